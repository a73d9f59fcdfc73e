use std::io::Read;
use std::time::Duration;

use base64::Engine;
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::log_sanitize::excerpt;
use crate::store::{KeyRecord, StoreClient, redacted_address};

const TOKEN_HEADER: &str = "X-Consul-Token";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on the buffer reserved up front from `Content-Length`.
const MAX_PREALLOC_BYTES: u64 = 64 << 20;

#[derive(Debug, Clone)]
pub struct ConsulConfig {
    pub address: Url,
    pub tls_skip_verify: bool,
    pub token: Option<String>,
    /// Whole-request timeout; snapshots of large clusters can take a while.
    pub timeout: Option<Duration>,
}

impl ConsulConfig {
    pub fn new(address: Url) -> Self {
        Self {
            address,
            tls_skip_verify: false,
            token: None,
            timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Consul HTTP API client covering snapshot, KV listing and leader status.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    base: String,
    /// `base` without userinfo, for messages.
    redacted: String,
    token: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

impl ConsulClient {
    pub fn new(cfg: &ConsulConfig) -> Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(cfg.tls_skip_verify)
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::msg(format!("error creating consul client: {e}")))?;
        Ok(Self {
            base: cfg.address.as_str().trim_end_matches('/').to_string(),
            redacted: redacted_address(&cfg.address),
            token: cfg
                .token
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned),
            http,
        })
    }

    pub fn address(&self) -> &str {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/{}", self.base, path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|e| {
            Error::msg(format!(
                "invalid consul endpoint {}/{path}: {e}",
                self.redacted
            ))
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) => req.header(TOKEN_HEADER, t),
            None => req,
        }
    }

    fn send(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        self.authed(req)
            .send()
            .map_err(|e| {
                Error::msg(format!(
                    "{what} request to {} failed: {}",
                    self.redacted,
                    e.without_url()
                ))
            })
    }
}

fn ensure_success(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(Error::msg(format!(
        "{what} returned {status}: {}",
        excerpt(body.trim(), 512)
    )))
}

fn decoded_len(key: &str, value: Option<&str>) -> Result<u64> {
    let Some(v) = value else {
        return Ok(0);
    };
    let raw = base64::engine::general_purpose::STANDARD
        .decode(v)
        .map_err(|e| Error::msg(format!("invalid base64 value for key '{key}': {e}")))?;
    Ok(raw.len() as u64)
}

impl StoreClient for ConsulClient {
    fn save_snapshot(&self) -> Result<Vec<u8>> {
        let url = self.endpoint("v1/snapshot")?;
        let resp = self.send(self.http.get(url), "snapshot save")?;
        let mut resp = ensure_success(resp, "snapshot save")?;
        let expected = resp.content_length();

        let mut buf = Vec::with_capacity(expected.map_or(0, |n| n.min(MAX_PREALLOC_BYTES) as usize));
        resp.read_to_end(&mut buf)
            .map_err(|e| Error::msg(format!("error reading consul snapshot: {e}")))?;
        if let Some(n) = expected
            && n != buf.len() as u64
        {
            return Err(Error::msg(format!(
                "short snapshot read: got {} of {n} bytes",
                buf.len()
            )));
        }
        Ok(buf)
    }

    fn restore_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        let url = self.endpoint("v1/snapshot")?;
        let resp = self.send(self.http.put(url).body(snapshot.to_vec()), "snapshot restore")?;
        ensure_success(resp, "snapshot restore")?;
        Ok(())
    }

    fn list_keys(&self, root: &str) -> Result<Vec<KeyRecord>> {
        let mut url = self.endpoint(&format!("v1/kv/{}", root.trim_start_matches('/')))?;
        url.query_pairs_mut().append_key_only("recurse");
        let resp = self.send(self.http.get(url), "kv list")?;
        if resp.status() == StatusCode::NOT_FOUND {
            // Consul answers 404 for an empty prefix.
            return Ok(Vec::new());
        }
        let body = ensure_success(resp, "kv list")?
            .text()
            .map_err(|e| Error::msg(format!("error reading kv listing: {}", e.without_url())))?;
        let entries: Vec<KvEntry> = serde_json::from_str(&body).map_err(|e| {
            Error::msg(format!(
                "failed to decode kv listing: {e}: {}",
                excerpt(body.trim(), 256)
            ))
        })?;
        entries
            .into_iter()
            .map(|e| {
                let len = decoded_len(&e.key, e.value.as_deref())?;
                Ok(KeyRecord::new(e.key, len))
            })
            .collect()
    }

    fn leader(&self) -> Result<Option<String>> {
        let url = self.endpoint("v1/status/leader")?;
        let resp = self.send(self.http.get(url).timeout(PROBE_TIMEOUT), "leader status")?;
        let resp = ensure_success(resp, "leader status")?;
        let leader: String = resp
            .json()
            .map_err(|e| Error::msg(format!("failed to decode leader status: {e}")))?;
        let leader = leader.trim();
        Ok((!leader.is_empty()).then(|| leader.to_string()))
    }
}
