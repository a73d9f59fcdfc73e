use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;
use reqwest::Url;

use crate::error::{Error, ErrorKind, Result};

/// Parsed `{kind}://{base}{/path}?{options}` upload destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub provider_kind: String,
    pub base: String,
    pub path: String,
    pub options: BTreeMap<String, Vec<String>>,
}

impl TargetDescriptor {
    /// First non-empty value for `name`, trimmed.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .get(name)?
            .iter()
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }

    pub fn to_uri(&self) -> Result<String> {
        let mut url = Url::parse(&format!("{}://{}", self.provider_kind, self.base))
            .map_err(|e| invalid_target(&format!("{}://{}", self.provider_kind, self.base), e))?;
        if !self.path.is_empty() {
            // Segment-wise so a decoded '%' or '?' is re-escaped.
            let segments = self.path.strip_prefix('/').unwrap_or(&self.path).split('/');
            url.path_segments_mut()
                .map_err(|_| invalid_target(&self.base, "cannot carry a path"))?
                .clear()
                .extend(segments);
        }
        if !self.options.is_empty() {
            let mut q = url.query_pairs_mut();
            for (k, values) in &self.options {
                for v in values {
                    q.append_pair(k, v);
                }
            }
        }
        Ok(url.to_string())
    }
}

fn invalid_target(uri: &str, why: impl std::fmt::Display) -> Error {
    Error::new(
        ErrorKind::InvalidTargetUri,
        format!("provided target url is invalid, got '{uri}': {why}"),
    )
}

pub fn parse_target(uri: &str) -> Result<TargetDescriptor> {
    let raw = uri.trim();
    let url = Url::parse(raw).map_err(|e| invalid_target(raw, e))?;
    if url.scheme().is_empty() {
        return Err(invalid_target(raw, "missing scheme"));
    }
    let host = url.host_str().unwrap_or_default();
    if host.is_empty() {
        return Err(invalid_target(raw, "missing host"));
    }
    let base = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|e| invalid_target(raw, format!("path is not utf-8: {e}")))?
        .into_owned();

    let mut options = BTreeMap::<String, Vec<String>>::new();
    for (k, v) in url.query_pairs() {
        options.entry(k.into_owned()).or_default().push(v.into_owned());
    }

    Ok(TargetDescriptor {
        provider_kind: url.scheme().to_string(),
        base,
        path,
        options,
    })
}

/// Resolved upload destination. Adding a provider means adding a variant here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    ObjectStorage(ObjectStorageTarget),
}

impl UploadTarget {
    pub fn resolve(target: &TargetDescriptor) -> Result<Self> {
        match target.provider_kind.as_str() {
            "s3" if target.base.contains(':') => Err(Error::new(
                ErrorKind::InvalidTargetUri,
                format!("s3 bucket cannot include a port, got '{}'", target.base),
            )),
            "s3" => Ok(Self::ObjectStorage(ObjectStorageTarget::from_descriptor(
                target,
            ))),
            other => Err(Error::new(
                ErrorKind::UnsupportedProvider,
                format!("target type of {other} is not supported"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStorageTarget {
    pub bucket: String,
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub profile: Option<String>,
}

impl ObjectStorageTarget {
    fn from_descriptor(target: &TargetDescriptor) -> Self {
        Self {
            bucket: target.base.clone(),
            prefix: target.path.trim_matches('/').to_string(),
            region: target.option("region").map(ToOwned::to_owned),
            endpoint_url: target.option("endpoint").map(ToOwned::to_owned),
            profile: target.option("profile").map(ToOwned::to_owned),
        }
    }

    pub fn object_key(&self, artifact_name: &str) -> String {
        if self.prefix.is_empty() {
            artifact_name.to_string()
        } else {
            format!("{}/{}", self.prefix, artifact_name)
        }
    }

    pub fn remote_path(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}
