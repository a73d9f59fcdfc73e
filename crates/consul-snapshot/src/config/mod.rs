//! Run settings: built-in defaults, then an optional TOML file, then CLI
//! flags / environment.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, ErrorKind, Result};
use crate::store::{ConsulConfig, parse_store_address};
use crate::target::{TargetDescriptor, parse_target};
use crate::upload::RetryPolicy;
use crate::verify::VerifyConfig;

fn default_true() -> bool {
    true
}

fn default_key_root() -> String {
    "/".into()
}

fn default_size_tolerance_bytes() -> u64 {
    1000
}

fn default_readiness_grace_ms() -> u64 {
    2000
}

fn default_readiness_timeout_ms() -> u64 {
    30_000
}

fn default_readiness_poll_ms() -> u64 {
    250
}

fn default_teardown_grace_ms() -> u64 {
    5000
}

fn default_consul_bin() -> String {
    "consul".into()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    5000
}

fn default_aws_bin() -> String {
    "aws".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_key_root")]
    pub key_root: String,
    #[serde(default = "default_size_tolerance_bytes")]
    pub size_tolerance_bytes: u64,
    #[serde(default = "default_readiness_grace_ms")]
    pub readiness_grace_ms: u64,
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    #[serde(default = "default_consul_bin")]
    pub consul_bin: String,
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            enabled: true,
            key_root: default_key_root(),
            size_tolerance_bytes: default_size_tolerance_bytes(),
            readiness_grace_ms: default_readiness_grace_ms(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            readiness_poll_ms: default_readiness_poll_ms(),
            teardown_grace_ms: default_teardown_grace_ms(),
            consul_bin: default_consul_bin(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_aws_bin")]
    pub aws_bin: String,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            aws_bin: default_aws_bin(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub verify: VerifySection,
    pub upload: UploadSection,
}

pub fn parse_file_config(raw: &str) -> Result<FileConfig> {
    toml::from_str(raw).map_err(|e| Error::new(ErrorKind::Config, format!("config parse error: {e}")))
}

pub fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path).map_err(|e| {
        Error::new(
            ErrorKind::Config,
            format!("failed to read config {}: {e}", path.display()),
        )
    })?;
    parse_file_config(&raw).map_err(|e| e.context(ErrorKind::Config, &path.display().to_string()))
}

/// Raw command-line / environment inputs, before validation.
#[derive(Debug, Clone, Default)]
pub struct CliInputs {
    pub consul_addr: Option<String>,
    pub consul_tls_skip_verify: bool,
    pub consul_token: Option<String>,
    pub target: Option<String>,
    pub skip_verify: bool,
    pub consul_bin: Option<PathBuf>,
    pub aws_bin: Option<PathBuf>,
}

/// Fully validated settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub consul: ConsulConfig,
    pub target: TargetDescriptor,
    pub verify_enabled: bool,
    pub verify: VerifyConfig,
    pub consul_bin: PathBuf,
    pub teardown_grace: Duration,
    pub retry: RetryPolicy,
    pub aws_bin: PathBuf,
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

impl Settings {
    /// Validate inputs and layer them over `file`. Does no network I/O.
    pub fn resolve(cli: CliInputs, file: FileConfig) -> Result<Self> {
        let addr = non_empty(cli.consul_addr.as_deref()).unwrap_or_default();
        let address = parse_store_address(addr)?;
        let target = parse_target(non_empty(cli.target.as_deref()).unwrap_or_default())?;

        let mut consul = ConsulConfig::new(address);
        consul.tls_skip_verify = cli.consul_tls_skip_verify;
        consul.token = non_empty(cli.consul_token.as_deref()).map(ToOwned::to_owned);

        let v = file.verify;
        if v.readiness_poll_ms == 0 {
            return Err(Error::new(
                ErrorKind::Config,
                "verify.readiness_poll_ms must be greater than 0",
            ));
        }
        let verify = VerifyConfig {
            key_root: v.key_root,
            size_tolerance_bytes: v.size_tolerance_bytes,
            readiness_grace: Duration::from_millis(v.readiness_grace_ms),
            readiness_timeout: Duration::from_millis(v.readiness_timeout_ms),
            readiness_poll: Duration::from_millis(v.readiness_poll_ms),
        };

        let u = file.upload;
        Ok(Self {
            consul,
            target,
            verify_enabled: v.enabled && !cli.skip_verify,
            verify,
            consul_bin: cli.consul_bin.unwrap_or_else(|| PathBuf::from(v.consul_bin)),
            teardown_grace: Duration::from_millis(v.teardown_grace_ms),
            retry: RetryPolicy {
                max_retries: u.max_retries,
                interval: Duration::from_millis(u.retry_interval_ms),
            },
            aws_bin: cli.aws_bin.unwrap_or_else(|| PathBuf::from(u.aws_bin)),
        })
    }
}
