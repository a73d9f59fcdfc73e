use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use consul_snapshot::cancel::CancelToken;
use consul_snapshot::config::{self, CliInputs, FileConfig, Settings};
use consul_snapshot::logging::{self, LogFormat};
use consul_snapshot::pipeline::{Pipeline, RunReport};
use consul_snapshot::store::{ConsulClient, redacted_address};
use consul_snapshot::upload::AwsCliFactory;
use consul_snapshot::verify::ConsulDevLauncher;
use consul_snapshot::{Error, Result};
use tracing::{error, info};

/// Snapshot a Consul cluster, verify the snapshot in a throwaway agent, and
/// upload it to object storage.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// The address of the consul server, including protocol (http/https)
    #[arg(long, env = "CONSUL_ADDR")]
    consul_addr: Option<String>,
    /// Skip verifying the consul tls connection
    #[arg(long, env = "CONSUL_TLS_SKIP_VERIFY")]
    consul_tls_skip_verify: bool,
    /// ACL token sent with every consul request
    #[arg(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,
    /// Where to send the backup: {provider}://{bucket}/{prefix}?region=... (eg, s3://my-bucket/consul-snapshots)
    #[arg(long, env = "TARGET_URI")]
    target: Option<String>,
    /// Upload without restoring the snapshot into an ephemeral agent first
    #[arg(long)]
    skip_verify: bool,
    /// TOML file with verification and upload thresholds
    #[arg(long)]
    config: Option<PathBuf>,
    /// consul executable used for the ephemeral verification agent
    #[arg(long)]
    consul_bin: Option<PathBuf>,
    /// aws executable used for uploads
    #[arg(long)]
    aws_bin: Option<PathBuf>,
    /// Write a JSON summary of a successful run to this path
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let args = Args::parse();
    let _log = logging::init(args.log_format);

    let report_path = args.report.clone();
    match run(args).and_then(|report| {
        if let Some(p) = &report_path {
            write_report(p, &report)?;
        }
        Ok(report)
    }) {
        Ok(report) => {
            info!(
                artifact = %report.artifact,
                bytes = report.snapshot_bytes,
                sha256 = %report.sha256,
                attempts = report.upload.attempts,
                verified = report.verdict.is_some(),
                "snapshot stored at {}",
                report.upload.remote_path.as_deref().unwrap_or_default()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(kind = %e.kind(), "{e}");
            ExitCode::from(e.kind().exit_code())
        }
    }
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let body = serde_json::to_string_pretty(&report.to_json())?;
    fs::write(path, body)
        .map_err(|e| Error::msg(format!("failed to write report {}: {e}", path.display())))
}

fn run(args: Args) -> Result<RunReport> {
    let cancel = CancelToken::with_signals()?;
    let file = match &args.config {
        Some(p) => config::load_file(p)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(
        CliInputs {
            consul_addr: args.consul_addr,
            consul_tls_skip_verify: args.consul_tls_skip_verify,
            consul_token: args.consul_token,
            target: args.target,
            skip_verify: args.skip_verify,
            consul_bin: args.consul_bin,
            aws_bin: args.aws_bin,
        },
        file,
    )?;

    info!("consul host: {}", redacted_address(&settings.consul.address));
    info!(
        "target: {}",
        settings
            .target
            .to_uri()
            .unwrap_or_else(|_| settings.target.base.clone())
    );

    let live = ConsulClient::new(&settings.consul)?;
    let launcher = ConsulDevLauncher {
        consul_bin: settings.consul_bin.clone(),
        tls_skip_verify: settings.consul.tls_skip_verify,
        teardown_grace: settings.teardown_grace,
    };
    let objects = AwsCliFactory {
        aws_bin: settings.aws_bin.clone(),
    };

    Pipeline {
        live: &live,
        launcher: &launcher,
        objects: &objects,
        verify: settings.verify_enabled.then(|| settings.verify.clone()),
        retry: settings.retry,
        cancel,
    }
    .run(&settings.target)
}
