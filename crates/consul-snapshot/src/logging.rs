use tracing::Dispatch;
use tracing::dispatcher::DefaultGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "consul_snapshot=info,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging for one run. The subscriber is scoped to this handle rather than
/// installed process-wide; it stops receiving events once dropped.
pub struct LogHandle {
    _guard: DefaultGuard,
}

pub fn build_dispatch(format: LogFormat) -> Dispatch {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => Dispatch::new(builder.finish()),
        LogFormat::Json => Dispatch::new(builder.json().finish()),
    }
}

pub fn init(format: LogFormat) -> LogHandle {
    let dispatch = build_dispatch(format);
    LogHandle {
        _guard: tracing::dispatcher::set_default(&dispatch),
    }
}
