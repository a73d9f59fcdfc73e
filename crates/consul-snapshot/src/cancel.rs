use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

use crate::error::{Error, ErrorKind, Result};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared cancellation flag for the pipeline's timed waits.
///
/// A token built with [`CancelToken::with_signals`] is also tripped by SIGINT
/// or SIGTERM.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token whose flag is set by SIGINT and SIGTERM. Once registered, those
    /// signals no longer terminate the process on their own.
    pub fn with_signals() -> Result<Self> {
        let token = Self::new();
        for sig in [SIGINT, SIGTERM] {
            signal_hook::flag::register(sig, token.flag.clone()).map_err(|e| {
                Error::msg(format!("failed to install handler for signal {sig}: {e}"))
            })?;
        }
        Ok(token)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::new(ErrorKind::Cancelled, "cancelled"));
        }
        Ok(())
    }

    /// Sleep for `dur`, waking early with a `Cancelled` error if the token trips.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let deadline = Instant::now() + dur;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
