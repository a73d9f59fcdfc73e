pub mod cancel;
pub mod config;
pub mod error;
pub mod log_sanitize;
pub mod logging;
pub mod pipeline;
mod process;
pub mod snapshot;
pub mod store;
pub mod target;
pub mod upload;
pub mod verify;

pub use error::{Error, ErrorKind, Result};
