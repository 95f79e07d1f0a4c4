pub mod config;
pub mod error;

pub use config::*;
pub use error::{Error, Result};

/// Milliseconds since the Unix epoch, as recorded in replicated commands.
pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
