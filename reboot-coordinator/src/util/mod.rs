use std::time::Duration;

pub(crate) mod colors;
mod error;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use error::*;

/// Reconciler tick period (spec §4.6).
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);
