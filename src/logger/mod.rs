//! Process-wide `tracing` setup for the binaries.

mod logger;
pub use logger::*;

pub use tracing::{debug, error, info, trace, warn};
