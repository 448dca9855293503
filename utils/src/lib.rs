//! Shared utilities for the Cairn node.

pub mod logging;
pub mod shutdown;
pub mod strand;
pub mod time;

pub use logging::{init_logging, LogFormat};
pub use shutdown::{ShutdownController, ShutdownListener};
pub use strand::Strand;
pub use time::{format_duration, Timestamp};
