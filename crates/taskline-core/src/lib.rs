//! # Taskline Core
//!
//! Foundational types shared by every Taskline crate: the unified error
//! type, result aliases, and logging initialization.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_logging, LogFormat, LoggingConfig};
