//! # Taskline Config
//!
//! Configuration management for Taskline.
//! Supports layered configuration from files, environment variables,
//! and runtime reload.

mod app_config;
mod jobs;
mod loader;

pub use app_config::*;
pub use jobs::*;
pub use loader::*;
pub use taskline_core::{LogFormat, LoggingConfig};
