//! Shared infrastructure: error taxonomy, logging, configuration.

pub mod config;
pub mod error;
pub mod logging;

pub use config::CommConfig;
pub use error::{CommError, Result};
