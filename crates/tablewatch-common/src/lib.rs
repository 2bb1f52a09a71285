//! TableWatch Common Types and Utilities
//!
//! Shared types, configuration, metrics and error handling for the TableWatch
//! change-detection service.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::TableWatchConfig;
pub use error::{Error, Result};
pub use types::*;
