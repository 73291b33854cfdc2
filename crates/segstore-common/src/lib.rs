//! segstore common - shared types and utilities
//!
//! This crate provides the error type, configuration and segment naming
//! used by the storage crate and the CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
