//! Dripline Common - Shared types and utilities
//!
//! This crate provides common types, configuration, and logging setup
//! shared across all Dripline components.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{Config, LoggingConfig, StreamConfig};
pub use error::{Error, Result};
