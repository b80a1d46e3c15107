//! kas Core Library
//!
//! Shared functionality for kas components:
//! - Configuration loading and validation
//! - Common error types
//! - Tracing initialization

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::KasConfig;
pub use error::{Error, Result};
