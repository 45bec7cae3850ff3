//! Domla Common - Shared utilities and types
//!
//! This crate provides common functionality used across the archive:
//! - Error types and handling
//! - Configuration management
//! - Domain type definitions
//! - Id, path and timestamp helpers

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::ArchiveConfig;
pub use error::{Error, Result};
pub use types::*;
