//! attrstore Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures and
//! key-space conventions shared by the attribute stores and the admin binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
