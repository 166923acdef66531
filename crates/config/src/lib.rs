//! Configuration module for the live relay
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
