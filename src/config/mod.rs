//! Configuration management module
//!
//! Provides TOML-based configuration with an explicit option set;
//! unrecognized keys are rejected at load.

mod config;

pub use config::*;
