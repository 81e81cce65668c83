//! Scan Configuration Module
//!
//! Every tunable of a brightness scan, loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `BRIGHTNESS_CONFIG` environment variable (path to TOML file)
//! 2. `scan_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded config is passed explicitly to the pipeline; there is no
//! global instance.

mod scan_config;
pub mod validation;

pub use scan_config::*;
