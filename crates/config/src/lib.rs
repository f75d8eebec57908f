//! Configuration for the Spindle disc ripping daemon
//!
//! Loads settings from a TOML file, applies environment variable overrides and
//! validates the result before anything else starts.

pub mod config;

pub use config::*;
