//! Serde adapters for the types that appear in configuration files and experiment records.

pub mod duration_secs;
pub mod option_float;
