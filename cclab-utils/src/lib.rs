//! Helpers shared between the experiment runner and the analysis tooling.

pub mod other;
pub mod serde;
