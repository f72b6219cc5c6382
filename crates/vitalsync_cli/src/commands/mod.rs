//! CLI command implementations.

pub mod anchors;
pub mod push;
