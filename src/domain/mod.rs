//! Domain layer types and invariants.

pub mod error;
pub mod resources;
pub mod types;
