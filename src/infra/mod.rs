//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod manifest;
pub mod preload;
pub mod telemetry;
pub mod tokens;
pub mod upstream;
