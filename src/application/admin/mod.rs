//! Application services for the administrative surface.

pub mod cache;

pub use cache::AdminCacheService;
