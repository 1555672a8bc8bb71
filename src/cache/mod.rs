//! Gate-aware static page cache.
//!
//! Rendered output of password-gated resources is kept as one file per
//! resource once a requester has unlocked it:
//!
//! - [`CacheStore`]: owner-only directory of `cache-<id>.html` files
//! - [`GateEvaluator`]: collaborator answering "which resource, is it locked,
//!   is this an operator"
//! - [`CacheCoordinator`]: per-request decisions, capture and population
//! - [`AuditLog`]: append-only decision log read back newest first
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! directory = "ppsc-cache"
//! lock_marker = "post-password-form"
//! annotate_responses = true
//! single_flight = true
//! ```
//!
//! Entries are never invalidated automatically. Changing a resource or its
//! secret requires clearing the entry through the admin surface or the CLI.

mod audit;
mod classify;
mod config;
mod coordinator;
mod flight;
mod gate;
mod lock;
mod middleware;
mod store;

pub use audit::{AuditLog, DecisionTrail, LogEntry};
pub use classify::{
    CapturedRender, Classification, IneligibleReason, MarkerClassifier, RenderClassifier,
};
pub use config::CacheConfig;
pub use coordinator::{
    BypassReason, CACHE_STATUS_HEADER, CacheCoordinator, CacheOutcome, Decision, Finalized,
    apply_locked_headers,
};
pub use flight::{FlightGroup, FlightGuard};
pub use gate::{GateEvaluator, GateRequest, GateSnapshot};
pub use middleware::gate_cache_layer;
pub use store::{CacheStore, CacheStoreError, EntryInfo, PurgeReport};

pub(crate) use coordinator::{METRIC_CACHE_OUTCOME, METRIC_STORE_ERROR};
