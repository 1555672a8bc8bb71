//! Per-request cache state machine.
//!
//! Stages run in a fixed order and stop at the first one that settles the
//! request:
//!
//! 1. not a single-resource view: passthrough
//! 2. resource not gated: passthrough
//! 3. locked: no-cache directives, passthrough to normal rendering
//! 4. privileged requester (or non-GET method): bypass, store untouched
//! 5. stored entry present: serve it
//! 6. otherwise capture the render, classify it and finalize
//!
//! The HTTP plumbing lives in [`super::middleware`]; this type owns every
//! decision and every store/audit side effect.

use std::{path::PathBuf, sync::Arc};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use bytes::{Bytes, BytesMut};
use metrics::counter;
use tracing::{debug, warn};

use crate::domain::types::ResourceId;

use super::{
    audit::{AuditLog, DecisionTrail},
    classify::{
        CapturedRender, Classification, IneligibleReason, MarkerClassifier, RenderClassifier,
    },
    config::CacheConfig,
    flight::{FlightGroup, FlightGuard},
    gate::{GateEvaluator, GateRequest, GateSnapshot},
    store::{CacheStore, CacheStoreError},
};

pub(crate) const METRIC_CACHE_OUTCOME: &str = "ppsc_cache_outcome_total";
pub(crate) const METRIC_STORE_ERROR: &str = "ppsc_cache_store_error_total";

/// Response header naming the decision taken for a gated request.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-ppsc-cache");

const LOCKED_CACHE_CONTROL: &str = "no-store, no-cache, must-revalidate, max-age=0, private";
const UNLOCKED_CACHE_CONTROL: &str = "private, no-cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Privileged,
    Method,
}

/// What the coordinator decided before any render happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Passthrough,
    Locked(ResourceId),
    Bypass(ResourceId, BypassReason),
    Hit { id: ResourceId, payload: Bytes },
    Miss(ResourceId),
}

/// Terminal outcome of a gated request, reported in `x-ppsc-cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Locked,
    Bypass,
    Hit,
    Stored,
    /// Render still carried the lock marker.
    Vetoed,
    /// Render was not storable (status, cookies, size, ...).
    Skipped,
    /// Render was storable but the write failed.
    Failed,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Locked => "locked",
            CacheOutcome::Bypass => "bypass",
            CacheOutcome::Hit => "hit",
            CacheOutcome::Stored => "stored",
            CacheOutcome::Vetoed => "vetoed",
            CacheOutcome::Skipped => "skipped",
            CacheOutcome::Failed => "failed",
        }
    }

    fn header_value(&self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

/// Result of finalizing a captured render.
#[derive(Debug)]
pub struct Finalized {
    pub render: CapturedRender,
    pub outcome: CacheOutcome,
}

/// Gate-aware cache service shared by every request.
pub struct CacheCoordinator {
    config: CacheConfig,
    store: Arc<CacheStore>,
    audit: Arc<AuditLog>,
    gate: Arc<dyn GateEvaluator>,
    classifier: Arc<dyn RenderClassifier>,
    flights: FlightGroup,
}

impl CacheCoordinator {
    pub fn new(config: CacheConfig, gate: Arc<dyn GateEvaluator>) -> Self {
        let classifier = Arc::new(MarkerClassifier::new(config.lock_marker.clone()));
        Self {
            store: Arc::new(CacheStore::new(config.directory.clone())),
            audit: Arc::new(AuditLog::new(config.log_path())),
            gate,
            classifier,
            flights: FlightGroup::new(),
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn RenderClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Prepare the cache directory at startup; failures are logged only.
    pub async fn activate(&self) {
        if let Err(err) = self.store.run(|store| store.ensure_directory()).await {
            record_store_error(&err);
            self.audit
                .append(format!("failed to prepare cache directory: {err}"))
                .await;
        }
    }

    /// Append `message` to the audit log and the request's trail.
    pub async fn log(&self, trail: &mut DecisionTrail, message: impl Into<String>) {
        trail.push(self.audit.append(message).await);
    }

    /// Walk stages 1 to 5, returning the gate answers alongside the decision.
    pub async fn decide(
        &self,
        request: &GateRequest,
        trail: &mut DecisionTrail,
    ) -> (GateSnapshot, Decision) {
        let mut snapshot = GateSnapshot::default();

        let Some(id) = self.gate.resolve(request).await else {
            return (snapshot, Decision::Passthrough);
        };
        snapshot.resource = Some(id);

        let gated = self.gate.is_gated_resource(id, request).await;
        snapshot.gated = Some(gated);
        if !gated {
            return (snapshot, Decision::Passthrough);
        }

        let locked = self.gate.is_locked(id, request).await;
        snapshot.locked = Some(locked);
        if locked {
            self.log(
                trail,
                format!("resource {id} is locked; no-cache headers sent, cache skipped"),
            )
            .await;
            return (snapshot, Decision::Locked(id));
        }

        let privileged = self.gate.is_privileged_bypass(request).await;
        snapshot.privileged = Some(privileged);
        if privileged {
            self.log(
                trail,
                format!("privileged requester for resource {id}; cache bypassed"),
            )
            .await;
            return (snapshot, Decision::Bypass(id, BypassReason::Privileged));
        }

        if request.method != Method::GET {
            self.log(
                trail,
                format!("{} request for resource {id}; cache bypassed", request.method),
            )
            .await;
            return (snapshot, Decision::Bypass(id, BypassReason::Method));
        }

        match self.lookup(id, trail).await {
            Some(payload) => (snapshot, Decision::Hit { id, payload }),
            None => {
                self.log(trail, format!("cache miss for resource {id}; capturing render"))
                    .await;
                (snapshot, Decision::Miss(id))
            }
        }
    }

    /// Read the stored entry for `id`. Read failures count as a miss.
    pub async fn lookup(&self, id: ResourceId, trail: &mut DecisionTrail) -> Option<Bytes> {
        match self.store.run(move |store| store.get(id)).await {
            Ok(Some(payload)) => {
                let path = self.store.path_for(id);
                self.log(
                    trail,
                    format!(
                        "served resource {id} from cache file {}",
                        path.display()
                    ),
                )
                .await;
                Some(payload)
            }
            Ok(None) => None,
            Err(err) => {
                record_store_error(&err);
                self.log(
                    trail,
                    format!("failed to read cache file for resource {id}: {err}; treating as miss"),
                )
                .await;
                None
            }
        }
    }

    /// Serialize the render of `id` when single-flight is enabled.
    pub async fn begin_flight(&self, id: ResourceId) -> Option<FlightGuard> {
        if !self.config.single_flight {
            return None;
        }
        let guard = self.flights.acquire(id).await;
        debug!(target = "ppsc::cache::coordinator", id = %id, "flight acquired");
        Some(guard)
    }

    /// Classify a captured render and persist it when cacheable.
    pub async fn finalize(
        &self,
        id: ResourceId,
        render: CapturedRender,
        trail: &mut DecisionTrail,
    ) -> Finalized {
        let classification = self.classifier.classify(&render);
        self.finalize_as(id, render, classification, trail).await
    }

    /// Finalize with a classification decided by the caller.
    pub async fn finalize_as(
        &self,
        id: ResourceId,
        mut render: CapturedRender,
        classification: Classification,
        trail: &mut DecisionTrail,
    ) -> Finalized {
        let outcome = match classification {
            Classification::StillLocked => {
                self.log(
                    trail,
                    format!(
                        "anomaly: render for unlocked resource {id} still contains lock marker; not cached"
                    ),
                )
                .await;
                warn!(
                    target = "ppsc::cache::coordinator",
                    id = %id,
                    "gate reported unlocked but render is still locked"
                );
                apply_locked_headers(&mut render.headers);
                CacheOutcome::Vetoed
            }
            Classification::Ineligible(reason) => {
                self.log(
                    trail,
                    format!("render for resource {id} not cached: {}", reason.describe()),
                )
                .await;
                CacheOutcome::Skipped
            }
            Classification::Cacheable => {
                match self.persist(id, render.body.clone()).await {
                    Ok(path) => {
                        self.log(
                            trail,
                            format!("cache file created for resource {id} at {}", path.display()),
                        )
                        .await;
                        CacheOutcome::Stored
                    }
                    Err(err) => {
                        record_store_error(&err);
                        self.log(
                            trail,
                            format!("failed to write cache file for resource {id}: {err}"),
                        )
                        .await;
                        CacheOutcome::Failed
                    }
                }
            }
        };

        if outcome != CacheOutcome::Vetoed {
            apply_unlocked_headers(&mut render.headers);
        }
        let annotated = self.annotate(&render, outcome == CacheOutcome::Stored);
        if annotated.len() != render.body.len() {
            render.headers.remove(header::CONTENT_LENGTH);
        }
        render.body = annotated;
        self.stamp(&mut render.headers, outcome);

        Finalized { render, outcome }
    }

    /// Record a render that is passed on without being buffered.
    ///
    /// Its lock state was never verified, so it leaves with the locked
    /// directives. `marker_seen` reports a lock marker in the part read so far.
    pub async fn skip_uncaptured(
        &self,
        id: ResourceId,
        headers: &mut HeaderMap,
        reason: IneligibleReason,
        marker_seen: bool,
        trail: &mut DecisionTrail,
    ) {
        if marker_seen {
            self.log(
                trail,
                format!(
                    "anomaly: render for unlocked resource {id} still contains lock marker; not cached"
                ),
            )
            .await;
            warn!(
                target = "ppsc::cache::coordinator",
                id = %id,
                "gate reported unlocked but render is still locked"
            );
        } else {
            self.log(
                trail,
                format!("render for resource {id} not cached: {}", reason.describe()),
            )
            .await;
        }
        apply_locked_headers(headers);
        let outcome = if marker_seen {
            CacheOutcome::Vetoed
        } else {
            CacheOutcome::Skipped
        };
        self.stamp(headers, outcome);
    }

    /// Whether `body` carries the configured lock marker.
    pub fn shows_lock_marker(&self, body: &[u8]) -> bool {
        let marker = self.config.lock_marker.as_bytes();
        !marker.is_empty() && body.windows(marker.len()).any(|window| window == marker)
    }

    async fn persist(&self, id: ResourceId, body: Bytes) -> Result<PathBuf, CacheStoreError> {
        self.store.run(move |store| store.put(id, &body)).await
    }

    /// Body served for a stored entry.
    pub fn hit_body(&self, payload: &Bytes) -> Bytes {
        if !self.config.annotate_responses {
            return payload.clone();
        }
        prefixed(&self.config.cached_marker(), payload)
    }

    /// Headers served with a stored entry.
    pub fn hit_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        apply_unlocked_headers(&mut headers);
        self.stamp(&mut headers, CacheOutcome::Hit);
        headers
    }

    fn annotate(&self, render: &CapturedRender, cached: bool) -> Bytes {
        if !self.config.annotate_responses || !render.is_html() {
            return render.body.clone();
        }
        let marker = if cached {
            self.config.cached_marker()
        } else {
            self.config.not_cached_marker()
        };
        prefixed(&marker, &render.body)
    }

    /// Set `x-ppsc-cache` and count the outcome.
    pub fn stamp(&self, headers: &mut HeaderMap, outcome: CacheOutcome) {
        headers.insert(CACHE_STATUS_HEADER, outcome.header_value());
        counter!(METRIC_CACHE_OUTCOME, "outcome" => outcome.as_str()).increment(1);
    }
}

/// Directives sent whenever the requester has not unlocked the resource.
pub fn apply_locked_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(LOCKED_CACHE_CONTROL),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

/// Unlocked output depends on the unlock cookie; shared caches must not keep it.
fn apply_unlocked_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(UNLOCKED_CACHE_CONTROL),
    );
    headers.append(header::VARY, HeaderValue::from_static("Cookie"));
}

fn prefixed(marker: &str, body: &Bytes) -> Bytes {
    let mut buffer = BytesMut::with_capacity(marker.len() + body.len());
    buffer.extend_from_slice(marker.as_bytes());
    buffer.extend_from_slice(body);
    buffer.freeze()
}

fn record_store_error(err: &CacheStoreError) {
    counter!(METRIC_STORE_ERROR, "op" => err.op()).increment(1);
    warn!(
        target = "ppsc::cache::coordinator",
        op = err.op(),
        error = %err,
        "cache store operation failed"
    );
}
