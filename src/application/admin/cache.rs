use std::{io, sync::Arc};

use serde::{Serialize, Serializer};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::info;

use crate::application::repos::{AntiForgery, GatedResourceCatalog, PreloadFetcher, RepoError};
use crate::cache::{AuditLog, CacheStore, CacheStoreError, PurgeReport};
use crate::domain::types::ResourceId;

/// Action name every mutating cache operation's token is scoped to.
pub const CACHE_ACTION: &str = "ppsc_cache_action";

#[derive(Debug, Error)]
pub enum AdminCacheError {
    #[error("requester is not a privileged operator")]
    Forbidden,
    #[error("anti-forgery token rejected")]
    InvalidToken,
    #[error("unknown cache action `{0}`")]
    UnknownAction(String),
    #[error("resource id `{0}` is not a positive integer")]
    InvalidResourceId(String),
    #[error(transparent)]
    Store(#[from] CacheStoreError),
    #[error(transparent)]
    Catalog(#[from] RepoError),
    #[error("failed to read audit log: {0}")]
    Log(#[source] io::Error),
}

/// A mutating operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    ClearAll,
    ClearOne(ResourceId),
    PreloadAll,
}

impl CacheAction {
    /// Parse the admin form's `action` and `resource_id` fields.
    pub fn from_form(action: &str, resource_id: Option<&str>) -> Result<Self, AdminCacheError> {
        match action {
            "clear_all" => Ok(Self::ClearAll),
            "preload_all" => Ok(Self::PreloadAll),
            "clear_one" => {
                let raw = resource_id.unwrap_or_default().trim();
                raw.parse()
                    .map(Self::ClearOne)
                    .map_err(|_| AdminCacheError::InvalidResourceId(raw.to_string()))
            }
            other => Err(AdminCacheError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearOutcome {
    Removed,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
    pub attempted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionResult {
    ClearAll { removed: usize, failed: usize },
    ClearOne { id: ResourceId, outcome: ClearOutcome },
    PreloadAll { attempted: usize, failed: usize },
}

/// One gated resource and the state of its cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageRow {
    pub id: ResourceId,
    pub kind: String,
    pub status: String,
    pub cached: bool,
    pub path: Option<String>,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub modified: Option<OffsetDateTime>,
    pub size_bytes: Option<u64>,
}

fn serialize_rfc3339<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value.map(|stamp| stamp.format(&Rfc3339)) {
        Some(Ok(text)) => serializer.serialize_some(&text),
        Some(Err(err)) => Err(serde::ser::Error::custom(err)),
        None => serializer.serialize_none(),
    }
}

/// Operator tools over the cache directory and audit log.
#[derive(Clone)]
pub struct AdminCacheService {
    store: Arc<CacheStore>,
    audit: Arc<AuditLog>,
    catalog: Arc<dyn GatedResourceCatalog>,
    fetcher: Arc<dyn PreloadFetcher>,
    tokens: Arc<dyn AntiForgery>,
}

impl AdminCacheService {
    pub fn new(
        store: Arc<CacheStore>,
        audit: Arc<AuditLog>,
        catalog: Arc<dyn GatedResourceCatalog>,
        fetcher: Arc<dyn PreloadFetcher>,
        tokens: Arc<dyn AntiForgery>,
    ) -> Self {
        Self {
            store,
            audit,
            catalog,
            fetcher,
            tokens,
        }
    }

    /// Token an operator page embeds for [`Self::perform`].
    pub fn action_token(&self) -> String {
        self.tokens.issue(CACHE_ACTION)
    }

    /// Check privilege and token, then run `action`.
    pub async fn perform(
        &self,
        privileged: bool,
        token: &str,
        action: CacheAction,
    ) -> Result<ActionResult, AdminCacheError> {
        if !privileged {
            return Err(AdminCacheError::Forbidden);
        }
        if !self.tokens.verify(CACHE_ACTION, token) {
            return Err(AdminCacheError::InvalidToken);
        }

        match action {
            CacheAction::ClearAll => {
                let report = self.clear_all().await?;
                Ok(ActionResult::ClearAll {
                    removed: report.removed,
                    failed: report.failed,
                })
            }
            CacheAction::ClearOne(id) => {
                let outcome = self.clear_one(id).await?;
                Ok(ActionResult::ClearOne { id, outcome })
            }
            CacheAction::PreloadAll => {
                let report = self.preload_all().await?;
                Ok(ActionResult::PreloadAll {
                    attempted: report.attempted,
                    failed: report.failed,
                })
            }
        }
    }

    pub async fn clear_all(&self) -> Result<PurgeReport, AdminCacheError> {
        let report = self.store.run(|store| store.delete_all()).await?;
        self.audit.append(format!(
            "cleared all cache files ({} removed, {} failed)",
            report.removed, report.failed
        ))
        .await;
        Ok(report)
    }

    pub async fn clear_one(&self, id: ResourceId) -> Result<ClearOutcome, AdminCacheError> {
        let removed = self.store.run(move |store| store.delete(id)).await?;
        if removed {
            self.audit
                .append(format!("cleared cache file for resource {id}"))
                .await;
            Ok(ClearOutcome::Removed)
        } else {
            self.audit
                .append(format!("no cache file to clear for resource {id}"))
                .await;
            Ok(ClearOutcome::NotFound)
        }
    }

    /// Fetch every gated resource's public URL, one at a time.
    ///
    /// Fetch failures are counted, never returned.
    pub async fn preload_all(&self) -> Result<PreloadReport, AdminCacheError> {
        let resources = self.catalog.list_gated().await?;
        let mut report = PreloadReport::default();

        for resource in &resources {
            report.attempted += 1;
            if let Err(err) = self.fetcher.fetch(resource).await {
                report.failed += 1;
                info!(
                    target = "ppsc::admin::preload",
                    id = %resource.id,
                    error = %err,
                    "preload fetch failed"
                );
            }
        }

        self.audit.append(format!(
            "preload triggered for {} gated resources ({} failed)",
            report.attempted, report.failed
        ))
        .await;
        Ok(report)
    }

    /// Per gated resource: whether an entry exists, with its path and mtime.
    pub async fn list_coverage(&self) -> Result<Vec<CoverageRow>, AdminCacheError> {
        let resources = self.catalog.list_gated().await?;
        let ids: Vec<ResourceId> = resources.iter().map(|resource| resource.id).collect();
        let stats = self
            .store
            .run(move |store| {
                ids.into_iter()
                    .map(|id| store.stat(id))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;

        Ok(resources
            .into_iter()
            .zip(stats)
            .map(|(resource, info)| CoverageRow {
                id: resource.id,
                kind: resource.kind,
                status: resource.status,
                cached: info.is_some(),
                path: info
                    .as_ref()
                    .map(|info| info.path.display().to_string()),
                modified: info.as_ref().and_then(|info| info.modified),
                size_bytes: info.as_ref().map(|info| info.size_bytes),
            })
            .collect())
    }

    /// Full audit log, newest first.
    pub async fn recent_log(&self) -> Result<Vec<String>, AdminCacheError> {
        let audit = Arc::clone(&self.audit);
        tokio::task::spawn_blocking(move || audit.read_all_newest_first())
            .await
            .map_err(|err| AdminCacheError::Log(io::Error::other(err)))?
            .map_err(AdminCacheError::Log)
    }
}
