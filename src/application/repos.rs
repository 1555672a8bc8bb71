//! Collaborator traits the administrative services depend on.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::resources::GatedResource;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl RepoError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Source of every resource that carries an access secret, across all kinds
/// and publication statuses.
#[async_trait]
pub trait GatedResourceCatalog: Send + Sync {
    async fn list_gated(&self) -> Result<Vec<GatedResource>, RepoError>;
}

#[derive(Debug, Error)]
#[error("preload of `{path}` failed: {message}")]
pub struct PreloadError {
    pub path: String,
    pub message: String,
}

/// Issues the public request that makes the serving path populate an entry.
#[async_trait]
pub trait PreloadFetcher: Send + Sync {
    async fn fetch(&self, resource: &GatedResource) -> Result<(), PreloadError>;
}

/// Anti-forgery tokens scoped to an action name.
pub trait AntiForgery: Send + Sync {
    fn issue(&self, action: &str) -> String;
    fn verify(&self, action: &str, token: &str) -> bool;
}
