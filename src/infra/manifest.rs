//! TOML resource manifest: the gate and catalog used by the binary.
//!
//! ```toml
//! [[resources]]
//! id = 42
//! path = "/members/quarterly-report"
//! kind = "page"
//! status = "publish"
//! secret_digest = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//! ```
//!
//! A resource is gated when it carries `secret_digest`. A requester has
//! unlocked it when the cookie `ppsc-unlock-<id>` holds that digest.

use std::{collections::HashMap, fs, path::Path};

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::application::repos::{GatedResourceCatalog, RepoError};
use crate::cache::{GateEvaluator, GateRequest};
use crate::domain::{resources::GatedResource, types::ResourceId};

use super::error::InfraError;

pub const UNLOCK_COOKIE_PREFIX: &str = "ppsc-unlock-";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    id: ResourceId,
    path: String,
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default = "default_status")]
    status: String,
    secret_digest: Option<String>,
}

fn default_kind() -> String {
    "page".to_string()
}

fn default_status() -> String {
    "publish".to_string()
}

#[derive(Debug, Clone)]
struct ManifestEntry {
    resource: GatedResource,
    secret_digest: Option<String>,
}

/// Resources listed in the manifest plus the operator credential.
#[derive(Debug, Clone, Default)]
pub struct ResourceManifest {
    entries: Vec<ManifestEntry>,
    by_path: HashMap<String, usize>,
    by_id: HashMap<ResourceId, usize>,
    operator_digest: Option<String>,
}

impl ResourceManifest {
    pub fn load(path: &Path) -> Result<Self, InfraError> {
        let text = fs::read_to_string(path).map_err(|err| {
            InfraError::configuration(format!(
                "failed to read manifest `{}`: {err}",
                path.display()
            ))
        })?;
        let manifest = Self::parse(&text)?;
        info!(
            target = "ppsc::infra::manifest",
            path = %path.display(),
            resources = manifest.entries.len(),
            gated = manifest.gated_count(),
            "resource manifest loaded"
        );
        Ok(manifest)
    }

    pub fn parse(text: &str) -> Result<Self, InfraError> {
        let raw: RawManifest = toml::from_str(text)
            .map_err(|err| InfraError::configuration(format!("invalid manifest: {err}")))?;

        let mut manifest = Self::default();
        for resource in raw.resources {
            manifest.insert(resource)?;
        }
        Ok(manifest)
    }

    /// Operator bearer-token digest (hex SHA-256) for privileged bypass.
    pub fn with_operator_digest(mut self, digest: Option<String>) -> Self {
        self.operator_digest = digest.map(|digest| digest.to_ascii_lowercase());
        self
    }

    pub fn gated_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.secret_digest.is_some())
            .count()
    }

    fn insert(&mut self, raw: RawResource) -> Result<(), InfraError> {
        let path = normalize_path(&raw.path);
        if !path.starts_with('/') {
            return Err(InfraError::configuration(format!(
                "resource {}: path `{}` must start with `/`",
                raw.id, raw.path
            )));
        }
        if self.by_id.contains_key(&raw.id) {
            return Err(InfraError::configuration(format!(
                "resource {} is listed more than once",
                raw.id
            )));
        }
        if self.by_path.contains_key(&path) {
            return Err(InfraError::configuration(format!(
                "path `{path}` is listed for more than one resource"
            )));
        }

        let secret_digest = match raw.secret_digest {
            Some(digest) => {
                let digest = digest.trim().to_ascii_lowercase();
                if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(InfraError::configuration(format!(
                        "resource {}: secret_digest must be 64 hex characters",
                        raw.id
                    )));
                }
                Some(digest)
            }
            None => None,
        };

        let index = self.entries.len();
        self.by_id.insert(raw.id, index);
        self.by_path.insert(path.clone(), index);
        self.entries.push(ManifestEntry {
            resource: GatedResource {
                id: raw.id,
                kind: raw.kind,
                status: raw.status,
                path,
            },
            secret_digest,
        });
        Ok(())
    }

    fn entry(&self, id: ResourceId) -> Option<&ManifestEntry> {
        self.by_id.get(&id).map(|index| &self.entries[*index])
    }
}

/// Hex SHA-256 of `secret`, the form stored in manifests and unlock cookies.
pub fn secret_digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn digests_match(expected: &str, presented: &str) -> bool {
    let presented = presented.trim().to_ascii_lowercase();
    expected.as_bytes().ct_eq(presented.as_bytes()).unwrap_u8() == 1
}

fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.trim_end_matches('/') {
        "" if trimmed.starts_with('/') => "/".to_string(),
        stripped => stripped.to_string(),
    }
}

#[async_trait]
impl GateEvaluator for ResourceManifest {
    async fn resolve(&self, request: &GateRequest) -> Option<ResourceId> {
        let index = self.by_path.get(&normalize_path(&request.path))?;
        Some(self.entries[*index].resource.id)
    }

    async fn is_gated_resource(&self, id: ResourceId, _request: &GateRequest) -> bool {
        self.entry(id)
            .is_some_and(|entry| entry.secret_digest.is_some())
    }

    async fn is_locked(&self, id: ResourceId, request: &GateRequest) -> bool {
        let Some(expected) = self.entry(id).and_then(|entry| entry.secret_digest.as_deref())
        else {
            return false;
        };
        let cookie_name = format!("{UNLOCK_COOKIE_PREFIX}{id}");
        match request.cookie(&cookie_name) {
            Some(presented) => !digests_match(expected, presented),
            None => true,
        }
    }

    async fn is_privileged_bypass(&self, request: &GateRequest) -> bool {
        match (self.operator_digest.as_deref(), request.bearer_token()) {
            (Some(expected), Some(token)) => digests_match(expected, &secret_digest(token)),
            _ => false,
        }
    }
}

#[async_trait]
impl GatedResourceCatalog for ResourceManifest {
    async fn list_gated(&self) -> Result<Vec<GatedResource>, RepoError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.secret_digest.is_some())
            .map(|entry| entry.resource.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};

    use super::*;

    fn manifest() -> ResourceManifest {
        let text = format!(
            r#"
            [[resources]]
            id = 42
            path = "/members/report/"
            kind = "post"
            status = "private"
            secret_digest = "{}"

            [[resources]]
            id = 7
            path = "/about"
            "#,
            secret_digest("open sesame")
        );
        ResourceManifest::parse(&text)
            .expect("valid manifest")
            .with_operator_digest(Some(secret_digest("operator-token")))
    }

    fn request(path: &str, headers: &[(&str, &str)]) -> GateRequest {
        let mut builder = Request::builder().uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        GateRequest::from_request(&builder.body(Body::empty()).unwrap())
    }

    fn id(value: u64) -> ResourceId {
        ResourceId::new(value).expect("non-zero id")
    }

    #[tokio::test]
    async fn resolves_with_or_without_trailing_slash() {
        let manifest = manifest();
        assert_eq!(manifest.resolve(&request("/members/report", &[])).await, Some(id(42)));
        assert_eq!(manifest.resolve(&request("/members/report/", &[])).await, Some(id(42)));
        assert_eq!(manifest.resolve(&request("/elsewhere", &[])).await, None);
    }

    #[tokio::test]
    async fn only_resources_with_digest_are_gated() {
        let manifest = manifest();
        let plain = request("/about", &[]);
        assert!(manifest.is_gated_resource(id(42), &plain).await);
        assert!(!manifest.is_gated_resource(id(7), &plain).await);

        let listed: Vec<u64> = manifest
            .list_gated()
            .await
            .unwrap()
            .iter()
            .map(|resource| resource.id.get())
            .collect();
        assert_eq!(listed, vec![42]);
    }

    #[tokio::test]
    async fn unlock_cookie_must_match_digest() {
        let manifest = manifest();
        let anonymous = request("/members/report", &[]);
        assert!(manifest.is_locked(id(42), &anonymous).await);

        let wrong = request("/members/report", &[("cookie", "ppsc-unlock-42=deadbeef")]);
        assert!(manifest.is_locked(id(42), &wrong).await);

        let cookie = format!("ppsc-unlock-42={}", secret_digest("open sesame"));
        let unlocked = request("/members/report", &[("cookie", cookie.as_str())]);
        assert!(!manifest.is_locked(id(42), &unlocked).await);
    }

    #[tokio::test]
    async fn operator_bearer_token_grants_bypass() {
        let manifest = manifest();
        let operator = request("/members/report", &[("authorization", "Bearer operator-token")]);
        let visitor = request("/members/report", &[("authorization", "Bearer guess")]);
        assert!(manifest.is_privileged_bypass(&operator).await);
        assert!(!manifest.is_privileged_bypass(&visitor).await);

        let without_operator = ResourceManifest::parse("").unwrap();
        assert!(!without_operator.is_privileged_bypass(&operator).await);
    }

    #[test]
    fn rejects_duplicates_and_bad_digests() {
        let duplicate = r#"
            [[resources]]
            id = 1
            path = "/a"
            [[resources]]
            id = 1
            path = "/b"
        "#;
        assert!(ResourceManifest::parse(duplicate).is_err());

        let bad_digest = r#"
            [[resources]]
            id = 1
            path = "/a"
            secret_digest = "plaintext-password"
        "#;
        assert!(ResourceManifest::parse(bad_digest).is_err());

        let relative = r#"
            [[resources]]
            id = 1
            path = "a"
        "#;
        assert!(ResourceManifest::parse(relative).is_err());
    }
}
