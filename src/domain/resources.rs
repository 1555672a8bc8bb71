use serde::{Deserialize, Serialize};

use super::types::ResourceId;

/// A resource that carries an access secret, as reported by the content catalog.
///
/// `kind` and `status` are free-form labels owned by the content system
/// (`page`, `post`, `publish`, `draft`, ...). Admin operations walk every
/// gated resource regardless of either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatedResource {
    pub id: ResourceId,
    pub kind: String,
    pub status: String,
    /// Public request path, always starting with `/`.
    pub path: String,
}
