//! Cache configuration.
//!
//! Controls where cache entries live and how captured renders are classified,
//! via the `[cache]` section of `ppsc.toml`.

use std::path::{Path, PathBuf};

use crate::domain::types::ResourceId;

pub(crate) const DEFAULT_CACHE_DIR: &str = "ppsc-cache";
pub(crate) const DEFAULT_LOG_FILE: &str = "ppsc-debug.log";
pub(crate) const DEFAULT_LOCK_MARKER: &str = "post-password-form";
pub(crate) const DEFAULT_SIGNATURE: &str = "ppsc";
pub(crate) const DEFAULT_MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;

const ENTRY_PREFIX: &str = "cache-";
const ENTRY_SUFFIX: &str = ".html";

/// Resolved cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding cache entries, the access-deny file and the audit log.
    pub directory: PathBuf,
    /// Audit log file name inside `directory`.
    pub log_file: String,
    /// Substring whose presence in a render means the password form is still shown.
    pub lock_marker: String,
    /// Name used in the provenance comments prefixed to responses.
    pub signature: String,
    /// Prefix response bodies with the provenance comment.
    pub annotate_responses: bool,
    /// Serialize render+write per resource id.
    pub single_flight: bool,
    /// Largest render body the coordinator will buffer for capture.
    pub max_capture_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_CACHE_DIR),
            log_file: DEFAULT_LOG_FILE.to_string(),
            lock_marker: DEFAULT_LOCK_MARKER.to_string(),
            signature: DEFAULT_SIGNATURE.to_string(),
            annotate_responses: true,
            single_flight: true,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            directory: settings.directory.clone(),
            log_file: settings.log_file.clone(),
            lock_marker: settings.lock_marker.clone(),
            signature: settings.signature.clone(),
            annotate_responses: settings.annotate_responses,
            single_flight: settings.single_flight,
            max_capture_bytes: settings.max_capture_bytes.get(),
        }
    }
}

impl CacheConfig {
    /// Build a configuration rooted at `directory` with defaults elsewhere.
    pub fn at(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.directory.join(&self.log_file)
    }

    pub fn entry_path(&self, id: ResourceId) -> PathBuf {
        entry_path_in(&self.directory, id)
    }

    pub fn cached_marker(&self) -> String {
        format!("<!-- cached by {} -->\n", self.signature)
    }

    pub fn not_cached_marker(&self) -> String {
        format!("<!-- not cached by {} -->\n", self.signature)
    }
}

/// `<dir>/cache-<id>.html`
pub(crate) fn entry_path_in(directory: &Path, id: ResourceId) -> PathBuf {
    directory.join(entry_file_name(id))
}

pub(crate) fn entry_file_name(id: ResourceId) -> String {
    format!("{ENTRY_PREFIX}{id}{ENTRY_SUFFIX}")
}

/// Inverse of [`entry_file_name`]; `None` for anything not produced by it.
pub(crate) fn parse_entry_file_name(name: &str) -> Option<ResourceId> {
    let digits = name.strip_prefix(ENTRY_PREFIX)?.strip_suffix(ENTRY_SUFFIX)?;
    let id: ResourceId = digits.parse().ok()?;
    // Reject non-canonical spellings such as `cache-007.html`.
    (entry_file_name(id) == name).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: u64) -> ResourceId {
        ResourceId::new(value).expect("non-zero id")
    }

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.directory, PathBuf::from("ppsc-cache"));
        assert_eq!(config.log_file, "ppsc-debug.log");
        assert!(config.annotate_responses);
        assert!(config.single_flight);
        assert_eq!(config.max_capture_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn entry_path_is_deterministic() {
        let config = CacheConfig::at("/var/cache/ppsc");
        assert_eq!(
            config.entry_path(id(42)),
            PathBuf::from("/var/cache/ppsc/cache-42.html")
        );
        assert_eq!(
            config.log_path(),
            PathBuf::from("/var/cache/ppsc/ppsc-debug.log")
        );
    }

    #[test]
    fn parses_only_canonical_entry_names() {
        assert_eq!(parse_entry_file_name("cache-42.html"), Some(id(42)));
        assert_eq!(parse_entry_file_name("cache-042.html"), None);
        assert_eq!(parse_entry_file_name("cache-42.html.tmp"), None);
        assert_eq!(parse_entry_file_name(".cache-42.html"), None);
        assert_eq!(parse_entry_file_name("ppsc-debug.log"), None);
        assert_eq!(parse_entry_file_name("cache-.html"), None);
    }

    #[test]
    fn markers_carry_signature() {
        let config = CacheConfig {
            signature: "edge".to_string(),
            ..Default::default()
        };
        assert_eq!(config.cached_marker(), "<!-- cached by edge -->\n");
        assert_eq!(config.not_cached_marker(), "<!-- not cached by edge -->\n");
    }
}
