//! Filesystem-backed cache entry storage.
//!
//! One file per resource under a single owner-only directory. Writes go through
//! a temp file in the same directory and are renamed into place, so readers
//! only ever observe complete payloads.

use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::domain::types::ResourceId;

use super::config::{entry_path_in, parse_entry_file_name};

pub(crate) const ACCESS_DENY_FILE: &str = ".access-deny";
const ACCESS_DENY_BODY: &str = "# Direct access to cache artifacts is forbidden.\nDeny from all\n";
const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("failed to prepare cache directory `{path}`: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read cache entry `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write cache entry `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove cache entry `{path}`: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to list cache directory `{path}`: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache store task aborted: {0}")]
    Aborted(String),
}

impl CacheStoreError {
    /// Short operation label used in metrics and log fields.
    pub fn op(&self) -> &'static str {
        match self {
            CacheStoreError::Directory { .. } => "directory",
            CacheStoreError::Read { .. } => "read",
            CacheStoreError::Write { .. } => "write",
            CacheStoreError::Remove { .. } => "remove",
            CacheStoreError::List { .. } => "list",
            CacheStoreError::Aborted(_) => "aborted",
        }
    }
}

/// Filesystem facts about one cache entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: PathBuf,
    pub modified: Option<OffsetDateTime>,
    pub size_bytes: u64,
}

/// Outcome of a bulk purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

/// Cache entry storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    directory: PathBuf,
}

impl CacheStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Run blocking filesystem work for `self` on the blocking pool.
    pub async fn run<T, F>(self: &Arc<Self>, op: F) -> Result<T, CacheStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&CacheStore) -> Result<T, CacheStoreError> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| CacheStoreError::Aborted(err.to_string()))?
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, id: ResourceId) -> PathBuf {
        entry_path_in(&self.directory, id)
    }

    /// Create the directory and access-deny declaration, repairing permissions.
    ///
    /// Safe to call before every write; nothing about a previous success is
    /// remembered.
    pub fn ensure_directory(&self) -> Result<(), CacheStoreError> {
        let dir_err = |source| CacheStoreError::Directory {
            path: self.directory.clone(),
            source,
        };

        fs::create_dir_all(&self.directory).map_err(dir_err)?;
        restrict_mode(&self.directory, DIR_MODE).map_err(dir_err)?;

        let deny_path = self.directory.join(ACCESS_DENY_FILE);
        match owner_only_options()
            .write(true)
            .create_new(true)
            .open(&deny_path)
        {
            Ok(mut file) => file
                .write_all(ACCESS_DENY_BODY.as_bytes())
                .map_err(dir_err)?,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(dir_err(err)),
        }
        restrict_mode(&deny_path, FILE_MODE).map_err(dir_err)?;

        Ok(())
    }

    pub fn get(&self, id: ResourceId) -> Result<Option<Bytes>, CacheStoreError> {
        let path = self.path_for(id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheStoreError::Read { path, source }),
        }
    }

    /// Atomically replace the entry for `id` with `payload`.
    pub fn put(&self, id: ResourceId, payload: &[u8]) -> Result<PathBuf, CacheStoreError> {
        self.ensure_directory()?;

        let path = self.path_for(id);
        let write_err = |source| CacheStoreError::Write {
            path: path.clone(),
            source,
        };

        // Dropping `temp` on any early return unlinks the partial file.
        let mut temp = tempfile::Builder::new()
            .prefix(".tmp-")
            .suffix(".part")
            .tempfile_in(&self.directory)
            .map_err(write_err)?;
        temp.write_all(payload).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        restrict_mode(temp.path(), FILE_MODE).map_err(write_err)?;
        temp.persist(&path).map_err(|err| write_err(err.error))?;

        debug!(
            target = "ppsc::cache::store",
            id = %id,
            bytes = payload.len(),
            "cache entry written"
        );
        Ok(path)
    }

    /// Remove the entry for `id`; `Ok(false)` when there was none.
    pub fn delete(&self, id: ResourceId) -> Result<bool, CacheStoreError> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheStoreError::Remove { path, source }),
        }
    }

    pub fn list_all(&self) -> Result<BTreeMap<ResourceId, PathBuf>, CacheStoreError> {
        let list_err = |source| CacheStoreError::List {
            path: self.directory.clone(),
            source,
        };

        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(list_err(err)),
        };

        let mut found = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(list_err)?;
            let Some(id) = entry.file_name().to_str().and_then(parse_entry_file_name) else {
                continue;
            };
            if entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                found.insert(id, entry.path());
            }
        }
        Ok(found)
    }

    /// Remove every entry, continuing past individual failures.
    pub fn delete_all(&self) -> Result<PurgeReport, CacheStoreError> {
        let mut report = PurgeReport::default();
        for (id, path) in self.list_all()? {
            match fs::remove_file(&path) {
                Ok(()) => report.removed += 1,
                // Raced with another delete; nothing left to do.
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target = "ppsc::cache::store",
                        id = %id,
                        path = %path.display(),
                        error = %err,
                        "failed to remove cache entry during purge"
                    );
                }
            }
        }
        Ok(report)
    }

    pub fn stat(&self, id: ResourceId) -> Result<Option<EntryInfo>, CacheStoreError> {
        let path = self.path_for(id);
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(EntryInfo {
                modified: metadata.modified().ok().map(OffsetDateTime::from),
                size_bytes: metadata.len(),
                path,
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheStoreError::Read { path, source }),
        }
    }
}

/// Open options that create files owner-only where the platform supports modes.
pub(crate) fn owner_only_options() -> OpenOptions {
    #[allow(unused_mut)]
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }
    options
}

/// Force `path` to exactly `mode` when its permission bits differ.
pub(crate) fn restrict_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let current = fs::metadata(path)?.permissions().mode() & 0o777;
        if current != mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn id(value: u64) -> ResourceId {
        ResourceId::new(value).expect("non-zero id")
    }

    fn store_in(dir: &TempDir) -> CacheStore {
        CacheStore::new(dir.path().join("cache"))
    }

    #[cfg(unix)]
    fn mode_of(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).expect("metadata").permissions().mode() & 0o777
    }

    #[test]
    fn put_then_get_round_trips_bytes() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let payload = b"<html><body>members only \xe2\x9c\x93</body></html>";

        let path = store.put(id(42), payload).expect("put");
        assert_eq!(path, dir.path().join("cache").join("cache-42.html"));

        let first = store.get(id(42)).unwrap().expect("entry");
        let second = store.get(id(42)).unwrap().expect("entry");
        assert_eq!(&first[..], payload);
        assert_eq!(first, second);
    }

    #[test]
    fn get_missing_entry_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.get(id(1)).unwrap().is_none());
    }

    #[test]
    fn put_replaces_existing_entry() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.put(id(5), b"old").unwrap();
        store.put(id(5), b"new").unwrap();
        assert_eq!(&store.get(id(5)).unwrap().unwrap()[..], b"new");
    }

    #[test]
    fn put_leaves_no_temp_files_behind() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.put(id(3), b"payload").unwrap();

        let names: Vec<String> = fs::read_dir(store.directory())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|name| !name.ends_with(".part")), "{names:?}");
    }

    #[test]
    fn ensure_directory_writes_access_deny_declaration() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_directory().unwrap();
        store.ensure_directory().unwrap();

        let body = fs::read_to_string(store.directory().join(ACCESS_DENY_FILE)).unwrap();
        assert!(body.contains("Deny from all"));
    }

    #[cfg(unix)]
    #[test]
    fn entries_and_directory_are_owner_only() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let path = store.put(id(42), b"x").unwrap();

        assert_eq!(mode_of(store.directory()), 0o700);
        assert_eq!(mode_of(&path), 0o600);
        assert_eq!(mode_of(&store.directory().join(ACCESS_DENY_FILE)), 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn ensure_directory_repairs_drifted_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_directory().unwrap();
        fs::set_permissions(store.directory(), fs::Permissions::from_mode(0o755)).unwrap();

        store.ensure_directory().unwrap();
        assert_eq!(mode_of(store.directory()), 0o700);
    }

    #[test]
    fn put_recreates_a_removed_directory() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_directory().unwrap();
        fs::remove_dir_all(store.directory()).unwrap();

        store.put(id(9), b"again").unwrap();
        assert!(store.get(id(9)).unwrap().is_some());
    }

    #[test]
    fn delete_reports_presence() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.put(id(42), b"x").unwrap();

        assert!(store.delete(id(42)).unwrap());
        assert!(store.get(id(42)).unwrap().is_none());
        assert!(!store.delete(id(42)).unwrap());
    }

    #[test]
    fn list_all_matches_only_entry_names() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.put(id(1), b"a").unwrap();
        store.put(id(20), b"b").unwrap();
        fs::write(store.directory().join("notes.txt"), b"ignored").unwrap();
        fs::write(store.directory().join("cache-abc.html"), b"ignored").unwrap();
        fs::create_dir(store.directory().join("cache-7.html")).unwrap();

        let listed = store.list_all().unwrap();
        let ids: Vec<u64> = listed.keys().map(|id| id.get()).collect();
        assert_eq!(ids, vec![1, 20]);
        assert_eq!(listed[&id(20)], store.path_for(id(20)));
    }

    #[test]
    fn list_all_on_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn delete_all_empties_the_listing() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for value in 1..=4 {
            store.put(id(value), b"payload").unwrap();
        }

        let report = store.delete_all().unwrap();
        assert_eq!(report, PurgeReport { removed: 4, failed: 0 });
        assert!(store.list_all().unwrap().is_empty());
        assert!(store.directory().join(ACCESS_DENY_FILE).exists());
    }

    #[test]
    fn stat_reports_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.stat(id(8)).unwrap().is_none());

        store.put(id(8), b"12345").unwrap();
        let info = store.stat(id(8)).unwrap().expect("entry info");
        assert_eq!(info.size_bytes, 5);
        assert_eq!(info.path, store.path_for(id(8)));
        assert!(info.modified.is_some());
    }
}
