//! Machine-wide artifact cache
//!
//! Layout: `<root>/<escaped-name>/<version>/` holding `entry.json` and either
//! `package.tgz` or `tree/`. Entries are assembled in `<root>/.staging/` and
//! renamed into place, so a reader never observes a half-written entry.
//! Entries are never modified once committed; only [`ArtifactCache::clean`]
//! removes them.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::source::error::FetchError;
use crate::source::integrity::Integrity;
use crate::source::types::{PackageMetadata, Payload, PinnedPackage, SourceKind, VersionListing};
use crate::source::{Source, escape_name};

const ENTRY_FILE: &str = "entry.json";
const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PayloadKind {
    Tarball,
    Tree,
}

/// Self-description stored alongside each cached payload
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRecord {
    name: String,
    version: String,
    integrity: Integrity,
    source: SourceKind,
    kind: PayloadKind,
    /// Payload path relative to the entry directory
    path: PathBuf,
}

pub struct ArtifactCache {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, name: &str, version: &Version) -> io::Result<PathBuf> {
        Ok(self.root.join(escape_name(name)?).join(version.to_string()))
    }

    /// In-process lock serializing work on one cache key
    pub async fn lock(&self, package: &PinnedPackage) -> tokio::sync::OwnedMutexGuard<()> {
        let key = package.to_string();
        let lock = match self.locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(key).or_default()),
            // Poisoned map: fall back to an unshared lock
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        };
        lock.lock_owned().await
    }

    /// Verified cached payload for `package`, if present
    pub fn lookup(&self, package: &PinnedPackage) -> Result<Option<Payload>, FetchError> {
        let dir = self.entry_dir(&package.name, &package.version)?;
        let raw = match fs::read_to_string(dir.join(ENTRY_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let violation = |actual: String| FetchError::IntegrityViolation {
            name: package.name.clone(),
            version: package.version.to_string(),
            expected: package.integrity.to_string(),
            actual,
        };

        let record: EntryRecord = serde_json::from_str(&raw)
            .map_err(|e| violation(format!("unreadable cache entry ({e})")))?;
        if record.integrity != package.integrity {
            return Err(violation(record.integrity.to_string()));
        }

        let path = dir.join(&record.path);
        let payload = match record.kind {
            PayloadKind::Tarball => Payload::Tarball(path),
            PayloadKind::Tree => Payload::Tree(path),
        };
        let actual = payload
            .compute_integrity()
            .map_err(|e| violation(format!("unreadable cached payload ({e})")))?;
        if actual != package.integrity {
            return Err(violation(actual.to_string()));
        }

        Ok(Some(payload))
    }

    /// Fresh staging directory on the same filesystem as the entries
    pub fn staging(&self) -> Result<TempDir, FetchError> {
        let dir = self.root.join(STAGING_DIR);
        fs::create_dir_all(&dir)?;
        Ok(TempDir::new_in(dir)?)
    }

    /// Publish a staged payload as the entry for `package`
    pub fn commit(
        &self,
        package: &PinnedPackage,
        staging: TempDir,
        payload: Payload,
    ) -> Result<Payload, FetchError> {
        let (kind, rel) = match &payload {
            Payload::Tarball(path) => (PayloadKind::Tarball, path),
            Payload::Tree(path) => (PayloadKind::Tree, path),
        };
        let rel = rel
            .strip_prefix(staging.path())
            .map_err(|_| {
                FetchError::Io(io::Error::other(format!(
                    "payload {} is outside the staging directory",
                    rel.display()
                )))
            })?
            .to_path_buf();

        let record = EntryRecord {
            name: package.name.clone(),
            version: package.version.to_string(),
            integrity: package.integrity.clone(),
            source: package.source,
            kind,
            path: rel,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(io::Error::other)?;
        fs::write(staging.path().join(ENTRY_FILE), json)?;

        let dest = self.entry_dir(&package.name, &package.version)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let staged = staging.keep();
        if let Err(e) = fs::rename(&staged, &dest) {
            let _ = fs::remove_dir_all(&staged);
            if dest.join(ENTRY_FILE).exists() {
                // Another process committed the same key first
                debug!("Cache entry for {} already committed", package);
            } else {
                return Err(e.into());
            }
        }

        self.lookup(package)?.ok_or_else(|| {
            FetchError::Io(io::Error::other(format!(
                "cache entry for {package} vanished after commit"
            )))
        })
    }

    /// Remove every cached entry
    pub fn clean(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                info!("Removed cache at {}", self.root.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Puts the cache in front of another source's artifact downloads
pub struct CachedSource {
    inner: Arc<dyn Source>,
    cache: Arc<ArtifactCache>,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn Source>, cache: Arc<ArtifactCache>) -> Self {
        Self { inner, cache }
    }

    async fn lookup(&self, package: &PinnedPackage) -> Result<Option<Payload>, FetchError> {
        let cache = Arc::clone(&self.cache);
        let package = package.clone();
        tokio::task::spawn_blocking(move || cache.lookup(&package))
            .await
            .map_err(|e| FetchError::Io(io::Error::other(e)))?
    }
}

#[async_trait::async_trait]
impl Source for CachedSource {
    fn kind(&self) -> SourceKind {
        self.inner.kind()
    }

    async fn fetch_versions(&self, name: &str) -> Result<VersionListing, FetchError> {
        self.inner.fetch_versions(name).await
    }

    async fn fetch_metadata(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<PackageMetadata, FetchError> {
        self.inner.fetch_metadata(name, version).await
    }

    /// Cached entries are served in place; `staging` is only used by the inner source on a miss
    async fn fetch_artifact(
        &self,
        package: &PinnedPackage,
        _staging: &Path,
    ) -> Result<Payload, FetchError> {
        let _guard = self.cache.lock(package).await;

        if let Some(payload) = self.lookup(package).await? {
            debug!("Cache hit for {}", package);
            return Ok(payload);
        }

        debug!("Cache miss for {}", package);
        let staging = self.cache.staging()?;
        let payload = self.inner.fetch_artifact(package, staging.path()).await?;

        let cache = Arc::clone(&self.cache);
        let package = package.clone();
        tokio::task::spawn_blocking(move || cache.commit(&package, staging, payload))
            .await
            .map_err(|e| FetchError::Io(io::Error::other(e)))?
    }
}
