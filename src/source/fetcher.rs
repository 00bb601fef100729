//! Uniform entry point over every configured source
//!
//! Routes each call to the source that serves the package, memoizes listings
//! and metadata for the rest of the run, and wraps every network call with a
//! timeout, bounded retries and cooperative cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use semver::Version;
use tracing::{debug, warn};

use crate::config::{Config, FetchConfig};
use crate::shutdown::Shutdown;
use crate::source::Source;
use crate::source::cache::{ArtifactCache, CachedSource};
use crate::source::error::FetchError;
use crate::source::git::GitSource;
use crate::source::registry::RegistrySource;
use crate::source::types::{ArtifactHandle, PackageMetadata, PinnedPackage, SourceKind, VersionListing};

/// Upper bound on a server-requested retry delay
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

pub struct SourceFetcher {
    sources: HashMap<SourceKind, Arc<dyn Source>>,
    listings: Mutex<HashMap<String, Arc<VersionListing>>>,
    metadata: Mutex<HashMap<(String, Version), Arc<PackageMetadata>>>,
    config: FetchConfig,
    shutdown: Shutdown,
}

impl SourceFetcher {
    pub fn new(config: FetchConfig, shutdown: Shutdown) -> Self {
        Self {
            sources: HashMap::new(),
            listings: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            config,
            shutdown,
        }
    }

    /// Register a source under the kind it reports
    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.insert(source.kind(), source);
        self
    }

    /// Registry and git sources, both behind the shared artifact cache
    pub fn from_config(config: &Config, shutdown: Shutdown) -> Self {
        let cache = Arc::new(ArtifactCache::new(config.cache_dir()));
        let registry: Arc<dyn Source> = Arc::new(RegistrySource::new(&config.registry.url));
        let git: Arc<dyn Source> = Arc::new(GitSource::new());

        Self::new(config.fetch.clone(), shutdown)
            .with_source(Arc::new(CachedSource::new(registry, Arc::clone(&cache))))
            .with_source(Arc::new(CachedSource::new(git, cache)))
    }

    pub fn workers(&self) -> usize {
        self.config.workers()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    fn source(&self, kind: SourceKind, name: &str) -> Result<&Arc<dyn Source>, FetchError> {
        self.sources
            .get(&kind)
            .ok_or_else(|| FetchError::UnsupportedSource(name.to_string()))
    }

    fn metadata_timeout(&self, kind: SourceKind) -> Duration {
        match kind {
            // Metadata of a git package requires a clone
            SourceKind::Git => self.config.download_timeout(),
            SourceKind::Registry => self.config.timeout(),
        }
    }

    /// All published versions of `name`; an empty listing is an error
    pub async fn fetch_versions(&self, name: &str) -> Result<Arc<VersionListing>, FetchError> {
        if let Ok(listings) = self.listings.lock()
            && let Some(found) = listings.get(name)
        {
            return Ok(Arc::clone(found));
        }

        let source = self.source(SourceKind::detect(name), name)?;
        let listing = self
            .guarded(name, self.config.timeout(), move || source.fetch_versions(name))
            .await?;
        if listing.is_empty() {
            return Err(FetchError::NoVersions(name.to_string()));
        }
        debug!("{} has {} versions", name, listing.versions.len());

        let listing = Arc::new(listing);
        if let Ok(mut listings) = self.listings.lock() {
            listings.insert(name.to_string(), Arc::clone(&listing));
        }
        Ok(listing)
    }

    pub async fn fetch_metadata(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Arc<PackageMetadata>, FetchError> {
        let key = (name.to_string(), version.clone());
        if let Ok(metadata) = self.metadata.lock()
            && let Some(found) = metadata.get(&key)
        {
            return Ok(Arc::clone(found));
        }

        let kind = SourceKind::detect(name);
        let source = self.source(kind, name)?;
        let what = format!("{name}@{version}");
        let metadata = self
            .guarded(&what, self.metadata_timeout(kind), move || {
                source.fetch_metadata(name, version)
            })
            .await?;
        metadata.check_dependency_names()?;
        let metadata = Arc::new(metadata);

        if let Ok(mut cache) = self.metadata.lock() {
            cache.insert(key, Arc::clone(&metadata));
        }
        Ok(metadata)
    }

    /// Acquire the artifact for a pinned package
    pub async fn fetch_artifact(
        &self,
        package: &PinnedPackage,
    ) -> Result<ArtifactHandle, FetchError> {
        let source = self.source(package.source, &package.name)?;
        let staging = tempfile::tempdir()?;
        let staging_path = staging.path();
        let what = package.to_string();

        let payload = self
            .guarded(&what, self.config.download_timeout(), move || {
                source.fetch_artifact(package, staging_path)
            })
            .await?;

        Ok(ArtifactHandle::new(package.clone(), payload, Some(staging)))
    }

    /// Run `op` with a timeout per attempt, retrying transient failures,
    /// and give up as soon as shutdown is signalled
    async fn guarded<T, F, Fut>(&self, what: &str, limit: Duration, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0;

        loop {
            if shutdown.is_shutdown() {
                return Err(FetchError::Cancelled);
            }

            let result = tokio::select! {
                _ = shutdown.recv() => return Err(FetchError::Cancelled),
                result = tokio::time::timeout(limit, op()) => {
                    result.unwrap_or_else(|_| Err(FetchError::Timeout(what.to_string())))
                }
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    let delay = match &e {
                        FetchError::RateLimited {
                            retry_after_secs: Some(secs),
                        } => Duration::from_secs(*secs).min(MAX_RETRY_AFTER),
                        _ => self.config.backoff(attempt),
                    };
                    warn!(
                        "Retrying {} in {:?} (attempt {}/{}): {}",
                        what, delay, attempt, self.config.retries, e
                    );
                    tokio::select! {
                        _ = shutdown.recv() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}
