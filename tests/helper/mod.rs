//! Shared fixtures for integration tests

#![allow(dead_code)]

mod source;

pub use source::{MemorySource, fixture_tarball};

use std::path::Path;
use std::sync::Arc;

use depot::config::FetchConfig;
use depot::shutdown::Shutdown;
use depot::source::{ArtifactCache, CachedSource, Source, SourceFetcher};

/// Fetcher over `source` with fast retries
pub fn fetcher(source: Arc<dyn Source>) -> SourceFetcher {
    SourceFetcher::new(test_fetch_config(), Shutdown::never()).with_source(source)
}

/// Fetcher over `source` with the artifact cache rooted at `cache_root` in front
pub fn cached_fetcher(source: Arc<dyn Source>, cache_root: &Path) -> SourceFetcher {
    let cache = Arc::new(ArtifactCache::new(cache_root.to_path_buf()));
    fetcher(Arc::new(CachedSource::new(source, cache)))
}

pub fn test_fetch_config() -> FetchConfig {
    FetchConfig {
        retries: 1,
        retry_backoff_ms: 1,
        ..FetchConfig::default()
    }
}

/// Write `content` as the project's depot.toml
pub fn write_manifest(root: &Path, content: &str) {
    std::fs::write(root.join("depot.toml"), content).unwrap();
}
