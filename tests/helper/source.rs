//! In-memory package source with fetch counters

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use semver::Version;
use tempfile::TempDir;

use depot::archive;
use depot::source::{
    FetchError, Integrity, PackageMetadata, Payload, PinnedPackage, Source, SourceKind,
    VersionListing,
};
use depot::version::Requirement;

struct Published {
    dependencies: BTreeMap<String, Requirement>,
    tarball: Vec<u8>,
}

/// Registry stand-in serving packages registered with [`MemorySource::publish`]
#[derive(Default)]
pub struct MemorySource {
    packages: Mutex<HashMap<String, BTreeMap<Version, Published>>>,
    latest: Mutex<HashMap<String, Version>>,
    /// Names whose artifact downloads fail
    broken: Mutex<Vec<String>>,
    pub version_fetches: AtomicUsize,
    pub metadata_fetches: AtomicUsize,
    pub artifact_fetches: AtomicUsize,
}

/// Tarball holding a depot.toml and one source file for `name@version`
pub fn fixture_tarball(name: &str, version: &str) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("depot.toml"),
        format!("[package]\nname = \"{name}\"\nversion = \"{version}\"\n"),
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/lib.dr"),
        format!("// {name} {version}\n"),
    )
    .unwrap();
    archive::pack_dir(dir.path(), None).unwrap()
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name@version` depending on `deps` (`(name, requirement)`)
    pub fn publish(self, name: &str, version: &str, deps: &[(&str, &str)]) -> Self {
        let dependencies = deps
            .iter()
            .map(|(dep, req)| (dep.to_string(), Requirement::parse(req).unwrap()))
            .collect();
        let published = Published {
            dependencies,
            tarball: fixture_tarball(name, version),
        };
        self.packages
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(Version::parse(version).unwrap(), published);
        self
    }

    pub fn with_latest(self, name: &str, version: &str) -> Self {
        self.latest
            .lock()
            .unwrap()
            .insert(name.to_string(), Version::parse(version).unwrap());
        self
    }

    /// Make every artifact download of `name` fail
    pub fn break_artifact(self, name: &str) -> Self {
        self.broken.lock().unwrap().push(name.to_string());
        self
    }

    pub fn integrity_of(&self, name: &str, version: &str) -> Integrity {
        let packages = self.packages.lock().unwrap();
        let published = &packages[name][&Version::parse(version).unwrap()];
        Integrity::of_bytes(&published.tarball)
    }

    pub fn artifact_fetches(&self) -> usize {
        self.artifact_fetches.load(Ordering::SeqCst)
    }

    pub fn metadata_fetches(&self) -> usize {
        self.metadata_fetches.load(Ordering::SeqCst)
    }

    pub fn version_fetches(&self) -> usize {
        self.version_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MemorySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Registry
    }

    async fn fetch_versions(&self, name: &str) -> Result<VersionListing, FetchError> {
        self.version_fetches.fetch_add(1, Ordering::SeqCst);
        let packages = self.packages.lock().unwrap();
        let versions = packages
            .get(name)
            .ok_or_else(|| FetchError::NotFound(name.to_string()))?;
        let latest = self.latest.lock().unwrap().get(name).cloned();
        Ok(VersionListing::new(name, versions.keys().cloned().collect(), latest))
    }

    async fn fetch_metadata(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<PackageMetadata, FetchError> {
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        let packages = self.packages.lock().unwrap();
        let published = packages
            .get(name)
            .and_then(|versions| versions.get(version))
            .ok_or_else(|| FetchError::NotFound(format!("{name}@{version}")))?;
        Ok(PackageMetadata {
            name: name.to_string(),
            version: version.clone(),
            dependencies: published.dependencies.clone(),
            source: SourceKind::Registry,
            location: format!("memory://{name}/{version}"),
            integrity: Integrity::of_bytes(&published.tarball),
        })
    }

    async fn fetch_artifact(
        &self,
        package: &PinnedPackage,
        staging: &Path,
    ) -> Result<Payload, FetchError> {
        self.artifact_fetches.fetch_add(1, Ordering::SeqCst);
        if self.broken.lock().unwrap().contains(&package.name) {
            return Err(FetchError::UnexpectedStatus {
                status: 503,
                url: format!("memory://{}", package.name),
            });
        }

        let tarball = {
            let packages = self.packages.lock().unwrap();
            packages
                .get(&package.name)
                .and_then(|versions| versions.get(&package.version))
                .map(|published| published.tarball.clone())
                .ok_or_else(|| FetchError::NotFound(package.to_string()))?
        };

        let actual = Integrity::of_bytes(&tarball);
        if actual != package.integrity {
            return Err(FetchError::IntegrityViolation {
                name: package.name.clone(),
                version: package.version.to_string(),
                expected: package.integrity.to_string(),
                actual: actual.to_string(),
            });
        }

        let path = staging.join("package.tgz");
        std::fs::write(&path, tarball)?;
        Ok(Payload::Tarball(path))
    }
}
