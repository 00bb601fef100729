use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::source::error::FetchError;
use crate::source::integrity::Integrity;
use crate::version::Requirement;
use crate::version::spec::validate_name;

/// Name prefixes routed to the source-control fetcher
const GIT_HOSTS: [&str; 4] = ["github.com/", "gitlab.com/", "bitbucket.org/", "git+"];

/// Where a package is acquired from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Registry,
    Git,
}

impl SourceKind {
    /// Route a package name to the source that serves it
    pub fn detect(name: &str) -> Self {
        if GIT_HOSTS.iter().any(|prefix| name.starts_with(prefix)) {
            SourceKind::Git
        } else {
            SourceKind::Registry
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Registry => "registry",
            SourceKind::Git => "git",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registry" => Ok(SourceKind::Registry),
            "git" => Ok(SourceKind::Git),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

/// Published versions of a package, ascending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionListing {
    pub name: String,
    pub versions: Vec<Version>,
    /// Version the source advertises as latest, when it has one
    pub latest: Option<Version>,
}

impl VersionListing {
    pub fn new(name: &str, mut versions: Vec<Version>, latest: Option<Version>) -> Self {
        versions.sort();
        versions.dedup();
        let latest = latest.filter(|l| versions.contains(l));
        Self {
            name: name.to_string(),
            versions,
            latest,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.versions.binary_search(version).is_ok()
    }
}

/// Everything the resolver needs to know about one published version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub name: String,
    pub version: Version,
    pub dependencies: BTreeMap<String, Requirement>,
    pub source: SourceKind,
    /// Tarball URL or repository reference
    pub location: String,
    pub integrity: Integrity,
}

impl PackageMetadata {
    pub fn pinned(&self) -> PinnedPackage {
        PinnedPackage {
            name: self.name.clone(),
            version: self.version.clone(),
            integrity: self.integrity.clone(),
            source: self.source,
        }
    }

    /// Reject dependency names that are not valid package names
    pub fn check_dependency_names(&self) -> Result<(), FetchError> {
        match self.dependencies.keys().find(|dep| validate_name(dep).is_err()) {
            Some(dep) => Err(FetchError::InvalidResponse(format!(
                "{}@{} depends on invalid package name {:?}",
                self.name, self.version, dep
            ))),
            None => Ok(()),
        }
    }
}

/// A resolved package: exact version plus expected content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PinnedPackage {
    pub name: String,
    pub version: Version,
    pub integrity: Integrity,
    pub source: SourceKind,
}

impl fmt::Display for PinnedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Fetched artifact content on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Gzip tarball as published to a registry
    Tarball(PathBuf),
    /// Checked-out source tree
    Tree(PathBuf),
}

impl Payload {
    pub fn path(&self) -> &Path {
        match self {
            Payload::Tarball(path) | Payload::Tree(path) => path,
        }
    }

    /// Hash the content the same way the source computed its integrity
    pub fn compute_integrity(&self) -> std::io::Result<Integrity> {
        match self {
            Payload::Tarball(path) => Integrity::of_file(path),
            Payload::Tree(path) => Integrity::of_tree(path),
        }
    }
}

/// An acquired artifact; staging space is released when the handle drops
#[derive(Debug)]
pub struct ArtifactHandle {
    pub package: PinnedPackage,
    pub payload: Payload,
    _staging: Option<TempDir>,
}

impl ArtifactHandle {
    pub fn new(package: PinnedPackage, payload: Payload, staging: Option<TempDir>) -> Self {
        Self {
            package,
            payload,
            _staging: staging,
        }
    }
}
