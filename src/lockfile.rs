//! Lock file (`depot.lock`) persistence
//!
//! Pretty-printed JSON with a mandatory `lockfileVersion` and a name-sorted
//! package list, so identical resolutions produce identical bytes. Each entry
//! records the names it depends on, which lets a later install tell whether
//! every locked package is still needed without asking any source.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::LOCKFILE_VERSION;
use crate::resolve::ResolvedSet;
use crate::source::{Integrity, PinnedPackage, SourceKind};
use crate::version::spec::validate_name;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock file {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Lock file schema version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u64, expected: u32 },

    #[error("Failed to serialize lock file: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Lock file I/O error: {0}")]
    Io(#[from] io::Error),
}

/// On-disk form of one resolved package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockEntry {
    pub name: String,
    pub version: String,
    pub integrity: Integrity,
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockDocument {
    lockfile_version: u64,
    packages: Vec<LockEntry>,
}

impl From<&PinnedPackage> for LockEntry {
    fn from(package: &PinnedPackage) -> Self {
        Self {
            name: package.name.clone(),
            version: package.version.to_string(),
            integrity: package.integrity.clone(),
            source: package.source,
            dependencies: Vec::new(),
        }
    }
}

pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Serialize `resolved` and atomically replace the lock file
    pub fn write(&self, resolved: &ResolvedSet) -> Result<(), LockError> {
        let bytes = render(resolved)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!("Wrote {} packages to {:?}", resolved.len(), self.path);
        Ok(())
    }

    pub fn read(&self) -> Result<ResolvedSet, LockError> {
        let raw = std::fs::read_to_string(&self.path)?;
        parse(&raw).map_err(|failure| match failure {
            ParseFailure::Corrupt(reason) => LockError::Corrupt {
                path: self.path.clone(),
                reason,
            },
            ParseFailure::VersionMismatch(found) => LockError::VersionMismatch {
                found,
                expected: LOCKFILE_VERSION,
            },
        })
    }

    /// Like [`LockFile::read`], but a missing file is `None`
    pub fn read_optional(&self) -> Result<Option<ResolvedSet>, LockError> {
        match self.read() {
            Ok(resolved) => Ok(Some(resolved)),
            Err(LockError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Deterministic lock file bytes for `resolved`
pub fn render(resolved: &ResolvedSet) -> Result<Vec<u8>, LockError> {
    let document = LockDocument {
        lockfile_version: u64::from(LOCKFILE_VERSION),
        // ResolvedSet iterates in name order
        packages: resolved
            .iter()
            .map(|package| LockEntry {
                dependencies: resolved.dependencies_of(&package.name).cloned().collect(),
                ..LockEntry::from(package)
            })
            .collect(),
    };
    let mut bytes = serde_json::to_vec_pretty(&document)?;
    bytes.push(b'\n');
    Ok(bytes)
}

enum ParseFailure {
    Corrupt(String),
    VersionMismatch(u64),
}

fn parse(raw: &str) -> Result<ResolvedSet, ParseFailure> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ParseFailure::Corrupt(e.to_string()))?;

    let version = value
        .get("lockfileVersion")
        .ok_or_else(|| ParseFailure::Corrupt("missing lockfileVersion".to_string()))?
        .as_u64()
        .ok_or_else(|| ParseFailure::Corrupt("lockfileVersion is not a number".to_string()))?;
    if version != u64::from(LOCKFILE_VERSION) {
        return Err(ParseFailure::VersionMismatch(version));
    }

    let document: LockDocument =
        serde_json::from_value(value).map_err(|e| ParseFailure::Corrupt(e.to_string()))?;

    let mut resolved = ResolvedSet::new();
    for entry in document.packages {
        for name in std::iter::once(&entry.name).chain(&entry.dependencies) {
            validate_name(name).map_err(|e| ParseFailure::Corrupt(e.to_string()))?;
        }
        let version = Version::parse(&entry.version).map_err(|e| {
            ParseFailure::Corrupt(format!("{}: invalid version {}: {e}", entry.name, entry.version))
        })?;
        let package = PinnedPackage {
            name: entry.name,
            version,
            integrity: entry.integrity,
            source: entry.source,
        };
        let name = package.name.clone();
        let dependencies = entry.dependencies.into_iter().collect();
        if resolved.insert_with_dependencies(package, dependencies).is_some() {
            return Err(ParseFailure::Corrupt(format!("duplicate entry for {name}")));
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn package(name: &str, version: &str, source: SourceKind) -> PinnedPackage {
        PinnedPackage {
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
            integrity: Integrity::of_bytes(format!("{name}@{version}").as_bytes()),
            source,
        }
    }

    fn sample_entries() -> Vec<(PinnedPackage, &'static [&'static str])> {
        vec![
            (package("b", "2.0.1", SourceKind::Registry), &[]),
            (package("github.com/owner/lib", "1.4.0", SourceKind::Git), &[]),
            (
                package("a", "1.2.0", SourceKind::Registry),
                &["b", "github.com/owner/lib"],
            ),
        ]
    }

    fn collect(entries: Vec<(PinnedPackage, &'static [&'static str])>) -> ResolvedSet {
        let mut set = ResolvedSet::new();
        for (package, deps) in entries {
            set.insert_with_dependencies(package, deps.iter().map(|d| d.to_string()).collect());
        }
        set
    }

    fn sample() -> ResolvedSet {
        collect(sample_entries())
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::new(dir.path().join("depot.lock"));

        lock.write(&sample()).unwrap();

        assert_eq!(lock.read().unwrap(), sample());
    }

    #[test]
    fn render_is_sorted_and_independent_of_insertion_order() {
        let reversed = collect(sample_entries().into_iter().rev().collect());

        let bytes = render(&sample()).unwrap();
        assert_eq!(bytes, render(&reversed).unwrap());

        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\n  \"lockfileVersion\": 1,"));
        assert!(text.ends_with("}\n"));
        let a = text.find("\"name\": \"a\"").unwrap();
        let b = text.find("\"name\": \"b\"").unwrap();
        let git = text.find("\"name\": \"github.com/owner/lib\"").unwrap();
        assert!(a < b && b < git);
    }

    #[rstest]
    #[case("not json")]
    #[case("{}")]
    #[case(r#"{"lockfileVersion": "one", "packages": []}"#)]
    #[case(r#"{"lockfileVersion": 1}"#)]
    #[case(r#"{"lockfileVersion": 1, "packages": [{"name": "a", "version": "x", "integrity": "sha256-2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824", "source": "registry"}]}"#)]
    #[case(r#"{"lockfileVersion": 1, "packages": [{"name": "a", "version": "1.0.0", "integrity": "md5-00", "source": "registry"}]}"#)]
    #[case(r#"{"lockfileVersion": 1, "packages": [{"name": "..", "version": "1.0.0", "integrity": "sha256-2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824", "source": "registry"}]}"#)]
    #[case(r#"{"lockfileVersion": 1, "packages": [{"name": "a/../../b", "version": "1.0.0", "integrity": "sha256-2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824", "source": "registry"}]}"#)]
    #[case(r#"{"lockfileVersion": 1, "packages": [{"name": "a", "dependencies": [".."], "version": "1.0.0", "integrity": "sha256-2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824", "source": "registry"}]}"#)]
    fn read_reports_corruption(#[case] content: &str) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("depot.lock");
        std::fs::write(&path, content).unwrap();

        assert!(matches!(
            LockFile::new(path).read(),
            Err(LockError::Corrupt { .. })
        ));
    }

    #[test]
    fn read_rejects_duplicate_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("depot.lock");
        let entry = LockEntry::from(&package("a", "1.0.0", SourceKind::Registry));
        let doc = serde_json::json!({"lockfileVersion": 1, "packages": [entry, entry]});
        std::fs::write(&path, doc.to_string()).unwrap();

        assert!(matches!(
            LockFile::new(path).read(),
            Err(LockError::Corrupt { reason, .. }) if reason.contains("duplicate")
        ));
    }

    #[test]
    fn read_reports_schema_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("depot.lock");
        std::fs::write(&path, r#"{"lockfileVersion": 2, "packages": []}"#).unwrap();

        assert!(matches!(
            LockFile::new(path).read(),
            Err(LockError::VersionMismatch {
                found: 2,
                expected: 1
            })
        ));
    }

    #[test]
    fn read_optional_treats_missing_file_as_none() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::new(dir.path().join("depot.lock"));

        assert!(lock.read_optional().unwrap().is_none());
    }

    #[test]
    fn write_replaces_existing_lock() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::new(dir.path().join("depot.lock"));
        lock.write(&sample()).unwrap();

        let smaller: ResolvedSet = [package("a", "1.3.0", SourceKind::Registry)].into_iter().collect();
        lock.write(&smaller).unwrap();

        assert_eq!(lock.read().unwrap(), smaller);
    }
}
