//! Materializing resolved packages into the module directory
//!
//! Each package is extracted into a fresh staging directory next to its
//! target, stamped with an integrity marker, then swapped into place. A
//! module whose marker already matches the pinned package is left alone.

pub mod report;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveError};
use crate::resolve::ResolvedSet;
use crate::source::{ArtifactHandle, FetchError, Integrity, Payload, PinnedPackage, SourceFetcher, escape_name};

pub use report::{InstallReport, PackageOutcome};

/// Marker written into every installed module
pub const MARKER_FILE: &str = ".depot-integrity";

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Failed to fetch {name}: {source}")]
    Fetch {
        name: String,
        #[source]
        source: FetchError,
    },

    #[error("Failed to extract {name}: {source}")]
    Extract {
        name: String,
        #[source]
        source: ArchiveError,
    },

    #[error("I/O error for {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Installation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Marker {
    name: String,
    version: String,
    integrity: Integrity,
}

impl Marker {
    fn matches(&self, package: &PinnedPackage) -> bool {
        self.name == package.name
            && self.version == package.version.to_string()
            && self.integrity == package.integrity
    }
}

/// A difference between the resolved set and the module directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    Missing(String),
    Mismatch { name: String, found: Option<String> },
    /// Installed but not part of the resolved set
    Extraneous(String),
}

pub struct Installer<'a> {
    fetcher: &'a SourceFetcher,
    modules_dir: PathBuf,
}

impl<'a> Installer<'a> {
    pub fn new(fetcher: &'a SourceFetcher, modules_dir: PathBuf) -> Self {
        Self {
            fetcher,
            modules_dir,
        }
    }

    /// Directory for `name`; names that would escape the module directory are refused
    pub fn module_dir(&self, name: &str) -> io::Result<PathBuf> {
        Ok(self.modules_dir.join(escape_name(name)?))
    }

    fn read_marker(dir: &Path) -> Option<Marker> {
        let raw = fs::read_to_string(dir.join(MARKER_FILE)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Whether `package` is installed with matching version and integrity
    pub fn is_present(&self, package: &PinnedPackage) -> bool {
        self.module_dir(&package.name)
            .ok()
            .and_then(|dir| Self::read_marker(&dir))
            .is_some_and(|m| m.matches(package))
    }

    /// Install every package, continuing past individual failures
    pub async fn install(&self, resolved: &ResolvedSet) -> InstallReport {
        let outcomes: Vec<(String, PackageOutcome)> = stream::iter(resolved.iter())
            .map(|package| async move {
                let outcome = match self.install_one(package).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Failed to install {}: {}", package, e);
                        PackageOutcome::Failed(e)
                    }
                };
                (package.name.clone(), outcome)
            })
            .buffer_unordered(self.fetcher.workers())
            .collect()
            .await;

        let mut report = InstallReport::new();
        for (name, outcome) in outcomes {
            report.record(name, outcome);
        }
        info!("{}", report);
        report
    }

    async fn install_one(&self, package: &PinnedPackage) -> Result<PackageOutcome, InstallError> {
        let target = self
            .module_dir(&package.name)
            .map_err(|source| InstallError::Io {
                name: package.name.clone(),
                source,
            })?;
        if self.is_present(package) {
            debug!("{} already installed", package);
            return Ok(PackageOutcome::AlreadyPresent);
        }
        if self.fetcher.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let handle = self
            .fetcher
            .fetch_artifact(package)
            .await
            .map_err(|source| match source {
                FetchError::Cancelled => InstallError::Cancelled,
                source => InstallError::Fetch {
                    name: package.name.clone(),
                    source,
                },
            })?;

        let modules_dir = self.modules_dir.clone();
        tokio::task::spawn_blocking(move || materialize(&modules_dir, &target, handle))
            .await
            .map_err(|e| InstallError::Io {
                name: package.name.clone(),
                source: io::Error::other(e),
            })??;

        debug!("Installed {}", package);
        Ok(PackageOutcome::Installed)
    }

    /// Compare the module directory against `resolved`
    pub fn check_drift(&self, resolved: &ResolvedSet) -> io::Result<Vec<Drift>> {
        let mut drift = Vec::new();
        for package in resolved {
            let dir = self.module_dir(&package.name)?;
            if !dir.exists() {
                drift.push(Drift::Missing(package.name.clone()));
                continue;
            }
            match Self::read_marker(&dir) {
                Some(marker) if marker.matches(package) => {}
                marker => drift.push(Drift::Mismatch {
                    name: package.name.clone(),
                    found: marker.map(|m| m.version),
                }),
            }
        }
        for (name, _) in self.extraneous(resolved)? {
            drift.push(Drift::Extraneous(name));
        }
        Ok(drift)
    }

    /// Installed modules that are not in `resolved`, as (name, directory)
    fn extraneous(&self, resolved: &ResolvedSet) -> io::Result<Vec<(String, PathBuf)>> {
        let entries = match fs::read_dir(&self.modules_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let name = Self::read_marker(&path)
                .map(|m| m.name)
                .unwrap_or(file_name);
            if !resolved.contains(&name) {
                found.push((name, path));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Remove installed modules that are not in `resolved`; returns their names
    pub fn prune(&self, resolved: &ResolvedSet) -> io::Result<Vec<String>> {
        let mut removed = Vec::new();
        for (name, path) in self.extraneous(resolved)? {
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!("Pruned {}", name);
                    removed.push(name);
                }
                Err(e) => warn!("Failed to prune {}: {}", name, e),
            }
        }
        Ok(removed)
    }

    /// Remove the module directory for `name`; a missing module is not an error
    pub fn uninstall(&self, name: &str) -> Result<(), InstallError> {
        match self.module_dir(name).and_then(fs::remove_dir_all) {
            Ok(()) => {
                debug!("Uninstalled {}", name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(InstallError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// Extract into staging, stamp the marker, then remove-then-rename into `target`
fn materialize(
    modules_dir: &Path,
    target: &Path,
    handle: ArtifactHandle,
) -> Result<(), InstallError> {
    let name = handle.package.name.clone();
    let io_err = |source: io::Error| InstallError::Io {
        name: name.clone(),
        source,
    };

    fs::create_dir_all(modules_dir).map_err(io_err)?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(modules_dir)
        .map_err(io_err)?;

    match &handle.payload {
        Payload::Tarball(path) => {
            archive::unpack(path, staging.path()).map_err(|source| InstallError::Extract {
                name: name.clone(),
                source,
            })?;
        }
        Payload::Tree(path) => copy_tree(path, staging.path()).map_err(io_err)?,
    }

    let marker = Marker {
        name: handle.package.name.clone(),
        version: handle.package.version.to_string(),
        integrity: handle.package.integrity.clone(),
    };
    let json = serde_json::to_vec_pretty(&marker).map_err(|e| io_err(io::Error::other(e)))?;
    fs::write(staging.path().join(MARKER_FILE), json).map_err(io_err)?;

    if target.exists() {
        fs::remove_dir_all(target).map_err(io_err)?;
    }
    let staged = staging.keep();
    if let Err(e) = fs::rename(&staged, target) {
        let _ = fs::remove_dir_all(&staged);
        return Err(io_err(e));
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest = to.join(entry.file_name());
        if file_type.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            copy_tree(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}
