//! Source-control packages fetched with the `git` binary
//!
//! Versions are the repository's semver-looking tags. A version is acquired
//! with a shallow clone of its tag; the checked-out tree (without `.git`) is
//! what gets hashed and installed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use semver::Version;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::MANIFEST_FILE;
use crate::manifest::{ManifestReader, TomlManifestReader};
use crate::source::error::FetchError;
use crate::source::integrity::Integrity;
use crate::source::types::{PackageMetadata, Payload, PinnedPackage, SourceKind, VersionListing};
use crate::source::Source;
use crate::version::Requirement;
use crate::version::semver::parse_version;

/// Directory holding the checked-out tree inside a staging directory
pub const TREE_DIR: &str = "tree";

async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<String, FetchError> {
    let mut cmd = Command::new("git");
    cmd.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    // Never block on a credential prompt
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    let out = cmd
        .output()
        .await
        .map_err(|e| FetchError::Git(format!("failed to execute git: {e}")))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(FetchError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Clone URL for a package name
pub fn repository_url(name: &str) -> String {
    match name.strip_prefix("git+") {
        Some(url) => url.to_string(),
        None => format!("https://{}.git", name),
    }
}

/// Parse `git ls-remote --tags` output into version -> tag name
pub fn parse_tag_refs(output: &str) -> BTreeMap<Version, String> {
    let mut tags = BTreeMap::new();
    for line in output.lines() {
        let Some((_, reference)) = line.split_once('\t') else {
            continue;
        };
        let Some(tag) = reference.trim().strip_prefix("refs/tags/") else {
            continue;
        };
        if tag.ends_with("^{}") {
            continue;
        }
        if let Some(version) = parse_version(tag) {
            tags.entry(version).or_insert_with(|| tag.to_string());
        }
    }
    tags
}

pub struct GitSource {
    reader: TomlManifestReader,
    tags: Mutex<HashMap<String, Arc<BTreeMap<Version, String>>>>,
    /// Trees cloned for metadata, reused by the following artifact fetch
    checkouts: Mutex<HashMap<(String, Version), TempDir>>,
}

impl GitSource {
    pub fn new() -> Self {
        Self {
            reader: TomlManifestReader::new(),
            tags: Mutex::new(HashMap::new()),
            checkouts: Mutex::new(HashMap::new()),
        }
    }

    async fn tags(&self, name: &str) -> Result<Arc<BTreeMap<Version, String>>, FetchError> {
        if let Ok(tags) = self.tags.lock()
            && let Some(found) = tags.get(name)
        {
            return Ok(Arc::clone(found));
        }

        let url = repository_url(name);
        debug!("Listing tags of {}", url);
        let output = run_git(&["ls-remote", "--tags", "--refs", &url], None)
            .await
            .map_err(|e| match e {
                FetchError::Git(msg) if msg.contains("not found") || msg.contains("does not exist") => {
                    FetchError::NotFound(name.to_string())
                }
                other => other,
            })?;
        let tags = Arc::new(parse_tag_refs(&output));

        if let Ok(mut cache) = self.tags.lock() {
            cache.insert(name.to_string(), Arc::clone(&tags));
        }
        Ok(tags)
    }

    async fn tag_for(&self, name: &str, version: &Version) -> Result<String, FetchError> {
        self.tags(name)
            .await?
            .get(version)
            .cloned()
            .ok_or_else(|| FetchError::RefNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    /// Shallow clone `tag` into `dest` and drop the repository metadata
    async fn checkout(&self, name: &str, tag: &str, dest: &Path) -> Result<(), FetchError> {
        let url = repository_url(name);
        let dest_str = dest.to_string_lossy();
        run_git(
            &[
                "clone",
                "--quiet",
                "--depth",
                "1",
                "--branch",
                tag,
                "--single-branch",
                &url,
                &dest_str,
            ],
            None,
        )
        .await?;

        let git_dir = dest.join(".git");
        if git_dir.exists() {
            tokio::fs::remove_dir_all(&git_dir).await?;
        }
        Ok(())
    }

    fn read_dependencies(
        &self,
        name: &str,
        tree: &Path,
    ) -> Result<BTreeMap<String, Requirement>, FetchError> {
        let path = tree.join(MANIFEST_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let manifest = self
            .reader
            .parse(&content)
            .map_err(|e| FetchError::InvalidResponse(format!("{name}: {e}")))?;

        manifest
            .dependencies
            .iter()
            .map(|(dep, entry)| {
                Requirement::parse(&entry.requirement)
                    .map(|req| (dep.clone(), req))
                    .map_err(|e| FetchError::InvalidResponse(format!("{name}: {e}")))
            })
            .collect()
    }

    fn take_checkout(&self, name: &str, version: &Version) -> Option<TempDir> {
        self.checkouts
            .lock()
            .ok()?
            .remove(&(name.to_string(), version.clone()))
    }
}

impl Default for GitSource {
    fn default() -> Self {
        Self::new()
    }
}

async fn tree_integrity(tree: PathBuf) -> Result<Integrity, FetchError> {
    tokio::task::spawn_blocking(move || Integrity::of_tree(&tree))
        .await
        .map_err(|e| FetchError::Git(format!("hashing task failed: {e}")))?
        .map_err(FetchError::from)
}

#[async_trait::async_trait]
impl Source for GitSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Git
    }

    async fn fetch_versions(&self, name: &str) -> Result<VersionListing, FetchError> {
        let tags = self.tags(name).await?;
        Ok(VersionListing::new(name, tags.keys().cloned().collect(), None))
    }

    async fn fetch_metadata(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<PackageMetadata, FetchError> {
        let tag = self.tag_for(name, version).await?;

        let checkout = TempDir::new()?;
        let tree = checkout.path().join(TREE_DIR);
        self.checkout(name, &tag, &tree).await?;

        let dependencies = self.read_dependencies(name, &tree)?;
        let integrity = tree_integrity(tree).await?;

        if let Ok(mut checkouts) = self.checkouts.lock() {
            checkouts.insert((name.to_string(), version.clone()), checkout);
        }

        Ok(PackageMetadata {
            name: name.to_string(),
            version: version.clone(),
            dependencies,
            source: SourceKind::Git,
            location: format!("{}#{}", repository_url(name), tag),
            integrity,
        })
    }

    async fn fetch_artifact(
        &self,
        package: &PinnedPackage,
        staging: &Path,
    ) -> Result<Payload, FetchError> {
        let dest = staging.join(TREE_DIR);

        let reused = match self.take_checkout(&package.name, &package.version) {
            Some(checkout) => match tokio::fs::rename(checkout.path().join(TREE_DIR), &dest).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("Could not reuse checkout of {}: {}", package, e);
                    false
                }
            },
            None => false,
        };
        if !reused {
            let tag = self.tag_for(&package.name, &package.version).await?;
            self.checkout(&package.name, &tag, &dest).await?;
        }

        let actual = tree_integrity(dest.clone()).await?;
        if actual != package.integrity {
            warn!("Checked-out tree of {} does not match its pinned hash", package);
            return Err(FetchError::IntegrityViolation {
                name: package.name.clone(),
                version: package.version.to_string(),
                expected: package.integrity.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(Payload::Tree(dest))
    }
}
