//! Project-level operations tying manifest, resolver, lock file and installer together

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use semver::Version;
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::{Config, ConfigError, LOCK_FILE, MANIFEST_FILE, MODULES_DIR};
use crate::install::{Drift, InstallError, InstallReport, Installer};
use crate::lockfile::{LockError, LockFile};
use crate::manifest::writer::{remove_dependency, set_dependency};
use crate::manifest::{DependencyTable, Manifest, ManifestError, ManifestReader, TomlManifestReader};
use crate::resolve::{ResolveError, ResolvedSet, Resolver};
use crate::shutdown::Shutdown;
use crate::source::cache::ArtifactCache;
use crate::source::registry::RegistrySource;
use crate::source::{FetchError, Integrity, SourceFetcher};
use crate::version::spec::validate_name;
use crate::version::{AliasTable, ConstraintError, PackageSpec, Requirement, SelectionPolicy};

/// Top-level entries packed by `publish`
const PUBLISH_INCLUDE: [&str; 4] = [MANIFEST_FILE, "src", "README.md", "LICENSE"];

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} is not a dependency of this project")]
    NotDeclared(String),

    #[error("Manifest has no package {0}")]
    MissingField(&'static str),

    #[error("Invalid package version {0:?}")]
    InvalidVersion(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a sync treats the existing lock file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    /// Reuse the lock as-is when it still satisfies the manifest
    Reuse,
    /// Always resolve, keeping locked versions that remain viable
    Prefer,
    /// Resolve from scratch
    Ignore,
}

/// Result of bringing the module directory in line with the manifest
#[derive(Debug)]
pub struct SyncOutcome {
    pub resolved: ResolvedSet,
    pub report: InstallReport,
    /// True when the lock file was reused without resolving
    pub from_lock: bool,
    pub pruned: Vec<String>,
}

/// How the manifest, the lock file and the module directory disagree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Declared dependencies with no locked version, or one that no longer satisfies them
    pub unlocked: Vec<String>,
    /// Locked packages nothing declared depends on any more
    pub stale: Vec<String>,
    /// Module directory against the lock file
    pub drift: Vec<Drift>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.unlocked.is_empty() && self.stale.is_empty() && self.drift.is_empty()
    }
}

/// The locked packages together with the declared dependencies they hang from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub roots: Vec<String>,
    pub resolved: ResolvedSet,
}

impl Listing {
    pub fn tree(&self) -> String {
        self.resolved.render_tree(&self.roots)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub name: String,
    pub version: Version,
    pub integrity: Integrity,
    pub size: usize,
    pub dry_run: bool,
}

pub struct Project {
    root: PathBuf,
    config: Config,
    aliases: AliasTable,
    fetcher: SourceFetcher,
}

impl Project {
    pub fn new(root: PathBuf, config: Config, shutdown: Shutdown) -> Self {
        let fetcher = SourceFetcher::from_config(&config, shutdown);
        Self::with_fetcher(root, config, fetcher)
    }

    pub fn with_fetcher(root: PathBuf, config: Config, fetcher: SourceFetcher) -> Self {
        let aliases = AliasTable::new(config.aliases.clone());
        Self {
            root,
            config,
            aliases,
            fetcher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.root.join(MODULES_DIR)
    }

    pub fn lock_file(&self) -> LockFile {
        LockFile::new(self.root.join(LOCK_FILE))
    }

    fn installer(&self) -> Installer<'_> {
        Installer::new(&self.fetcher, self.modules_dir())
    }

    fn read_manifest(&self) -> Result<(String, Manifest), ProjectError> {
        let path = self.manifest_path();
        let content = fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let manifest = TomlManifestReader::new().parse(&content)?;
        Ok((content, manifest))
    }

    fn write_manifest(&self, content: &str) -> Result<(), ProjectError> {
        fs::write(self.manifest_path(), content)?;
        Ok(())
    }

    fn direct_requirements(
        manifest: &Manifest,
        include_dev: bool,
    ) -> Result<IndexMap<String, Requirement>, ProjectError> {
        manifest
            .requirements(include_dev)
            .into_iter()
            .map(|(name, raw)| {
                let spec = PackageSpec::new(&name, &raw)?;
                Ok((spec.name, spec.requirement))
            })
            .collect::<Result<_, ConstraintError>>()
            .map_err(ProjectError::from)
    }

    /// Read the lock, treating corruption and schema mismatches as "no lock"
    fn read_lock(&self) -> Result<Option<ResolvedSet>, ProjectError> {
        let lock = self.lock_file();
        match lock.read_optional() {
            Ok(locked) => Ok(locked),
            Err(e @ (LockError::Corrupt { .. } | LockError::VersionMismatch { .. })) => {
                warn!("Ignoring lock file: {}", e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Install the manifest's dependencies, reusing the lock file when it still applies
    pub async fn install(&self, include_dev: bool) -> Result<SyncOutcome, ProjectError> {
        let (_, manifest) = self.read_manifest()?;
        let direct = Self::direct_requirements(&manifest, include_dev)?;
        self.sync(&direct, LockMode::Reuse).await
    }

    /// Resolve every dependency again, ignoring locked versions
    pub async fn update(&self, include_dev: bool) -> Result<SyncOutcome, ProjectError> {
        let (_, manifest) = self.read_manifest()?;
        let direct = Self::direct_requirements(&manifest, include_dev)?;
        self.sync(&direct, LockMode::Ignore).await
    }

    /// Declare a dependency and install it. A `latest` spec is recorded as `^<resolved>`.
    pub async fn add(&self, spec: &str, dev: bool) -> Result<SyncOutcome, ProjectError> {
        let spec = PackageSpec::parse(spec, &self.aliases)?;
        let (content, manifest) = self.read_manifest()?;

        let mut direct = Self::direct_requirements(&manifest, true)?;
        direct.insert(spec.name.clone(), spec.requirement.clone());

        let locked = self.read_lock()?;
        let resolved = self.resolve(&direct, locked.as_ref()).await?;

        let recorded = match spec.requirement.policy {
            SelectionPolicy::Latest => match resolved.version_of(&spec.name) {
                Some(version) => format!("^{version}"),
                None => spec.requirement.as_str().to_string(),
            },
            SelectionPolicy::Newest => spec.requirement.as_str().to_string(),
        };
        let table = if dev {
            DependencyTable::DevDependencies
        } else {
            DependencyTable::Dependencies
        };
        self.write_manifest(&set_dependency(&content, table, &spec.name, &recorded)?)?;
        info!("Added {}@{}", spec.name, recorded);

        self.materialize(resolved, locked.as_ref(), false).await
    }

    /// Drop a dependency from the manifest, remove its module and re-sync the rest
    pub async fn remove(&self, name: &str) -> Result<SyncOutcome, ProjectError> {
        let name = self.aliases.expand(name).to_string();
        let (content, _) = self.read_manifest()?;
        let updated =
            remove_dependency(&content, &name)?.ok_or_else(|| ProjectError::NotDeclared(name.clone()))?;
        self.write_manifest(&updated)?;
        info!("Removed {}", name);

        if let Err(e) = self.installer().uninstall(&name) {
            warn!("Failed to remove module {}: {}", name, e);
        }

        let manifest = TomlManifestReader::new().parse(&updated)?;
        let direct = Self::direct_requirements(&manifest, true)?;
        self.sync(&direct, LockMode::Prefer).await
    }

    /// Compare the manifest with the lock file and the lock file with the
    /// module directory, without contacting any source
    pub fn check(&self, include_dev: bool) -> Result<CheckReport, ProjectError> {
        let (_, manifest) = self.read_manifest()?;
        let direct = Self::direct_requirements(&manifest, include_dev)?;
        let locked = self.read_lock()?.unwrap_or_default();

        let unlocked = direct
            .iter()
            .filter(|(name, requirement)| {
                !locked
                    .version_of(name)
                    .is_some_and(|version| requirement.satisfies(version))
            })
            .map(|(name, _)| name.clone())
            .collect();
        let reachable = locked.reachable_from(direct.keys().map(String::as_str));
        let stale = locked
            .iter()
            .filter(|package| !reachable.contains(&package.name))
            .map(|package| package.name.clone())
            .collect();
        let drift = self.installer().check_drift(&locked)?;

        let report = CheckReport {
            unlocked,
            stale,
            drift,
        };
        debug!("Check of {}: {:?}", self.root.display(), report);
        Ok(report)
    }

    /// The locked packages and the declared dependencies they are reached from
    pub fn list(&self, include_dev: bool) -> Result<Listing, ProjectError> {
        let (_, manifest) = self.read_manifest()?;
        let roots = Self::direct_requirements(&manifest, include_dev)?
            .into_keys()
            .collect();
        let resolved = self.read_lock()?.unwrap_or_default();
        Ok(Listing { roots, resolved })
    }

    /// Remove the module directory and lock file, and optionally the shared cache
    pub fn clean(&self, cache: bool) -> Result<(), ProjectError> {
        remove_if_exists(&self.modules_dir(), true)?;
        remove_if_exists(self.lock_file().path(), false)?;
        if cache {
            ArtifactCache::new(self.config.cache_dir()).clean()?;
        }
        info!("Cleaned {}", self.root.display());
        Ok(())
    }

    /// Pack the project and upload it to `registry` (the configured registry by default)
    pub async fn publish(
        &self,
        registry: Option<&str>,
        dry_run: bool,
    ) -> Result<PublishOutcome, ProjectError> {
        let (_, manifest) = self.read_manifest()?;
        let name = manifest.name.ok_or(ProjectError::MissingField("name"))?;
        validate_name(&name)?;
        let raw_version = manifest.version.ok_or(ProjectError::MissingField("version"))?;
        let version =
            Version::parse(&raw_version).map_err(|_| ProjectError::InvalidVersion(raw_version.clone()))?;

        let tarball = archive::pack_dir(&self.root, Some(&PUBLISH_INCLUDE[..]))?;
        let outcome = PublishOutcome {
            name: name.clone(),
            version: version.clone(),
            integrity: Integrity::of_bytes(&tarball),
            size: tarball.len(),
            dry_run,
        };

        if dry_run {
            info!("Dry run: would publish {}@{} ({} bytes)", name, version, outcome.size);
            return Ok(outcome);
        }

        let url = registry.unwrap_or(&self.config.registry.url);
        RegistrySource::new(url).publish(&name, &version, tarball).await?;
        info!("Published {}@{} to {}", name, version, url);
        Ok(outcome)
    }

    async fn resolve(
        &self,
        direct: &IndexMap<String, Requirement>,
        preferences: Option<&ResolvedSet>,
    ) -> Result<ResolvedSet, ProjectError> {
        let resolver = Resolver::new(&self.fetcher);
        let resolver = match preferences {
            Some(locked) => resolver.with_preferences(locked),
            None => resolver,
        };
        Ok(resolver.resolve(direct).await?)
    }

    async fn sync(
        &self,
        direct: &IndexMap<String, Requirement>,
        mode: LockMode,
    ) -> Result<SyncOutcome, ProjectError> {
        let locked = match mode {
            LockMode::Ignore => None,
            LockMode::Reuse | LockMode::Prefer => self.read_lock()?,
        };

        if mode == LockMode::Reuse
            && let Some(locked) = &locked
            && lock_satisfies(locked, direct)
        {
            debug!("Lock file satisfies the manifest, skipping resolution");
            return self.materialize(locked.clone(), Some(locked), true).await;
        }

        let resolved = self.resolve(direct, locked.as_ref()).await?;
        self.materialize(resolved, locked.as_ref(), false).await
    }

    /// Persist the lock if it changed, install, then prune what is no longer needed
    async fn materialize(
        &self,
        resolved: ResolvedSet,
        locked: Option<&ResolvedSet>,
        from_lock: bool,
    ) -> Result<SyncOutcome, ProjectError> {
        if locked != Some(&resolved) {
            self.lock_file().write(&resolved)?;
        }

        let installer = self.installer();
        let report = installer.install(&resolved).await;
        if self.fetcher.is_cancelled() {
            return Err(InstallError::Cancelled.into());
        }
        let pruned = installer.prune(&resolved)?;

        Ok(SyncOutcome {
            resolved,
            report,
            from_lock,
            pruned,
        })
    }
}

/// Every direct requirement is locked at a version that satisfies it, and
/// every locked package is still reached from the direct requirements
fn lock_satisfies(locked: &ResolvedSet, direct: &IndexMap<String, Requirement>) -> bool {
    let declared = direct.iter().all(|(name, requirement)| {
        locked
            .version_of(name)
            .is_some_and(|version| requirement.satisfies(version))
    });
    if !declared {
        return false;
    }

    let reachable = locked.reachable_from(direct.keys().map(String::as_str));
    reachable.len() == locked.len() && locked.iter().all(|p| reachable.contains(&p.name))
}

fn remove_if_exists(path: &Path, dir: bool) -> io::Result<()> {
    let result = if dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
