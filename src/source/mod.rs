//! Package sources: registry, git and the on-disk artifact cache
//!
//! Every concrete source implements [`Source`]. The [`SourceFetcher`] routes
//! calls to the right source and applies timeouts, retries and cancellation.

pub mod cache;
pub mod error;
pub mod fetcher;
pub mod git;
pub mod integrity;
pub mod registry;
pub mod types;

use std::io;
use std::path::Path;

#[cfg(test)]
use mockall::automock;
use semver::Version;

use crate::version::spec::validate_name;

pub use cache::{ArtifactCache, CachedSource};
pub use error::FetchError;
pub use fetcher::SourceFetcher;
pub use git::GitSource;
pub use integrity::Integrity;
pub use registry::RegistrySource;
pub use types::{ArtifactHandle, PackageMetadata, Payload, PinnedPackage, SourceKind, VersionListing};

/// A place packages can be listed, described and downloaded from
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    /// Returns the kind of source this implementation handles
    fn kind(&self) -> SourceKind;

    /// Lists all published versions of a package
    async fn fetch_versions(&self, name: &str) -> Result<VersionListing, FetchError>;

    /// Describes one published version: dependencies, location and integrity
    async fn fetch_metadata(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<PackageMetadata, FetchError>;

    /// Downloads the artifact into `staging`, verifying it against the pinned integrity
    async fn fetch_artifact(
        &self,
        package: &PinnedPackage,
        staging: &Path,
    ) -> Result<Payload, FetchError>;
}

/// Turn a package name into a single safe path segment
///
/// Names that are not valid package names, or that would escape to `.` or
/// `..`, are rejected rather than joined onto a directory.
pub fn escape_name(name: &str) -> io::Result<String> {
    validate_name(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let escaped: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '!',
            c => c,
        })
        .collect();
    if escaped.is_empty() || escaped == "." || escaped == ".." {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{name:?} is not a safe directory name"),
        ));
    }
    Ok(escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("left-pad", "left-pad")]
    #[case("@scope/pkg", "@scope!pkg")]
    #[case("github.com/owner/repo", "github.com!owner!repo")]
    #[case("git+https://host/r.git", "git+https!!!host!r.git")]
    fn escape_name_flattens_separators(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(escape_name(name).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("..")]
    #[case("a/..")]
    #[case("../../etc")]
    #[case(".hidden")]
    fn escape_name_rejects_unsafe_names(#[case] name: &str) {
        let err = escape_name(name).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
