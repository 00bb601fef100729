//! Version layer: parsing, ordering and constraint evaluation
//!
//! Pure code with no I/O. Versions are compared with semantic-version
//! rules (numeric components, pre-release before release), never lexically.
//!
//! # Modules
//!
//! - [`semver`]: lenient version parsing
//! - [`constraint`]: `VersionConstraint`, `Requirement` and `SelectionPolicy`
//! - [`spec`]: `PackageSpec` parsing, package-name validation and aliases

pub mod constraint;
pub mod semver;
pub mod spec;

pub use constraint::{ConstraintError, RangeOp, Requirement, SelectionPolicy, VersionConstraint};
pub use spec::{AliasTable, PackageSpec};
