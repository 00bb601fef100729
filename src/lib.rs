//! depot: dependency resolution and package acquisition
//!
//! # Modules
//!
//! - [`version`]: version parsing, constraints and package specs
//! - [`source`]: registry, git and cache sources behind a single fetcher
//! - [`resolve`]: dependency graph resolution into a pinned set
//! - [`install`]: materializing a pinned set into the module directory
//! - [`lockfile`]: persisted resolutions
//! - [`manifest`]: reading and editing `depot.toml`
//! - [`project`]: the user-facing operations built on all of the above

pub mod archive;
pub mod config;
pub mod install;
pub mod lockfile;
pub mod logging;
pub mod manifest;
pub mod project;
pub mod resolve;
pub mod shutdown;
pub mod source;
pub mod version;
