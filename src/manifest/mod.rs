//! Project manifest (`depot.toml`) reading and editing

pub mod reader;
pub mod types;
pub mod writer;

pub use reader::{ManifestReader, TomlManifestReader};
pub use types::{DependencyEntry, DependencyTable, Manifest};

/// Error type for manifest operations
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Failed to parse the file structure
    #[error("Failed to parse manifest: {0}")]
    ParseFailed(String),

    /// Invalid syntax in the file
    #[error("Invalid manifest syntax at line {line}, column {column}")]
    InvalidSyntax { line: usize, column: usize },

    /// Tree-sitter related error
    #[error("Tree-sitter error: {0}")]
    TreeSitter(String),

    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
