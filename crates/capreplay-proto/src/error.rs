//! Error types shared across capreplay crates.

use std::path::PathBuf;

/// Errors raised while building or processing test batches.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two distinct test names sanitize to the same artifact label.
    #[error("Tests {first} and {second} share the label {label}")]
    DuplicateLabel {
        label: String,
        first: String,
        second: String,
    },

    /// A test was handed to the build stage without a discovered context.
    #[error("Test {0} has no capture context")]
    MissingContext(String),

    /// A generated or captured artifact could not be read or written.
    #[error("Artifact I/O on {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wraps an I/O error with the artifact path it concerns.
    pub fn artifact(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Artifact {
            path: path.into(),
            source,
        }
    }
}

/// Result alias using the shared [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
