//! Error taxonomy for the deployment lifecycle.
//!
//! Adapters around external tools return [`anyhow::Result`]; at component
//! boundaries those are classified into an [`Error`] so that the command
//! surface can distinguish benign outcomes from fatal ones.

use std::fmt::Display;

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// The repository could not be reached or did not have the artifact.
    #[error("Fetching {url}")]
    Network {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    /// The version index is empty or has no matching entry.
    #[error("No image matching {selector} found for target {target}")]
    NotFound { target: String, selector: String },
    /// A line of the version index could not be parsed.
    #[error("Invalid manifest line {line:?}: {reason}")]
    InvalidManifest { line: String, reason: String },
    /// The bundle did not hash to the published digest.
    #[error("Digest mismatch for {id}: expected {expected}, found {actual}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },
    /// An expected layer stream is missing from the bundle.
    #[error("Bundle {bundle} does not contain {stream}")]
    CorruptBundle { bundle: Utf8PathBuf, stream: String },
    /// A snapshot, permission, or plain filesystem operation failed.
    #[error("{context}")]
    Filesystem {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    /// The boot entry could not be written or selected.
    #[error("Registering boot entry for {id}")]
    BootRegistration {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Deployment {id} is already deployed")]
    AlreadyDeployed { id: String },
    /// Checked before any mutation.
    #[error("{0}")]
    Precondition(String),
    #[error("Invalid configuration")]
    Config(#[source] anyhow::Error),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Benign outcomes are reported but do not fail the invocation.
    pub(crate) fn is_benign(&self) -> bool {
        matches!(self, Error::AlreadyDeployed { .. })
    }

    pub(crate) fn network(url: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Network {
            url: url.into(),
            source: source.into(),
        }
    }
}

/// Classify a failed filesystem step, attaching a description of the step.
pub(crate) trait FilesystemContext<T> {
    fn fs_context<C: Display>(self, context: C) -> Result<T>;

    fn with_fs_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> FilesystemContext<T> for std::result::Result<T, E> {
    fn fs_context<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::Filesystem {
            context: context.to_string(),
            source: e.into(),
        })
    }

    fn with_fs_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::Filesystem {
            context: f().to_string(),
            source: e.into(),
        })
    }
}
