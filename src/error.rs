//! Error types for the hotchunk runtime

use std::fmt;
use thiserror::Error;

use crate::chunks::ChunkId;
use crate::hmr::HmrStatus;
use crate::modules::ModuleId;

/// Which kind of resource a chunk load was fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// JavaScript chunk that self-registers on execution
    Script,
    /// Stylesheet chunk
    Stylesheet,
    /// Hot-update payload chunk
    HotUpdate,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Script => write!(f, "chunk"),
            ResourceKind::Stylesheet => write!(f, "CSS chunk"),
            ResourceKind::HotUpdate => write!(f, "hot update chunk"),
        }
    }
}

/// Why an injected resource failed to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// The resource loaded but did not deliver its payload
    Missing,
    /// Neither a load nor an error event arrived in time
    Timeout,
    /// The host reported an error event of this type
    Host(String),
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadFailure::Missing => write!(f, "missing"),
            LoadFailure::Timeout => write!(f, "timeout"),
            LoadFailure::Host(kind) => write!(f, "{}", kind),
        }
    }
}

/// A chunk could not be loaded
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Loading {kind} {chunk_id} failed.\n({failure}: {request})")]
pub struct ChunkLoadError {
    pub chunk_id: ChunkId,
    pub kind: ResourceKind,
    pub failure: LoadFailure,
    /// Resource locator that was requested
    pub request: String,
}

impl ChunkLoadError {
    pub fn new(chunk_id: ChunkId, kind: ResourceKind, failure: LoadFailure, request: impl Into<String>) -> Self {
        Self {
            chunk_id,
            kind,
            failure,
            request: request.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.failure == LoadFailure::Timeout
    }
}

/// Render an update propagation chain for diagnostics
fn chain_info(chain: &[ModuleId]) -> String {
    if chain.is_empty() {
        return String::new();
    }
    let joined = chain
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ");
    format!("\nUpdate propagation: {}", joined)
}

/// Hot-update cycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HmrError {
    /// An operation was called in the wrong coordinator status
    #[error("{operation}() is only allowed in {expected} status (state: {actual})")]
    InvalidStatus {
        operation: &'static str,
        expected: &'static str,
        actual: HmrStatus,
    },

    #[error("Aborted because of self decline: {module_id}{}", chain_info(chain))]
    SelfDeclined {
        module_id: ModuleId,
        chain: Vec<ModuleId>,
    },

    #[error("Aborted because of declined dependency: {module_id} in {parent_id}{}", chain_info(chain))]
    Declined {
        module_id: ModuleId,
        parent_id: ModuleId,
        chain: Vec<ModuleId>,
    },

    #[error("Aborted because {module_id} is not accepted{}", chain_info(chain))]
    Unaccepted {
        module_id: ModuleId,
        chain: Vec<ModuleId>,
    },
}

/// Main error type for hotchunk
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// No factory is registered for the requested module
    #[error("Cannot find module '{0}'")]
    ModuleNotFound(ModuleId),

    /// A module removed by a hot update was required again
    #[error("unexpected require({0}) to disposed module")]
    DisposedModule(ModuleId),

    /// A disposed module instance tried to require another module
    #[error("unexpected require({request}) from disposed module {from}")]
    RequireFromDisposed { from: ModuleId, request: ModuleId },

    #[error(transparent)]
    ChunkLoad(#[from] ChunkLoadError),

    #[error(transparent)]
    Hmr(#[from] HmrError),

    /// Raised by application code (a factory, accept callback or runtime callback)
    #[error("Error: {0}")]
    Thrown(String),

    #[error("Failed to fetch update manifest {url} ({status})")]
    ManifestFetch { url: String, status: u16 },

    #[error("Invalid update manifest: {0}")]
    InvalidManifest(String),

    #[error("ConfigError: {0}")]
    Config(String),

    /// A value in a module's hot data could not be encoded or decoded
    #[error("SerializationError: {0}")]
    Serialization(String),

    /// A handle outlived the runtime that created it
    #[error("runtime has been dropped")]
    RuntimeDropped,
}

impl Error {
    /// Create an application error, the equivalent of `throw new Error(message)`
    pub fn thrown(message: impl Into<String>) -> Self {
        Error::Thrown(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// The chunk load failure behind this error, if any
    pub fn as_chunk_load(&self) -> Option<&ChunkLoadError> {
        match self {
            Error::ChunkLoad(err) => Some(err),
            _ => None,
        }
    }

    /// The hot-update failure behind this error, if any
    pub fn as_hmr(&self) -> Option<&HmrError> {
        match self {
            Error::Hmr(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for hotchunk
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_load_error_message() {
        let err = ChunkLoadError::new(
            ChunkId::from("vendors"),
            ResourceKind::Script,
            LoadFailure::Timeout,
            "/static/js/vendors.chunk.js",
        );
        assert_eq!(
            err.to_string(),
            "Loading chunk vendors failed.\n(timeout: /static/js/vendors.chunk.js)"
        );
        assert!(err.is_timeout());
    }

    #[test]
    fn test_declined_message_includes_chain() {
        let err = HmrError::Declined {
            module_id: ModuleId::from("c"),
            parent_id: ModuleId::from("b"),
            chain: vec![ModuleId::from("c"), ModuleId::from("b")],
        };
        assert_eq!(
            err.to_string(),
            "Aborted because of declined dependency: c in b\nUpdate propagation: c -> b"
        );
    }

    #[test]
    fn test_invalid_status_message() {
        let err = HmrError::InvalidStatus {
            operation: "apply",
            expected: "ready",
            actual: HmrStatus::Idle,
        };
        assert_eq!(err.to_string(), "apply() is only allowed in ready status (state: idle)");
    }
}
