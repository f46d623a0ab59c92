//! Chunk Registry
//!
//! Tracks which chunks are linked into the module registry. A chunk is
//! unregistered until someone asks for it, loading while exactly one shared
//! load future is in flight, and installed once its payload has registered.
//! Loading can fall back to unregistered on failure so a later request
//! retries; installed never regresses.

pub mod injector;
pub mod loader;

pub use injector::{Injector, LoadOutcome};
pub use loader::{ChunkLoader, CssChunkLoader, JsChunkLoader};

use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;

use futures::channel::oneshot;
use futures::future::{LocalBoxFuture, Shared};

use crate::error::ChunkLoadError;
use crate::modules::RawId;

/// Chunk identifier
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawId")]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<RawId> for ChunkId {
    fn from(raw: RawId) -> Self {
        Self(raw.into())
    }
}

impl From<&str> for ChunkId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChunkId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&ChunkId> for ChunkId {
    fn from(id: &ChunkId) -> Self {
        id.clone()
    }
}

impl std::borrow::Borrow<str> for ChunkId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One in-flight load, shared by every requester of the chunk
pub type SharedLoad = Shared<LocalBoxFuture<'static, Result<(), ChunkLoadError>>>;

pub(crate) enum ChunkState {
    Loading {
        resolve: oneshot::Sender<()>,
        promise: SharedLoad,
    },
    Installed,
}

/// Installation state of a chunk as seen from outside the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Unregistered,
    Loading,
    Installed,
}

/// Chunk id to state table
#[derive(Default)]
pub struct ChunkRegistry {
    states: RefCell<HashMap<ChunkId, ChunkState>>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, chunk_id: &str) -> ChunkStatus {
        match self.states.borrow().get(chunk_id) {
            None => ChunkStatus::Unregistered,
            Some(ChunkState::Loading { .. }) => ChunkStatus::Loading,
            Some(ChunkState::Installed) => ChunkStatus::Installed,
        }
    }

    pub fn is_installed(&self, chunk_id: &str) -> bool {
        self.status(chunk_id) == ChunkStatus::Installed
    }

    /// The shared load future of a loading chunk
    pub(crate) fn pending(&self, chunk_id: &str) -> Option<SharedLoad> {
        match self.states.borrow().get(chunk_id) {
            Some(ChunkState::Loading { promise, .. }) => Some(promise.clone()),
            _ => None,
        }
    }

    /// unregistered -> loading
    pub(crate) fn start_loading(&self, chunk_id: ChunkId, resolve: oneshot::Sender<()>, promise: SharedLoad) {
        self.states
            .borrow_mut()
            .insert(chunk_id, ChunkState::Loading { resolve, promise });
    }

    /// Mark installed, waking the waiters of a loading chunk
    pub(crate) fn install(&self, chunk_id: &ChunkId) {
        let previous = self
            .states
            .borrow_mut()
            .insert(chunk_id.clone(), ChunkState::Installed);
        if let Some(ChunkState::Loading { resolve, .. }) = previous {
            let _ = resolve.send(());
        }
    }

    /// loading -> unregistered; installed chunks are left alone
    pub(crate) fn reset(&self, chunk_id: &str) {
        let mut states = self.states.borrow_mut();
        if matches!(states.get(chunk_id), Some(ChunkState::Loading { .. })) {
            states.remove(chunk_id);
        }
    }

    /// Forget a chunk entirely, used when a hot update removes it
    pub(crate) fn remove(&self, chunk_id: &str) {
        self.states.borrow_mut().remove(chunk_id);
    }

    pub fn installed_chunks(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self
            .states
            .borrow()
            .iter()
            .filter(|(_, state)| matches!(state, ChunkState::Installed))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for ChunkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states = self.states.borrow();
        let mut map = f.debug_map();
        for (id, state) in states.iter() {
            let status = match state {
                ChunkState::Loading { .. } => ChunkStatus::Loading,
                ChunkState::Installed => ChunkStatus::Installed,
            };
            map.entry(id, &status);
        }
        map.finish()
    }
}
