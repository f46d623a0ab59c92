//! Update manifest and the state of one in-flight update cycle

use indexmap::IndexMap;
use rustc_hash::FxHashSet as HashSet;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chunks::loader::ChunkPromise;
use crate::chunks::ChunkId;
use crate::error::{Error, Result};
use crate::modules::{ModuleFactory, ModuleId, RuntimeCallback};
use crate::runtime::Runtime;

/// What changed since the running build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    #[serde(rename = "c", default)]
    pub changed_chunks: Vec<ChunkId>,
    #[serde(rename = "r", default)]
    pub removed_chunks: Vec<ChunkId>,
    #[serde(rename = "m", default)]
    pub removed_modules: Vec<ModuleId>,
}

impl UpdateManifest {
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|e| Error::InvalidManifest(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.changed_chunks.is_empty() && self.removed_chunks.is_empty() && self.removed_modules.is_empty()
    }
}

/// Scratch state of one update cycle, from `check` until apply or abort
#[derive(Default)]
pub struct PendingCycle {
    pub(crate) updated_modules: Vec<ModuleId>,
    /// Replacement factory per module; `None` removes the module
    pub(crate) update: IndexMap<ModuleId, Option<ModuleFactory>>,
    pub(crate) runtime_callbacks: Vec<RuntimeCallback>,
    pub(crate) removed_chunks: Vec<ChunkId>,
    /// Changed chunks and whether their update payload was requested
    pub(crate) update_chunks: IndexMap<ChunkId, bool>,
    pub(crate) received_chunks: HashSet<ChunkId>,
}

impl PendingCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a module's factory in this cycle
    pub fn stage_update(&mut self, module_id: ModuleId, factory: ModuleFactory) {
        if !self.updated_modules.contains(&module_id) {
            self.updated_modules.push(module_id.clone());
        }
        self.update.insert(module_id, Some(factory));
    }

    /// Remove a module without replacement
    pub fn stage_removal(&mut self, module_id: ModuleId) {
        self.update.insert(module_id, None);
    }

    /// Re-install `factory` unless the module is already staged
    pub fn stage_reinstall(&mut self, module_id: ModuleId, factory: Option<ModuleFactory>) {
        self.update.entry(module_id).or_insert(factory);
    }

    pub fn is_staged(&self, module_id: &str) -> bool {
        self.update.contains_key(module_id)
    }

    pub fn add_runtime_callback(&mut self, callback: RuntimeCallback) {
        self.runtime_callbacks.push(callback);
    }

    pub fn set_removed_chunks(&mut self, chunks: Vec<ChunkId>) {
        self.removed_chunks = chunks;
    }

    pub fn mark_received(&mut self, chunk_id: ChunkId) {
        self.received_chunks.insert(chunk_id);
    }

    pub fn has_received(&self, chunk_id: &str) -> bool {
        self.received_chunks.contains(chunk_id)
    }

    pub fn updated_modules(&self) -> &[ModuleId] {
        &self.updated_modules
    }
}

impl fmt::Debug for PendingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCycle")
            .field("updated_modules", &self.updated_modules)
            .field("staged", &self.update.keys().collect::<Vec<_>>())
            .field("removed_chunks", &self.removed_chunks)
            .field("update_chunks", &self.update_chunks)
            .finish()
    }
}

/// Turns a manifest into staged updates for one payload format
pub trait HotUpdateHandler {
    fn name(&self) -> &str;

    /// Stage removals and start fetching replacement code
    fn consume_manifest(&self, runtime: &Runtime, manifest: &UpdateManifest, cycle: &mut PendingCycle) -> Vec<ChunkPromise>;

    /// Stage a module that invalidated itself
    fn invalidate(&self, runtime: &Runtime, module_id: &ModuleId, cycle: &mut PendingCycle);
}
