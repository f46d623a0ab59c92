//! JSONP hot-update payloads
//!
//! Every changed chunk that is loaded (or loading) gets its hot-update script
//! injected. The script calls [`Runtime::hot_update`], which stages its
//! factories into the pending cycle. Chunks that were not loaded at check
//! time fetch their payload when something ensures them before apply.

use futures::future::FutureExt;
use tracing::debug;

use super::manifest::{HotUpdateHandler, PendingCycle, UpdateManifest};
use crate::chunks::loader::{ChunkLoader, ChunkPromise};
use crate::chunks::{ChunkId, ChunkStatus};
use crate::error::{ChunkLoadError, Error, LoadFailure, ResourceKind};
use crate::host::Element;
use crate::modules::ModuleId;
use crate::runtime::Runtime;

/// Inject the hot-update script of `chunk_id` and wait for its payload
fn load_update_chunk(runtime: &Runtime, chunk_id: ChunkId) -> ChunkPromise {
    let weak = runtime.downgrade();
    async move {
        let runtime = weak.upgrade().ok_or(Error::RuntimeDropped)?;
        let url = runtime.config().hot_update_chunk_url(&chunk_id, None);
        let marker = format!("{}:hot-update-{}", runtime.config().unique_name, chunk_id);
        debug!(chunk = %chunk_id, %url, "loading hot update chunk");

        let outcome = runtime
            .injector()
            .load(&runtime, Element::script(url.clone()).with_attribute("data-webpack", marker))
            .await;
        let received = runtime
            .hmr()
            .map_or(false, |hmr| hmr.with_cycle(|cycle| cycle.has_received(chunk_id.as_str())).unwrap_or(false));
        if received {
            return Ok(());
        }
        let failure = outcome.err().unwrap_or(LoadFailure::Missing);
        Err(ChunkLoadError::new(chunk_id, ResourceKind::HotUpdate, failure, url).into())
    }
    .boxed_local()
}

/// Update handler for script-delivered hot-update chunks
#[derive(Debug, Default)]
pub struct JsonpUpdateHandler;

impl JsonpUpdateHandler {
    pub fn new() -> Self {
        Self
    }
}

impl HotUpdateHandler for JsonpUpdateHandler {
    fn name(&self) -> &str {
        "jsonp"
    }

    fn consume_manifest(&self, runtime: &Runtime, manifest: &UpdateManifest, cycle: &mut PendingCycle) -> Vec<ChunkPromise> {
        cycle.set_removed_chunks(manifest.removed_chunks.clone());
        for module_id in &manifest.removed_modules {
            cycle.stage_removal(module_id.clone());
        }

        let mut promises = Vec::new();
        for chunk_id in &manifest.changed_chunks {
            let requested = runtime.chunks().status(chunk_id.as_str()) != ChunkStatus::Unregistered;
            if requested {
                promises.push(load_update_chunk(runtime, chunk_id.clone()));
            }
            cycle.update_chunks.insert(chunk_id.clone(), requested);
        }
        promises
    }

    fn invalidate(&self, runtime: &Runtime, module_id: &ModuleId, cycle: &mut PendingCycle) {
        cycle.stage_reinstall(module_id.clone(), runtime.modules().factory(module_id));
    }
}

/// Fetches the update payload of a changed chunk that gets ensured mid-cycle
#[derive(Debug, Default)]
pub struct HotUpdateChunkLoader;

impl HotUpdateChunkLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ChunkLoader for HotUpdateChunkLoader {
    fn name(&self) -> &str {
        "jsonp-hmr"
    }

    fn can_handle(&self, runtime: &Runtime, chunk_id: &ChunkId) -> bool {
        runtime
            .hmr()
            .and_then(|hmr| hmr.with_cycle(|cycle| cycle.update_chunks.get(chunk_id) == Some(&false)))
            .unwrap_or(false)
    }

    fn ensure(&self, runtime: &Runtime, chunk_id: &ChunkId, promises: &mut Vec<ChunkPromise>) {
        let Some(hmr) = runtime.hmr() else {
            return;
        };
        hmr.with_cycle_mut(|cycle| cycle.update_chunks.insert(chunk_id.clone(), true));
        promises.push(load_update_chunk(runtime, chunk_id.clone()));
    }
}
