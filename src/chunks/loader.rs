//! Dynamic chunk loaders
//!
//! `ensure_chunk` asks every registered [`ChunkLoader`] in registration order
//! whether it has something to contribute for the chunk and awaits all of
//! their futures together. Adding a resource type means registering another
//! loader, the call site stays the same.

use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::fmt;
use std::pin::pin;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, Either, FutureExt, LocalBoxFuture, TryFutureExt};
use tracing::{debug, trace};

use super::{ChunkId, ChunkStatus, SharedLoad};
use crate::config::HashKind;
use crate::error::{ChunkLoadError, Error, LoadFailure, ResourceKind, Result};
use crate::host::Element;
use crate::runtime::Runtime;

/// A future contributed by a loader to one `ensure_chunk` call
pub type ChunkPromise = LocalBoxFuture<'static, Result<()>>;

/// A loader plugin for one resource type
pub trait ChunkLoader {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Whether this loader has anything to do for the chunk
    fn can_handle(&self, runtime: &Runtime, chunk_id: &ChunkId) -> bool;

    /// Push zero or more futures that must settle before the chunk is usable
    fn ensure(&self, runtime: &Runtime, chunk_id: &ChunkId, promises: &mut Vec<ChunkPromise>);
}

fn to_promise(load: SharedLoad) -> ChunkPromise {
    load.map_err(Error::from).boxed_local()
}

/// Loads JavaScript chunks that register themselves when executed
#[derive(Debug, Default)]
pub struct JsChunkLoader;

impl JsChunkLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ChunkLoader for JsChunkLoader {
    fn name(&self) -> &str {
        "jsonp"
    }

    fn can_handle(&self, _runtime: &Runtime, _chunk_id: &ChunkId) -> bool {
        true
    }

    fn ensure(&self, runtime: &Runtime, chunk_id: &ChunkId, promises: &mut Vec<ChunkPromise>) {
        let chunks = runtime.chunks();
        match chunks.status(chunk_id.as_str()) {
            ChunkStatus::Installed => {}
            ChunkStatus::Loading => {
                if let Some(pending) = chunks.pending(chunk_id.as_str()) {
                    trace!(chunk = %chunk_id, "chunk already loading");
                    promises.push(to_promise(pending));
                }
            }
            ChunkStatus::Unregistered => {
                let url = runtime.chunk_url(chunk_id, HashKind::Js);
                let marker = format!("{}:chunk-{}", runtime.config().unique_name, chunk_id);
                let element = Element::script(url.clone()).with_attribute("data-webpack", marker);
                debug!(chunk = %chunk_id, %url, "loading chunk");

                let (resolve, registered) = oneshot::channel();
                let injected = runtime.injector().load(runtime, element);
                let weak = runtime.downgrade();
                let id = chunk_id.clone();
                let load = async move {
                    let outcome = injected.await;
                    if let Some(runtime) = weak.upgrade() {
                        if runtime.chunks().is_installed(id.as_str()) {
                            return Ok(());
                        }
                        runtime.chunks().reset(id.as_str());
                    }
                    let failure = outcome.err().unwrap_or(LoadFailure::Missing);
                    debug!(chunk = %id, %failure, "chunk load failed");
                    Err(ChunkLoadError::new(id, ResourceKind::Script, failure, url))
                };

                // Registration can beat the load event; the injected load still
                // has to settle to detach the script and clear its dedupe entry.
                let promise = async move {
                    match future::select(registered, pin!(load)).await {
                        Either::Left((_, load)) => load.await,
                        Either::Right((result, _)) => result,
                    }
                }
                .boxed_local()
                .shared();

                chunks.start_loading(chunk_id.clone(), resolve, promise.clone());
                promises.push(to_promise(promise));
            }
        }
    }
}

enum CssState {
    Loading(SharedLoad),
    Installed,
}

/// Loads stylesheet chunks for chunks that carry a CSS hash
#[derive(Default)]
pub struct CssChunkLoader {
    states: Rc<RefCell<HashMap<ChunkId, CssState>>>,
}

impl CssChunkLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self, chunk_id: &str) -> bool {
        matches!(self.states.borrow().get(chunk_id), Some(CssState::Installed))
    }
}

impl ChunkLoader for CssChunkLoader {
    fn name(&self) -> &str {
        "css"
    }

    fn can_handle(&self, runtime: &Runtime, chunk_id: &ChunkId) -> bool {
        runtime.has_chunk_hash(chunk_id, HashKind::Css)
    }

    fn ensure(&self, runtime: &Runtime, chunk_id: &ChunkId, promises: &mut Vec<ChunkPromise>) {
        let pending = match self.states.borrow().get(chunk_id) {
            Some(CssState::Installed) => return,
            Some(CssState::Loading(load)) => Some(load.clone()),
            None => None,
        };
        if let Some(load) = pending {
            trace!(chunk = %chunk_id, "stylesheet already loading");
            promises.push(to_promise(load));
            return;
        }

        let hash = runtime.chunk_hash(chunk_id, HashKind::Css);
        let href = runtime.config().chunk_path(chunk_id, HashKind::Css, hash.as_deref());
        let full_href = format!("{}{}", runtime.config().public_path, href);
        if runtime.host().find_stylesheet(&href, &full_href) {
            trace!(chunk = %chunk_id, %href, "stylesheet already present");
            self.states.borrow_mut().insert(chunk_id.clone(), CssState::Installed);
            return;
        }

        debug!(chunk = %chunk_id, url = %full_href, "loading stylesheet");
        let injected = runtime.injector().load(runtime, Element::link(full_href.clone()));
        let states = Rc::clone(&self.states);
        let id = chunk_id.clone();
        let load = async move {
            match injected.await {
                Ok(()) => {
                    states.borrow_mut().insert(id, CssState::Installed);
                    Ok(())
                }
                Err(failure) => {
                    states.borrow_mut().remove(&id);
                    Err(ChunkLoadError::new(id, ResourceKind::Stylesheet, failure, full_href))
                }
            }
        }
        .boxed_local()
        .shared();

        self.states
            .borrow_mut()
            .insert(chunk_id.clone(), CssState::Loading(load.clone()));
        promises.push(to_promise(load));
    }
}

impl fmt::Debug for CssChunkLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CssChunkLoader")
            .field("chunks", &self.states.borrow().len())
            .finish()
    }
}
