//! The runtime context
//!
//! One [`Runtime`] owns every piece of process-wide state a bundle needs:
//! the module registry, the chunk registry, the injector, the loader plugins
//! and, when hot updates are enabled, the hot-update coordinator. Runtimes are
//! independent of each other; tests create one per case.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::future::{try_join_all, FutureExt, LocalBoxFuture};
use tracing::{debug, warn};

use crate::chunks::{ChunkId, ChunkLoader, ChunkRegistry, ChunkStatus, CssChunkLoader, Injector, JsChunkLoader};
use crate::config::{ChunkHashes, HashKind, RuntimeConfig};
use crate::error::Result;
use crate::hmr::hot::hot_interceptor;
use crate::hmr::{
    self, ApplyOptions, HmrStatus, HotCoordinator, HotUpdateChunkLoader, HotUpdateHandler, JsonpUpdateHandler,
    StatusHandlerId, UpdateEffect,
};
use crate::host::Host;
use crate::modules::{Exports, Interceptor, ModuleFactory, ModuleId, ModuleRegistry, Require, RuntimeCallback};

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    chunk_hashes: RefCell<ChunkHashes>,
    host: Rc<dyn Host>,
    modules: ModuleRegistry,
    chunks: ChunkRegistry,
    injector: Injector,
    loaders: RefCell<Vec<Rc<dyn ChunkLoader>>>,
    hmr: Option<HotCoordinator>,
}

/// Handle to a runtime instance; clones share the same state
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

/// Non-owning handle, held by everything the runtime hands to modules
#[derive(Clone)]
pub struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl fmt::Debug for WeakRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakRuntime")
    }
}

impl Runtime {
    /// Create a runtime with the JS and CSS loaders and, if `config.hot`,
    /// the hot-update coordinator with its JSONP handler
    pub fn new(config: RuntimeConfig, host: Rc<dyn Host>) -> Self {
        let hot = config.hot;
        let chunk_hashes = RefCell::new(config.chunk_hashes.clone());
        let mut loaders: Vec<Rc<dyn ChunkLoader>> = vec![Rc::new(JsChunkLoader::new()), Rc::new(CssChunkLoader::new())];
        let hmr = hot.then(|| {
            let coordinator = HotCoordinator::new();
            coordinator.add_handler(Rc::new(JsonpUpdateHandler::new()));
            loaders.push(Rc::new(HotUpdateChunkLoader::new()));
            coordinator
        });

        let runtime = Self {
            inner: Rc::new(RuntimeInner {
                config,
                chunk_hashes,
                host,
                modules: ModuleRegistry::new(),
                chunks: ChunkRegistry::new(),
                injector: Injector::new(),
                loaders: RefCell::new(loaders),
                hmr,
            }),
        };
        if hot {
            runtime.add_interceptor(hot_interceptor());
        }
        debug!(hot, public_path = %runtime.config().public_path, "runtime created");
        runtime
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn host(&self) -> Rc<dyn Host> {
        Rc::clone(&self.inner.host)
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.inner.modules
    }

    pub fn chunks(&self) -> &ChunkRegistry {
        &self.inner.chunks
    }

    pub fn injector(&self) -> &Injector {
        &self.inner.injector
    }

    /// The hot-update coordinator, absent when hot updates are disabled
    pub fn hmr(&self) -> Option<&HotCoordinator> {
        self.inner.hmr.as_ref()
    }

    pub fn add_loader(&self, loader: Rc<dyn ChunkLoader>) {
        self.inner.loaders.borrow_mut().push(loader);
    }

    pub fn add_interceptor(&self, interceptor: Interceptor) {
        self.inner.modules.add_interceptor(interceptor);
    }

    pub fn add_hot_update_handler(&self, handler: Rc<dyn HotUpdateHandler>) {
        match self.hmr() {
            Some(hmr) => hmr.add_handler(handler),
            None => warn!(handler = handler.name(), "hot updates disabled, handler ignored"),
        }
    }

    /// Register a single module factory
    pub fn define(&self, id: impl Into<ModuleId>, factory: ModuleFactory) {
        self.inner.modules.define(id.into(), factory);
    }

    pub fn require(&self, id: impl Into<ModuleId>) -> Result<Exports> {
        self.inner.modules.require(self, &id.into())
    }

    /// A chunk payload arrived: merge its factories and install its chunks.
    ///
    /// Factories and the runtime callback are only taken when at least one
    /// chunk of the batch is not installed yet.
    pub fn register<I, M>(&self, chunk_ids: I, modules: M, callback: Option<RuntimeCallback>) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<ChunkId>,
        M: IntoIterator<Item = (ModuleId, ModuleFactory)>,
    {
        let chunk_ids: Vec<ChunkId> = chunk_ids.into_iter().map(Into::into).collect();
        let chunks = self.chunks();
        if chunk_ids.iter().all(|id| chunks.is_installed(id.as_str())) {
            debug!(chunks = ?chunk_ids, "chunks already installed");
            return Ok(());
        }

        for (id, factory) in modules {
            self.inner.modules.define(id, factory);
        }
        let result = match callback {
            Some(callback) => callback(&Require::root(self.downgrade())),
            None => Ok(()),
        };
        for chunk_id in &chunk_ids {
            chunks.install(chunk_id);
        }
        debug!(chunks = ?chunk_ids, "chunks registered");
        result
    }

    /// A hot-update payload arrived for `chunk_id`
    pub fn hot_update<M>(&self, chunk_id: impl Into<ChunkId>, modules: M, callback: Option<RuntimeCallback>)
    where
        M: IntoIterator<Item = (ModuleId, ModuleFactory)>,
    {
        let chunk_id = chunk_id.into();
        let Some(hmr) = self.hmr() else {
            warn!(chunk = %chunk_id, "hot update received but hot updates are disabled");
            return;
        };
        let staged = hmr.with_cycle_mut(|cycle| {
            for (id, factory) in modules {
                cycle.stage_update(id, factory);
            }
            if let Some(callback) = callback {
                cycle.add_runtime_callback(callback);
            }
            cycle.mark_received(chunk_id.clone());
        });
        if staged.is_none() {
            warn!(chunk = %chunk_id, "hot update received outside of an update cycle");
        }
    }

    /// Make a chunk available, asking every loader that can handle it
    ///
    /// Loads are bounded by the configured chunk timeout, which uses tokio's
    /// timer: the returned future must be driven inside a tokio runtime with
    /// the time driver enabled, otherwise polling it panics.
    pub fn ensure_chunk(&self, chunk_id: impl Into<ChunkId>) -> LocalBoxFuture<'static, Result<()>> {
        let chunk_id = chunk_id.into();
        let loaders = self.inner.loaders.borrow().clone();
        let mut promises = Vec::new();
        for loader in &loaders {
            if loader.can_handle(self, &chunk_id) {
                loader.ensure(self, &chunk_id, &mut promises);
            }
        }
        async move {
            try_join_all(promises).await?;
            Ok(())
        }
        .boxed_local()
    }

    pub fn chunk_status(&self, chunk_id: &str) -> ChunkStatus {
        self.chunks().status(chunk_id)
    }

    pub fn set_chunk_hash(&self, chunk_id: impl Into<ChunkId>, kind: HashKind, hash: impl Into<String>) {
        let mut hashes = self.inner.chunk_hashes.borrow_mut();
        let table = match kind {
            HashKind::Js => &mut hashes.js,
            HashKind::Css => &mut hashes.css,
        };
        table.insert(chunk_id.into(), hash.into());
    }

    pub fn chunk_hash(&self, chunk_id: &ChunkId, kind: HashKind) -> Option<String> {
        let hashes = self.inner.chunk_hashes.borrow();
        let table = match kind {
            HashKind::Js => &hashes.js,
            HashKind::Css => &hashes.css,
        };
        table.get(chunk_id).cloned()
    }

    pub fn has_chunk_hash(&self, chunk_id: &ChunkId, kind: HashKind) -> bool {
        self.chunk_hash(chunk_id, kind).is_some()
    }

    /// Full URL of a lazily loaded chunk
    pub fn chunk_url(&self, chunk_id: &ChunkId, kind: HashKind) -> String {
        let hash = self.chunk_hash(chunk_id, kind);
        let path = self.config().chunk_path(chunk_id, kind, hash.as_deref());
        format!("{}{}", self.config().public_path, path)
    }

    pub fn status(&self) -> HmrStatus {
        self.hmr().map_or(HmrStatus::Idle, HotCoordinator::status)
    }

    /// Fetch the update manifest and prepare the update; with `auto_apply`
    /// the update is applied right away
    pub fn check(&self, auto_apply: Option<ApplyOptions>) -> LocalBoxFuture<'static, Result<Option<Vec<ModuleId>>>> {
        hmr::check(self.clone(), auto_apply).boxed_local()
    }

    pub fn apply(&self, options: ApplyOptions) -> LocalBoxFuture<'static, Result<Vec<ModuleId>>> {
        hmr::apply(self.clone(), options).boxed_local()
    }

    /// What replacing `id` would do, without changing anything
    pub fn affected_modules(&self, id: impl Into<ModuleId>) -> UpdateEffect {
        hmr::affected_modules(self.modules(), &id.into())
    }

    /// Resolves once no tracked chunk loads are in flight
    pub fn wait_for_blocking(&self) -> LocalBoxFuture<'static, ()> {
        match self.hmr() {
            Some(hmr) => hmr.wait_for_blocking(),
            None => futures::future::ready(()).boxed_local(),
        }
    }

    pub fn add_status_handler<F, Fut>(&self, handler: F) -> StatusHandlerId
    where
        F: Fn(HmrStatus) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        match self.hmr() {
            Some(hmr) => hmr.add_status_handler(Rc::new(move |status| handler(status).boxed_local())),
            None => {
                warn!("hot updates disabled, status handler ignored");
                StatusHandlerId::detached()
            }
        }
    }

    pub fn remove_status_handler(&self, id: StatusHandlerId) -> bool {
        self.hmr().map_or(false, |hmr| hmr.remove_status_handler(id))
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("modules", &self.inner.modules)
            .field("chunks", &self.inner.chunks)
            .field("injector", &self.inner.injector)
            .field("hmr", &self.inner.hmr)
            .finish()
    }
}
