//! Per-module hot state and the `module.hot` handle

use indexmap::IndexMap;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::future::{self, FutureExt, LocalBoxFuture};
use tracing::warn;

use super::apply::ApplyOptions;
use super::{HmrStatus, StatusHandlerId};
use crate::error::{Error, Result};
use crate::chunks::ChunkId;
use crate::modules::{ExecutionOptions, Exports, Interceptor, ModuleId, Require};
use crate::runtime::{Runtime, WeakRuntime};

/// Called with the outdated dependencies of the accepting module
pub type AcceptCallback = Rc<dyn Fn(&[ModuleId]) -> Result<()>>;

/// Where an accept callback failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptErrorContext {
    pub module_id: ModuleId,
    pub dependency_id: ModuleId,
}

pub type AcceptErrorHandler = Rc<dyn Fn(&Error, &AcceptErrorContext) -> Result<()>>;

/// Error handler of a self-accepting module, called when re-executing it fails
pub type SelfAcceptErrorHandler = Rc<dyn Fn(&Error, &ModuleId) -> Result<()>>;

pub type DisposeHandler = Rc<dyn Fn(&mut HotData)>;

/// State handed from a disposed module instance to its replacement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HotData {
    data: HashMap<String, Vec<u8>>,
}

impl HotData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: serde::Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.data.insert(key.to_string(), bytes);
        Ok(())
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.data.get(key) {
            Some(bytes) => bincode::deserialize(bytes)
                .map(Some)
                .map_err(|e| Error::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn set_raw(&mut self, key: &str, data: Vec<u8>) {
        self.data.insert(key.to_string(), data);
    }

    pub fn get_raw(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.data.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Clone, Default)]
pub(crate) enum SelfAccept {
    #[default]
    No,
    Yes,
    WithHandler(SelfAcceptErrorHandler),
}

/// Hot-update declarations of one module instance
pub(crate) struct HotState {
    accepted_dependencies: RefCell<IndexMap<ModuleId, AcceptCallback>>,
    accepted_error_handlers: RefCell<HashMap<ModuleId, AcceptErrorHandler>>,
    declined_dependencies: RefCell<HashSet<ModuleId>>,
    self_accepted: RefCell<SelfAccept>,
    self_declined: Cell<bool>,
    self_invalidated: Cell<bool>,
    dispose_handlers: RefCell<Vec<DisposeHandler>>,
    active: Cell<bool>,
    is_entry: bool,
    data: Option<HotData>,
}

impl HotState {
    pub(crate) fn new(is_entry: bool, data: Option<HotData>) -> Self {
        Self {
            accepted_dependencies: RefCell::new(IndexMap::new()),
            accepted_error_handlers: RefCell::new(HashMap::default()),
            declined_dependencies: RefCell::new(HashSet::default()),
            self_accepted: RefCell::new(SelfAccept::No),
            self_declined: Cell::new(false),
            self_invalidated: Cell::new(false),
            dispose_handlers: RefCell::new(Vec::new()),
            active: Cell::new(true),
            is_entry,
            data,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Disposed instances never come back
    pub(crate) fn deactivate(&self) {
        self.active.set(false);
    }

    pub(crate) fn is_entry(&self) -> bool {
        self.is_entry
    }

    pub(crate) fn is_self_accepted(&self) -> bool {
        !matches!(*self.self_accepted.borrow(), SelfAccept::No)
    }

    pub(crate) fn self_accept_handler(&self) -> Option<SelfAcceptErrorHandler> {
        match &*self.self_accepted.borrow() {
            SelfAccept::WithHandler(handler) => Some(Rc::clone(handler)),
            _ => None,
        }
    }

    pub(crate) fn is_self_declined(&self) -> bool {
        self.self_declined.get()
    }

    pub(crate) fn is_self_invalidated(&self) -> bool {
        self.self_invalidated.get()
    }

    pub(crate) fn mark_invalidated(&self) {
        self.self_invalidated.set(true);
    }

    pub(crate) fn declines(&self, dependency: &ModuleId) -> bool {
        self.declined_dependencies.borrow().contains(dependency)
    }

    pub(crate) fn accepts(&self, dependency: &ModuleId) -> bool {
        self.accepted_dependencies.borrow().contains_key(dependency)
    }

    pub(crate) fn accept_callback(&self, dependency: &ModuleId) -> Option<AcceptCallback> {
        self.accepted_dependencies.borrow().get(dependency).cloned()
    }

    pub(crate) fn accept_error_handler(&self, dependency: &ModuleId) -> Option<AcceptErrorHandler> {
        self.accepted_error_handlers.borrow().get(dependency).cloned()
    }

    pub(crate) fn dispose_handlers(&self) -> Vec<DisposeHandler> {
        self.dispose_handlers.borrow().clone()
    }

    fn accept_dependency(&self, dependency: ModuleId, callback: AcceptCallback, error_handler: Option<AcceptErrorHandler>) {
        let mut handlers = self.accepted_error_handlers.borrow_mut();
        match error_handler {
            Some(handler) => handlers.insert(dependency.clone(), handler),
            None => handlers.remove(&dependency),
        };
        self.accepted_dependencies.borrow_mut().insert(dependency, callback);
    }
}

impl fmt::Debug for HotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotState")
            .field("accepted_dependencies", &self.accepted_dependencies.borrow().keys().collect::<Vec<_>>())
            .field("declined_dependencies", &self.declined_dependencies.borrow().len())
            .field("self_accepted", &self.is_self_accepted())
            .field("self_declined", &self.self_declined.get())
            .field("self_invalidated", &self.self_invalidated.get())
            .field("active", &self.active.get())
            .field("is_entry", &self.is_entry)
            .finish()
    }
}

/// The `module.hot` handle a factory uses to take part in hot updates
#[derive(Clone)]
pub struct Hot {
    id: ModuleId,
    state: Rc<HotState>,
    runtime: WeakRuntime,
}

impl Hot {
    pub(crate) fn new(id: ModuleId, state: Rc<HotState>, runtime: WeakRuntime) -> Self {
        Self { id, state, runtime }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// Re-run this module's factory in place when it is replaced
    pub fn accept_self(&self) {
        *self.state.self_accepted.borrow_mut() = SelfAccept::Yes;
    }

    /// Like [`Hot::accept_self`], with a handler for errors raised while re-executing
    pub fn accept_self_with<F>(&self, error_handler: F)
    where
        F: Fn(&Error, &ModuleId) -> Result<()> + 'static,
    {
        *self.state.self_accepted.borrow_mut() = SelfAccept::WithHandler(Rc::new(error_handler));
    }

    /// Absorb replacements of `deps` by calling `callback`
    pub fn accept<I, D, F>(&self, deps: I, callback: F)
    where
        I: IntoIterator<Item = D>,
        D: Into<ModuleId>,
        F: Fn(&[ModuleId]) -> Result<()> + 'static,
    {
        let callback: AcceptCallback = Rc::new(callback);
        for dep in deps {
            self.state.accept_dependency(dep.into(), Rc::clone(&callback), None);
        }
    }

    pub fn accept_with_error_handler<I, D, F, E>(&self, deps: I, callback: F, error_handler: E)
    where
        I: IntoIterator<Item = D>,
        D: Into<ModuleId>,
        F: Fn(&[ModuleId]) -> Result<()> + 'static,
        E: Fn(&Error, &AcceptErrorContext) -> Result<()> + 'static,
    {
        let callback: AcceptCallback = Rc::new(callback);
        let error_handler: AcceptErrorHandler = Rc::new(error_handler);
        for dep in deps {
            self.state
                .accept_dependency(dep.into(), Rc::clone(&callback), Some(Rc::clone(&error_handler)));
        }
    }

    /// Accept `deps` without a callback
    pub fn accept_deps<I, D>(&self, deps: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<ModuleId>,
    {
        for dep in deps {
            self.state.accept_dependency(dep.into(), Rc::new(|_| Ok(())), None);
        }
    }

    /// Refuse hot replacement of `deps`
    pub fn decline<I, D>(&self, deps: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<ModuleId>,
    {
        let mut declined = self.state.declined_dependencies.borrow_mut();
        declined.extend(deps.into_iter().map(Into::into));
    }

    pub fn decline_self(&self) {
        self.state.self_declined.set(true);
    }

    /// Register a handler that runs before this instance is replaced
    pub fn dispose<F>(&self, handler: F) -> DisposeHandler
    where
        F: Fn(&mut HotData) + 'static,
    {
        let handler: DisposeHandler = Rc::new(handler);
        self.add_dispose_handler(Rc::clone(&handler));
        handler
    }

    pub fn add_dispose_handler(&self, handler: DisposeHandler) {
        self.state.dispose_handlers.borrow_mut().push(handler);
    }

    pub fn remove_dispose_handler(&self, handler: &DisposeHandler) {
        let mut handlers = self.state.dispose_handlers.borrow_mut();
        if let Some(pos) = handlers.iter().position(|h| Rc::ptr_eq(h, handler)) {
            handlers.remove(pos);
        }
    }

    /// Mark this module as needing replacement without a rebuild
    pub fn invalidate(&self) -> Result<()> {
        let runtime = self.upgrade()?;
        super::invalidate(&runtime, &self.id, &self.state);
        Ok(())
    }

    /// Data the previous instance's dispose handlers left behind
    pub fn data(&self) -> Option<&HotData> {
        self.state.data.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn check(&self, auto_apply: Option<ApplyOptions>) -> LocalBoxFuture<'static, Result<Option<Vec<ModuleId>>>> {
        match self.upgrade() {
            Ok(runtime) => runtime.check(auto_apply),
            Err(err) => future::ready(Err(err)).boxed_local(),
        }
    }

    pub fn apply(&self, options: ApplyOptions) -> LocalBoxFuture<'static, Result<Vec<ModuleId>>> {
        match self.upgrade() {
            Ok(runtime) => runtime.apply(options),
            Err(err) => future::ready(Err(err)).boxed_local(),
        }
    }

    pub fn status(&self) -> Result<HmrStatus> {
        Ok(self.upgrade()?.status())
    }

    pub fn add_status_handler<F, Fut>(&self, handler: F) -> Result<StatusHandlerId>
    where
        F: Fn(HmrStatus) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Ok(self.upgrade()?.add_status_handler(handler))
    }

    pub fn remove_status_handler(&self, id: StatusHandlerId) -> Result<bool> {
        Ok(self.upgrade()?.remove_status_handler(id))
    }

    fn upgrade(&self) -> Result<Runtime> {
        self.runtime.upgrade().ok_or(Error::RuntimeDropped)
    }
}

impl fmt::Debug for Hot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hot")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// Interceptor that attaches hot state to every executed module and wraps
/// its `require` so parent/child edges get recorded
pub(crate) fn hot_interceptor() -> Interceptor {
    Rc::new(|runtime: &Runtime, options: &mut ExecutionOptions| {
        let Some(hmr) = runtime.hmr() else {
            return;
        };
        let id = options.id.clone();
        let record = Rc::clone(options.module.record());

        let inner = options.require.clone();
        let weak = runtime.downgrade();
        let me = Rc::clone(&record);
        let call = move |request: &ModuleId| -> Result<Exports> {
            let runtime = weak.upgrade().ok_or(Error::RuntimeDropped)?;
            let hmr = runtime.hmr().ok_or(Error::RuntimeDropped)?;
            if !me.is_active() {
                warn!(module = %me.id(), %request, "require from disposed module");
                hmr.set_current_parents(Vec::new());
                return Err(Error::RequireFromDisposed {
                    from: me.id().clone(),
                    request: request.clone(),
                });
            }
            let cached = runtime.modules().cached(request.as_str());
            match &cached {
                Some(callee) => callee.add_parent(me.id()),
                None => {
                    hmr.set_current_parents(vec![me.id().clone()]);
                    hmr.set_current_child(Some(request.clone()));
                }
            }
            me.add_child(request);
            let result = inner.call(request);
            if result.is_err() && cached.is_none() {
                hmr.set_current_parents(Vec::new());
                hmr.set_current_child(None);
            }
            result
        };

        let ensure_inner = options.require.clone();
        let ensure_weak = runtime.downgrade();
        let ensure = move |chunk_id: &ChunkId| {
            let load = ensure_inner.ensure_chunk(chunk_id.clone());
            match ensure_weak.upgrade() {
                Some(runtime) => match runtime.hmr() {
                    Some(hmr) => hmr.track_blocking(&runtime, load),
                    None => load,
                },
                None => load,
            }
        };
        options.require = Require::new(call, ensure);

        let is_entry = hmr.current_child().as_ref() != Some(&id);
        let state = Rc::new(HotState::new(is_entry, hmr.module_data(&id)));
        hmr.set_current_child(None);
        record.attach_hot(state);
        record.set_parents(hmr.take_current_parents());
        record.clear_children();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hot_data_typed_values() {
        let mut data = HotData::new();
        data.set("counter", &41u32).unwrap();
        data.set("name", &"widget".to_string()).unwrap();

        assert_eq!(data.get::<u32>("counter").unwrap(), Some(41));
        assert_eq!(data.get::<String>("name").unwrap(), Some("widget".to_string()));
        assert_eq!(data.get::<u32>("missing").unwrap(), None);
        assert!(data.has("counter"));
    }

    #[test]
    fn test_hot_data_raw_access() {
        let mut data = HotData::new();
        data.set_raw("blob", vec![1, 2, 3]);
        assert_eq!(data.get_raw("blob"), Some(&[1u8, 2, 3][..]));
        assert_eq!(data.remove("blob"), Some(vec![1, 2, 3]));
        assert!(data.is_empty());
    }

    #[test]
    fn test_hot_data_decode_error() {
        let mut data = HotData::new();
        data.set_raw("short", vec![1]);
        assert!(matches!(data.get::<u64>("short"), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_accept_error_handler_replaced_on_plain_accept() {
        let state = HotState::new(false, None);
        let dep = ModuleId::from("./b");
        state.accept_dependency(dep.clone(), Rc::new(|_| Ok(())), Some(Rc::new(|_, _| Ok(()))));
        assert!(state.accept_error_handler(&dep).is_some());

        state.accept_dependency(dep.clone(), Rc::new(|_| Ok(())), None);
        assert!(state.accepts(&dep));
        assert!(state.accept_error_handler(&dep).is_none());
    }
}
