//! Module Registry & Executor
//!
//! Owns the factory table and the module cache. A module's factory runs at
//! most once per [`ModuleRecord`]; the record is cached *before* the factory
//! runs so that circular requires observe the partially populated exports
//! instead of recursing.
//!
//! Every execution passes through an ordered interceptor pipeline that may
//! replace the `require` handed to the factory or attach extra state to the
//! record. The hot-update coordinator uses it to attach `module.hot` and to
//! record parent/child edges.
//!
//! # Example
//! ```text
//! runtime.define("greeting", Rc::new(|_module, exports, _require| {
//!     exports.set("text", "hello");
//!     Ok(())
//! }));
//! let exports = runtime.require("greeting")?;
//! ```

use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use futures::future::{self, FutureExt, LocalBoxFuture};
use tracing::{debug, trace};

use crate::chunks::ChunkId;
use crate::error::{Error, Result};
use crate::hmr::{Hot, HotState};
use crate::runtime::{Runtime, WeakRuntime};

/// Identifier as it appears in build output: a string or an integer
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum RawId {
    Str(String),
    Int(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Str(s) => s,
            RawId::Int(n) => n.to_string(),
        }
    }
}

/// Module identifier, stable within one build
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawId")]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<RawId> for ModuleId {
    fn from(raw: RawId) -> Self {
        Self(raw.into())
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ModuleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&ModuleId> for ModuleId {
    fn from(id: &ModuleId) -> Self {
        id.clone()
    }
}

impl std::borrow::Borrow<str> for ModuleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A module's exports object.
///
/// Cloning shares the underlying object; identity is observable through
/// [`Exports::ptr_eq`].
#[derive(Clone, Default)]
pub struct Exports(Rc<RefCell<Map<String, Value>>>);

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.borrow().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.borrow_mut().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.borrow_mut().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Copy of the current contents as a JSON object
    pub fn snapshot(&self) -> Value {
        Value::Object(self.0.borrow().clone())
    }

    /// Whether both handles point at the same exports object
    pub fn ptr_eq(a: &Exports, b: &Exports) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Exports").field(&*self.0.borrow()).finish()
    }
}

/// Factory supplied by the build: `(module, module.exports, require)`
pub type ModuleFactory = Rc<dyn Fn(&Module, &Exports, &Require) -> Result<()>>;

/// Initialization code shipped with a chunk, run once with the runtime's require
pub type RuntimeCallback = Rc<dyn Fn(&Require) -> Result<()>>;

/// Hook run before every factory invocation
pub type Interceptor = Rc<dyn Fn(&Runtime, &mut ExecutionOptions)>;

type RequireFn = dyn Fn(&ModuleId) -> Result<Exports>;
type EnsureFn = dyn Fn(&ChunkId) -> LocalBoxFuture<'static, Result<()>>;

/// The `require` function handed to a factory
#[derive(Clone)]
pub struct Require {
    call: Rc<RequireFn>,
    ensure: Rc<EnsureFn>,
}

impl Require {
    pub fn new<C, E>(call: C, ensure: E) -> Self
    where
        C: Fn(&ModuleId) -> Result<Exports> + 'static,
        E: Fn(&ChunkId) -> LocalBoxFuture<'static, Result<()>> + 'static,
    {
        Self {
            call: Rc::new(call),
            ensure: Rc::new(ensure),
        }
    }

    /// The unwrapped require bound to a runtime
    pub(crate) fn root(runtime: WeakRuntime) -> Self {
        let ensure_runtime = runtime.clone();
        Self::new(
            move |id| runtime.upgrade().ok_or(Error::RuntimeDropped)?.require(id),
            move |chunk_id| match ensure_runtime.upgrade() {
                Some(runtime) => runtime.ensure_chunk(chunk_id.clone()),
                None => future::ready(Err(Error::RuntimeDropped)).boxed_local(),
            },
        )
    }

    /// Require a module
    pub fn call(&self, id: impl Into<ModuleId>) -> Result<Exports> {
        (self.call)(&id.into())
    }

    /// Make sure a chunk is loaded, the equivalent of `require.e(chunkId)`
    pub fn ensure_chunk(&self, chunk_id: impl Into<ChunkId>) -> LocalBoxFuture<'static, Result<()>> {
        (self.ensure)(&chunk_id.into())
    }
}

impl fmt::Debug for Require {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Require")
    }
}

/// Registry-owned state of one module instance
pub struct ModuleRecord {
    id: ModuleId,
    exports: Exports,
    parents: RefCell<Vec<ModuleId>>,
    children: RefCell<Vec<ModuleId>>,
    error: RefCell<Option<Error>>,
    loaded: Cell<bool>,
    hot: RefCell<Option<Rc<HotState>>>,
}

impl ModuleRecord {
    fn new(id: ModuleId) -> Self {
        Self {
            id,
            exports: Exports::new(),
            parents: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
            error: RefCell::new(None),
            loaded: Cell::new(false),
            hot: RefCell::new(None),
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    pub fn parents(&self) -> Vec<ModuleId> {
        self.parents.borrow().clone()
    }

    pub fn children(&self) -> Vec<ModuleId> {
        self.children.borrow().clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.error.borrow().clone()
    }

    /// The factory ran to completion
    pub fn is_loaded(&self) -> bool {
        self.loaded.get()
    }

    pub(crate) fn hot(&self) -> Option<Rc<HotState>> {
        self.hot.borrow().clone()
    }

    pub(crate) fn attach_hot(&self, hot: Rc<HotState>) {
        *self.hot.borrow_mut() = Some(hot);
    }

    /// A record without hot state counts as active
    pub(crate) fn is_active(&self) -> bool {
        self.hot().map_or(true, |hot| hot.is_active())
    }

    pub(crate) fn set_parents(&self, parents: Vec<ModuleId>) {
        *self.parents.borrow_mut() = parents;
    }

    pub(crate) fn add_parent(&self, parent: &ModuleId) {
        let mut parents = self.parents.borrow_mut();
        if !parents.contains(parent) {
            parents.push(parent.clone());
        }
    }

    pub(crate) fn remove_parent(&self, parent: &ModuleId) {
        self.parents.borrow_mut().retain(|id| id != parent);
    }

    pub(crate) fn add_child(&self, child: &ModuleId) {
        let mut children = self.children.borrow_mut();
        if !children.contains(child) {
            children.push(child.clone());
        }
    }

    pub(crate) fn clear_children(&self) {
        self.children.borrow_mut().clear();
    }

    pub(crate) fn remove_children(&self, removed: &[ModuleId]) {
        self.children.borrow_mut().retain(|id| !removed.contains(id));
    }

    /// Exports of a cached record, or the error its factory raised
    fn cached_exports(&self) -> Result<Exports> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self.exports.clone()),
        }
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("id", &self.id)
            .field("parents", &*self.parents.borrow())
            .field("children", &*self.children.borrow())
            .field("loaded", &self.loaded.get())
            .field("error", &*self.error.borrow())
            .finish()
    }
}

/// Handle to a module instance, handed to its factory as `module`
#[derive(Clone)]
pub struct Module {
    record: Rc<ModuleRecord>,
    runtime: WeakRuntime,
}

impl Module {
    pub(crate) fn new(record: Rc<ModuleRecord>, runtime: WeakRuntime) -> Self {
        Self { record, runtime }
    }

    pub fn id(&self) -> &ModuleId {
        self.record.id()
    }

    pub fn exports(&self) -> &Exports {
        self.record.exports()
    }

    /// The module's `module.hot` handle, absent when hot updates are disabled
    pub fn hot(&self) -> Option<Hot> {
        self.record
            .hot()
            .map(|state| Hot::new(self.record.id().clone(), state, self.runtime.clone()))
    }

    pub fn parents(&self) -> Vec<ModuleId> {
        self.record.parents()
    }

    pub fn children(&self) -> Vec<ModuleId> {
        self.record.children()
    }

    pub fn is_loaded(&self) -> bool {
        self.record.is_loaded()
    }

    pub(crate) fn record(&self) -> &Rc<ModuleRecord> {
        &self.record
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module").field("id", self.id()).finish()
    }
}

/// Everything the interceptor pipeline may inspect or replace before a factory runs
pub struct ExecutionOptions {
    pub id: ModuleId,
    pub module: Module,
    pub factory: ModuleFactory,
    pub require: Require,
}

/// Factory table, module cache and interceptor pipeline
#[derive(Default)]
pub struct ModuleRegistry {
    factories: RefCell<HashMap<ModuleId, ModuleFactory>>,
    cache: RefCell<HashMap<ModuleId, Rc<ModuleRecord>>>,
    interceptors: RefCell<Vec<Interceptor>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, id: ModuleId, factory: ModuleFactory) {
        self.factories.borrow_mut().insert(id, factory);
    }

    pub fn factory(&self, id: &ModuleId) -> Option<ModuleFactory> {
        self.factories.borrow().get(id).cloned()
    }

    pub fn has_factory(&self, id: &str) -> bool {
        self.factories.borrow().contains_key(id)
    }

    pub fn cached(&self, id: &str) -> Option<Rc<ModuleRecord>> {
        self.cache.borrow().get(id).cloned()
    }

    pub fn cached_ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.cache.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn evict(&self, id: &str) -> Option<Rc<ModuleRecord>> {
        self.cache.borrow_mut().remove(id)
    }

    pub fn add_interceptor(&self, interceptor: Interceptor) {
        self.interceptors.borrow_mut().push(interceptor);
    }

    /// Return cached exports or instantiate the module
    pub(crate) fn require(&self, runtime: &Runtime, id: &ModuleId) -> Result<Exports> {
        if let Some(record) = self.cached(id.as_str()) {
            trace!(module = %id, "module cache hit");
            return record.cached_exports();
        }

        let factory = self.factory(id).ok_or_else(|| Error::ModuleNotFound(id.clone()))?;
        let record = Rc::new(ModuleRecord::new(id.clone()));
        self.cache.borrow_mut().insert(id.clone(), Rc::clone(&record));

        let mut options = ExecutionOptions {
            id: id.clone(),
            module: Module::new(Rc::clone(&record), runtime.downgrade()),
            factory,
            require: Require::root(runtime.downgrade()),
        };
        let interceptors = self.interceptors.borrow().clone();
        for interceptor in &interceptors {
            interceptor(runtime, &mut options);
        }

        debug!(module = %id, "executing module factory");
        let exports = record.exports().clone();
        match (options.factory)(&options.module, &exports, &options.require) {
            Ok(()) => {
                record.loaded.set(true);
                Ok(exports)
            }
            Err(err) => {
                debug!(module = %id, error = %err, "module factory failed");
                *record.error.borrow_mut() = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("factories", &self.factories.borrow().len())
            .field("cached", &self.cache.borrow().len())
            .field("interceptors", &self.interceptors.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::host::MemoryHost;
    use std::cell::Cell;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_hot(false), Rc::new(MemoryHost::new()))
    }

    #[test]
    fn test_module_id_accepts_integers() {
        let ids: Vec<ModuleId> = serde_json::from_str(r#"["./src/a.js", 42]"#).unwrap();
        assert_eq!(ids, vec![ModuleId::from("./src/a.js"), ModuleId::from("42")]);
    }

    #[test]
    fn test_module_id_map_lookup_by_str() {
        let mut map: HashMap<ModuleId, u32> = HashMap::default();
        map.insert(ModuleId::from("./src/a.js"), 1);
        assert_eq!(map.get("./src/a.js"), Some(&1));
        assert!(map.get("./src/b.js").is_none());
    }

    #[test]
    fn test_exports_object() {
        let exports = Exports::new();
        assert!(exports.is_empty());
        exports.set("a", 1);
        exports.set("b", "two");

        assert!(exports.contains("a"));
        assert_eq!(exports.get("b"), Some(Value::from("two")));
        assert_eq!(exports.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(exports.snapshot(), serde_json::json!({ "a": 1, "b": "two" }));
        assert!(format!("{:?}", exports).starts_with("Exports({\"a\""));

        assert_eq!(exports.remove("a"), Some(Value::from(1)));
        assert!(!exports.contains("a"));
    }

    #[test]
    fn test_factory_runs_once() {
        let runtime = runtime();
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        runtime.define("a", Rc::new(move |_, exports, _| {
            counter.set(counter.get() + 1);
            exports.set("value", 1);
            Ok(())
        }));

        let first = runtime.require("a").unwrap();
        let second = runtime.require("a").unwrap();
        assert_eq!(runs.get(), 1);
        assert!(Exports::ptr_eq(&first, &second));
        assert_eq!(first.get("value"), Some(Value::from(1)));
    }

    #[test]
    fn test_missing_factory_is_fatal() {
        let runtime = runtime();
        let err = runtime.require("nope").unwrap_err();
        assert!(matches!(err, Error::ModuleNotFound(ref id) if id.as_str() == "nope"));
        assert!(runtime.modules().cached("nope").is_none());
    }

    #[test]
    fn test_factory_error_is_sticky() {
        let runtime = runtime();
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        runtime.define("broken", Rc::new(move |_, _, _| {
            counter.set(counter.get() + 1);
            Err(Error::thrown("boom"))
        }));

        assert!(runtime.require("broken").is_err());
        let err = runtime.require("broken").unwrap_err();
        assert_eq!(err.to_string(), "Error: boom");
        assert_eq!(runs.get(), 1);
        let record = runtime.modules().cached("broken").unwrap();
        assert!(!record.is_loaded());
        assert!(record.error().is_some());
    }

    #[test]
    fn test_interceptors_run_in_order_and_can_wrap_require() {
        let runtime = runtime();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&seen);
        runtime.add_interceptor(Rc::new(move |_, options: &mut ExecutionOptions| {
            log.borrow_mut().push(format!("first:{}", options.id));
        }));
        let log = Rc::clone(&seen);
        runtime.add_interceptor(Rc::new(move |_, options: &mut ExecutionOptions| {
            log.borrow_mut().push(format!("second:{}", options.id));
            let inner = options.require.clone();
            let calls = Rc::clone(&log);
            let ensure = options.require.clone();
            options.require = Require::new(
                move |id| {
                    calls.borrow_mut().push(format!("require:{}", id));
                    inner.call(id)
                },
                move |chunk_id| ensure.ensure_chunk(chunk_id.clone()),
            );
        }));

        runtime.define("leaf", Rc::new(|_, _, _| Ok(())));
        runtime.define("root", Rc::new(|_, _, require| {
            require.call("leaf")?;
            Ok(())
        }));
        runtime.require("root").unwrap();

        assert_eq!(
            *seen.borrow(),
            vec!["first:root", "second:root", "require:leaf", "first:leaf", "second:leaf"]
        );
    }
}
