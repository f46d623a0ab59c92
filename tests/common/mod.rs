//! Shared test helpers for integration tests

use hotchunk::{
    Exports, Module, ModuleFactory, ModuleId, MemoryHost, Require, Runtime, RuntimeConfig,
};
use std::cell::RefCell;
use std::rc::Rc;

/// A runtime with hot updates enabled, backed by a fresh in-memory host
pub fn setup() -> (Runtime, Rc<MemoryHost>) {
    setup_with(RuntimeConfig::default())
}

pub fn setup_with(config: RuntimeConfig) -> (Runtime, Rc<MemoryHost>) {
    let host = Rc::new(MemoryHost::new());
    let runtime = Runtime::new(config, host.clone());
    (runtime, host)
}

/// Wrap a closure as a module factory
pub fn factory<F>(f: F) -> ModuleFactory
where
    F: Fn(&Module, &Exports, &Require) -> hotchunk::Result<()> + 'static,
{
    Rc::new(f)
}

/// Ordered record of events observed by a test
#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<Vec<String>>>);

#[allow(dead_code)]
impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.borrow().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

/// A factory that logs `exec <id>` and requires `deps` in order
#[allow(dead_code)]
pub fn logging_module(log: &Log, id: &str, deps: &[&str]) -> ModuleFactory {
    let log = log.clone();
    let name = format!("exec {}", id);
    let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
    factory(move |_, _, require| {
        log.push(name.clone());
        for dep in &deps {
            require.call(dep.as_str())?;
        }
        Ok(())
    })
}

/// Serve a chunk script that registers `modules` under `chunk_id`
#[allow(dead_code)]
pub fn serve_chunk(host: &MemoryHost, url: &str, chunk_id: &str, modules: Vec<(&str, ModuleFactory)>) {
    let chunk_id = chunk_id.to_string();
    let modules: Vec<(ModuleId, ModuleFactory)> = modules
        .into_iter()
        .map(|(id, factory)| (ModuleId::from(id), factory))
        .collect();
    host.serve_script(url, move |runtime| {
        runtime
            .register([chunk_id.as_str()], modules.clone(), None)
            .expect("chunk registration");
    });
}

/// Serve `/<chunk>.hot-update.js` delivering `modules`
#[allow(dead_code)]
pub fn serve_hot_update(host: &MemoryHost, chunk_id: &str, modules: Vec<(&str, ModuleFactory)>) {
    let chunk = chunk_id.to_string();
    let modules: Vec<(ModuleId, ModuleFactory)> = modules
        .into_iter()
        .map(|(id, factory)| (ModuleId::from(id), factory))
        .collect();
    host.serve_script(format!("/{}.hot-update.js", chunk_id), move |runtime| {
        runtime.hot_update(chunk.as_str(), modules.clone(), None);
    });
}

/// Publish `/main.hot-update.json`
#[allow(dead_code)]
pub fn publish_manifest(host: &MemoryHost, changed: &[&str], removed_chunks: &[&str], removed_modules: &[&str]) {
    let body = serde_json::json!({
        "c": changed,
        "r": removed_chunks,
        "m": removed_modules,
    });
    host.respond_json("/main.hot-update.json", body.to_string());
}

/// Slot a factory can stash a handle into for the test to pick up
#[allow(dead_code)]
pub type Slot<T> = Rc<RefCell<Option<T>>>;

#[allow(dead_code)]
pub fn slot<T>() -> Slot<T> {
    Rc::new(RefCell::new(None))
}
