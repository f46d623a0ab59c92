//! Dispose and apply phases of a hot-update cycle

use indexmap::IndexMap;
use rustc_hash::FxHashSet as HashSet;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use super::graph::{affected_modules, UpdateEffect};
use super::hot::{AcceptErrorContext, HotData, SelfAcceptErrorHandler};
use super::manifest::PendingCycle;
use crate::chunks::ChunkId;
use crate::error::{Error, HmrError, Result};
use crate::modules::{ModuleFactory, ModuleId, ModuleRecord, Require, RuntimeCallback};
use crate::runtime::Runtime;

pub type EffectObserver = Rc<dyn Fn(&UpdateEffect)>;
pub type ErrorObserver = Rc<dyn Fn(&ApplyErrorEvent)>;

/// Errors raised by accept callbacks and self-accepted re-execution
#[derive(Debug, Clone)]
pub enum ApplyErrorEvent {
    AcceptErrored {
        module_id: ModuleId,
        dependency_id: ModuleId,
        error: Error,
    },
    AcceptErrorHandlerErrored {
        module_id: ModuleId,
        dependency_id: ModuleId,
        error: Error,
        original_error: Error,
    },
    SelfAcceptErrored {
        module_id: ModuleId,
        error: Error,
    },
    SelfAcceptErrorHandlerErrored {
        module_id: ModuleId,
        error: Error,
        original_error: Error,
    },
}

impl ApplyErrorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ApplyErrorEvent::AcceptErrored { .. } => "accept-errored",
            ApplyErrorEvent::AcceptErrorHandlerErrored { .. } => "accept-error-handler-errored",
            ApplyErrorEvent::SelfAcceptErrored { .. } => "self-accept-errored",
            ApplyErrorEvent::SelfAcceptErrorHandlerErrored { .. } => "self-accept-error-handler-errored",
        }
    }

    pub fn module_id(&self) -> &ModuleId {
        match self {
            ApplyErrorEvent::AcceptErrored { module_id, .. }
            | ApplyErrorEvent::AcceptErrorHandlerErrored { module_id, .. }
            | ApplyErrorEvent::SelfAcceptErrored { module_id, .. }
            | ApplyErrorEvent::SelfAcceptErrorHandlerErrored { module_id, .. } => module_id,
        }
    }
}

/// How `apply` treats updates that cannot be applied cleanly
#[derive(Clone, Default)]
pub struct ApplyOptions {
    pub ignore_unaccepted: bool,
    pub ignore_declined: bool,
    pub ignore_errored: bool,
    pub on_declined: Option<EffectObserver>,
    pub on_unaccepted: Option<EffectObserver>,
    pub on_accepted: Option<EffectObserver>,
    pub on_disposed: Option<EffectObserver>,
    pub on_errored: Option<ErrorObserver>,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore_unaccepted(mut self, ignore: bool) -> Self {
        self.ignore_unaccepted = ignore;
        self
    }

    pub fn ignore_declined(mut self, ignore: bool) -> Self {
        self.ignore_declined = ignore;
        self
    }

    pub fn ignore_errored(mut self, ignore: bool) -> Self {
        self.ignore_errored = ignore;
        self
    }

    pub fn on_declined<F: Fn(&UpdateEffect) + 'static>(mut self, observer: F) -> Self {
        self.on_declined = Some(Rc::new(observer));
        self
    }

    pub fn on_unaccepted<F: Fn(&UpdateEffect) + 'static>(mut self, observer: F) -> Self {
        self.on_unaccepted = Some(Rc::new(observer));
        self
    }

    pub fn on_accepted<F: Fn(&UpdateEffect) + 'static>(mut self, observer: F) -> Self {
        self.on_accepted = Some(Rc::new(observer));
        self
    }

    pub fn on_disposed<F: Fn(&UpdateEffect) + 'static>(mut self, observer: F) -> Self {
        self.on_disposed = Some(Rc::new(observer));
        self
    }

    pub fn on_errored<F: Fn(&ApplyErrorEvent) + 'static>(mut self, observer: F) -> Self {
        self.on_errored = Some(Rc::new(observer));
        self
    }

    fn notify(observer: &Option<EffectObserver>, effect: &UpdateEffect) {
        if let Some(observer) = observer {
            observer(effect);
        }
    }

    fn errored(&self, event: ApplyErrorEvent) {
        if let Some(observer) = &self.on_errored {
            observer(&event);
        }
    }
}

impl fmt::Debug for ApplyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("ignore_unaccepted", &self.ignore_unaccepted)
            .field("ignore_declined", &self.ignore_declined)
            .field("ignore_errored", &self.ignore_errored)
            .field("on_declined", &self.on_declined.is_some())
            .field("on_unaccepted", &self.on_unaccepted.is_some())
            .field("on_accepted", &self.on_accepted.is_some())
            .field("on_disposed", &self.on_disposed.is_some())
            .field("on_errored", &self.on_errored.is_some())
            .finish()
    }
}

/// Keeps the first error reported during the apply phase
#[derive(Debug, Default)]
pub(crate) struct ErrorReporter {
    first: Option<Error>,
}

impl ErrorReporter {
    pub(crate) fn report(&mut self, err: Error) {
        if self.first.is_none() {
            self.first = Some(err);
        } else {
            debug!(error = %err, "additional apply error");
        }
    }

    pub(crate) fn into_error(self) -> Option<Error> {
        self.first
    }
}

struct SelfAccepted {
    record: Rc<ModuleRecord>,
    is_entry: bool,
    error_handler: Option<SelfAcceptErrorHandler>,
}

/// Factory installed for modules an update removed
fn disposed_factory() -> ModuleFactory {
    Rc::new(|module, _, _| {
        warn!(module = %module.id(), "unexpected require to disposed module");
        Err(Error::DisposedModule(module.id().clone()))
    })
}

/// Everything one cycle will dispose, install and re-run
pub(crate) struct UpdatePlan {
    outdated_modules: Vec<ModuleId>,
    outdated_dependencies: IndexMap<ModuleId, Vec<ModuleId>>,
    applied: IndexMap<ModuleId, ModuleFactory>,
    self_accepted: Vec<SelfAccepted>,
    runtime_callbacks: Vec<RuntimeCallback>,
    removed_chunks: Vec<ChunkId>,
}

fn merge(target: &mut Vec<ModuleId>, ids: impl IntoIterator<Item = ModuleId>) {
    for id in ids {
        if !target.contains(&id) {
            target.push(id);
        }
    }
}

impl UpdatePlan {
    /// Classify every staged module. Nothing is mutated when this fails.
    pub(crate) fn build(runtime: &Runtime, cycle: PendingCycle, options: &ApplyOptions) -> Result<Self> {
        let PendingCycle {
            update,
            runtime_callbacks,
            removed_chunks,
            ..
        } = cycle;

        let mut outdated_modules = Vec::new();
        let mut outdated_dependencies: IndexMap<ModuleId, Vec<ModuleId>> = IndexMap::new();
        let mut applied = IndexMap::new();
        let mut disposed = HashSet::default();

        for (module_id, factory) in update {
            let effect = match &factory {
                Some(_) => affected_modules(runtime.modules(), &module_id),
                None => UpdateEffect::Disposed {
                    module_id: module_id.clone(),
                },
            };
            debug!(module = %module_id, ?effect, "classified update");

            let abort = match &effect {
                UpdateEffect::SelfDeclined { module_id, chain } => {
                    ApplyOptions::notify(&options.on_declined, &effect);
                    (!options.ignore_declined).then(|| HmrError::SelfDeclined {
                        module_id: module_id.clone(),
                        chain: chain.clone(),
                    })
                }
                UpdateEffect::Declined {
                    module_id,
                    parent_id,
                    chain,
                } => {
                    ApplyOptions::notify(&options.on_declined, &effect);
                    (!options.ignore_declined).then(|| HmrError::Declined {
                        module_id: module_id.clone(),
                        parent_id: parent_id.clone(),
                        chain: chain.clone(),
                    })
                }
                UpdateEffect::Unaccepted { chain, .. } => {
                    ApplyOptions::notify(&options.on_unaccepted, &effect);
                    (!options.ignore_unaccepted).then(|| HmrError::Unaccepted {
                        module_id: module_id.clone(),
                        chain: chain.clone(),
                    })
                }
                UpdateEffect::Accepted {
                    outdated_modules: modules,
                    outdated_dependencies: dependencies,
                    ..
                } => {
                    ApplyOptions::notify(&options.on_accepted, &effect);
                    if let Some(factory) = factory {
                        applied.insert(module_id.clone(), factory);
                    }
                    merge(&mut outdated_modules, modules.iter().cloned());
                    for (parent, deps) in dependencies {
                        merge(outdated_dependencies.entry(parent.clone()).or_default(), deps.iter().cloned());
                    }
                    None
                }
                UpdateEffect::Disposed { .. } => {
                    ApplyOptions::notify(&options.on_disposed, &effect);
                    merge(&mut outdated_modules, [module_id.clone()]);
                    applied.insert(module_id.clone(), disposed_factory());
                    disposed.insert(module_id.clone());
                    None
                }
            };
            if let Some(err) = abort {
                return Err(err.into());
            }
        }

        let self_accepted = outdated_modules
            .iter()
            .filter(|id| !disposed.contains(*id))
            .filter_map(|id| runtime.modules().cached(id.as_str()))
            .filter_map(|record| {
                let hot = record.hot()?;
                let eligible = (hot.is_self_accepted() || hot.is_entry()) && !hot.is_self_invalidated();
                eligible.then(|| SelfAccepted {
                    is_entry: hot.is_entry(),
                    error_handler: hot.self_accept_handler(),
                    record: Rc::clone(&record),
                })
            })
            .collect();

        Ok(Self {
            outdated_modules,
            outdated_dependencies,
            applied,
            self_accepted,
            runtime_callbacks,
            removed_chunks,
        })
    }

    pub(crate) fn outdated_modules(&self) -> &[ModuleId] {
        &self.outdated_modules
    }

    /// Run dispose handlers and drop every outdated module from the cache
    pub(crate) fn dispose(&mut self, runtime: &Runtime) {
        for chunk_id in &self.removed_chunks {
            runtime.chunks().remove(chunk_id.as_str());
        }

        let modules = runtime.modules();
        for module_id in self.outdated_modules.clone() {
            let Some(record) = modules.cached(module_id.as_str()) else {
                continue;
            };
            let mut data = HotData::new();
            if let Some(hot) = record.hot() {
                for handler in hot.dispose_handlers() {
                    handler(&mut data);
                }
                hot.deactivate();
            }
            if let Some(hmr) = runtime.hmr() {
                hmr.store_module_data(module_id.clone(), data);
            }
            modules.evict(module_id.as_str());
            self.outdated_dependencies.shift_remove(&module_id);
            for child_id in record.children() {
                if let Some(child) = modules.cached(child_id.as_str()) {
                    child.remove_parent(&module_id);
                }
            }
            debug!(module = %module_id, "disposed module");
        }

        for (module_id, deps) in &self.outdated_dependencies {
            if let Some(record) = modules.cached(module_id.as_str()) {
                record.remove_children(deps);
            }
        }
    }

    /// Install new factories, run accept callbacks and re-execute self-accepted modules
    pub(crate) fn apply(&self, runtime: &Runtime, options: &ApplyOptions, reporter: &mut ErrorReporter) -> Vec<ModuleId> {
        let modules = runtime.modules();
        for (module_id, factory) in &self.applied {
            modules.define(module_id.clone(), Rc::clone(factory));
        }

        let require = Require::root(runtime.downgrade());
        for callback in &self.runtime_callbacks {
            if let Err(err) = callback(&require) {
                reporter.report(err);
            }
        }

        for (module_id, deps) in &self.outdated_dependencies {
            let Some(hot) = modules.cached(module_id.as_str()).and_then(|record| record.hot()) else {
                continue;
            };
            let mut callbacks = Vec::new();
            for dependency in deps {
                let Some(callback) = hot.accept_callback(dependency) else {
                    continue;
                };
                if callbacks.iter().any(|(existing, _, _)| Rc::ptr_eq(existing, &callback)) {
                    continue;
                }
                callbacks.push((callback, hot.accept_error_handler(dependency), dependency.clone()));
            }

            for (callback, error_handler, dependency_id) in callbacks {
                let Err(err) = callback(deps.as_slice()) else {
                    continue;
                };
                match error_handler {
                    Some(handler) => {
                        let context = AcceptErrorContext {
                            module_id: module_id.clone(),
                            dependency_id: dependency_id.clone(),
                        };
                        if let Err(err2) = handler(&err, &context) {
                            options.errored(ApplyErrorEvent::AcceptErrorHandlerErrored {
                                module_id: module_id.clone(),
                                dependency_id,
                                error: err2.clone(),
                                original_error: err.clone(),
                            });
                            if !options.ignore_errored {
                                reporter.report(err2);
                                reporter.report(err);
                            }
                        }
                    }
                    None => {
                        options.errored(ApplyErrorEvent::AcceptErrored {
                            module_id: module_id.clone(),
                            dependency_id,
                            error: err.clone(),
                        });
                        if !options.ignore_errored {
                            reporter.report(err);
                        }
                    }
                }
            }
        }

        for item in &self.self_accepted {
            let module_id = item.record.id().clone();
            if let Some(hmr) = runtime.hmr() {
                hmr.set_current_parents(item.record.parents());
                hmr.set_current_child((!item.is_entry).then(|| module_id.clone()));
            }
            let Err(err) = runtime.require(module_id.clone()) else {
                continue;
            };
            match &item.error_handler {
                Some(handler) => {
                    if let Err(err2) = handler(&err, &module_id) {
                        options.errored(ApplyErrorEvent::SelfAcceptErrorHandlerErrored {
                            module_id,
                            error: err2.clone(),
                            original_error: err.clone(),
                        });
                        if !options.ignore_errored {
                            reporter.report(err2);
                            reporter.report(err);
                        }
                    }
                }
                None => {
                    options.errored(ApplyErrorEvent::SelfAcceptErrored {
                        module_id,
                        error: err.clone(),
                    });
                    if !options.ignore_errored {
                        reporter.report(err);
                    }
                }
            }
        }

        self.outdated_modules.clone()
    }
}
