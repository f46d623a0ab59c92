//! Hot Module Replacement
//!
//! Swaps running module implementations without a reload. One cycle goes
//! `idle -> check -> prepare -> ready -> dispose -> apply -> idle`; `abort`
//! and `fail` end a cycle early and the next `check` starts from `idle`.
//!
//! # Example
//! ```text
//! runtime.define("counter", Rc::new(|module, exports, _| {
//!     let count = module.hot()
//!         .and_then(|hot| hot.data().cloned())
//!         .and_then(|data| data.get::<u32>("count").ok().flatten())
//!         .unwrap_or(0);
//!     exports.set("count", count);
//!
//!     if let Some(hot) = module.hot() {
//!         hot.accept_self();
//!         hot.dispose(move |data| {
//!             let _ = data.set("count", &count);
//!         });
//!     }
//!     Ok(())
//! }));
//!
//! // later, after a rebuild
//! let outdated = runtime.check(Some(ApplyOptions::new())).await?;
//! ```

pub mod apply;
pub mod graph;
pub mod hot;
pub mod jsonp;
pub mod manifest;

pub use apply::{ApplyErrorEvent, ApplyOptions};
pub use graph::{affected_modules, UpdateEffect};
pub use hot::{AcceptCallback, AcceptErrorContext, AcceptErrorHandler, DisposeHandler, Hot, HotData, SelfAcceptErrorHandler};
pub(crate) use hot::HotState;
pub use jsonp::{HotUpdateChunkLoader, JsonpUpdateHandler};
pub use manifest::{HotUpdateHandler, PendingCycle, UpdateManifest};

use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, join_all, try_join_all, FutureExt, LocalBoxFuture};
use tracing::{debug, warn};

use crate::error::{Error, HmrError, Result};
use crate::modules::ModuleId;
use crate::runtime::{Runtime, WeakRuntime};
use apply::{ErrorReporter, UpdatePlan};

/// Hot-update coordinator status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmrStatus {
    #[default]
    Idle,
    Check,
    Prepare,
    Ready,
    Dispose,
    Apply,
    Abort,
    Fail,
}

impl HmrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HmrStatus::Idle => "idle",
            HmrStatus::Check => "check",
            HmrStatus::Prepare => "prepare",
            HmrStatus::Ready => "ready",
            HmrStatus::Dispose => "dispose",
            HmrStatus::Apply => "apply",
            HmrStatus::Abort => "abort",
            HmrStatus::Fail => "fail",
        }
    }

    /// A cycle is between `check` and the end of `apply`
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            HmrStatus::Check | HmrStatus::Prepare | HmrStatus::Dispose | HmrStatus::Apply
        )
    }
}

impl fmt::Display for HmrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned when registering a status handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusHandlerId(u64);

impl StatusHandlerId {
    /// Id of a handler that was never registered
    pub(crate) fn detached() -> Self {
        Self(u64::MAX)
    }
}

pub type StatusFuture = LocalBoxFuture<'static, ()>;
pub type StatusHandler = Rc<dyn Fn(HmrStatus) -> StatusFuture>;

/// Process-wide hot-update state of one runtime
pub struct HotCoordinator {
    status: Cell<HmrStatus>,
    status_handlers: RefCell<Vec<(StatusHandlerId, StatusHandler)>>,
    next_handler_id: Cell<u64>,
    /// Handler futures of transitions nobody awaited yet
    pending_notifications: RefCell<Vec<StatusFuture>>,
    blocking: Cell<usize>,
    blocking_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    cycle: RefCell<Option<PendingCycle>>,
    queued_invalidations: RefCell<Option<Vec<ModuleId>>>,
    module_data: RefCell<HashMap<ModuleId, HotData>>,
    current_parents: RefCell<Vec<ModuleId>>,
    current_child: RefCell<Option<ModuleId>>,
    handlers: RefCell<Vec<Rc<dyn HotUpdateHandler>>>,
}

impl HotCoordinator {
    pub fn new() -> Self {
        Self {
            status: Cell::new(HmrStatus::Idle),
            status_handlers: RefCell::new(Vec::new()),
            next_handler_id: Cell::new(0),
            pending_notifications: RefCell::new(Vec::new()),
            blocking: Cell::new(0),
            blocking_waiters: RefCell::new(Vec::new()),
            cycle: RefCell::new(None),
            queued_invalidations: RefCell::new(None),
            module_data: RefCell::new(HashMap::default()),
            current_parents: RefCell::new(Vec::new()),
            current_child: RefCell::new(None),
            handlers: RefCell::new(Vec::new()),
        }
    }

    pub fn status(&self) -> HmrStatus {
        self.status.get()
    }

    pub fn add_status_handler(&self, handler: StatusHandler) -> StatusHandlerId {
        let id = StatusHandlerId(self.next_handler_id.get());
        self.next_handler_id.set(id.0 + 1);
        self.status_handlers.borrow_mut().push((id, handler));
        id
    }

    pub fn remove_status_handler(&self, id: StatusHandlerId) -> bool {
        let mut handlers = self.status_handlers.borrow_mut();
        match handlers.iter().position(|(handler_id, _)| *handler_id == id) {
            Some(pos) => {
                handlers.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn add_handler(&self, handler: Rc<dyn HotUpdateHandler>) {
        self.handlers.borrow_mut().push(handler);
    }

    /// Switch status and call every handler; the handlers' futures are left pending
    pub(crate) fn notify(&self, status: HmrStatus) {
        debug!(from = %self.status.get(), to = %status, "hmr status");
        self.status.set(status);
        let handlers: Vec<StatusHandler> = self
            .status_handlers
            .borrow()
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect();
        let futures: Vec<StatusFuture> = handlers.iter().map(|handler| handler(status)).collect();
        self.pending_notifications.borrow_mut().extend(futures);
    }

    /// Switch status; the returned future settles once every handler has
    pub(crate) fn set_status(&self, status: HmrStatus) -> StatusFuture {
        self.notify(status);
        let pending: Vec<StatusFuture> = self.pending_notifications.borrow_mut().drain(..).collect();
        async move {
            join_all(pending).await;
        }
        .boxed_local()
    }

    /// Count `load` as blocking while the coordinator is `ready` or `prepare`
    pub(crate) fn track_blocking(&self, runtime: &Runtime, load: LocalBoxFuture<'static, Result<()>>) -> LocalBoxFuture<'static, Result<()>> {
        match self.status.get() {
            HmrStatus::Ready => self.notify(HmrStatus::Prepare),
            HmrStatus::Prepare => {}
            _ => return load,
        }
        self.blocking.set(self.blocking.get() + 1);
        let guard = BlockingGuard::new(runtime.downgrade());
        async move {
            let result = load.await;
            if let Some(runtime) = guard.disarm() {
                if let Some(hmr) = runtime.hmr() {
                    hmr.unblock().await;
                }
            }
            result
        }
        .boxed_local()
    }

    /// Drop one blocking slot; true when it was the last
    fn release_blocking(&self) -> bool {
        let remaining = self.blocking.get().saturating_sub(1);
        self.blocking.set(remaining);
        remaining == 0
    }

    fn wake_blocking_waiters(&self) {
        if self.blocking.get() > 0 {
            return;
        }
        let waiters = std::mem::take(&mut *self.blocking_waiters.borrow_mut());
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    async fn unblock(&self) {
        if !self.release_blocking() {
            return;
        }
        self.set_status(HmrStatus::Ready).await;
        self.wake_blocking_waiters();
    }

    /// Resolves once no tracked loads are in flight
    pub fn wait_for_blocking(&self) -> LocalBoxFuture<'static, ()> {
        if self.blocking.get() == 0 {
            return future::ready(()).boxed_local();
        }
        let (tx, rx) = oneshot::channel();
        self.blocking_waiters.borrow_mut().push(tx);
        async move {
            let _ = rx.await;
        }
        .boxed_local()
    }

    pub fn blocking_count(&self) -> usize {
        self.blocking.get()
    }

    pub fn has_pending_cycle(&self) -> bool {
        self.cycle.borrow().is_some()
    }

    pub(crate) fn with_cycle<R>(&self, f: impl FnOnce(&PendingCycle) -> R) -> Option<R> {
        self.cycle.borrow().as_ref().map(f)
    }

    pub(crate) fn with_cycle_mut<R>(&self, f: impl FnOnce(&mut PendingCycle) -> R) -> Option<R> {
        self.cycle.borrow_mut().as_mut().map(f)
    }

    fn take_cycle(&self) -> Option<PendingCycle> {
        self.cycle.borrow_mut().take()
    }

    pub(crate) fn module_data(&self, module_id: &ModuleId) -> Option<HotData> {
        self.module_data.borrow().get(module_id).cloned()
    }

    pub(crate) fn store_module_data(&self, module_id: ModuleId, data: HotData) {
        self.module_data.borrow_mut().insert(module_id, data);
    }

    pub(crate) fn set_current_parents(&self, parents: Vec<ModuleId>) {
        *self.current_parents.borrow_mut() = parents;
    }

    pub(crate) fn take_current_parents(&self) -> Vec<ModuleId> {
        std::mem::take(&mut *self.current_parents.borrow_mut())
    }

    pub(crate) fn current_child(&self) -> Option<ModuleId> {
        self.current_child.borrow().clone()
    }

    pub(crate) fn set_current_child(&self, child: Option<ModuleId>) {
        *self.current_child.borrow_mut() = child;
    }

    fn handlers(&self) -> Vec<Rc<dyn HotUpdateHandler>> {
        self.handlers.borrow().clone()
    }

    /// Fold queued invalidations into the pending cycle
    fn apply_invalidated_modules(&self, runtime: &Runtime) -> bool {
        let Some(queued) = self.queued_invalidations.borrow_mut().take() else {
            return false;
        };
        let handlers = self.handlers();
        let mut cycle = self.take_cycle().unwrap_or_default();
        for handler in &handlers {
            for module_id in &queued {
                handler.invalidate(runtime, module_id, &mut cycle);
            }
        }
        *self.cycle.borrow_mut() = Some(cycle);
        true
    }
}

impl Default for HotCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HotCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotCoordinator")
            .field("status", &self.status.get())
            .field("status_handlers", &self.status_handlers.borrow().len())
            .field("blocking", &self.blocking.get())
            .field("cycle", &*self.cycle.borrow())
            .field("queued_invalidations", &*self.queued_invalidations.borrow())
            .finish()
    }
}

fn coordinator(runtime: &Runtime) -> Result<&HotCoordinator> {
    runtime
        .hmr()
        .ok_or_else(|| Error::config("hot updates are disabled for this runtime"))
}

async fn fetch_manifest(runtime: &Runtime) -> Result<Option<UpdateManifest>> {
    let url = runtime.config().hot_update_manifest_url(None);
    debug!(%url, "fetching update manifest");
    let response = runtime.host().fetch(&url).await?;
    if response.status == 404 {
        return Ok(None);
    }
    if !response.ok() {
        return Err(Error::ManifestFetch {
            url,
            status: response.status,
        });
    }
    UpdateManifest::from_json_str(&response.body).map(Some)
}

/// Look for an update and prepare it
pub(crate) async fn check(runtime: Runtime, auto_apply: Option<ApplyOptions>) -> Result<Option<Vec<ModuleId>>> {
    let hmr = coordinator(&runtime)?;
    match hmr.status() {
        HmrStatus::Idle => {}
        HmrStatus::Abort | HmrStatus::Fail => hmr.set_status(HmrStatus::Idle).await,
        actual => {
            return Err(HmrError::InvalidStatus {
                operation: "check",
                expected: "idle",
                actual,
            }
            .into())
        }
    }

    hmr.set_status(HmrStatus::Check).await;
    let manifest = match fetch_manifest(&runtime).await {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(error = %err, "update check failed");
            hmr.take_cycle();
            hmr.set_status(HmrStatus::Abort).await;
            return Err(err);
        }
    };

    let Some(manifest) = manifest else {
        debug!("no update available");
        let status = if hmr.apply_invalidated_modules(&runtime) {
            HmrStatus::Ready
        } else {
            HmrStatus::Idle
        };
        hmr.set_status(status).await;
        return Ok(None);
    };

    hmr.set_status(HmrStatus::Prepare).await;
    let mut cycle = PendingCycle::new();
    let mut promises = Vec::new();
    for handler in hmr.handlers() {
        promises.extend(handler.consume_manifest(&runtime, &manifest, &mut cycle));
    }
    *hmr.cycle.borrow_mut() = Some(cycle);

    if let Err(err) = try_join_all(promises).await {
        warn!(error = %err, "loading hot update failed");
        hmr.take_cycle();
        hmr.set_status(HmrStatus::Abort).await;
        return Err(err);
    }
    hmr.wait_for_blocking().await;

    match auto_apply {
        Some(options) => internal_apply(&runtime, hmr, &options).await.map(Some),
        None => {
            let updated = hmr
                .with_cycle(|cycle| cycle.updated_modules().to_vec())
                .unwrap_or_default();
            hmr.set_status(HmrStatus::Ready).await;
            Ok(Some(updated))
        }
    }
}

/// Apply a prepared update
pub(crate) async fn apply(runtime: Runtime, options: ApplyOptions) -> Result<Vec<ModuleId>> {
    let hmr = coordinator(&runtime)?;
    let actual = hmr.status();
    if actual != HmrStatus::Ready {
        return Err(HmrError::InvalidStatus {
            operation: "apply",
            expected: "ready",
            actual,
        }
        .into());
    }
    internal_apply(&runtime, hmr, &options).await
}

fn internal_apply<'a>(
    runtime: &'a Runtime,
    hmr: &'a HotCoordinator,
    options: &'a ApplyOptions,
) -> LocalBoxFuture<'a, Result<Vec<ModuleId>>> {
    async move {
        hmr.apply_invalidated_modules(runtime);
        let cycle = hmr.take_cycle().unwrap_or_default();

        let mut plan = match UpdatePlan::build(runtime, cycle, options) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "update aborted");
                hmr.set_status(HmrStatus::Abort).await;
                return Err(err);
            }
        };

        let disposing = hmr.set_status(HmrStatus::Dispose);
        plan.dispose(runtime);

        let applying = hmr.set_status(HmrStatus::Apply);
        let mut reporter = ErrorReporter::default();
        let mut outdated = plan.apply(runtime, options, &mut reporter);
        future::join(disposing, applying).await;

        if let Some(err) = reporter.into_error() {
            warn!(error = %err, "update failed");
            hmr.set_status(HmrStatus::Fail).await;
            return Err(err);
        }

        if hmr.queued_invalidations.borrow().is_some() {
            let mut list = internal_apply(runtime, hmr, options).await?;
            for module_id in outdated.drain(..) {
                if !list.contains(&module_id) {
                    list.push(module_id);
                }
            }
            return Ok(list);
        }

        debug!(outdated = ?plan.outdated_modules(), "update applied");
        hmr.set_status(HmrStatus::Idle).await;
        Ok(outdated)
    }
    .boxed_local()
}

/// `module.hot.invalidate()`
pub(crate) fn invalidate(runtime: &Runtime, module_id: &ModuleId, state: &HotState) {
    state.mark_invalidated();
    let Some(hmr) = runtime.hmr() else {
        return;
    };
    match hmr.status() {
        HmrStatus::Idle | HmrStatus::Abort | HmrStatus::Fail => {
            let mut cycle = PendingCycle::new();
            for handler in hmr.handlers() {
                handler.invalidate(runtime, module_id, &mut cycle);
            }
            *hmr.cycle.borrow_mut() = Some(cycle);
            hmr.notify(HmrStatus::Ready);
        }
        HmrStatus::Ready => {
            let handlers = hmr.handlers();
            let mut cycle = hmr.take_cycle().unwrap_or_default();
            for handler in &handlers {
                handler.invalidate(runtime, module_id, &mut cycle);
            }
            *hmr.cycle.borrow_mut() = Some(cycle);
        }
        HmrStatus::Check | HmrStatus::Prepare | HmrStatus::Dispose | HmrStatus::Apply => {
            debug!(module = %module_id, status = %hmr.status(), "queueing invalidation");
            hmr.queued_invalidations
                .borrow_mut()
                .get_or_insert_with(Vec::new)
                .push(module_id.clone());
        }
    }
}

/// Gives back a blocking slot when a tracked load is dropped before settling.
///
/// Status handlers notified from here run with the next awaited transition.
struct BlockingGuard {
    runtime: Option<WeakRuntime>,
}

impl BlockingGuard {
    fn new(runtime: WeakRuntime) -> Self {
        Self { runtime: Some(runtime) }
    }

    /// The load settled; hand the slot to the awaiting `unblock`
    fn disarm(mut self) -> Option<Runtime> {
        self.runtime.take().and_then(|runtime| runtime.upgrade())
    }
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take().and_then(|runtime| runtime.upgrade()) else {
            return;
        };
        let Some(hmr) = runtime.hmr() else {
            return;
        };
        debug!(remaining = hmr.blocking_count().saturating_sub(1), "tracked chunk load dropped");
        if hmr.release_blocking() {
            hmr.notify(HmrStatus::Ready);
            hmr.wake_blocking_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_status_display() {
        assert_eq!(HmrStatus::Prepare.to_string(), "prepare");
        assert_eq!(HmrStatus::default(), HmrStatus::Idle);
        assert!(HmrStatus::Dispose.is_in_flight());
        assert!(!HmrStatus::Ready.is_in_flight());
    }

    #[test]
    fn test_status_handlers_called_in_order() {
        let hmr = HotCoordinator::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for name in ["first", "second"] {
            let seen = Rc::clone(&seen);
            hmr.add_status_handler(Rc::new(move |status| {
                seen.borrow_mut().push(format!("{}:{}", name, status));
                future::ready(()).boxed_local()
            }));
        }

        futures::executor::block_on(hmr.set_status(HmrStatus::Check));
        assert_eq!(*seen.borrow(), vec!["first:check", "second:check"]);
    }

    #[test]
    fn test_removed_status_handler_is_not_called() {
        let hmr = HotCoordinator::new();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let id = hmr.add_status_handler(Rc::new(move |_| {
            counter.set(counter.get() + 1);
            future::ready(()).boxed_local()
        }));

        assert!(hmr.remove_status_handler(id));
        assert!(!hmr.remove_status_handler(id));
        futures::executor::block_on(hmr.set_status(HmrStatus::Check));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_set_status_waits_for_earlier_notifications() {
        let hmr = HotCoordinator::new();
        let (tx, rx) = oneshot::channel::<()>();
        let rx = RefCell::new(Some(rx));
        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        hmr.add_status_handler(Rc::new(move |status| {
            let rx = rx.borrow_mut().take();
            let flag = Rc::clone(&flag);
            async move {
                if status == HmrStatus::Ready {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                        flag.set(true);
                    }
                }
            }
            .boxed_local()
        }));

        hmr.notify(HmrStatus::Ready);
        tx.send(()).unwrap();
        futures::executor::block_on(hmr.set_status(HmrStatus::Idle));
        assert!(done.get());
    }

    #[test]
    fn test_wait_for_blocking_without_loads() {
        let hmr = HotCoordinator::new();
        assert_eq!(hmr.blocking_count(), 0);
        futures::executor::block_on(hmr.wait_for_blocking());
    }
}
