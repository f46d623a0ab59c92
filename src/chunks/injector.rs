//! Script/link injector
//!
//! Loads a resource into the host at most once at a time per URL. Concurrent
//! requests for the same URL share one in-flight load; the entry is dropped
//! when the load settles so a later request issues a fresh one.

use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::fmt;

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use tracing::{debug, trace};

use crate::error::LoadFailure;
use crate::host::{Element, ElementKind, HostEvent};
use crate::runtime::Runtime;

/// Settled state of one injected resource
pub type LoadOutcome = Result<(), LoadFailure>;

pub(crate) type SharedOutcome = Shared<LocalBoxFuture<'static, LoadOutcome>>;

#[derive(Default)]
pub struct Injector {
    in_progress: RefCell<HashMap<String, SharedOutcome>>,
}

impl Injector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loads currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_progress.borrow().len()
    }

    pub fn is_loading(&self, url: &str) -> bool {
        self.in_progress.borrow().contains_key(url)
    }

    /// Attach `element` and resolve once the host reports on it.
    ///
    /// A load that stays silent past the configured timeout fails with
    /// [`LoadFailure::Timeout`]. Scripts are detached once settled; stylesheet
    /// links only when they failed, so an applied stylesheet stays applied.
    pub(crate) fn load(&self, runtime: &Runtime, element: Element) -> SharedOutcome {
        if let Some(pending) = self.in_progress.borrow().get(&element.url) {
            trace!(url = %element.url, "joining in-flight load");
            return pending.clone();
        }

        debug!(url = %element.url, kind = ?element.kind, "injecting element");
        let host = runtime.host();
        let event = host.append(&element, runtime);
        let timeout = runtime.config().chunk_load_timeout();
        let weak = runtime.downgrade();
        let url = element.url.clone();

        let load = async move {
            let outcome = match tokio::time::timeout(timeout, event).await {
                Ok(HostEvent::Load) => Ok(()),
                Ok(HostEvent::Error(kind)) => Err(LoadFailure::Host(kind)),
                Err(_) => Err(LoadFailure::Timeout),
            };
            if element.kind == ElementKind::Script || outcome.is_err() {
                host.remove(&element);
            }
            if let Some(runtime) = weak.upgrade() {
                runtime.injector().finish(&element.url);
            }
            debug!(url = %element.url, ?outcome, "load settled");
            outcome
        }
        .boxed_local()
        .shared();

        self.in_progress.borrow_mut().insert(url, load.clone());
        load
    }

    fn finish(&self, url: &str) {
        self.in_progress.borrow_mut().remove(url);
    }
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("in_progress", &self.in_progress.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}
