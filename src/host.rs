//! Host environment boundary
//!
//! The runtime never touches a document directly. Injecting scripts and
//! stylesheets, looking up stylesheets a previous page load applied and
//! fetching the update manifest all go through [`Host`].
//!
//! [`MemoryHost`] is a headless document: resources are registered up front
//! and "loading" one runs its closure against the runtime, the same way a
//! real chunk script self-registers when the browser executes it.

use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use futures::future::{self, FutureExt, LocalBoxFuture};
use tracing::trace;

use crate::error::Result;
use crate::runtime::Runtime;

/// Kind of element injected into the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Script,
    Link,
}

/// A `<script>` or `<link>` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub kind: ElementKind,
    pub url: String,
    pub attributes: Vec<(String, String)>,
}

impl Element {
    pub fn script(url: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Script,
            url: url.into(),
            attributes: vec![("charset".to_string(), "utf-8".to_string())],
        }
    }

    pub fn link(url: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Link,
            url: url.into(),
            attributes: vec![
                ("rel".to_string(), "stylesheet".to_string()),
                ("type".to_string(), "text/css".to_string()),
            ],
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Outcome reported by the host for an injected element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Load,
    /// Error event carrying the host's event type, e.g. `"error"`
    Error(String),
}

/// Response to a manifest fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(404, "")
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// DOM-like primitives the runtime needs from its environment
///
/// Futures returned by [`Host::append`] are raced against a tokio timer, so
/// chunk loads only make progress on a tokio runtime.
pub trait Host {
    /// Attach an element; the future resolves with its load or error event
    fn append(&self, element: &Element, runtime: &Runtime) -> LocalBoxFuture<'static, HostEvent>;

    /// Detach a previously appended element
    fn remove(&self, element: &Element);

    /// Whether a stylesheet with this href is already applied
    fn find_stylesheet(&self, href: &str, full_href: &str) -> bool;

    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<FetchResponse>>;
}

/// Behavior of a URL served by [`MemoryHost`]
#[derive(Clone)]
pub enum Resource {
    /// Runs the closure, then fires `load`
    Script(Rc<dyn Fn(&Runtime)>),
    Stylesheet,
    /// Fires `load` without doing anything
    Empty,
    /// Fires an error event of the given type
    Broken(String),
    /// Never fires any event
    Stalled,
}

impl Resource {
    pub fn script<F>(run: F) -> Self
    where
        F: Fn(&Runtime) + 'static,
    {
        Resource::Script(Rc::new(run))
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Script(_) => f.write_str("Script"),
            Resource::Stylesheet => f.write_str("Stylesheet"),
            Resource::Empty => f.write_str("Empty"),
            Resource::Broken(kind) => f.debug_tuple("Broken").field(kind).finish(),
            Resource::Stalled => f.write_str("Stalled"),
        }
    }
}

/// In-memory host environment
#[derive(Default)]
pub struct MemoryHost {
    resources: RefCell<HashMap<String, Resource>>,
    stylesheets: RefCell<Vec<String>>,
    responses: RefCell<HashMap<String, FetchResponse>>,
    attached: RefCell<Vec<Element>>,
    requests: RefCell<HashMap<String, usize>>,
    fetches: RefCell<HashMap<String, usize>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: impl Into<String>, resource: Resource) {
        self.resources.borrow_mut().insert(url.into(), resource);
    }

    pub fn serve_script<F>(&self, url: impl Into<String>, run: F)
    where
        F: Fn(&Runtime) + 'static,
    {
        self.serve(url, Resource::script(run));
    }

    /// Stop serving a URL; later loads fire an error event
    pub fn unserve(&self, url: &str) {
        self.resources.borrow_mut().remove(url);
    }

    /// Mark a stylesheet as present before the runtime starts
    pub fn add_stylesheet(&self, href: impl Into<String>) {
        self.stylesheets.borrow_mut().push(href.into());
    }

    pub fn respond(&self, url: impl Into<String>, response: FetchResponse) {
        self.responses.borrow_mut().insert(url.into(), response);
    }

    pub fn respond_json(&self, url: impl Into<String>, body: impl Into<String>) {
        self.respond(url, FetchResponse::new(200, body));
    }

    pub fn clear_response(&self, url: &str) {
        self.responses.borrow_mut().remove(url);
    }

    /// Elements currently attached to the document
    pub fn attached(&self) -> Vec<Element> {
        self.attached.borrow().clone()
    }

    /// Number of times an element for this URL was appended
    pub fn request_count(&self, url: &str) -> usize {
        self.requests.borrow().get(url).copied().unwrap_or(0)
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches.borrow().get(url).copied().unwrap_or(0)
    }
}

impl Host for MemoryHost {
    fn append(&self, element: &Element, runtime: &Runtime) -> LocalBoxFuture<'static, HostEvent> {
        *self.requests.borrow_mut().entry(element.url.clone()).or_insert(0) += 1;
        self.attached.borrow_mut().push(element.clone());
        trace!(url = %element.url, "element appended");

        let resource = self.resources.borrow().get(&element.url).cloned();
        let weak = runtime.downgrade();
        async move {
            match resource {
                Some(Resource::Script(run)) => {
                    if let Some(runtime) = weak.upgrade() {
                        run(&runtime);
                    }
                    HostEvent::Load
                }
                Some(Resource::Stylesheet) | Some(Resource::Empty) => HostEvent::Load,
                Some(Resource::Broken(kind)) => HostEvent::Error(kind),
                Some(Resource::Stalled) => future::pending().await,
                None => HostEvent::Error("error".to_string()),
            }
        }
        .boxed_local()
    }

    fn remove(&self, element: &Element) {
        let mut attached = self.attached.borrow_mut();
        if let Some(pos) = attached.iter().position(|e| e == element) {
            attached.remove(pos);
        }
    }

    fn find_stylesheet(&self, href: &str, full_href: &str) -> bool {
        let matches = |candidate: &str| candidate == href || candidate == full_href;
        self.stylesheets.borrow().iter().any(|s| matches(s))
            || self
                .attached
                .borrow()
                .iter()
                .any(|e| e.kind == ElementKind::Link && matches(&e.url))
    }

    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<FetchResponse>> {
        *self.fetches.borrow_mut().entry(url.to_string()).or_insert(0) += 1;
        let response = self
            .responses
            .borrow()
            .get(url)
            .cloned()
            .unwrap_or_else(FetchResponse::not_found);
        future::ready(Ok(response)).boxed_local()
    }
}

impl fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHost")
            .field("resources", &self.resources.borrow().len())
            .field("attached", &*self.attached.borrow())
            .finish()
    }
}
