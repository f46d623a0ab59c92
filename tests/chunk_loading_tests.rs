//! Chunk loading integration tests
//!
//! Script and stylesheet chunks loaded through the in-memory host.

mod common;

use common::*;
use futures::future::{FutureExt, LocalBoxFuture};
use hotchunk::{
    ChunkStatus, Element, ElementKind, FetchResponse, HashKind, Host, HostEvent, LoadFailure, MemoryHost, Resource,
    ResourceKind, Runtime, RuntimeConfig,
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::rc::Rc;
use std::time::Duration;

const LAZY_URL: &str = "/static/js/lazy.chunk.js";

/// Host that reports `load` one tick after a script has run, like a browser
/// firing the event after the chunk registered itself
#[derive(Default)]
struct DeferredLoadHost(MemoryHost);

impl Host for DeferredLoadHost {
    fn append(&self, element: &Element, runtime: &Runtime) -> LocalBoxFuture<'static, HostEvent> {
        let event = self.0.append(element, runtime);
        async move {
            let event = event.await;
            tokio::task::yield_now().await;
            event
        }
        .boxed_local()
    }

    fn remove(&self, element: &Element) {
        self.0.remove(element);
    }

    fn find_stylesheet(&self, href: &str, full_href: &str) -> bool {
        self.0.find_stylesheet(href, full_href)
    }

    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, hotchunk::Result<FetchResponse>> {
        self.0.fetch(url)
    }
}

mod scripts {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_ensure_loads_and_registers() {
        let (runtime, host) = setup();
        serve_chunk(&host, LAZY_URL, "lazy", vec![("lazy-mod", factory(|_, exports, _| {
            exports.set("ready", true);
            Ok(())
        }))]);

        runtime.ensure_chunk("lazy").await.unwrap();

        assert_eq!(runtime.chunk_status("lazy"), ChunkStatus::Installed);
        let exports = runtime.require("lazy-mod").unwrap();
        assert_eq!(exports.get("ready"), Some(Value::Bool(true)));
        // scripts are detached once they ran
        assert!(host.attached().is_empty());
    }

    #[tokio::test]
    async fn test_script_detached_when_chunk_registers_before_load_event() {
        let host = Rc::new(DeferredLoadHost::default());
        let runtime = Runtime::new(RuntimeConfig::default(), host.clone());
        serve_chunk(&host.0, LAZY_URL, "lazy", vec![("lazy-mod", factory(|_, _, _| Ok(())))]);

        runtime.ensure_chunk("lazy").await.unwrap();

        assert_eq!(runtime.chunk_status("lazy"), ChunkStatus::Installed);
        assert!(host.0.attached().is_empty());
        assert_eq!(runtime.injector().in_flight(), 0);

        runtime.ensure_chunk("lazy").await.unwrap();
        assert_eq!(host.0.request_count(LAZY_URL), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensures_share_one_request() {
        let (runtime, host) = setup();
        serve_chunk(&host, LAZY_URL, "lazy", vec![("lazy-mod", factory(|_, _, _| Ok(())))]);

        let first = runtime.ensure_chunk("lazy");
        let second = runtime.ensure_chunk("lazy");
        assert_eq!(runtime.chunk_status("lazy"), ChunkStatus::Loading);
        let (first, second) = futures::join!(first, second);

        first.unwrap();
        second.unwrap();
        assert_eq!(host.request_count(LAZY_URL), 1);
    }

    #[tokio::test]
    async fn test_installed_chunk_is_not_requested() {
        let (runtime, host) = setup();
        runtime.register(["lazy"], Vec::new(), None).unwrap();

        runtime.ensure_chunk("lazy").await.unwrap();
        assert_eq!(host.request_count(LAZY_URL), 0);
    }

    #[tokio::test]
    async fn test_chunk_without_payload_is_missing() {
        let (runtime, host) = setup();
        host.serve(LAZY_URL, Resource::Empty);

        let err = runtime.ensure_chunk("lazy").await.unwrap_err();
        let err = err.as_chunk_load().unwrap();

        assert_eq!(err.kind, ResourceKind::Script);
        assert_eq!(err.failure, LoadFailure::Missing);
        assert_eq!(err.request, LAZY_URL);
        assert_eq!(err.to_string(), "Loading chunk lazy failed.\n(missing: /static/js/lazy.chunk.js)");
        assert_eq!(runtime.chunk_status("lazy"), ChunkStatus::Unregistered);
    }

    #[tokio::test]
    async fn test_host_error_then_retry() {
        let (runtime, host) = setup();

        let err = runtime.ensure_chunk("lazy").await.unwrap_err();
        assert_eq!(err.as_chunk_load().unwrap().failure, LoadFailure::Host("error".to_string()));
        assert_eq!(runtime.chunk_status("lazy"), ChunkStatus::Unregistered);

        serve_chunk(&host, LAZY_URL, "lazy", Vec::new());
        runtime.ensure_chunk("lazy").await.unwrap();
        assert_eq!(host.request_count(LAZY_URL), 2);
        assert_eq!(runtime.chunk_status("lazy"), ChunkStatus::Installed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_retry() {
        let config = RuntimeConfig::default().with_chunk_load_timeout(Duration::from_secs(5));
        let (runtime, host) = setup_with(config);
        host.serve(LAZY_URL, Resource::Stalled);

        let err = runtime.ensure_chunk("lazy").await.unwrap_err();
        assert!(err.as_chunk_load().unwrap().is_timeout());
        assert_eq!(runtime.chunk_status("lazy"), ChunkStatus::Unregistered);
        assert!(host.attached().is_empty());

        serve_chunk(&host, LAZY_URL, "lazy", Vec::new());
        runtime.ensure_chunk("lazy").await.unwrap();
        assert_eq!(host.request_count(LAZY_URL), 2);
    }

    #[tokio::test]
    async fn test_hashed_chunk_url() {
        let config = RuntimeConfig::default()
            .with_public_path("/assets/")
            .with_chunk_hash("lazy", HashKind::Js, "3f2a");
        let (runtime, host) = setup_with(config);
        serve_chunk(&host, "/assets/static/js/lazy.3f2a.chunk.js", "lazy", Vec::new());

        runtime.ensure_chunk("lazy").await.unwrap();
        assert_eq!(host.request_count("/assets/static/js/lazy.3f2a.chunk.js"), 1);
    }

    #[tokio::test]
    async fn test_module_ensures_chunk_through_require() {
        let (runtime, host) = setup();
        serve_chunk(&host, LAZY_URL, "lazy", vec![("lazy-mod", factory(|_, exports, _| {
            exports.set("value", 7);
            Ok(())
        }))]);
        let captured = slot();
        let stash = captured.clone();
        runtime.define("entry", factory(move |_, _, require| {
            *stash.borrow_mut() = Some(require.clone());
            Ok(())
        }));
        runtime.require("entry").unwrap();

        let require = captured.borrow().clone().unwrap();
        require.ensure_chunk("lazy").await.unwrap();
        let lazy = require.call("lazy-mod").unwrap();
        assert_eq!(lazy.get("value"), Some(Value::from(7)));
        assert_eq!(
            runtime.modules().cached("lazy-mod").unwrap().parents(),
            vec![hotchunk::ModuleId::from("entry")]
        );
    }
}

mod stylesheets {
    use super::*;
    use pretty_assertions::assert_eq;

    const CSS_URL: &str = "/static/css/styles.abc.chunk.css";

    fn styled_runtime() -> (hotchunk::Runtime, std::rc::Rc<hotchunk::MemoryHost>) {
        let config = RuntimeConfig::default().with_chunk_hash("styles", HashKind::Css, "abc");
        let (runtime, host) = setup_with(config);
        serve_chunk(&host, "/static/js/styles.chunk.js", "styles", Vec::new());
        (runtime, host)
    }

    #[tokio::test]
    async fn test_script_and_stylesheet_load_together() {
        let (runtime, host) = styled_runtime();
        host.serve(CSS_URL, Resource::Stylesheet);

        runtime.ensure_chunk("styles").await.unwrap();

        assert_eq!(host.request_count(CSS_URL), 1);
        assert_eq!(host.request_count("/static/js/styles.chunk.js"), 1);
        let attached = host.attached();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].kind, ElementKind::Link);
        assert_eq!(attached[0].url, CSS_URL);

        runtime.ensure_chunk("styles").await.unwrap();
        assert_eq!(host.request_count(CSS_URL), 1);
    }

    #[tokio::test]
    async fn test_existing_stylesheet_is_reused() {
        let (runtime, host) = styled_runtime();
        host.add_stylesheet("static/css/styles.abc.chunk.css");

        runtime.ensure_chunk("styles").await.unwrap();
        assert_eq!(host.request_count(CSS_URL), 0);
    }

    #[tokio::test]
    async fn test_stylesheet_failure_then_retry() {
        let (runtime, host) = styled_runtime();
        host.serve(CSS_URL, Resource::Broken("error".to_string()));

        let err = runtime.ensure_chunk("styles").await.unwrap_err();
        let err = err.as_chunk_load().unwrap();
        assert_eq!(err.kind, ResourceKind::Stylesheet);
        assert_eq!(err.request, CSS_URL);
        assert!(host.attached().is_empty());

        host.serve(CSS_URL, Resource::Stylesheet);
        runtime.ensure_chunk("styles").await.unwrap();
        assert_eq!(host.request_count(CSS_URL), 2);
    }

    #[tokio::test]
    async fn test_chunk_without_css_hash_skips_stylesheet() {
        let (runtime, host) = setup();
        serve_chunk(&host, LAZY_URL, "lazy", Vec::new());

        runtime.ensure_chunk("lazy").await.unwrap();
        assert_eq!(host.request_count("/static/css/lazy.chunk.css"), 0);
    }
}
