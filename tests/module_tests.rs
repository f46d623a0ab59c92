//! Module registry integration tests
//!
//! Instantiation, caching and cycles through the public runtime API.

mod common;

use common::*;
use hotchunk::{Error, Exports, ModuleId, RuntimeConfig};
use pretty_assertions::assert_eq;
use serde_json::Value;

mod caching {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_factory_runs_once_per_runtime() {
        let (runtime, _host) = setup();
        let log = Log::new();
        runtime.define("a", logging_module(&log, "a", &[]));

        let first = runtime.require("a").unwrap();
        let second = runtime.require("a").unwrap();

        assert_eq!(log.count("exec a"), 1);
        assert!(Exports::ptr_eq(&first, &second));
    }

    #[test]
    fn test_runtimes_are_independent() {
        let (first, _) = setup();
        let (second, _) = setup();
        let log = Log::new();
        first.define("a", logging_module(&log, "a", &[]));

        first.require("a").unwrap();
        assert!(matches!(second.require("a"), Err(Error::ModuleNotFound(_))));
        assert_eq!(log.count("exec a"), 1);
    }

    #[test]
    fn test_failed_factory_keeps_throwing() {
        let (runtime, _host) = setup();
        let log = Log::new();
        let counter = log.clone();
        runtime.define("broken", factory(move |_, _, _| {
            counter.push("exec broken");
            Err(Error::thrown("boom"))
        }));

        let first = runtime.require("broken").unwrap_err();
        let second = runtime.require("broken").unwrap_err();
        assert_eq!(first.to_string(), "Error: boom");
        assert_eq!(second.to_string(), "Error: boom");
        assert_eq!(log.count("exec broken"), 1);
        assert!(!runtime.modules().cached("broken").unwrap().is_loaded());
    }
}

mod cycles {
    use super::*;
    use pretty_assertions::assert_eq;

    fn define_cycle(runtime: &hotchunk::Runtime, seen: &Slot<Exports>) {
        runtime.define("a", factory(|_, exports, require| {
            exports.set("early", 1);
            require.call("b")?;
            exports.set("late", 2);
            Ok(())
        }));
        let seen = seen.clone();
        runtime.define("b", factory(move |_, exports, require| {
            let a = require.call("a")?;
            exports.set("saw_early", a.contains("early"));
            exports.set("saw_late", a.contains("late"));
            *seen.borrow_mut() = Some(a);
            Ok(())
        }));
    }

    #[test]
    fn test_cycle_sees_partial_exports() {
        let (runtime, _host) = setup();
        let seen = slot();
        define_cycle(&runtime, &seen);

        let a = runtime.require("a").unwrap();
        let b = runtime.require("b").unwrap();

        assert_eq!(b.get("saw_early"), Some(Value::Bool(true)));
        assert_eq!(b.get("saw_late"), Some(Value::Bool(false)));
        let partial = seen.borrow().clone().unwrap();
        assert!(Exports::ptr_eq(&partial, &a));
        assert_eq!(a.get("late"), Some(Value::from(2)));
    }

    #[test]
    fn test_cycle_without_hot_updates() {
        let (runtime, _host) = setup_with(RuntimeConfig::default().with_hot(false));
        let seen = slot();
        define_cycle(&runtime, &seen);

        let a = runtime.require("a").unwrap();
        assert!(Exports::ptr_eq(&seen.borrow().clone().unwrap(), &a));
    }
}

mod graph {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parent_and_child_edges() {
        let (runtime, _host) = setup();
        let log = Log::new();
        runtime.define("entry", logging_module(&log, "entry", &["a", "b"]));
        runtime.define("a", logging_module(&log, "a", &["b"]));
        runtime.define("b", logging_module(&log, "b", &[]));

        runtime.require("entry").unwrap();

        let modules = runtime.modules();
        let entry = modules.cached("entry").unwrap();
        let b = modules.cached("b").unwrap();
        assert_eq!(entry.parents(), Vec::<ModuleId>::new());
        assert_eq!(entry.children(), vec![ModuleId::from("a"), ModuleId::from("b")]);
        assert_eq!(b.parents(), vec![ModuleId::from("a"), ModuleId::from("entry")]);
        assert_eq!(log.entries(), vec!["exec entry", "exec a", "exec b"]);
    }

    #[test]
    fn test_module_handle_reports_its_edges() {
        let (runtime, _host) = setup();
        let parents = slot();
        let captured = parents.clone();
        runtime.define("entry", factory(|_, _, require| {
            require.call("leaf")?;
            Ok(())
        }));
        runtime.define("leaf", factory(move |module, _, _| {
            *captured.borrow_mut() = Some(module.parents());
            assert!(module.hot().is_some());
            Ok(())
        }));

        runtime.require("entry").unwrap();
        assert_eq!(parents.borrow().clone().unwrap(), vec![ModuleId::from("entry")]);
    }

    #[test]
    fn test_missing_dependency_propagates() {
        let (runtime, _host) = setup();
        runtime.define("entry", factory(|_, _, require| {
            require.call("ghost")?;
            Ok(())
        }));

        let err = runtime.require("entry").unwrap_err();
        assert_eq!(err.to_string(), "Cannot find module 'ghost'");
        assert!(runtime.modules().cached("ghost").is_none());
    }
}
