//! Hotchunk: the module-loading and hot-update runtime of a bundled application
//!
//! A bundler splits an application into chunks of module factories. Hotchunk
//! is the piece that runs on the other side: it instantiates modules on
//! demand and caches their exports, loads further chunks lazily, and drives
//! the hot module replacement protocol that swaps running modules after a
//! rebuild without a full reload.
//!
//! # Quick Start
//!
//! ```no_run
//! use hotchunk::{MemoryHost, Runtime, RuntimeConfig};
//! use std::rc::Rc;
//!
//! fn main() -> hotchunk::Result<()> {
//!     let runtime = Runtime::new(RuntimeConfig::default(), Rc::new(MemoryHost::new()));
//!     runtime.define("answer", Rc::new(|_module, exports, _require| {
//!         exports.set("value", 42);
//!         Ok(())
//!     }));
//!     let exports = runtime.require("answer")?;
//!     println!("{:?}", exports.get("value"));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Requests flow: [`Runtime::ensure_chunk`] → [`chunks::loader`] → [`chunks::injector`] →
//! [`host`] → [`Runtime::register`] → [`modules`]
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`runtime`], [`modules`], [`error`](Error), [`config`] |
//! | **Loading** | [`chunks`], [`host`] |
//! | **Hot updates** | [`hmr`] |
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

pub mod chunks;
pub mod config;
pub mod hmr;
pub mod host;
pub mod modules;
pub mod prelude;
pub mod runtime;

mod error;

pub use chunks::{ChunkId, ChunkStatus};
pub use config::{HashKind, RuntimeConfig};
pub use error::{ChunkLoadError, Error, HmrError, LoadFailure, ResourceKind, Result};
pub use hmr::{ApplyOptions, HmrStatus, Hot, HotData, UpdateEffect, UpdateManifest};
pub use host::{Element, ElementKind, FetchResponse, Host, HostEvent, MemoryHost, Resource};
pub use modules::{Exports, Module, ModuleFactory, ModuleId, Require, RuntimeCallback};
pub use runtime::{Runtime, WeakRuntime};

/// Hotchunk version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
