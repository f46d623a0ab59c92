//! Prelude module for convenient imports
//!
//! ```no_run
//! use hotchunk::prelude::*;
//! use std::rc::Rc;
//!
//! fn main() -> Result<()> {
//!     let runtime = Runtime::new(RuntimeConfig::default(), Rc::new(MemoryHost::new()));
//!     runtime.define("a", Rc::new(|_, _, _| Ok(())));
//!     runtime.require("a")?;
//!     Ok(())
//! }
//! ```

// Runtime context
pub use crate::config::{HashKind, RuntimeConfig};
pub use crate::runtime::Runtime;

// Error handling
pub use crate::error::{ChunkLoadError, Error, HmrError, LoadFailure, Result};

// Modules and chunks
pub use crate::chunks::{ChunkId, ChunkStatus};
pub use crate::modules::{Exports, Module, ModuleFactory, ModuleId, Require, RuntimeCallback};

// Hot updates
pub use crate::hmr::{AcceptErrorContext, ApplyErrorEvent, ApplyOptions, HmrStatus, Hot, HotData, UpdateEffect};

// Host environment
pub use crate::host::{Host, MemoryHost, Resource};
