//! Lifecycle, caching and binding injection for embedded Lua engines.
//!
//! A host that runs many short scripts (one per user command) faces a
//! trade-off: creating an interpreter per run is slow, reusing one leaks
//! state between runs. This crate decides per invocation which engine runs
//! a command, prepares it, and tears the preparation down afterwards.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      EngineManager                       │
//! │  acquire(ctx) ─► Invocation ─► release()                 │
//! └───────┬──────────────┬─────────────────┬─────────────────┘
//!         │              │                 │
//!         ▼              ▼                 ▼
//!  ┌─────────────┐ ┌───────────────┐ ┌──────────────────┐
//!  │ EngineCache │ │ EngineFactory │ │ StreamRedirector │
//!  │ key ► engine│ │ (LuaEngine-   │ │ BindingInjector  │
//!  └─────────────┘ │  Factory)     │ └──────────────────┘
//!                  └───────┬───────┘
//!                          ▼
//!                   ScriptEngine (mlua, Lua 5.4)
//! ```
//!
//! - [`EngineManager`] - policy-driven engine selection, acquire/release
//! - [`EngineCache`] - one engine per [`CacheKey`](cinder_types::CacheKey)
//! - [`ScriptEngine`] - one Lua state with swappable output and search paths
//! - [`BindingInjector`] - per-invocation globals (`__host__`, `__result__`, ...)
//! - [`StreamRedirector`] - output redirection with restore guards
//! - [`config`] - layered configuration
//!
//! # Example
//!
//! ```
//! use cinder_engine::{CaptureBuffer, EngineManager, ExecutionContext, OutputStream};
//! use cinder_types::{CommandInfo, EnginePolicy};
//!
//! let manager = EngineManager::new();
//! let buffer = CaptureBuffer::new();
//! let command = CommandInfo::new("Count", "count.lua").with_extension("tools");
//!
//! for _ in 0..2 {
//!     let ctx = ExecutionContext::builder(command.clone())
//!         .policy(EnginePolicy::Reuse)
//!         .output(OutputStream::capture(&buffer))
//!         .build();
//!     let invocation = manager.acquire(ctx).expect("acquire");
//!     invocation
//!         .exec("runs = (runs or 0) + 1 print(runs, __cachedengine__)", "count")
//!         .expect("exec");
//!     invocation.release().expect("release");
//! }
//!
//! assert_eq!(buffer.contents(), "1\tfalse\n2\ttrue\n");
//! ```

mod bindings;
mod cache;
pub mod config;
mod context;
mod engine;
mod error;
mod factory;
mod manager;
mod output;
mod stream;

pub use bindings::{Binding, BindingGuard, BindingInjector, ContextHandle};
pub use cache::EngineCache;
pub use context::{ActiveDocument, ExecutionContext, ExecutionContextBuilder, ResultsContainer};
pub use engine::{EngineHandle, EngineOptions, FrameMode, ScriptEngine};
pub use error::EngineError;
pub use factory::{EngineFactory, EngineInitializer, LuaEngineFactory};
pub use manager::{EngineManager, EngineManagerBuilder, Invocation, ManagerHandle};
pub use output::{CaptureBuffer, OutputStream};
pub use stream::{StreamGuard, StreamRedirector};
