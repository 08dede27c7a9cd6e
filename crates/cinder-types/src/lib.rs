//! Foundation types for cinder.
//!
//! This crate holds the small, dependency-light types shared by the engine
//! manager and its hosts:
//!
//! - [`EngineId`] - identity of one interpreter instance
//! - [`CacheKey`] - identity grouping invocations that may share an instance
//! - [`EnginePolicy`] - how an invocation obtains its instance
//! - [`CommandInfo`] - identity metadata of the command being run
//!
//! # Example
//!
//! ```
//! use cinder_types::{CacheKey, CommandInfo, EnginePolicy};
//!
//! let info = CommandInfo::new("Count Walls", "/ext/tools.extension/Walls.pushbutton/script.lua")
//!     .with_extension("tools");
//! assert_eq!(info.cache_key(), CacheKey::new("tools"));
//!
//! let policy = EnginePolicy::from_flags(false, true, true);
//! assert_eq!(policy, EnginePolicy::Clean);
//! ```

mod command;
mod error;
mod id;
mod policy;

pub use command::CommandInfo;
pub use error::ParsePolicyError;
pub use id::{CacheKey, EngineId};
pub use policy::EnginePolicy;
