//! Engine lifecycle controller.
//!
//! [`EngineManager::acquire`] turns an [`ExecutionContext`] into a ready
//! [`Invocation`]; [`Invocation::release`] tears it down again.
//!
//! # Architecture
//!
//! ```text
//! acquire(ctx)
//!   │
//!   ├─ select engine ── FullIsolation ─► factory (full frames), uncached
//!   │                ├─ Clean ─────────► factory, uncached
//!   │                ├─ Refresh ───────► factory, replaces cache entry
//!   │                └─ Reuse ─────────► cache hit, or factory + insert
//!   │
//!   ├─ StreamRedirector::attach(ctx.output)      ─► StreamGuard
//!   ├─ BindingInjector::inject(ctx, cached, ..)  ─► BindingGuard
//!   └─ engine.set_search_paths(ctx paths + defaults)
//!
//! release(invocation)
//!   ├─ BindingInjector::clear(BindingGuard)
//!   ├─ StreamRedirector::detach(StreamGuard)
//!   └─ collect garbage (full-frame engines)
//! ```
//!
//! A failure after the stream was attached rolls back what was already set
//! up before the error is returned. Dropping an unreleased [`Invocation`]
//! releases it.
//!
//! # Example
//!
//! ```
//! use cinder_engine::{CaptureBuffer, EngineManager, ExecutionContext, OutputStream};
//! use cinder_types::CommandInfo;
//!
//! let manager = EngineManager::new();
//! let buffer = CaptureBuffer::new();
//! let ctx = ExecutionContext::builder(CommandInfo::new("Hello", "hello.lua").with_extension("demo"))
//!     .output(OutputStream::capture(&buffer))
//!     .build();
//!
//! let invocation = manager.acquire(ctx).expect("acquire");
//! invocation.exec("print('hello from ' .. __commandname__)", "hello").expect("exec");
//! invocation.release().expect("release");
//!
//! assert_eq!(buffer.contents(), "hello from Hello\n");
//! ```

use crate::bindings::{BindingGuard, BindingInjector};
use crate::cache::EngineCache;
use crate::config::CinderConfig;
use crate::context::ExecutionContext;
use crate::engine::{EngineHandle, EngineOptions};
use crate::error::EngineError;
use crate::factory::{EngineFactory, LuaEngineFactory};
use crate::stream::{StreamGuard, StreamRedirector};
use cinder_types::{CacheKey, EnginePolicy};
use mlua::{UserData, UserDataMethods};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

// =============================================================================
// Manager
// =============================================================================

struct ManagerInner {
    cache: Arc<EngineCache>,
    factory: Arc<dyn EngineFactory>,
    default_search_paths: Vec<PathBuf>,
}

/// Decides, per invocation, which engine runs it and prepares that engine.
///
/// Cheap to clone; clones share the cache and factory.
#[derive(Clone)]
pub struct EngineManager {
    inner: Arc<ManagerInner>,
}

impl EngineManager {
    /// Creates a manager with a fresh cache and the default Lua factory.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a manager.
    #[must_use]
    pub fn builder() -> EngineManagerBuilder {
        EngineManagerBuilder::default()
    }

    /// Creates a manager configured from [`CinderConfig`].
    #[must_use]
    pub fn from_config(config: &CinderConfig) -> Self {
        let factory = LuaEngineFactory::new()
            .with_memory_limit(config.engine.memory_limit_bytes())
            .with_collect_on_release(config.engine.collect_on_release);
        Self::builder()
            .with_factory(factory)
            .with_default_search_paths(config.engine.search_paths.clone())
            .build()
    }

    /// The engine cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<EngineCache> {
        &self.inner.cache
    }

    /// Returns the cached engine for `key`.
    #[must_use]
    pub fn cached_engine(&self, key: &CacheKey) -> Option<EngineHandle> {
        self.inner.cache.get(key)
    }

    /// Search paths appended after each context's own paths.
    #[must_use]
    pub fn default_search_paths(&self) -> &[PathBuf] {
        &self.inner.default_search_paths
    }

    /// Discards every cached engine. Returns how many were discarded.
    ///
    /// Engines still held by running invocations stay alive until those
    /// invocations are dropped.
    pub fn clear_engines(&self) -> usize {
        let discarded = self.inner.cache.reset_all();
        info!(count = discarded.len(), "Cleared engine cache");
        for (key, engine) in &discarded {
            debug!(key = %key, engine = %engine.id(), "Discarded cached engine");
        }
        discarded.len()
    }

    /// Script-side handle bound as `__enginemanager__`.
    #[must_use]
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Selects and prepares an engine for one invocation.
    ///
    /// # Errors
    ///
    /// - Construction errors from the factory, unchanged
    /// - [`EngineError::Lua`] if bindings cannot be converted
    /// - [`EngineError::InvalidSearchPath`] for unusable search paths
    ///
    /// On error nothing stays attached or injected. An engine created for
    /// a refresh or reuse miss stays cached.
    pub fn acquire(&self, ctx: impl Into<Arc<ExecutionContext>>) -> Result<Invocation, EngineError> {
        let ctx: Arc<ExecutionContext> = ctx.into();
        let policy = ctx.policy();
        let key = ctx.cache_key();

        let (engine, cached) = self.select_engine(policy, &key)?;
        debug!(
            key = %key,
            policy = %policy,
            engine = %engine.id(),
            cached,
            "Selected engine"
        );

        let stream = StreamRedirector::attach(&engine, ctx.output().clone());

        let bindings = match BindingInjector::inject(&engine, &ctx, cached, self.handle()) {
            Ok(guard) => guard,
            Err(e) => {
                rollback_stream(&engine, stream);
                return Err(e);
            }
        };

        let paths = self.effective_search_paths(ctx.search_paths());
        if let Err(e) = engine.set_search_paths(&paths) {
            if let Err(rollback) = BindingInjector::clear(&engine, bindings) {
                warn!(engine = %engine.id(), error = %rollback, "Binding rollback failed");
            }
            rollback_stream(&engine, stream);
            return Err(e);
        }

        Ok(Invocation {
            engine,
            ctx,
            cached,
            guards: Some(InvocationGuards { stream, bindings }),
        })
    }

    /// Releases an invocation. Same as [`Invocation::release`].
    ///
    /// # Errors
    ///
    /// See [`Invocation::release`].
    pub fn release(&self, invocation: Invocation) -> Result<(), EngineError> {
        invocation.release()
    }

    fn select_engine(
        &self,
        policy: EnginePolicy,
        key: &CacheKey,
    ) -> Result<(EngineHandle, bool), EngineError> {
        if !policy.always_creates() {
            return self.inner.cache.get_or_insert_with(key, || {
                let engine = self.create_engine(&EngineOptions::lightweight())?;
                debug!(key = %key, engine = %engine.id(), "Cached new engine");
                Ok(engine)
            });
        }

        let options = if policy == EnginePolicy::FullIsolation {
            EngineOptions::full_isolation()
        } else {
            EngineOptions::lightweight()
        };
        let engine = self.create_engine(&options)?;

        if policy.uses_cache() {
            if let Some(previous) = self.inner.cache.put(key.clone(), Arc::clone(&engine)) {
                debug!(
                    key = %key,
                    replaced = %previous.id(),
                    engine = %engine.id(),
                    "Refreshed cached engine"
                );
            }
        }
        Ok((engine, false))
    }

    fn create_engine(&self, options: &EngineOptions) -> Result<EngineHandle, EngineError> {
        self.inner.factory.create(options).map(Arc::new)
    }

    fn effective_search_paths(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut effective = paths.to_vec();
        for path in &self.inner.default_search_paths {
            if !effective.contains(path) {
                effective.push(path.clone());
            }
        }
        effective
    }
}

impl Default for EngineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineManager")
            .field("cached", &self.inner.cache.len())
            .field("default_search_paths", &self.inner.default_search_paths)
            .finish_non_exhaustive()
    }
}

fn rollback_stream(engine: &EngineHandle, stream: StreamGuard) {
    if let Err(e) = StreamRedirector::detach(engine, stream) {
        warn!(engine = %engine.id(), error = %e, "Stream rollback failed");
    }
}

/// Builder for [`EngineManager`].
#[derive(Default)]
pub struct EngineManagerBuilder {
    cache: Option<Arc<EngineCache>>,
    factory: Option<Arc<dyn EngineFactory>>,
    default_search_paths: Vec<PathBuf>,
}

impl EngineManagerBuilder {
    /// Shares an existing cache (for several managers over one cache).
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<EngineCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses a custom engine factory.
    #[must_use]
    pub fn with_factory(mut self, factory: impl EngineFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Paths appended after every context's own search paths.
    #[must_use]
    pub fn with_default_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.default_search_paths = paths;
        self
    }

    /// Builds the manager.
    #[must_use]
    pub fn build(self) -> EngineManager {
        EngineManager {
            inner: Arc::new(ManagerInner {
                cache: self.cache.unwrap_or_default(),
                factory: self
                    .factory
                    .unwrap_or_else(|| Arc::new(LuaEngineFactory::default())),
                default_search_paths: self.default_search_paths,
            }),
        }
    }
}

// =============================================================================
// Invocation
// =============================================================================

struct InvocationGuards {
    stream: StreamGuard,
    bindings: BindingGuard,
}

/// A prepared engine, ready to run one command.
///
/// Release it with [`Invocation::release`]. Dropping it without release
/// performs the same teardown and logs any failure.
pub struct Invocation {
    engine: EngineHandle,
    ctx: Arc<ExecutionContext>,
    cached: bool,
    guards: Option<InvocationGuards>,
}

impl Invocation {
    /// The prepared engine.
    #[must_use]
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// The context this invocation was acquired for.
    #[must_use]
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// Whether the engine was served from the cache.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Script file this invocation runs: the alternate source in alternate
    /// mode when one exists, the primary source otherwise.
    #[must_use]
    pub fn script_path(&self) -> &Path {
        let command = self.ctx.command();
        match (&command.alternate_script_source, self.ctx.alternate_mode()) {
            (Some(alternate), true) => alternate,
            _ => &command.script_source,
        }
    }

    /// Runs Lua source on the prepared engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] on syntax or runtime errors.
    pub fn exec(&self, source: &str, chunk_name: &str) -> Result<(), EngineError> {
        self.engine.exec(source, chunk_name)
    }

    /// Runs the command's script file (see [`Invocation::script_path`]).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScriptNotFound`], [`EngineError::ScriptRead`]
    /// or [`EngineError::Lua`].
    pub fn run_script(&self) -> Result<(), EngineError> {
        let path = self.script_path().to_path_buf();
        debug!(engine = %self.engine.id(), script = %path.display(), "Running script");
        self.engine.exec_file(&path)
    }

    /// Clears the bindings, restores the output stream and, for full-frame
    /// engines, runs a full collection.
    ///
    /// Both restore steps are attempted even if the first fails; the first
    /// error is returned.
    ///
    /// # Errors
    ///
    /// - [`EngineError::StreamOutOfOrder`] if a later invocation on the same
    ///   engine is still holding the output stream. The later invocation's
    ///   release then restores the stream this one found on acquire.
    /// - [`EngineError::Lua`] if the Lua state rejects the teardown
    pub fn release(mut self) -> Result<(), EngineError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), EngineError> {
        let Some(guards) = self.guards.take() else {
            return Ok(());
        };

        let bindings = BindingInjector::clear(&self.engine, guards.bindings);
        let stream = StreamRedirector::detach(&self.engine, guards.stream);
        bindings?;
        stream?;

        if self.engine.options().collects_on_release() {
            self.engine.collect_garbage()?;
        }

        debug!(
            engine = %self.engine.id(),
            command = %self.ctx.command().name,
            "Released invocation"
        );
        Ok(())
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if self.guards.is_some() {
            if let Err(e) = self.release_inner() {
                warn!(engine = %self.engine.id(), error = %e, "Release on drop failed");
            }
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("engine", &self.engine.id())
            .field("command", &self.ctx.command().name)
            .field("cached", &self.cached)
            .field("released", &self.guards.is_none())
            .finish()
    }
}

// =============================================================================
// Script-side handle
// =============================================================================

/// `__enginemanager__`: what a script may do with the manager.
///
/// ```lua
/// for _, key in ipairs(__enginemanager__:cached_keys()) do print(key) end
/// if __enginemanager__:is_cached("tools") then ... end
/// local n = __enginemanager__:clear_engines()
/// ```
///
/// Holds a weak reference; calls fail once the manager is dropped.
#[derive(Clone)]
pub struct ManagerHandle {
    inner: Weak<ManagerInner>,
}

impl ManagerHandle {
    /// Handle not connected to any manager.
    #[must_use]
    pub fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    /// The manager behind this handle, if still alive.
    #[must_use]
    pub fn manager(&self) -> Option<EngineManager> {
        self.inner.upgrade().map(|inner| EngineManager { inner })
    }

    fn require(&self) -> Result<EngineManager, EngineError> {
        self.manager().ok_or(EngineError::ManagerDropped)
    }
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl UserData for ManagerHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("cached_keys", |_, this, ()| {
            let manager = this.require()?;
            Ok(manager
                .cache()
                .keys()
                .into_iter()
                .map(|k| k.as_str().to_string())
                .collect::<Vec<_>>())
        });

        methods.add_method("is_cached", |_, this, key: String| {
            let manager = this.require()?;
            Ok(manager.cache().contains(&CacheKey::new(key)))
        });

        methods.add_method("clear_engines", |_, this, ()| {
            let manager = this.require()?;
            Ok(manager.clear_engines())
        });
    }
}
