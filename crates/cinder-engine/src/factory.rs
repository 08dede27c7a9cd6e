//! Engine construction seam.
//!
//! The engine manager never calls [`ScriptEngine::new`] directly. It asks an
//! [`EngineFactory`], which lets hosts preload their API modules into every
//! new engine and lets tests inject construction failures.

use crate::engine::{EngineOptions, ScriptEngine};
use crate::error::EngineError;
use std::fmt;
use std::sync::Arc;

/// Constructs interpreter instances for the engine manager.
pub trait EngineFactory: Send + Sync {
    /// Creates a new engine with the given options.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be constructed. The manager
    /// propagates it unchanged.
    fn create(&self, options: &EngineOptions) -> Result<ScriptEngine, EngineError>;
}

/// Hook run against every freshly constructed engine.
pub type EngineInitializer = Arc<dyn Fn(&ScriptEngine) -> Result<(), EngineError> + Send + Sync>;

/// Default factory producing Lua-backed engines.
///
/// # Example
///
/// ```
/// use cinder_engine::{EngineFactory, EngineOptions, LuaEngineFactory};
///
/// let factory = LuaEngineFactory::new().with_initializer(|engine| {
///     engine.exec("package.preload['host'] = function() return { version = 3 } end", "init")
/// });
///
/// let engine = factory.create(&EngineOptions::default()).expect("engine");
/// let version: i64 = engine.eval("return require('host').version", "t").expect("eval");
/// assert_eq!(version, 3);
/// ```
#[derive(Clone, Default)]
pub struct LuaEngineFactory {
    memory_limit: Option<usize>,
    collect_on_release: bool,
    initializers: Vec<EngineInitializer>,
}

impl LuaEngineFactory {
    /// Creates a factory with no limits and no initializers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a memory limit to engines that do not request their own.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Makes every engine run a full collection on release.
    #[must_use]
    pub fn with_collect_on_release(mut self, collect: bool) -> Self {
        self.collect_on_release = collect;
        self
    }

    /// Registers an initializer. Initializers run in registration order.
    #[must_use]
    pub fn with_initializer<F>(mut self, init: F) -> Self
    where
        F: Fn(&ScriptEngine) -> Result<(), EngineError> + Send + Sync + 'static,
    {
        self.initializers.push(Arc::new(init));
        self
    }

    /// Number of registered initializers.
    #[must_use]
    pub fn initializer_count(&self) -> usize {
        self.initializers.len()
    }
}

impl EngineFactory for LuaEngineFactory {
    fn create(&self, options: &EngineOptions) -> Result<ScriptEngine, EngineError> {
        let mut effective = *options;
        if effective.memory_limit.is_none() {
            effective.memory_limit = self.memory_limit;
        }
        effective.collect_on_release |= self.collect_on_release;

        let engine = ScriptEngine::new(effective)?;
        for (index, init) in self.initializers.iter().enumerate() {
            init(&engine).map_err(|e| {
                EngineError::construction(format!("initializer #{index} failed: {e}"))
            })?;
        }
        Ok(engine)
    }
}

impl fmt::Debug for LuaEngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaEngineFactory")
            .field("memory_limit", &self.memory_limit)
            .field("collect_on_release", &self.collect_on_release)
            .field("initializers", &self.initializers.len())
            .finish()
    }
}
