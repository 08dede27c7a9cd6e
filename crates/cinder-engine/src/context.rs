//! Per-invocation execution context.
//!
//! An [`ExecutionContext`] is built by the host for each command run and
//! handed to [`EngineManager::acquire`](crate::EngineManager::acquire). It
//! is read-only to the engine manager; the one mutable part is the
//! [`ResultsContainer`], which the running script fills in and the host
//! reads back after release.
//!
//! Host objects (application handle, documents, selection, command data)
//! are carried as JSON values and converted to Lua values at injection.

use crate::output::OutputStream;
use cinder_types::{CacheKey, CommandInfo, EnginePolicy};
use mlua::{Function, LuaSerdeExt, MetaMethod, UserData, UserDataMethods, Value};
use parking_lot::Mutex;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// Active document
// =============================================================================

/// The document pair exposed to a script when one is open in the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveDocument {
    /// UI-level handle of the document.
    pub ui_document: JsonValue,
    /// The document itself.
    pub document: JsonValue,
}

impl ActiveDocument {
    /// Creates a document pair.
    #[must_use]
    pub fn new(ui_document: JsonValue, document: JsonValue) -> Self {
        Self {
            ui_document,
            document,
        }
    }
}

// =============================================================================
// Results container
// =============================================================================

/// Shared key/value results a script reports back to its host.
///
/// Clones share storage. Inside Lua it is bound as `__result__` and behaves
/// like a table restricted to JSON-compatible values:
///
/// ```lua
/// __result__.count = 12
/// __result__.names = { "a", "b" }
/// print(#__result__)          -- 2
/// for k, v in pairs(__result__) do print(k, v) end
/// __result__.count = nil      -- removes the entry
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResultsContainer {
    entries: Arc<Mutex<BTreeMap<String, JsonValue>>>,
}

impl ResultsContainer {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.entries.lock().get(key).cloned()
    }

    /// Stores a value, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.entries.lock().insert(key.into(), value)
    }

    /// Removes a value.
    pub fn remove(&self, key: &str) -> Option<JsonValue> {
        self.entries.lock().remove(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Reported keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Snapshot as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        let map: Map<String, JsonValue> = self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        JsonValue::Object(map)
    }
}

impl UserData for ResultsContainer {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            match this.get(&key) {
                Some(value) => lua.to_value(&value),
                None => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (String, Value)| {
                if value.is_nil() {
                    this.remove(&key);
                } else {
                    let json: JsonValue = lua.from_value(value)?;
                    this.insert(key, json);
                }
                Ok(())
            },
        );

        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.len()));

        methods.add_meta_method(MetaMethod::Pairs, |lua, this, ()| {
            let snapshot = lua.create_table()?;
            for (key, value) in this.entries.lock().iter() {
                snapshot.set(key.as_str(), lua.to_value(value)?)?;
            }
            let next: Function = lua.globals().get("next")?;
            Ok((next, snapshot, Value::Nil))
        });
    }
}

// =============================================================================
// Execution context
// =============================================================================

/// Everything an invocation needs besides the engine itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    policy: EnginePolicy,
    output: OutputStream,
    search_paths: Vec<PathBuf>,
    host: JsonValue,
    documents: Option<ActiveDocument>,
    command_data: JsonValue,
    selected_elements: Vec<JsonValue>,
    command: CommandInfo,
    debug_mode: bool,
    alternate_mode: bool,
    results: ResultsContainer,
}

impl ExecutionContext {
    /// Starts building a context for `command`.
    ///
    /// # Example
    ///
    /// ```
    /// use cinder_engine::{ExecutionContext, OutputStream};
    /// use cinder_types::{CommandInfo, EnginePolicy};
    ///
    /// let ctx = ExecutionContext::builder(
    ///     CommandInfo::new("Walls", "/ext/Walls.pushbutton/script.lua").with_extension("tools"),
    /// )
    /// .policy(EnginePolicy::Refresh)
    /// .output(OutputStream::sink())
    /// .search_path("/ext/lib")
    /// .build();
    ///
    /// assert_eq!(ctx.cache_key().as_str(), "tools");
    /// assert!(!ctx.has_document());
    /// ```
    #[must_use]
    pub fn builder(command: CommandInfo) -> ExecutionContextBuilder {
        ExecutionContextBuilder::new(command)
    }

    /// Identity grouping invocations that may share an engine.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        self.command.cache_key()
    }

    #[must_use]
    pub fn policy(&self) -> EnginePolicy {
        self.policy
    }

    #[must_use]
    pub fn output(&self) -> &OutputStream {
        &self.output
    }

    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    #[must_use]
    pub fn host(&self) -> &JsonValue {
        &self.host
    }

    #[must_use]
    pub fn documents(&self) -> Option<&ActiveDocument> {
        self.documents.as_ref()
    }

    /// Returns true if a document is open in the host.
    #[must_use]
    pub fn has_document(&self) -> bool {
        self.documents.is_some()
    }

    #[must_use]
    pub fn command_data(&self) -> &JsonValue {
        &self.command_data
    }

    #[must_use]
    pub fn selected_elements(&self) -> &[JsonValue] {
        &self.selected_elements
    }

    #[must_use]
    pub fn command(&self) -> &CommandInfo {
        &self.command
    }

    #[must_use]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    #[must_use]
    pub fn alternate_mode(&self) -> bool {
        self.alternate_mode
    }

    /// Results the script reports back.
    #[must_use]
    pub fn results(&self) -> &ResultsContainer {
        &self.results
    }
}

/// Builder for [`ExecutionContext`].
#[derive(Debug, Clone)]
pub struct ExecutionContextBuilder {
    ctx: ExecutionContext,
}

impl ExecutionContextBuilder {
    fn new(command: CommandInfo) -> Self {
        Self {
            ctx: ExecutionContext {
                policy: EnginePolicy::default(),
                output: OutputStream::stdout(),
                search_paths: Vec::new(),
                host: JsonValue::Null,
                documents: None,
                command_data: JsonValue::Null,
                selected_elements: Vec::new(),
                command,
                debug_mode: false,
                alternate_mode: false,
                results: ResultsContainer::new(),
            },
        }
    }

    #[must_use]
    pub fn policy(mut self, policy: EnginePolicy) -> Self {
        self.ctx.policy = policy;
        self
    }

    /// Derives the policy from the legacy flag triple.
    #[must_use]
    pub fn policy_flags(self, full_isolation: bool, clean: bool, refresh: bool) -> Self {
        self.policy(EnginePolicy::from_flags(full_isolation, clean, refresh))
    }

    #[must_use]
    pub fn output(mut self, output: OutputStream) -> Self {
        self.ctx.output = output;
        self
    }

    /// Appends one module search path.
    #[must_use]
    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ctx.search_paths.push(path.into());
        self
    }

    /// Replaces the module search paths.
    #[must_use]
    pub fn search_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.ctx.search_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn host(mut self, host: JsonValue) -> Self {
        self.ctx.host = host;
        self
    }

    /// Sets the active document pair.
    #[must_use]
    pub fn document(mut self, ui_document: JsonValue, document: JsonValue) -> Self {
        self.ctx.documents = Some(ActiveDocument::new(ui_document, document));
        self
    }

    #[must_use]
    pub fn documents(mut self, documents: Option<ActiveDocument>) -> Self {
        self.ctx.documents = documents;
        self
    }

    #[must_use]
    pub fn command_data(mut self, data: JsonValue) -> Self {
        self.ctx.command_data = data;
        self
    }

    #[must_use]
    pub fn selected_elements(mut self, elements: Vec<JsonValue>) -> Self {
        self.ctx.selected_elements = elements;
        self
    }

    #[must_use]
    pub fn debug_mode(mut self, on: bool) -> Self {
        self.ctx.debug_mode = on;
        self
    }

    #[must_use]
    pub fn alternate_mode(mut self, on: bool) -> Self {
        self.ctx.alternate_mode = on;
        self
    }

    /// Uses an existing results container (to share it with the host).
    #[must_use]
    pub fn results(mut self, results: ResultsContainer) -> Self {
        self.ctx.results = results;
        self
    }

    #[must_use]
    pub fn build(self) -> ExecutionContext {
        self.ctx
    }
}
