//! Per-invocation global bindings.
//!
//! Scripts see the invocation context as a fixed set of globals
//! (`__host__`, `__commandname__`, `__result__`, ...). Bindings are not
//! written into `_G` directly. Each injection creates a fresh **scope
//! table**, and the global table resolves unknown names through it:
//!
//! ```text
//! _G ──metatable──► { __index = scope, __newindex = guard }
//!                               │
//!                               ▼
//!                   { __host__ = ..., __result__ = ..., ... }
//! ```
//!
//! # Lifecycle
//!
//! - [`BindingInjector::inject`] writes every binding into a new scope and
//!   makes it current. The returned [`BindingGuard`] remembers the scope
//!   that was current before.
//! - [`BindingInjector::clear`] sets every binding of the guard's scope to
//!   the absent value (`cinder.null`) and makes the previous scope current
//!   again, so an outer invocation sees its own bindings after a nested one
//!   finishes. With no previous scope the cleared scope stays current:
//!   binding names remain defined and read as `cinder.null`.
//!
//! Scripts cannot assign to a binding name; ordinary globals are unaffected.

use crate::context::ExecutionContext;
use crate::engine::ScriptEngine;
use crate::error::EngineError;
use crate::manager::ManagerHandle;
use cinder_types::EngineId;
use mlua::{
    FromLua, Function, Lua, LuaSerdeExt, RegistryKey, Table, UserData, UserDataFields, Value,
};
use std::path::Path;
use std::sync::Arc;

/// Registry slot holding the metatable installed on `_G`.
const GLOBALS_METATABLE_KEY: &str = "cinder.globals_metatable";

// =============================================================================
// Binding names
// =============================================================================

/// One entry of the fixed binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Whether the engine was served from the cache.
    CachedEngine,
    /// Script-side handle to the engine manager.
    EngineManager,
    /// Read-only view of the execution context.
    ExecContext,
    /// Host application handle.
    Host,
    /// UI handle of the active document.
    ActiveUiDocument,
    /// The active document.
    ActiveDocument,
    /// True when no document is open.
    NoActiveDocument,
    /// Data the host attached to this invocation.
    CommandData,
    /// Elements selected in the host.
    SelectedElements,
    /// Directory of the primary script.
    CommandPath,
    /// Directory of the alternate script.
    AlternateCommandPath,
    CommandName,
    CommandBundle,
    CommandExtension,
    CommandUniqueId,
    ForcedDebugMode,
    AlternateMode,
    /// Results container the script reports into.
    Results,
}

impl Binding {
    /// Every binding, in injection order.
    pub const ALL: [Binding; 18] = [
        Binding::CachedEngine,
        Binding::EngineManager,
        Binding::ExecContext,
        Binding::Host,
        Binding::ActiveUiDocument,
        Binding::ActiveDocument,
        Binding::NoActiveDocument,
        Binding::CommandData,
        Binding::SelectedElements,
        Binding::CommandPath,
        Binding::AlternateCommandPath,
        Binding::CommandName,
        Binding::CommandBundle,
        Binding::CommandExtension,
        Binding::CommandUniqueId,
        Binding::ForcedDebugMode,
        Binding::AlternateMode,
        Binding::Results,
    ];

    /// Global name the binding is visible under.
    #[must_use]
    pub fn global_name(&self) -> &'static str {
        match self {
            Self::CachedEngine => "__cachedengine__",
            Self::EngineManager => "__enginemanager__",
            Self::ExecContext => "__execcontext__",
            Self::Host => "__host__",
            Self::ActiveUiDocument => "__activeuidoc__",
            Self::ActiveDocument => "__activedoc__",
            Self::NoActiveDocument => "__zerodoc__",
            Self::CommandData => "__commanddata__",
            Self::SelectedElements => "__elements__",
            Self::CommandPath => "__commandpath__",
            Self::AlternateCommandPath => "__alternatecommandpath__",
            Self::CommandName => "__commandname__",
            Self::CommandBundle => "__commandbundle__",
            Self::CommandExtension => "__commandextension__",
            Self::CommandUniqueId => "__commanduniqueid__",
            Self::ForcedDebugMode => "__forceddebugmode__",
            Self::AlternateMode => "__alternatemode__",
            Self::Results => "__result__",
        }
    }

    /// Looks a binding up by its global name.
    #[must_use]
    pub fn from_global_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.global_name() == name)
    }
}

// =============================================================================
// Context handle
// =============================================================================

/// `__execcontext__`: read-only view of the invocation context.
///
/// ```lua
/// print(__execcontext__.policy, __execcontext__.cache_key)
/// for _, p in ipairs(__execcontext__.search_paths) do print(p) end
/// ```
#[derive(Debug, Clone)]
pub struct ContextHandle(Arc<ExecutionContext>);

impl ContextHandle {
    /// Wraps a context.
    #[must_use]
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self(ctx)
    }

    /// The wrapped context.
    #[must_use]
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.0
    }
}

impl UserData for ContextHandle {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("policy", |_, this| Ok(this.0.policy().as_str()));
        fields.add_field_method_get("cache_key", |_, this| {
            Ok(this.0.cache_key().as_str().to_string())
        });
        fields.add_field_method_get("output", |_, this| Ok(this.0.output().label().to_string()));
        fields.add_field_method_get("search_paths", |_, this| {
            Ok(this
                .0
                .search_paths()
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>())
        });
        fields.add_field_method_get("command_name", |_, this| Ok(this.0.command().name.clone()));
        fields.add_field_method_get("bundle", |_, this| Ok(this.0.command().bundle.clone()));
        fields.add_field_method_get("extension", |_, this| {
            Ok(this.0.command().extension.clone())
        });
        fields.add_field_method_get("unique_id", |_, this| {
            Ok(this.0.command().unique_id.clone())
        });
        fields.add_field_method_get("script_source", |_, this| {
            Ok(this.0.command().script_source.display().to_string())
        });
        fields.add_field_method_get("alternate_script_source", |_, this| {
            Ok(this
                .0
                .command()
                .alternate_script_source
                .as_ref()
                .map(|p| p.display().to_string()))
        });
        fields.add_field_method_get("has_document", |_, this| Ok(this.0.has_document()));
        fields.add_field_method_get("debug_mode", |_, this| Ok(this.0.debug_mode()));
        fields.add_field_method_get("alternate_mode", |_, this| Ok(this.0.alternate_mode()));
    }
}

// =============================================================================
// Injector
// =============================================================================

/// Restore token returned by [`BindingInjector::inject`].
#[derive(Debug)]
#[must_use = "a binding guard must be handed back to BindingInjector::clear"]
pub struct BindingGuard {
    engine_id: EngineId,
    scope: RegistryKey,
    previous: Option<RegistryKey>,
}

impl BindingGuard {
    /// Engine this guard belongs to.
    #[must_use]
    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    /// Returns true if another scope was current when this one was injected.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.previous.is_some()
    }
}

/// Writes and clears the binding table of one invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindingInjector;

impl BindingInjector {
    /// Injects every binding for `ctx` into a new scope on `engine`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] if a context value cannot be converted.
    /// The engine's current scope is unchanged in that case.
    pub fn inject(
        engine: &ScriptEngine,
        ctx: &Arc<ExecutionContext>,
        cached: bool,
        manager: ManagerHandle,
    ) -> Result<BindingGuard, EngineError> {
        let guard = engine.with_lua(|lua| -> mlua::Result<BindingGuard> {
            let metatable = globals_metatable(lua)?;
            let scope = build_scope(lua, ctx, cached, manager)?;

            let previous = match metatable.raw_get::<Value>("__index")? {
                Value::Table(t) => Some(lua.create_registry_value(t)?),
                _ => None,
            };
            let scope_key = lua.create_registry_value(scope.clone())?;
            metatable.raw_set("__index", scope)?;

            Ok(BindingGuard {
                engine_id: engine.id(),
                scope: scope_key,
                previous,
            })
        })?;

        tracing::trace!(
            engine = %engine.id(),
            command = %ctx.command().name,
            cached,
            nested = guard.is_nested(),
            "Injected bindings"
        );
        Ok(guard)
    }

    /// Clears the bindings injected with `guard` and restores the previous
    /// scope.
    ///
    /// # Errors
    ///
    /// - [`EngineError::BindingGuardMismatch`] if the guard belongs to
    ///   another engine
    /// - [`EngineError::Lua`] if the Lua state rejects the update
    pub fn clear(engine: &ScriptEngine, guard: BindingGuard) -> Result<(), EngineError> {
        if guard.engine_id != engine.id() {
            return Err(EngineError::BindingGuardMismatch {
                guard: guard.engine_id,
                engine: engine.id(),
            });
        }

        engine.with_lua(|lua| -> mlua::Result<()> {
            let BindingGuard {
                scope, previous, ..
            } = guard;
            let scope_table: Table = lua.registry_value(&scope)?;
            null_out(&scope_table)?;

            let metatable = globals_metatable(lua)?;
            let is_current = match metatable.raw_get::<Value>("__index")? {
                Value::Table(current) => current.to_pointer() == scope_table.to_pointer(),
                _ => false,
            };

            if let Some(previous) = previous {
                if is_current {
                    let previous_table: Table = lua.registry_value(&previous)?;
                    metatable.raw_set("__index", previous_table)?;
                }
                lua.remove_registry_value(previous)?;
            }
            lua.remove_registry_value(scope)?;
            Ok(())
        })?;

        tracing::trace!(engine = %engine.id(), "Cleared bindings");
        Ok(())
    }

    /// Sets every binding of the current scope to the absent value.
    ///
    /// Does nothing if no binding was ever injected. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] if the Lua state rejects the update.
    pub fn clear_all(engine: &ScriptEngine) -> Result<(), EngineError> {
        engine.with_lua(|lua| -> mlua::Result<()> {
            let Some(metatable) = lua.named_registry_value::<Option<Table>>(GLOBALS_METATABLE_KEY)?
            else {
                return Ok(());
            };
            if let Value::Table(scope) = metatable.raw_get::<Value>("__index")? {
                null_out(&scope)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Reads one binding as seen by scripts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] if the value cannot be converted to `T`.
    pub fn binding<T: FromLua>(engine: &ScriptEngine, binding: Binding) -> Result<T, EngineError> {
        engine.global(binding.global_name())
    }

    /// Returns true if the binding currently reads as the absent value
    /// (`cinder.null`) or is undefined.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] if the global cannot be read.
    pub fn is_absent(engine: &ScriptEngine, binding: Binding) -> Result<bool, EngineError> {
        let absent = engine.with_lua(|lua| -> mlua::Result<bool> {
            let value: Value = lua.globals().get(binding.global_name())?;
            Ok(value.is_nil() || value.is_null())
        })?;
        Ok(absent)
    }
}

/// Returns the `_G` metatable, installing it on first use.
fn globals_metatable(lua: &Lua) -> mlua::Result<Table> {
    if let Some(existing) = lua.named_registry_value::<Option<Table>>(GLOBALS_METATABLE_KEY)? {
        return Ok(existing);
    }

    let metatable = lua.create_table()?;
    let newindex = lua.create_function(|_, (target, key, value): (Table, Value, Value)| {
        if let Value::String(name) = &key {
            if let Ok(name) = name.to_str() {
                if Binding::from_global_name(&name).is_some() {
                    return Err(mlua::Error::RuntimeError(format!(
                        "'{}' is a read-only binding",
                        &*name
                    )));
                }
            }
        }
        target.raw_set(key, value)
    })?;
    metatable.raw_set("__newindex", newindex)?;

    let globals = lua.globals();
    let setmetatable: Function = globals.get("setmetatable")?;
    setmetatable.call::<()>((globals, metatable.clone()))?;

    lua.set_named_registry_value(GLOBALS_METATABLE_KEY, metatable.clone())?;
    Ok(metatable)
}

/// Builds a scope table holding every binding for `ctx`.
fn build_scope(
    lua: &Lua,
    ctx: &Arc<ExecutionContext>,
    cached: bool,
    manager: ManagerHandle,
) -> mlua::Result<Table> {
    let scope = lua.create_table()?;
    let command = ctx.command();

    for binding in Binding::ALL {
        let value = match binding {
            Binding::CachedEngine => Value::Boolean(cached),
            Binding::EngineManager => Value::UserData(lua.create_userdata(manager.clone())?),
            Binding::ExecContext => {
                Value::UserData(lua.create_userdata(ContextHandle::new(Arc::clone(ctx)))?)
            }
            Binding::Host => lua.to_value(ctx.host())?,
            Binding::ActiveUiDocument => match ctx.documents() {
                Some(docs) => lua.to_value(&docs.ui_document)?,
                None => Value::NULL,
            },
            Binding::ActiveDocument => match ctx.documents() {
                Some(docs) => lua.to_value(&docs.document)?,
                None => Value::NULL,
            },
            Binding::NoActiveDocument => Value::Boolean(!ctx.has_document()),
            Binding::CommandData => lua.to_value(ctx.command_data())?,
            Binding::SelectedElements => lua.to_value(ctx.selected_elements())?,
            Binding::CommandPath => path_value(lua, command.script_dir())?,
            Binding::AlternateCommandPath => path_value(lua, command.alternate_script_dir())?,
            Binding::CommandName => Value::String(lua.create_string(&command.name)?),
            Binding::CommandBundle => Value::String(lua.create_string(&command.bundle)?),
            Binding::CommandExtension => Value::String(lua.create_string(&command.extension)?),
            Binding::CommandUniqueId => Value::String(lua.create_string(&command.unique_id)?),
            Binding::ForcedDebugMode => Value::Boolean(ctx.debug_mode()),
            Binding::AlternateMode => Value::Boolean(ctx.alternate_mode()),
            Binding::Results => Value::UserData(lua.create_userdata(ctx.results().clone())?),
        };
        scope.raw_set(binding.global_name(), value)?;
    }

    Ok(scope)
}

fn path_value(lua: &Lua, path: Option<&Path>) -> mlua::Result<Value> {
    match path {
        Some(p) => Ok(Value::String(lua.create_string(p.display().to_string())?)),
        None => Ok(Value::NULL),
    }
}

fn null_out(scope: &Table) -> mlua::Result<()> {
    for binding in Binding::ALL {
        scope.raw_set(binding.global_name(), Value::NULL)?;
    }
    Ok(())
}
