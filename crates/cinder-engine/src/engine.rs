//! Lua-backed interpreter instance.
//!
//! A [`ScriptEngine`] owns one Lua 5.4 state and exposes the surface the
//! engine manager works with:
//!
//! - a global namespace (bindings are resolved through it)
//! - a swappable output stream (`print` and `io.write` write to it)
//! - a module search path list (`package.path`)
//! - creation options fixed at construction ([`EngineOptions`])
//!
//! # Helper table
//!
//! Every engine gets a `cinder` global:
//!
//! | Name | Description |
//! |------|-------------|
//! | `cinder.null` | The absent value cleared bindings are set to |
//! | `cinder.isnull(v)` | True for `nil` and `cinder.null` |
//! | `cinder.log(level, msg)` | Log through the host's tracing subscriber |
//! | `cinder.engine_id` | Id of this engine (string) |
//! | `cinder.frame_mode` | `"lightweight"` or `"full"` |
//!
//! # Example
//!
//! ```
//! use cinder_engine::{CaptureBuffer, EngineOptions, OutputStream, ScriptEngine};
//!
//! let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
//! let buffer = CaptureBuffer::new();
//! engine.replace_output(OutputStream::capture(&buffer));
//!
//! engine.exec(r#"print("hello", 42)"#, "example").expect("exec");
//! assert_eq!(buffer.contents(), "hello\t42\n");
//! ```

use crate::error::EngineError;
use crate::output::OutputStream;
use crate::stream::Redirection;
use cinder_types::EngineId;
use mlua::{FromLua, FromLuaMulti, Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared handle to an engine. Cached engines are held by the cache and by
/// every invocation currently using them.
pub type EngineHandle = Arc<ScriptEngine>;

/// Global table name for the helper functions.
const HELPER_TABLE_NAME: &str = "cinder";

/// How an engine treats call frames across invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameMode {
    /// Default mode. Frames and temporaries are reclaimed by the incremental
    /// collector whenever it gets to them.
    #[default]
    Lightweight,
    /// Full isolation. A complete collection cycle runs after every
    /// invocation so no frame outlives the invocation that created it.
    Full,
}

impl FrameMode {
    /// Returns the name exposed as `cinder.frame_mode`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lightweight => "lightweight",
            Self::Full => "full",
        }
    }
}

/// Creation options, fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineOptions {
    /// Frame retention mode.
    pub frame_mode: FrameMode,
    /// Upper bound on Lua heap size in bytes (`None` = unlimited).
    pub memory_limit: Option<usize>,
    /// Run a full collection on release even in lightweight mode.
    pub collect_on_release: bool,
}

impl EngineOptions {
    /// Options for default engines (clean, refresh, reuse).
    #[must_use]
    pub fn lightweight() -> Self {
        Self::default()
    }

    /// Options for full-isolation engines.
    #[must_use]
    pub fn full_isolation() -> Self {
        Self {
            frame_mode: FrameMode::Full,
            ..Self::default()
        }
    }

    /// Sets the memory limit.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Forces a collection cycle on every release.
    #[must_use]
    pub fn with_collect_on_release(mut self, collect: bool) -> Self {
        self.collect_on_release = collect;
        self
    }

    /// Returns true if a release must be followed by a full collection.
    #[must_use]
    pub fn collects_on_release(&self) -> bool {
        self.frame_mode == FrameMode::Full || self.collect_on_release
    }
}

/// One embedded Lua interpreter instance.
///
/// The Lua state sits behind a reentrant lock: a script running on this
/// engine may call back into Rust code that touches the same engine (for
/// example through the engine manager handle) without deadlocking, while
/// other threads are serialized.
pub struct ScriptEngine {
    id: EngineId,
    options: EngineOptions,
    lua: ReentrantMutex<Lua>,
    /// Current output target, shared with the `print` / `io.write` closures.
    output: Arc<Mutex<OutputStream>>,
    /// Active guarded redirections, innermost last.
    redirections: Mutex<Vec<Arc<Redirection>>>,
    /// Mirror of the paths rendered into `package.path`.
    search_paths: Mutex<Vec<PathBuf>>,
}

impl ScriptEngine {
    /// Creates a new engine with the safe standard libraries loaded.
    ///
    /// Output goes to the process stdout until redirected.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] if the Lua state cannot be
    /// created or prepared.
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        let id = EngineId::new();
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())
            .map_err(|e| EngineError::construction(format!("create lua state: {e}")))?;

        if let Some(limit) = options.memory_limit {
            lua.set_memory_limit(limit)
                .map_err(|e| EngineError::construction(format!("set memory limit: {e}")))?;
        }

        let output = Arc::new(Mutex::new(OutputStream::stdout()));
        install_helpers(&lua, id, &options)
            .map_err(|e| EngineError::construction(format!("install helpers: {e}")))?;
        install_output_functions(&lua, &output)
            .map_err(|e| EngineError::construction(format!("install output functions: {e}")))?;

        tracing::debug!(
            engine = %id,
            frame_mode = options.frame_mode.as_str(),
            memory_limit = ?options.memory_limit,
            "Created script engine"
        );

        Ok(Self {
            id,
            options,
            lua: ReentrantMutex::new(lua),
            output,
            redirections: Mutex::new(Vec::new()),
            search_paths: Mutex::new(Vec::new()),
        })
    }

    /// Returns the engine id.
    #[must_use]
    pub fn id(&self) -> EngineId {
        self.id
    }

    /// Returns the creation options.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Runs a closure with the locked Lua state.
    ///
    /// Values created inside the closure must not escape it.
    pub fn with_lua<R>(&self, f: impl FnOnce(&Lua) -> R) -> R {
        let lua = self.lua.lock();
        f(&lua)
    }

    /// Executes a chunk of Lua source.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] on syntax or runtime errors.
    pub fn exec(&self, source: &str, chunk_name: &str) -> Result<(), EngineError> {
        self.with_lua(|lua| lua.load(source).set_name(chunk_name).exec())?;
        Ok(())
    }

    /// Evaluates a chunk of Lua source and converts its result.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] on syntax, runtime or conversion errors.
    pub fn eval<T: FromLuaMulti>(&self, source: &str, chunk_name: &str) -> Result<T, EngineError> {
        let value = self.with_lua(|lua| lua.load(source).set_name(chunk_name).eval::<T>())?;
        Ok(value)
    }

    /// Reads and executes a script file.
    ///
    /// The file is loaded as raw bytes; Lua source need not be UTF-8.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ScriptNotFound`] if the file does not exist
    /// - [`EngineError::ScriptRead`] for any other read failure
    /// - [`EngineError::Lua`] if execution fails
    pub fn exec_file(&self, path: &Path) -> Result<(), EngineError> {
        let source = std::fs::read(path).map_err(|e| EngineError::script_read(path, e))?;
        let chunk_name = format!("@{}", path.display());
        self.with_lua(|lua| lua.load(&source[..]).set_name(chunk_name).exec())?;
        Ok(())
    }

    /// Reads a global (bindings included) and converts it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] if the value cannot be converted.
    pub fn global<T: FromLua>(&self, name: &str) -> Result<T, EngineError> {
        let value = self.with_lua(|lua| lua.globals().get::<T>(name))?;
        Ok(value)
    }

    /// Returns the stream `print` currently writes to.
    #[must_use]
    pub fn output(&self) -> OutputStream {
        self.output.lock().clone()
    }

    /// Swaps the output stream, returning the previous one.
    ///
    /// Hosts normally go through the stream redirector, which remembers the
    /// previous stream for them.
    pub fn replace_output(&self, stream: OutputStream) -> OutputStream {
        std::mem::replace(&mut *self.output.lock(), stream)
    }

    pub(crate) fn redirections(&self) -> &Mutex<Vec<Arc<Redirection>>> {
        &self.redirections
    }

    /// Replaces the module search paths.
    ///
    /// Each path `p` contributes `p/?.lua` and `p/?/init.lua` to
    /// `package.path`, in order. An empty slice disables filesystem module
    /// lookup. Modules already in `package.loaded` stay loaded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidSearchPath`] if a path is not UTF-8 or
    /// contains a `package.path` metacharacter (`;` or `?`). Nothing is
    /// changed in that case.
    pub fn set_search_paths(&self, paths: &[PathBuf]) -> Result<(), EngineError> {
        let package_path = render_package_path(paths)?;

        self.with_lua(|lua| -> mlua::Result<()> {
            let package: Table = lua.globals().get("package")?;
            package.set("path", package_path.as_str())
        })?;

        *self.search_paths.lock() = paths.to_vec();
        tracing::trace!(engine = %self.id, path = %package_path, "Applied search paths");
        Ok(())
    }

    /// Returns the currently configured search paths.
    #[must_use]
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.lock().clone()
    }

    /// Runs a full garbage collection cycle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lua`] if a finalizer fails.
    pub fn collect_garbage(&self) -> Result<(), EngineError> {
        self.with_lua(|lua| lua.gc_collect())?;
        Ok(())
    }

    /// Bytes currently allocated by the Lua state.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        self.with_lua(|lua| lua.used_memory())
    }
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("output", &self.output.lock().label())
            .finish_non_exhaustive()
    }
}

/// Renders search paths into a `package.path` string.
fn render_package_path(paths: &[PathBuf]) -> Result<String, EngineError> {
    let mut patterns = Vec::with_capacity(paths.len() * 2);
    for path in paths {
        let text = path
            .to_str()
            .ok_or_else(|| EngineError::invalid_search_path(path, "path is not valid UTF-8"))?;
        if text.is_empty() {
            return Err(EngineError::invalid_search_path(path, "path is empty"));
        }
        if text.contains(';') || text.contains('?') {
            return Err(EngineError::invalid_search_path(
                path,
                "path contains a package.path metacharacter (';' or '?')",
            ));
        }
        let base = text.trim_end_matches(|c| c == '/' || c == '\\');
        patterns.push(format!("{base}/?.lua"));
        patterns.push(format!("{base}/?/init.lua"));
    }
    Ok(patterns.join(";"))
}

/// Registers the `cinder` helper table.
fn install_helpers(lua: &Lua, id: EngineId, options: &EngineOptions) -> mlua::Result<()> {
    let helpers = lua.create_table()?;

    helpers.set("null", Value::NULL)?;
    helpers.set("engine_id", id.to_string())?;
    helpers.set("frame_mode", options.frame_mode.as_str())?;

    let is_null = lua.create_function(|_, value: Value| Ok(value.is_nil() || value.is_null()))?;
    helpers.set("isnull", is_null)?;

    let log_fn = lua.create_function(move |_, (level, msg): (String, String)| {
        match level.to_lowercase().as_str() {
            "trace" => tracing::trace!(engine = %id, "[lua] {}", msg),
            "debug" => tracing::debug!(engine = %id, "[lua] {}", msg),
            "warn" => tracing::warn!(engine = %id, "[lua] {}", msg),
            "error" => tracing::error!(engine = %id, "[lua] {}", msg),
            _ => tracing::info!(engine = %id, "[lua] {}", msg),
        }
        Ok(())
    })?;
    helpers.set("log", log_fn)?;

    lua.globals().set(HELPER_TABLE_NAME, helpers)
}

/// Replaces `print` and `io.write` with functions writing to the engine's
/// current output stream.
fn install_output_functions(lua: &Lua, output: &Arc<Mutex<OutputStream>>) -> mlua::Result<()> {
    let globals = lua.globals();
    let tostring: Function = globals.get("tostring")?;

    let out = Arc::clone(output);
    let print_fn = lua.create_function(move |_, args: MultiValue| {
        let mut line = Vec::new();
        for (i, value) in args.into_iter().enumerate() {
            if i > 0 {
                line.push(b'\t');
            }
            let text = tostring.call::<mlua::String>(value)?;
            line.extend_from_slice(&text.as_bytes());
        }
        line.push(b'\n');

        let stream = out.lock().clone();
        stream.write_lossy(&line).map_err(mlua::Error::external)
    })?;
    globals.set("print", print_fn)?;

    // io is part of the safe libraries; only io.write is rerouted.
    if let Ok(io) = globals.get::<Table>("io") {
        let out = Arc::clone(output);
        let write_fn = lua.create_function(move |_, args: MultiValue| {
            let stream = out.lock().clone();
            for (i, value) in args.into_iter().enumerate() {
                let written = match value {
                    Value::String(s) => stream.write_lossy(&s.as_bytes()),
                    Value::Integer(n) => stream.write_text(&n.to_string()),
                    Value::Number(n) => stream.write_text(&n.to_string()),
                    other => {
                        return Err(mlua::Error::RuntimeError(format!(
                            "bad argument #{} to 'write' (string expected, got {})",
                            i + 1,
                            other.type_name()
                        )))
                    }
                };
                written.map_err(mlua::Error::external)?;
            }
            Ok(())
        })?;
        io.set("write", write_fn)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CaptureBuffer;

    fn captured_engine(options: EngineOptions) -> (ScriptEngine, CaptureBuffer) {
        let engine = ScriptEngine::new(options).expect("engine should be created");
        let buffer = CaptureBuffer::new();
        engine.replace_output(OutputStream::capture(&buffer));
        (engine, buffer)
    }

    // ─── Construction ────────────────────────────────────────────────

    #[test]
    fn new_engine_has_helpers() {
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");

        let kind: String = engine
            .eval("return type(cinder.log)", "t")
            .expect("cinder.log should exist");
        assert_eq!(kind, "function");

        let id: String = engine.eval("return cinder.engine_id", "t").expect("id");
        assert_eq!(id, engine.id().to_string());
    }

    #[test]
    fn frame_mode_is_exposed() {
        let light = ScriptEngine::new(EngineOptions::lightweight()).expect("engine");
        let full = ScriptEngine::new(EngineOptions::full_isolation()).expect("engine");

        let light_mode: String = light.eval("return cinder.frame_mode", "t").expect("eval");
        let full_mode: String = full.eval("return cinder.frame_mode", "t").expect("eval");
        assert_eq!(light_mode, "lightweight");
        assert_eq!(full_mode, "full");
        assert!(full.options().collects_on_release());
        assert!(!light.options().collects_on_release());
    }

    #[test]
    fn engines_do_not_share_globals() {
        let a = ScriptEngine::new(EngineOptions::default()).expect("engine a");
        let b = ScriptEngine::new(EngineOptions::default()).expect("engine b");

        a.exec("shared = 1", "a").expect("set in a");
        let in_b: Value = b.global("shared").expect("read b");
        assert!(in_b.is_nil());
    }

    #[test]
    fn unsafe_libraries_are_not_loaded() {
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        let kind: String = engine.eval("return type(debug)", "t").expect("eval");
        assert_eq!(kind, "nil");
    }

    #[test]
    fn memory_limit_is_enforced() {
        let engine = ScriptEngine::new(EngineOptions::default().with_memory_limit(Some(1 << 20)))
            .expect("engine");

        let result = engine.exec(
            "local t = {} for i = 1, 1e7 do t[i] = string.rep('x', 64) .. i end",
            "hog",
        );
        assert!(result.is_err(), "allocation beyond the limit should fail");
    }

    // ─── Output ──────────────────────────────────────────────────────

    #[test]
    fn print_uses_tostring_semantics() {
        let (engine, buffer) = captured_engine(EngineOptions::default());
        engine
            .exec("print('a', 1, 2.5, true, nil)", "t")
            .expect("print");
        assert_eq!(buffer.contents(), "a\t1\t2.5\ttrue\tnil\n");
    }

    #[test]
    fn io_write_goes_to_output() {
        let (engine, buffer) = captured_engine(EngineOptions::default());
        engine.exec("io.write('x', 1, '\\n')", "t").expect("write");
        assert_eq!(buffer.contents(), "x1\n");
    }

    #[test]
    fn io_write_rejects_tables() {
        let (engine, _buffer) = captured_engine(EngineOptions::default());
        let err = engine.exec("io.write({})", "t").unwrap_err();
        assert!(err.to_string().contains("string expected"), "got: {err}");
    }

    #[test]
    fn replace_output_returns_previous() {
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        let first = OutputStream::sink();
        let original = engine.replace_output(first.clone());
        assert_eq!(original.label(), "stdout");

        let previous = engine.replace_output(OutputStream::sink());
        assert!(previous.same_stream(&first));
    }

    // ─── Search paths ────────────────────────────────────────────────

    #[test]
    fn search_paths_drive_require() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("helper.lua"),
            "return { greet = function() return 'hi' end }",
        )
        .unwrap();
        let pkg = dir.path().join("pkg");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("init.lua"), "return { name = 'pkg' }").unwrap();

        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        engine
            .set_search_paths(&[dir.path().to_path_buf()])
            .expect("set paths");

        let greeting: String = engine
            .eval("return require('helper').greet()", "t")
            .expect("require file module");
        assert_eq!(greeting, "hi");

        let name: String = engine
            .eval("return require('pkg').name", "t")
            .expect("require init.lua module");
        assert_eq!(name, "pkg");
    }

    #[test]
    fn search_paths_are_replaced_not_appended() {
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        engine
            .set_search_paths(&[PathBuf::from("/first"), PathBuf::from("/second/")])
            .expect("set paths");
        engine
            .set_search_paths(&[PathBuf::from("/third")])
            .expect("replace paths");

        let path: String = engine.eval("return package.path", "t").expect("eval");
        assert_eq!(path, "/third/?.lua;/third/?/init.lua");
        assert_eq!(engine.search_paths(), vec![PathBuf::from("/third")]);
    }

    #[test]
    fn first_search_path_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join("shared.lua"), "return 'first'").unwrap();
        std::fs::write(second.path().join("shared.lua"), "return 'second'").unwrap();

        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        engine
            .set_search_paths(&[first.path().to_path_buf(), second.path().to_path_buf()])
            .expect("set paths");

        let source: String = engine.eval("return require('shared')", "t").expect("eval");
        assert_eq!(source, "first");
    }

    #[test]
    fn search_path_metacharacters_rejected() {
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        engine
            .set_search_paths(&[PathBuf::from("/ok")])
            .expect("set valid path");

        let err = engine
            .set_search_paths(&[PathBuf::from("/bad;path")])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSearchPath { .. }));

        // Previous configuration untouched
        assert_eq!(engine.search_paths(), vec![PathBuf::from("/ok")]);
    }

    #[test]
    fn empty_search_paths_disable_file_modules() {
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        engine.set_search_paths(&[]).expect("clear paths");

        let path: String = engine.eval("return package.path", "t").expect("eval");
        assert!(path.is_empty());
    }

    // ─── Execution helpers ───────────────────────────────────────────

    #[test]
    fn exec_file_missing_reports_path() {
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        let err = engine
            .exec_file(Path::new("/nonexistent/script.lua"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ScriptNotFound(ref p) if p.ends_with("script.lua")));
    }

    #[test]
    fn exec_file_unreadable_is_not_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");

        // A directory exists but cannot be read as a file
        let err = engine.exec_file(dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::ScriptRead { .. }), "got: {err:?}");
    }

    #[test]
    fn exec_file_accepts_non_utf8_source() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("latin1.lua");
        let mut source = b"raw = '".to_vec();
        source.push(0xE9);
        source.extend_from_slice(b"'");
        std::fs::write(&script, source).unwrap();

        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        engine.exec_file(&script).expect("non-UTF-8 source runs");
        let raw: mlua::String = engine.global("raw").expect("global");
        assert_eq!(&raw.as_bytes()[..], &[0xE9]);
    }

    #[test]
    fn exec_file_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.lua");
        std::fs::write(&script, "ran = 'yes'").unwrap();

        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        engine.exec_file(&script).expect("exec file");
        let ran: String = engine.global("ran").expect("global");
        assert_eq!(ran, "yes");
    }

    #[test]
    fn isnull_helper() {
        let engine = ScriptEngine::new(EngineOptions::default()).expect("engine");
        let result: (bool, bool, bool) = engine
            .eval(
                "return cinder.isnull(nil), cinder.isnull(cinder.null), cinder.isnull(0)",
                "t",
            )
            .expect("eval");
        assert_eq!(result, (true, true, false));
    }

    #[test]
    fn collect_garbage_succeeds() {
        let engine = ScriptEngine::new(EngineOptions::full_isolation()).expect("engine");
        engine
            .exec("local t = {} for i = 1, 1000 do t[i] = {} end", "t")
            .expect("alloc");
        engine.collect_garbage().expect("gc");
        assert!(engine.used_memory() > 0);
    }
}
