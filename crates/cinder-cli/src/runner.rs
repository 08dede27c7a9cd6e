//! Runs script files through a shared engine manager.

use anyhow::{Context, Result};
use cinder_engine::{EngineManager, ExecutionContext, OutputStream, ResultsContainer};
use cinder_types::{CommandInfo, EnginePolicy};
use serde_json::Value as JsonValue;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Per-run settings shared by every script of one CLI call.
#[derive(Debug, Clone)]
pub(crate) struct RunOptions {
    pub extension: String,
    pub bundle: Option<String>,
    pub policy: EnginePolicy,
    pub search_paths: Vec<PathBuf>,
    pub host: JsonValue,
    pub document: Option<JsonValue>,
    pub selection: Vec<JsonValue>,
    pub data: JsonValue,
    pub debug_mode: bool,
    pub alternate: bool,
    pub print_results: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            extension: "default".into(),
            bundle: None,
            policy: EnginePolicy::default(),
            search_paths: Vec::new(),
            host: JsonValue::Null,
            document: None,
            selection: Vec::new(),
            data: JsonValue::Null,
            debug_mode: false,
            alternate: false,
            print_results: false,
        }
    }
}

/// Builds command metadata for a script file.
///
/// The command is named after the file stem; the bundle defaults to the
/// name of the directory holding the script.
pub(crate) fn command_for(script: &Path, opts: &RunOptions) -> CommandInfo {
    let name = script
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.display().to_string());
    let bundle = opts.bundle.clone().unwrap_or_else(|| {
        script
            .parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let unique_id = format!("{}-{}", opts.extension, name).to_lowercase();

    CommandInfo::new(name, script)
        .with_bundle(bundle)
        .with_extension(opts.extension.clone())
        .with_unique_id(unique_id)
}

/// Builds the execution context for one script.
///
/// The script's own directory is searched first (`.` for a bare file
/// name), then the configured search paths.
pub(crate) fn context_for(
    script: &Path,
    opts: &RunOptions,
    output: OutputStream,
    results: ResultsContainer,
) -> ExecutionContext {
    let command = command_for(script, opts);

    let mut search_paths = Vec::with_capacity(opts.search_paths.len() + 1);
    let script_dir = command.script_dir().unwrap_or_else(|| Path::new("."));
    search_paths.push(script_dir.to_path_buf());
    search_paths.extend(opts.search_paths.iter().cloned());

    let documents = opts
        .document
        .as_ref()
        .map(|doc| cinder_engine::ActiveDocument::new(doc.clone(), doc.clone()));

    ExecutionContext::builder(command)
        .policy(opts.policy)
        .output(output)
        .search_paths(search_paths)
        .host(opts.host.clone())
        .documents(documents)
        .command_data(opts.data.clone())
        .selected_elements(opts.selection.clone())
        .debug_mode(opts.debug_mode)
        .alternate_mode(opts.alternate)
        .results(results)
        .build()
}

/// Runs one script as one invocation.
///
/// Results are written to `results_out` as a JSON line when requested.
///
/// # Errors
///
/// Returns an error if the engine cannot be prepared, the script fails, or
/// the release fails.
pub(crate) fn run_script(
    manager: &EngineManager,
    script: &Path,
    opts: &RunOptions,
    output: OutputStream,
    results_out: &mut impl Write,
) -> Result<()> {
    let results = ResultsContainer::new();
    let ctx = context_for(script, opts, output, results.clone());

    let invocation = manager
        .acquire(ctx)
        .with_context(|| format!("failed to prepare engine for {}", script.display()))?;
    info!(
        script = %script.display(),
        cached = invocation.is_cached(),
        policy = %opts.policy,
        "Running script"
    );

    let outcome = invocation.run_script();
    let released = invocation.release();
    outcome.with_context(|| format!("script {} failed", script.display()))?;
    released.context("failed to release engine")?;

    if opts.print_results {
        writeln!(results_out, "{}", serde_json::to_string(&results.to_json())?)?;
    }
    Ok(())
}
