//! cinder - run Lua command scripts through managed engines
//!
//! Every script given on the command line runs as one invocation through a
//! single engine manager, in order. Scripts sharing an extension share a
//! cached engine unless a policy says otherwise.
//!
//! # Configuration
//!
//! Configuration is loaded from multiple sources with priority:
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables (`CINDER_*`)
//! 3. Project config (`.cinder/config.toml` in the project directory)
//! 4. Global config (`~/.cinder/config.toml`)
//! 5. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `CINDER_DEBUG`: Enable debug mode (`true`/`false`)
//! - `CINDER_MEMORY_LIMIT_MB`: Lua heap limit per engine
//! - `CINDER_FULL_GC`: Collect garbage after every invocation
//! - `CINDER_POLICY`: Default engine policy
//! - `CINDER_SEARCH_PATH`: Extra module search paths
//! - `CINDER_LOG_LEVEL`: Default log filter

mod runner;

use anyhow::Result;
use cinder_engine::config::{CinderConfig, ConfigError, ConfigLoader};
use cinder_engine::{EngineManager, OutputStream};
use cinder_types::EnginePolicy;
use clap::Parser;
use runner::RunOptions;
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// cinder - run Lua command scripts through managed engines
#[derive(Parser, Debug)]
#[command(name = "cinder")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Project root directory (defaults to current directory)
    #[arg(short = 'C', long)]
    project: Option<PathBuf>,

    /// Extension the scripts belong to (engine cache key)
    #[arg(long, default_value = "default")]
    extension: String,

    /// Bundle name (defaults to the script's directory name)
    #[arg(long)]
    bundle: Option<String>,

    /// Engine policy: reuse, refresh, clean, full-isolation
    #[arg(long)]
    policy: Option<EnginePolicy>,

    /// Run in a full-isolation engine (legacy flag)
    #[arg(long)]
    full_frame: bool,

    /// Run in a clean, uncached engine (legacy flag)
    #[arg(long)]
    clean: bool,

    /// Replace the cached engine with a new one (legacy flag)
    #[arg(long)]
    refresh: bool,

    /// Additional module search path (repeatable)
    #[arg(short = 'I', long = "search-path", value_name = "DIR")]
    search_paths: Vec<PathBuf>,

    /// Host application handle as JSON
    #[arg(long, value_name = "JSON", value_parser = parse_json)]
    host: Option<JsonValue>,

    /// Active document as JSON
    #[arg(long, value_name = "JSON", value_parser = parse_json)]
    document: Option<JsonValue>,

    /// Selected elements as a JSON array
    #[arg(long, value_name = "JSON", value_parser = parse_json)]
    selection: Option<JsonValue>,

    /// Command invocation data as JSON
    #[arg(long, value_name = "JSON", value_parser = parse_json)]
    data: Option<JsonValue>,

    /// Set the forced-debug binding
    #[arg(long)]
    debug_mode: bool,

    /// Alternate invocation (shift-click)
    #[arg(long)]
    alternate: bool,

    /// Print each script's results container as JSON
    #[arg(long)]
    print_results: bool,

    /// Scripts to run, in order
    #[arg(required = true, value_name = "SCRIPT")]
    scripts: Vec<PathBuf>,
}

fn parse_json(s: &str) -> Result<JsonValue, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))
}

/// CLI-based configuration resolver.
///
/// Merges file/env config via [`ConfigLoader`] and applies CLI argument
/// overrides as the highest-priority layer.
struct CliConfigResolver {
    project_root: PathBuf,
    debug: bool,
}

impl CliConfigResolver {
    fn from_args(args: &Args) -> Self {
        let project_root = args.project.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to get current directory, using '.'");
                PathBuf::from(".")
            })
        });

        Self {
            project_root,
            debug: args.debug,
        }
    }

    fn resolve(&self, loader: ConfigLoader) -> Result<CinderConfig, ConfigError> {
        let mut config = loader.with_project_root(&self.project_root).load()?;

        // CLI args override (highest priority)
        if self.debug {
            config.debug = true;
        }

        Ok(config)
    }
}

/// Picks the policy: `--policy`, then the legacy flags, then config.
fn resolve_policy(args: &Args, config: &CinderConfig) -> EnginePolicy {
    if let Some(policy) = args.policy {
        return policy;
    }
    if args.full_frame || args.clean || args.refresh {
        return EnginePolicy::from_flags(args.full_frame, args.clean, args.refresh);
    }
    config.engine.default_policy
}

fn run_options(args: &Args, config: &CinderConfig) -> RunOptions {
    let selection = match &args.selection {
        Some(JsonValue::Array(items)) => items.clone(),
        Some(JsonValue::Null) | None => Vec::new(),
        Some(single) => vec![single.clone()],
    };
    let host = args.host.clone().unwrap_or_else(|| {
        serde_json::json!({
            "name": "cinder",
            "version": env!("CARGO_PKG_VERSION"),
        })
    });

    RunOptions {
        extension: args.extension.clone(),
        bundle: args.bundle.clone(),
        policy: resolve_policy(args, config),
        // Config paths are appended by the manager after these.
        search_paths: args.search_paths.clone(),
        host,
        document: args.document.clone(),
        selection,
        data: args.data.clone().unwrap_or(JsonValue::Null),
        debug_mode: args.debug_mode || config.debug,
        alternate: args.alternate,
        print_results: args.print_results,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let resolver = CliConfigResolver::from_args(&args);
    let config = resolver
        .resolve(ConfigLoader::new())
        .map_err(|e| anyhow::anyhow!("Config error: {e}"))?;

    // Filter: --debug > --verbose > RUST_LOG env > config.logging.level
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else if args.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();

    info!(path = %resolver.project_root.display(), "Project root");

    let manager = EngineManager::from_config(&config);
    let opts = run_options(&args, &config);
    let mut stdout = std::io::stdout();

    for script in &args.scripts {
        if let Err(e) = runner::run_script(&manager, script, &opts, OutputStream::stdout(), &mut stdout)
        {
            error!(script = %script.display(), "Script failed");
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }

    info!(cached = manager.cache().len(), "All scripts finished");
    Ok(())
}
