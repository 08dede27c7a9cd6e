//! Shared E2E test helpers for `cinder` binary tests.

use assert_cmd::cargo::cargo_bin_cmd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for CLI tests.
pub const TIMEOUT_BASIC: Duration = Duration::from_secs(10);

/// Environment variables that would leak host configuration into tests.
const CONFIG_VARS: &[&str] = &[
    "CINDER_DEBUG",
    "CINDER_MEMORY_LIMIT_MB",
    "CINDER_FULL_GC",
    "CINDER_POLICY",
    "CINDER_SEARCH_PATH",
    "CINDER_LOG_LEVEL",
    "RUST_LOG",
];

/// Build a Command for the `cinder` binary isolated from user config.
///
/// HOME points at a fresh temp directory and the project root is that
/// same directory. Returns (command, _guard); keep the guard alive for the
/// test's duration.
pub fn cinder_cmd() -> (assert_cmd::Command, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("create temp dir for project");
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("cinder");
    cmd.timeout(TIMEOUT_BASIC);
    for var in CONFIG_VARS {
        cmd.env_remove(var);
    }
    cmd.env("HOME", tmp.path());
    cmd.args(["-C", tmp.path().to_str().expect("valid utf8")]);
    (cmd, tmp)
}

/// Writes a script (creating parent directories) and returns its path.
pub fn write_script(dir: &Path, relative: &str, body: &str) -> PathBuf {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create script dir");
    }
    std::fs::write(&path, body).expect("write script");
    path
}
