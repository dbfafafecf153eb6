//! Per-repo isolated interpreter environment manager. Acceptance and
//! verify commands resolve their interpreter and test runner to a
//! controlled install under `<repo>/.harness_env/`, independent of the
//! harness process's own environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::process;

/// Name of the per-repo managed environment directory. Excluded from
/// cleanliness/drift checks and from the outer rollback wipe.
pub const HARNESS_ENV_DIR: &str = ".harness_env";
const SENTINEL_FILE: &str = ".provisioned";
const PROVISION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RepoRuntime {
    pub env_root: PathBuf,
}

fn bin_dir(env_root: &Path) -> PathBuf {
    if cfg!(windows) {
        env_root.join("Scripts")
    } else {
        env_root.join("bin")
    }
}

fn interpreter_path(env_root: &Path) -> PathBuf {
    bin_dir(env_root).join(if cfg!(windows) { "python.exe" } else { "python3" })
}

fn sentinel_path(env_root: &Path) -> PathBuf {
    env_root.join(SENTINEL_FILE)
}

/// Idempotently ensure a provisioned environment exists for `repo`, rebuilding
/// it if the sentinel is present but the interpreter binary is missing
/// (corruption or partial rollback).
pub fn ensure(repo: &Path) -> Result<RepoRuntime> {
    let env_root = repo.join(HARNESS_ENV_DIR);
    let sentinel = sentinel_path(&env_root);
    let interpreter = interpreter_path(&env_root);

    if sentinel.exists() && interpreter.exists() {
        return Ok(RepoRuntime { env_root });
    }

    if env_root.exists() {
        std::fs::remove_dir_all(&env_root)
            .with_context(|| format!("failed to clear stale env at {}", env_root.display()))?;
    }

    provision(&env_root)?;
    Ok(RepoRuntime { env_root })
}

fn provision(env_root: &Path) -> Result<()> {
    run_step("python3", &["-m", "venv", env_root.to_str().unwrap_or_default()], repo_parent(env_root))?;

    let python = interpreter_path(env_root);
    let python_str = python.to_str().context("non-utf8 interpreter path")?;

    run_step(python_str, &["-m", "pip", "install", "--upgrade", "pip"], repo_parent(env_root))?;
    run_step(python_str, &["-m", "pip", "install", "pytest"], repo_parent(env_root))?;

    std::fs::write(sentinel_path(env_root), "ok")
        .with_context(|| format!("failed to write sentinel at {}", env_root.display()))?;
    Ok(())
}

fn repo_parent(env_root: &Path) -> &Path {
    env_root.parent().unwrap_or(env_root)
}

fn run_step(program: &str, args: &[&str], cwd: &Path) -> Result<()> {
    let out = process::run_command_with_timeout(program, args, cwd, Some(PROVISION_TIMEOUT))
        .with_context(|| format!("failed to run {program} {}", args.join(" ")))?;
    if out.exit_code != 0 {
        bail!(
            "environment provisioning step `{program} {}` failed (exit {}): {}",
            args.join(" "),
            out.exit_code,
            sanitize_for_error(&out.stderr)
        );
    }
    Ok(())
}

fn sanitize_for_error(stderr: &str) -> String {
    crate::validators::sanitize(stderr)
}

/// Build the execution environment mapping for commands run under a
/// provisioned environment: prefixes the env's binary directory onto
/// `PATH`, sets a `VIRTUAL_ENV`-style variable, and preserves any sandbox
/// variables already present in `base_env`.
pub fn env_for(env_root: &Path, base_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = base_env.clone();
    let bin = bin_dir(env_root);
    let existing_path = env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();
    let new_path = format!("{}:{existing_path}", bin.display());
    env.insert("PATH".to_string(), new_path);
    env.insert(
        "VIRTUAL_ENV".to_string(),
        env_root.to_string_lossy().to_string(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_for_prefixes_path_and_sets_virtual_env() {
        let root = PathBuf::from("/repo/.harness_env");
        let base = BTreeMap::from([("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())]);
        let env = env_for(&root, &base);
        assert!(env.get("PATH").unwrap().starts_with("/repo/.harness_env/bin:"));
        assert_eq!(env.get("VIRTUAL_ENV").unwrap(), "/repo/.harness_env");
        assert_eq!(env.get("PYTHONDONTWRITEBYTECODE").unwrap(), "1");
    }

    #[test]
    fn sentinel_and_interpreter_paths_are_under_env_root() {
        let td = tempdir().unwrap();
        let env_root = td.path().join(HARNESS_ENV_DIR);
        assert_eq!(sentinel_path(&env_root), env_root.join(SENTINEL_FILE));
        assert!(interpreter_path(&env_root).starts_with(&env_root));
    }
}
