//! Timeout-bounded subprocess execution with truncated stdout/stderr
//! capture to files and a sandbox environment for acceptance/verify
//! commands.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use harness_types::CmdResult;

/// Maximum length of the truncated stdout/stderr embedded in [`CmdResult`].
pub const TRUNCATION_LIMIT: usize = 2000;
const TRUNCATION_MARKER: &str = "\u{2026}[truncated]";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Execute `program args` in `working_dir`, optionally bounded by `timeout`.
/// Used internally for harness-owned plumbing (git, env provisioning) where
/// only in-memory output is needed. For acceptance/verify commands, prefer
/// [`run`], which persists full output to files.
pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);

    let (exit_code, stdout, stderr, timed_out) = if let Some(timeout_dur) = timeout {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn command")?;
        wait_with_timeout(&mut child, timeout_dur)?
    } else {
        let output = command.output().context("failed to execute command")?;
        (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            false,
        )
    };

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn wait_with_timeout(child: &mut Child, timeout_dur: Duration) -> Result<(i32, String, String, bool)> {
    let deadline = Instant::now() + timeout_dur;
    loop {
        match child.try_wait().context("failed to poll command")? {
            Some(status) => {
                let (out, err) = drain(child);
                return Ok((status.code().unwrap_or(-1), out, err, false));
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let (out, mut err) = drain(child);
                    err.push_str(&format!(
                        "\ncommand timed out after {}",
                        humantime::format_duration(timeout_dur)
                    ));
                    return Ok((124, out, err, true));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn drain(child: &mut Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

fn truncate(s: &str) -> String {
    if s.len() <= TRUNCATION_LIMIT {
        s.to_string()
    } else {
        let mut out = s.chars().take(TRUNCATION_LIMIT).collect::<String>();
        out.push_str(TRUNCATION_MARKER);
        out
    }
}

/// A sandbox environment synthesized when the caller doesn't supply one:
/// disables interpreter bytecode caching so acceptance/verify runs never
/// pollute the target repo with `__pycache__`-style artifacts.
pub fn sandbox_env(base_env: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut env = base_env.cloned().unwrap_or_default();
    env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
    env.insert("PIP_NO_CACHE_DIR".to_string(), "1".to_string());
    env
}

/// Run `cmd` (an already-tokenized argv, `shell=false`) in `cwd`, writing
/// full stdout/stderr to `stdout_path`/`stderr_path` and returning a
/// [`CmdResult`] with truncated excerpts. A `None` exit status from the
/// OS (killed by signal) surfaces as `-1`; a timeout surfaces as exit 124.
pub fn run(
    cmd: &[String],
    cwd: &Path,
    timeout: Duration,
    stdout_path: &Path,
    stderr_path: &Path,
    env: Option<&BTreeMap<String, String>>,
) -> Result<CmdResult> {
    let start = Instant::now();
    let Some((program, args)) = cmd.split_first() else {
        anyhow::bail!("empty command");
    };

    let mut command = Command::new(program);
    command.args(args).current_dir(cwd);

    let effective_env = match env {
        Some(e) => e.clone(),
        None => sandbox_env(None),
    };
    command.envs(&effective_env);

    let spawned = command.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn();

    let (exit_code, stdout, stderr) = match spawned {
        Ok(mut child) => {
            let (code, out, err, _timed_out) = wait_with_timeout(&mut child, timeout)?;
            (code, out, err)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (127, String::new(), format!("command not found: {program}"))
        }
        Err(e) => return Err(e).context("failed to spawn command"),
    };

    write_full(stdout_path, &stdout)?;
    write_full(stderr_path, &stderr)?;

    Ok(CmdResult {
        command: cmd.to_vec(),
        exit_code,
        stdout_trunc: truncate(&stdout),
        stderr_trunc: truncate(&stderr),
        stdout_path: stdout_path.to_path_buf(),
        stderr_path: stderr_path.to_path_buf(),
        duration_seconds: start.elapsed().as_secs_f64(),
    })
}

fn write_full(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut f = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    f.write_all(content.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn default_output_paths(out_dir: &Path, label: &str) -> (PathBuf, PathBuf) {
    (
        out_dir.join(format!("{label}.stdout.txt")),
        out_dir.join(format!("{label}.stderr.txt")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn truncates_long_output() {
        let s = "x".repeat(TRUNCATION_LIMIT + 100);
        let t = truncate(&s);
        assert!(t.ends_with(TRUNCATION_MARKER));
        assert_eq!(t.len(), TRUNCATION_LIMIT + TRUNCATION_MARKER.len());
    }

    #[test]
    fn short_output_untouched() {
        assert_eq!(truncate("hello"), "hello");
    }

    #[test]
    fn run_captures_exit_code_and_writes_files() {
        let td = tempdir().unwrap();
        let (out, err) = default_output_paths(td.path(), "t1");
        let cmd = vec!["sh".to_string(), "-c".to_string(), "echo hi; exit 3".to_string()];
        let result = run(&cmd, td.path(), Duration::from_secs(5), &out, &err, None).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout_trunc.trim(), "hi");
        assert!(out.exists());
    }

    #[test]
    fn run_times_out_with_exit_124() {
        let td = tempdir().unwrap();
        let (out, err) = default_output_paths(td.path(), "t2");
        let cmd = vec!["sleep".to_string(), "5".to_string()];
        let result = run(&cmd, td.path(), Duration::from_millis(100), &out, &err, None).unwrap();
        assert_eq!(result.exit_code, 124);
        assert!(result.stderr_trunc.contains("timed out"));
    }

    #[test]
    fn run_missing_binary_exits_127() {
        let td = tempdir().unwrap();
        let (out, err) = default_output_paths(td.path(), "t3");
        let cmd = vec!["definitely-not-a-real-binary-xyz".to_string()];
        let result = run(&cmd, td.path(), Duration::from_secs(5), &out, &err, None).unwrap();
        assert_eq!(result.exit_code, 127);
    }

    #[test]
    fn sandbox_env_disables_bytecode_cache() {
        let env = sandbox_env(None);
        assert_eq!(env.get("PYTHONDONTWRITEBYTECODE").map(String::as_str), Some("1"));
    }
}
