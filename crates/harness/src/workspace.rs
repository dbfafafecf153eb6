//! Git workspace operations: baseline capture, cleanliness checks with the
//! harness-managed-directory allowlist, scoped staging, rollback, and
//! scoped tree hashing. All commands run with a bounded timeout.

use std::collections::BTreeSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::process;

const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

fn git_program() -> String {
    env::var("HARNESS_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<process::CommandOutput> {
    process::run_command_with_timeout(&git_program(), args, dir, Some(DEFAULT_GIT_TIMEOUT))
}

/// True if `dir` is inside a git working tree.
pub fn is_git_repo(dir: &Path) -> Result<bool> {
    let out = run_git(dir, &["rev-parse", "--is-inside-work-tree"])?;
    Ok(out.exit_code == 0 && out.stdout.trim() == "true")
}

/// The current `HEAD` commit SHA, used as the rollback baseline.
pub fn baseline_commit(dir: &Path) -> Result<String> {
    let out = run_git(dir, &["rev-parse", "HEAD"])?;
    if out.exit_code != 0 {
        bail!("git rev-parse HEAD failed: {}", out.stderr.trim());
    }
    Ok(out.stdout.trim().to_string())
}

/// Parse the NUL-delimited output of `git status --porcelain -z`, dropping
/// the pre-rename path of renamed/copied entries and keeping only each
/// entry's (new) path.
fn parse_porcelain_z(stdout: &str) -> Vec<String> {
    let fields: Vec<&str> = stdout.split('\0').filter(|s| !s.is_empty()).collect();
    let mut paths = Vec::new();
    let mut i = 0;
    while i < fields.len() {
        let entry = fields[i];
        // Status code is two chars followed by a space, then the path.
        let status_code = &entry[..entry.len().min(2)];
        let path = entry.get(3..).unwrap_or("").to_string();
        let is_rename_or_copy = status_code.contains('R') || status_code.contains('C');
        paths.push(path);
        if is_rename_or_copy {
            // The next field is the original path; consume and discard it.
            i += 1;
        }
        i += 1;
    }
    paths
}

/// True if `path` (or its first path component) lies within the
/// harness-managed environment directory and should be ignored by
/// cleanliness/drift checks.
fn is_within_harness_dir(path: &str, harness_dir_name: &str) -> bool {
    let first_segment = path.split('/').next().unwrap_or("");
    first_segment == harness_dir_name && path.contains('/')
        || path == harness_dir_name && path.ends_with('/')
}

/// `git status --porcelain -z`, with any entry inside the harness-managed
/// directory ignored. An empty remainder means clean.
pub fn is_clean(dir: &Path, harness_dir_name: &str) -> Result<bool> {
    let out = run_git(dir, &["status", "--porcelain", "-z"])?;
    if out.exit_code != 0 {
        bail!("git status failed: {}", out.stderr.trim());
    }
    let paths = parse_porcelain_z(&out.stdout);
    let remainder: Vec<&String> = paths
        .iter()
        .filter(|p| !is_within_harness_dir(p, harness_dir_name))
        .collect();
    Ok(remainder.is_empty())
}

/// `reset --hard baseline` followed by `clean -fdx -e <harness-managed-dir>`.
/// Returns an error (with a remediation hint) if either step fails or if
/// the tree is not clean afterward.
pub fn rollback(dir: &Path, baseline: &str, harness_dir_name: &str) -> Result<()> {
    let reset = run_git(dir, &["reset", "--hard", baseline])?;
    if reset.exit_code != 0 {
        bail!(
            "rollback failed: git reset --hard {baseline} exited {}: {}. \
             Manual remediation: inspect the working tree and re-run \
             `git reset --hard {baseline}` by hand.",
            reset.exit_code,
            reset.stderr.trim()
        );
    }

    let exclude_arg = format!("{harness_dir_name}/");
    let clean = run_git(dir, &["clean", "-fdx", "-e", &exclude_arg])?;
    if clean.exit_code != 0 {
        bail!(
            "rollback failed: git clean -fdx -e {exclude_arg} exited {}: {}. \
             Manual remediation: run `git clean -fdx -e {exclude_arg}` by hand.",
            clean.exit_code,
            clean.stderr.trim()
        );
    }

    if !is_clean(dir, harness_dir_name)? {
        bail!(
            "rollback failed: working tree still dirty after reset+clean. \
             Manual remediation: inspect `git status --porcelain -z` for \
             entries outside {harness_dir_name}/."
        );
    }

    Ok(())
}

/// Stage only `touched_files`, write a tree object, then reset the index
/// back to its prior state. Used as a reproducibility fingerprint of the
/// changes a single attempt made, without mutating the index long-term.
pub fn scoped_tree_hash(dir: &Path, touched_files: &[String]) -> Result<String> {
    if touched_files.is_empty() {
        let out = run_git(dir, &["write-tree"])?;
        if out.exit_code != 0 {
            bail!("git write-tree failed: {}", out.stderr.trim());
        }
        return Ok(out.stdout.trim().to_string());
    }

    let mut add_args: Vec<&str> = vec!["add", "--"];
    add_args.extend(touched_files.iter().map(|s| s.as_str()));
    let add = run_git(dir, &add_args)?;
    if add.exit_code != 0 {
        bail!("git add failed: {}", add.stderr.trim());
    }

    let tree = run_git(dir, &["write-tree"])?;
    if tree.exit_code != 0 {
        // Best-effort: still try to reset the index before bailing.
        let _ = run_git(dir, &["reset"]);
        bail!("git write-tree failed: {}", tree.stderr.trim());
    }

    let reset = run_git(dir, &["reset"])?;
    if reset.exit_code != 0 {
        bail!("git reset (post write-tree) failed: {}", reset.stderr.trim());
    }

    Ok(tree.stdout.trim().to_string())
}

/// Scoped add + commit. If nothing was staged, returns the current `HEAD`
/// without erroring.
pub fn commit(dir: &Path, message: &str, touched_files: &[String]) -> Result<String> {
    if !touched_files.is_empty() {
        let mut add_args: Vec<&str> = vec!["add", "--"];
        add_args.extend(touched_files.iter().map(|s| s.as_str()));
        let add = run_git(dir, &add_args)?;
        if add.exit_code != 0 {
            bail!("git add failed: {}", add.stderr.trim());
        }
    }

    let diff = run_git(dir, &["diff", "--cached", "--quiet"])?;
    if diff.exit_code == 0 {
        // Nothing staged.
        return baseline_commit(dir);
    }

    let commit_out = run_git(dir, &["commit", "-m", message])?;
    if commit_out.exit_code != 0 {
        bail!("git commit failed: {}", commit_out.stderr.trim());
    }

    baseline_commit(dir)
}

/// Clone `url` into `dest` (which must not yet exist) at `git_ref`, then
/// return the resulting `HEAD` SHA. `dest`'s parent is created if needed.
pub fn clone_at_ref(url: &str, dest: &Path, git_ref: &str) -> Result<String> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let dest_str = dest.to_string_lossy().to_string();
    let out = process::run_command_with_timeout(
        &git_program(),
        &["clone", "--branch", git_ref, "--single-branch", url, &dest_str],
        parent_or_cwd(dest),
        Some(CLONE_TIMEOUT),
    )?;
    if out.exit_code != 0 {
        bail!("git clone failed: {}", out.stderr.trim());
    }
    baseline_commit(dest)
}

fn parent_or_cwd(dest: &Path) -> &Path {
    dest.parent().unwrap_or(dest)
}

/// Create and check out a new local branch from the current `HEAD`.
pub fn create_branch(dir: &Path, branch: &str) -> Result<()> {
    let out = run_git(dir, &["checkout", "-b", branch])?;
    if out.exit_code != 0 {
        bail!("git checkout -b {branch} failed: {}", out.stderr.trim());
    }
    Ok(())
}

/// Push `branch` to `origin`, creating the upstream tracking ref.
pub fn push_branch(dir: &Path, branch: &str) -> Result<()> {
    let out = run_git(dir, &["push", "--set-upstream", "origin", branch]);
    match out {
        Ok(o) if o.exit_code == 0 => Ok(()),
        Ok(o) => bail!("git push failed: {}", o.stderr.trim()),
        Err(e) => bail!("git push failed: {e}"),
    }
}

/// The set of paths that are modified/untracked but are neither in
/// `touched_files` nor inside the harness-managed directory. A non-empty
/// result signals verification-time side effects polluting the tree.
pub fn drift(dir: &Path, touched_files: &[String], harness_dir_name: &str) -> Result<BTreeSet<String>> {
    let out = run_git(dir, &["status", "--porcelain", "-z"])?;
    if out.exit_code != 0 {
        bail!("git status failed: {}", out.stderr.trim());
    }
    let touched: BTreeSet<&str> = touched_files.iter().map(|s| s.as_str()).collect();
    let paths = parse_porcelain_z(&out.stdout);
    Ok(paths
        .into_iter()
        .filter(|p| !is_within_harness_dir(p, harness_dir_name) && !touched.contains(p.as_str()))
        .collect())
}
