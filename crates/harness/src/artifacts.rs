//! Artifact persistence: registering factory-produced files as
//! [`Artifact`] records in the run store. Files themselves already live on
//! disk (written by [`crate::factory`]); this module records their metadata
//! — size, sha256, content type — and retrieves their bytes for the HTTP
//! download route.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use harness_types::Artifact;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::store::RunStore;

/// Register the file at `path` (named `name` in the artifact index) for
/// `run_id`, computing its size and sha256 from disk.
pub fn save_artifact(store: &dyn RunStore, run_id: Uuid, name: &str, path: &Path) -> Result<Artifact> {
    let bytes = fs::read(path).with_context(|| format!("failed to read artifact {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());

    store.add_artifact(Artifact {
        id: 0,
        run_id,
        name: name.to_string(),
        path: path.to_path_buf(),
        content_type: content_type_for(name),
        bytes: bytes.len() as u64,
        sha256,
        created_at: Utc::now(),
    })
}

/// Register every file directly inside `attempt_dir` (an `attempt_N`
/// directory written by the factory) under a name prefixed with the
/// iteration number, e.g. `iter_2/se_prompt.txt`.
pub fn save_iteration_artifacts(
    store: &dyn RunStore,
    run_id: Uuid,
    iteration: u32,
    attempt_dir: &Path,
) -> Result<Vec<Artifact>> {
    let mut saved = Vec::new();
    let Ok(entries) = fs::read_dir(attempt_dir) else {
        return Ok(saved);
    };
    let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).filter(|p| p.is_file()).collect();
    paths.sort();
    for path in paths {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let name = format!("iter_{iteration}/{file_name}");
        saved.push(save_artifact(store, run_id, &name, &path)?);
    }
    Ok(saved)
}

/// Register `<out_dir>/run_summary.json`, the factory's terminal artifact.
pub fn save_run_summary(store: &dyn RunStore, run_id: Uuid, out_dir: &Path) -> Result<Artifact> {
    save_artifact(store, run_id, "run_summary.json", &out_dir.join("run_summary.json"))
}

fn content_type_for(name: &str) -> String {
    if name.ends_with(".json") {
        "application/json".to_string()
    } else {
        "text/plain".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileRunStore;
    use harness_types::{CommandSpec, Run, RunStatus, WorkOrder, WritebackSpec};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn sample_run(id: Uuid) -> Run {
        Run {
            id,
            status: RunStatus::Running,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            idempotency_key: None,
            repo_url: "https://github.com/acme/widgets".to_string(),
            repo_ref: "main".to_string(),
            git_sha: None,
            work_order: WorkOrder {
                id: "WO-01".to_string(),
                title: "t".to_string(),
                intent: "i".to_string(),
                allowed_files: vec![],
                forbidden: vec![],
                acceptance_commands: vec![CommandSpec { command: "true".to_string(), shell: false, timeout_sec: 10 }],
                context_files: vec![],
                preconditions: vec![],
                postconditions: vec![],
                verify_exempt: false,
                notes: None,
                env: Default::default(),
            },
            work_order_body: "{}".to_string(),
            params: serde_json::json!({}),
            writeback: WritebackSpec::default(),
            iteration: 0,
            queue_job_id: None,
            result_summary: None,
            error: None,
            artifact_root: PathBuf::from("/tmp/artifacts"),
        }
    }

    #[test]
    fn save_artifact_records_size_and_hash() {
        let td = tempdir().unwrap();
        let store = FileRunStore::open(td.path().join("store")).unwrap();
        let run_id = Uuid::now_v7();
        store.create(sample_run(run_id)).unwrap();

        let file_path = td.path().join("run_summary.json");
        fs::write(&file_path, b"{\"verdict\":\"pass\"}").unwrap();

        let artifact = save_artifact(&store, run_id, "run_summary.json", &file_path).unwrap();
        assert_eq!(artifact.name, "run_summary.json");
        assert_eq!(artifact.bytes, 20);
        assert_eq!(artifact.content_type, "application/json");

        let listed = store.list_artifacts(run_id).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn save_iteration_artifacts_prefixes_names_with_iteration() {
        let td = tempdir().unwrap();
        let store = FileRunStore::open(td.path().join("store")).unwrap();
        let run_id = Uuid::now_v7();
        store.create(sample_run(run_id)).unwrap();

        let attempt_dir = td.path().join("attempt_1");
        fs::create_dir_all(&attempt_dir).unwrap();
        fs::write(attempt_dir.join("se_prompt.txt"), b"hello").unwrap();
        fs::write(attempt_dir.join("write_result.json"), b"{}").unwrap();

        let saved = save_iteration_artifacts(&store, run_id, 1, &attempt_dir).unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().any(|a| a.name == "iter_1/se_prompt.txt"));
        assert!(saved.iter().any(|a| a.name == "iter_1/write_result.json"));
    }
}
