//! Run store: `RunStore` trait plus a file-backed JSON implementation.
//!
//! A trait plus an atomic-file-per-run implementation satisfies the
//! persistence contract without pulling in an unused sea-orm/sqlx
//! dependency for a SQL engine this crate doesn't otherwise need. One JSON
//! file per run under `<root>/runs/<id>.json`, one
//! append-only JSONL event log per run via [`harness_events::EventLog`], and
//! one directory per run for artifact metadata.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use harness_events::EventLog;
use harness_types::{Artifact, Event, Run, RunStatus};
use uuid::Uuid;

/// Storage contract for runs, their event logs, and their artifact metadata.
/// Implementations must make `create` fail on a duplicate `idempotency_key`
/// and must preserve event ordering within a single run.
pub trait RunStore: Send + Sync {
    fn create(&self, run: Run) -> Result<Run>;
    fn get(&self, id: Uuid) -> Result<Option<Run>>;
    fn update(&self, run: &Run) -> Result<()>;
    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>>;
    fn append_event(&self, event: Event) -> Result<Event>;
    fn list_events(&self, run_id: Uuid) -> Result<Vec<Event>>;
    fn add_artifact(&self, artifact: Artifact) -> Result<Artifact>;
    fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>>;
}

/// A file-per-run JSON store under `root`. A single in-process [`Mutex`]
/// serializes writes; each run's events are additionally serialized by the
/// per-run event log file, matching a "short-lived session, commit on
/// success" access discipline.
pub struct FileRunStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRunStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("runs"))
            .with_context(|| format!("failed to create {}", root.join("runs").display()))?;
        fs::create_dir_all(root.join("events"))
            .with_context(|| format!("failed to create {}", root.join("events").display()))?;
        fs::create_dir_all(root.join("artifacts"))
            .with_context(|| format!("failed to create {}", root.join("artifacts").display()))?;
        Ok(Self { root, write_lock: Mutex::new(()) })
    }

    fn run_path(&self, id: Uuid) -> PathBuf {
        self.root.join("runs").join(format!("{id}.json"))
    }

    fn events_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("events").join(run_id.to_string())
    }

    fn artifacts_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join("artifacts").join(format!("{run_id}.json"))
    }

    fn read_run(&self, id: Uuid) -> Result<Option<Run>> {
        let path = self.run_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let run: Run = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse run JSON {}", path.display()))?;
        Ok(Some(run))
    }

    fn read_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>> {
        let path = self.artifacts_path(run_id);
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let artifacts: Vec<Artifact> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse artifacts JSON {}", path.display()))?;
        Ok(artifacts)
    }
}

impl RunStore for FileRunStore {
    fn create(&self, run: Run) -> Result<Run> {
        let _guard = self.write_lock.lock().unwrap();

        if let Some(key) = &run.idempotency_key
            && self.find_by_idempotency_key_locked(key)?.is_some()
        {
            bail!("idempotency_key `{key}` already exists");
        }

        atomic_write_json(&self.run_path(run.id), &run)?;
        Ok(run)
    }

    fn get(&self, id: Uuid) -> Result<Option<Run>> {
        self.read_run(id)
    }

    fn update(&self, run: &Run) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if self.read_run(run.id)?.is_none() {
            bail!("no such run {}", run.id);
        }
        atomic_write_json(&self.run_path(run.id), run)
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>> {
        let _guard = self.write_lock.lock().unwrap();
        self.find_by_idempotency_key_locked(key)
    }

    fn append_event(&self, event: Event) -> Result<Event> {
        let _guard = self.write_lock.lock().unwrap();
        let mut log = EventLog::open(&self.events_dir(event.run_id))?;
        log.append(event.run_id, event.level, event.kind, event.iteration, event.payload)
    }

    fn list_events(&self, run_id: Uuid) -> Result<Vec<Event>> {
        let dir = self.events_dir(run_id);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let log = EventLog::open(&dir)?;
        log.read_all()
    }

    fn add_artifact(&self, artifact: Artifact) -> Result<Artifact> {
        let _guard = self.write_lock.lock().unwrap();
        let mut artifacts = self.read_artifacts(artifact.run_id)?;
        let mut artifact = artifact;
        artifact.id = artifacts.len() as u64 + 1;
        artifacts.push(artifact.clone());
        atomic_write_json(&self.artifacts_path(artifact.run_id), &artifacts)?;
        Ok(artifact)
    }

    fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>> {
        self.read_artifacts(run_id)
    }
}

impl FileRunStore {
    fn find_by_idempotency_key_locked(&self, key: &str) -> Result<Option<Run>> {
        let runs_dir = self.root.join("runs");
        for entry in fs::read_dir(&runs_dir)
            .with_context(|| format!("failed to read {}", runs_dir.display()))?
        {
            let entry = entry?;
            let content = fs::read_to_string(entry.path())?;
            let Ok(run) = serde_json::from_str::<Run>(&content) else { continue };
            if run.idempotency_key.as_deref() == Some(key) {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }
}

/// True if `status` is a terminal run status (no further transitions expected).
pub fn is_terminal(status: RunStatus) -> bool {
    matches!(status, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled | RunStatus::Error)
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    {
        let mut f = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use harness_types::{CommandSpec, EventKind, EventLevel, WorkOrder, WritebackSpec};
    use tempfile::tempdir;

    fn sample_work_order() -> WorkOrder {
        WorkOrder {
            id: "WO-01".to_string(),
            title: "t".to_string(),
            intent: "i".to_string(),
            allowed_files: vec!["a.txt".to_string()],
            forbidden: vec![],
            acceptance_commands: vec![CommandSpec {
                command: "true".to_string(),
                shell: false,
                timeout_sec: 10,
            }],
            context_files: vec![],
            preconditions: vec![],
            postconditions: vec![],
            verify_exempt: false,
            notes: None,
            env: Default::default(),
        }
    }

    fn sample_run(id: Uuid, idempotency_key: Option<&str>) -> Run {
        Run {
            id,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            idempotency_key: idempotency_key.map(str::to_string),
            repo_url: "https://github.com/acme/widgets".to_string(),
            repo_ref: "main".to_string(),
            git_sha: None,
            work_order: sample_work_order(),
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
    fn create_then_get_roundtrips() {
        let td = tempdir().unwrap();
        let store = FileRunStore::open(td.path()).unwrap();
        let id = Uuid::now_v7();
        let run = sample_run(id, None);
        store.create(run.clone()).unwrap();
        let loaded = store.get(id).unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.status, RunStatus::Pending);
    }

    #[test]
    fn create_rejects_duplicate_idempotency_key() {
        let td = tempdir().unwrap();
        let store = FileRunStore::open(td.path()).unwrap();
        let run1 = sample_run(Uuid::now_v7(), Some("key-1"));
        store.create(run1).unwrap();
        let run2 = sample_run(Uuid::now_v7(), Some("key-1"));
        assert!(store.create(run2).is_err());
    }

    #[test]
    fn update_requires_existing_run() {
        let td = tempdir().unwrap();
        let store = FileRunStore::open(td.path()).unwrap();
        let run = sample_run(Uuid::now_v7(), None);
        assert!(store.update(&run).is_err());
    }

    #[test]
    fn update_persists_status_transition() {
        let td = tempdir().unwrap();
        let store = FileRunStore::open(td.path()).unwrap();
        let mut run = sample_run(Uuid::now_v7(), None);
        store.create(run.clone()).unwrap();
        run.status = RunStatus::Running;
        store.update(&run).unwrap();
        let loaded = store.get(run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
    }

    #[test]
    fn events_are_appended_in_order_with_increasing_ids() {
        let td = tempdir().unwrap();
        let store = FileRunStore::open(td.path()).unwrap();
        let run_id = Uuid::now_v7();
        for kind in [EventKind::RunStart, EventKind::SeOutput, EventKind::RunEnd] {
            store
                .append_event(Event {
                    id: 0,
                    run_id,
                    ts: Utc::now(),
                    level: EventLevel::Info,
                    kind,
                    iteration: None,
                    payload: serde_json::json!({}),
                })
                .unwrap();
        }
        let events = store.list_events(run_id).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, 1);
        assert_eq!(events[2].id, 3);
        assert_eq!(events[2].kind, EventKind::RunEnd);
    }

    #[test]
    fn artifacts_accumulate_with_increasing_ids() {
        let td = tempdir().unwrap();
        let store = FileRunStore::open(td.path()).unwrap();
        let run_id = Uuid::now_v7();
        for name in ["a.txt", "b.txt"] {
            store
                .add_artifact(Artifact {
                    id: 0,
                    run_id,
                    name: name.to_string(),
                    path: PathBuf::from(format!("/tmp/{name}")),
                    content_type: "text/plain".to_string(),
                    bytes: 10,
                    sha256: "abc".to_string(),
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let artifacts = store.list_artifacts(run_id).unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[1].id, 2);
    }

    #[test]
    fn is_terminal_classifies_statuses() {
        assert!(is_terminal(RunStatus::Succeeded));
        assert!(is_terminal(RunStatus::Failed));
        assert!(is_terminal(RunStatus::Canceled));
        assert!(is_terminal(RunStatus::Error));
        assert!(!is_terminal(RunStatus::Pending));
        assert!(!is_terminal(RunStatus::Running));
    }
}
