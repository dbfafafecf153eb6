//! Job queue + worker: submit a run keyed by its id, and a worker that
//! consumes one run at a time end-to-end — clone, factory invocation,
//! artifact/event persistence, optional writeback, terminal status
//! transition.
//!
//! Any external job-queue product is out of scope; only the
//! submit/consume/timeout contract is implemented here, via an in-process
//! `tokio::sync::mpsc` channel run under a multi-threaded Tokio runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use harness_types::{Event, EventKind, EventLevel, Run, RunStatus, WorkOrder};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::factory::{self, FactoryConfig, FactoryExitVerdict};
use crate::llm::LlmClient;
use crate::store::{self, RunStore};
use crate::validators;
use crate::workspace;
use crate::{artifacts, runtime};

/// Outer kill-switch: the queue job itself is abandoned past this duration,
/// independent of any more granular timeout (subprocess, LLM poll) inside
/// the factory invocation.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Submit/consume contract for the external job-queue product.
pub trait JobQueue: Send + Sync {
    fn submit(&self, run_id: Uuid) -> Result<()>;
}

/// An in-process, FIFO-best-effort queue backed by an unbounded `mpsc`
/// channel. One worker consumes one run at a time; many `InProcessQueue`
/// handles may enqueue concurrently.
#[derive(Clone)]
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl InProcessQueue {
    /// Create a queue and its receiver half. The receiver is handed to
    /// [`Worker::serve`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobQueue for InProcessQueue {
    fn submit(&self, run_id: Uuid) -> Result<()> {
        self.tx.send(run_id).context("failed to enqueue run: worker channel closed")
    }
}

/// Everything the worker needs to execute a run end-to-end, independent of
/// where the run record itself came from.
pub struct WorkerConfig {
    /// Root under which each run gets its own `<root>/<run_id>/repo` clone.
    pub workspace_root: PathBuf,
    /// Root under which factory/planner artifacts are written, passed to
    /// [`FactoryConfig::out_dir`] as `<artifacts_root>/factory/<run_id>`.
    pub artifacts_root: PathBuf,
    pub llm_model: String,
    pub llm_base_url: String,
}

pub struct Worker {
    store: Arc<dyn RunStore>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(store: Arc<dyn RunStore>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    /// Drain `rx`, running each job to completion (subject to the outer
    /// [`JOB_TIMEOUT`]) before consuming the next one — single-run-at-a-time
    /// per worker.
    pub async fn serve(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(run_id) = rx.recv().await {
            let worker = Arc::clone(&self);
            let job = tokio::task::spawn_blocking(move || worker.run_job(run_id));
            match tokio::time::timeout(JOB_TIMEOUT, job).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!(%run_id, error = %e, "run_job returned an error"),
                Ok(Err(join_err)) => error!(%run_id, error = %join_err, "run_job panicked"),
                Err(_) => error!(%run_id, "run_job exceeded the 1h job timeout"),
            }
        }
    }

    /// Execute one run to a terminal status. Mirrors `run_job(run_id)`:
    /// load → transition RUNNING → clone → factory → persist artifacts →
    /// writeback → terminal transition. Any step that can fail after
    /// `RUNNING` has been recorded marks the run `FAILED` rather than
    /// propagating, so a `Run` row is never left stuck mid-flight.
    pub fn run_job(&self, run_id: Uuid) -> Result<()> {
        let Some(mut run) = self.store.get(run_id)? else {
            anyhow::bail!("no such run {run_id}");
        };

        if run.status == RunStatus::Canceled {
            info!(%run_id, "run already canceled before start; exiting cleanly");
            return Ok(());
        }

        run.status = RunStatus::Running;
        run.started_at = Some(chrono::Utc::now());
        self.store.update(&run)?;
        self.emit(run_id, EventLevel::Info, EventKind::RunStart, None, serde_json::json!({}))?;

        match self.execute(&mut run) {
            Ok(()) => {}
            Err(e) => {
                warn!(%run_id, error = %e, "run_job failed");
                run.status = RunStatus::Failed;
                run.error = Some(serde_json::json!({"message": validators::sanitize(&e.to_string())}));
            }
        }

        run.finished_at = Some(chrono::Utc::now());
        self.store.update(&run)?;
        self.emit(
            run_id,
            EventLevel::Info,
            EventKind::RunEnd,
            None,
            serde_json::json!({"status": run.status}),
        )?;
        Ok(())
    }

    fn execute(&self, run: &mut Run) -> Result<()> {
        let run_id = run.id;

        if self.check_canceled(run)? {
            return Ok(());
        }

        validators::validate_repo_url(&run.repo_url).map_err(|e| anyhow::anyhow!("{e}"))?;
        validators::validate_ref(&run.repo_ref).map_err(|e| anyhow::anyhow!("{e}"))?;

        let repo_dir = self.config.workspace_root.join(run_id.to_string()).join("repo");
        let clone_url = match auth::resolve_git_token()? {
            Some(token) => auth::inject_token(&run.repo_url, &token),
            None => run.repo_url.clone(),
        };
        let head_sha = workspace::clone_at_ref(&clone_url, &repo_dir, &run.repo_ref)
            .context("failed to clone target repository")?;
        run.git_sha = Some(head_sha);
        self.store.update(run)?;

        if self.check_canceled(run)? {
            return Ok(());
        }

        let out_dir = self.config.artifacts_root.join("factory").join(run_id.to_string());
        let client = LlmClient::from_env(self.config.llm_base_url.clone())?;
        let factory_config = FactoryConfig {
            repo_root: repo_dir.clone(),
            out_dir: out_dir.clone(),
            max_attempts: factory::DEFAULT_MAX_ATTEMPTS,
            llm_model: self.config.llm_model.clone(),
            allow_verify_exempt: false,
        };

        runtime::ensure(&repo_dir).context("failed to provision repo runtime environment")?;

        let mut reporter = TracingReporter { run_id };
        let summary = factory::run(&factory_config, &run.work_order, &client, &mut reporter)?;

        for n in 1..=summary.total_attempts {
            let attempt_dir = out_dir.join(format!("attempt_{n}"));
            if let Ok(saved) = artifacts::save_iteration_artifacts(self.store.as_ref(), run_id, n, &attempt_dir) {
                for artifact in saved {
                    self.emit(
                        run_id,
                        EventLevel::Info,
                        EventKind::TrApply,
                        Some(n),
                        serde_json::json!({"artifact": artifact.name}),
                    )?;
                }
            }
            self.emit(
                run_id,
                EventLevel::Info,
                EventKind::PoResult,
                Some(n),
                serde_json::json!({"attempt": n}),
            )?;
        }
        artifacts::save_run_summary(self.store.as_ref(), run_id, &out_dir).ok();

        run.iteration = summary.total_attempts;
        run.result_summary = Some(serde_json::to_value(&summary)?);

        if summary.verdict == FactoryExitVerdict::Pass {
            if run.writeback.push
                && let Some(branch) = run.writeback.branch.clone().or_else(|| Some(default_branch_name(run_id)))
            {
                if let Err(e) = self.writeback(&repo_dir, &branch, &run.work_order) {
                    warn!(%run_id, error = %e, "writeback push failed; run result unaffected");
                    self.emit(
                        run_id,
                        EventLevel::Warn,
                        EventKind::ErrorException,
                        None,
                        serde_json::json!({"writeback_error": validators::sanitize(&e.to_string())}),
                    )?;
                }
            }
            run.status = RunStatus::Succeeded;
        } else {
            run.status = RunStatus::Failed;
            run.error = Some(serde_json::json!({"stage": "factory", "verdict": "fail"}));
        }

        Ok(())
    }

    fn writeback(&self, repo_dir: &std::path::Path, branch: &str, work_order: &WorkOrder) -> Result<()> {
        validators::validate_branch_name(branch).map_err(|e| anyhow::anyhow!("{e}"))?;
        workspace::create_branch(repo_dir, branch)?;
        let message = format!("harness: apply work order {}", work_order.id);
        workspace::commit(repo_dir, &message, &work_order.allowed_files)?;
        workspace::push_branch(repo_dir, branch)?;
        Ok(())
    }

    /// Returns `true` (and transitions the run) if cancellation was
    /// observed at this phase boundary.
    fn check_canceled(&self, run: &mut Run) -> Result<bool> {
        let Some(latest) = self.store.get(run.id)? else {
            return Ok(false);
        };
        if latest.status != RunStatus::Canceled {
            return Ok(false);
        }
        run.status = RunStatus::Canceled;
        self.store.update(run)?;
        self.emit(run.id, EventLevel::Info, EventKind::Canceled, None, serde_json::json!({}))?;
        Ok(true)
    }

    fn emit(
        &self,
        run_id: Uuid,
        level: EventLevel,
        kind: EventKind,
        iteration: Option<u32>,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.store.append_event(Event {
            id: 0,
            run_id,
            ts: chrono::Utc::now(),
            level,
            kind,
            iteration,
            payload,
        })?;
        Ok(())
    }
}

fn default_branch_name(run_id: Uuid) -> String {
    let short = run_id.to_string().chars().take(8).collect::<String>();
    format!("aos/run-{short}")
}

/// Bridges the factory's human-facing [`factory::Reporter`] into the
/// orchestration service's `tracing` spans. The CLI's `Reporter` and the
/// service's structured logs serve different audiences and are
/// deliberately not unified.
struct TracingReporter {
    run_id: Uuid,
}

impl factory::Reporter for TracingReporter {
    fn info(&mut self, msg: &str) {
        info!(run_id = %self.run_id, "{msg}");
    }

    fn warn(&mut self, msg: &str) {
        warn!(run_id = %self.run_id, "{msg}");
    }

    fn error(&mut self, msg: &str) {
        error!(run_id = %self.run_id, "{msg}");
    }
}

/// True if `status` is a terminal run status, re-exported here since the
/// worker's only job is to drive a run to one of these.
pub fn is_terminal(status: RunStatus) -> bool {
    store::is_terminal(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_types::{CommandSpec, WorkOrder, WritebackSpec};
    use std::path::PathBuf;

    fn sample_work_order() -> WorkOrder {
        WorkOrder {
            id: "WO-01".to_string(),
            title: "t".to_string(),
            intent: "i".to_string(),
            allowed_files: vec!["a.txt".to_string()],
            forbidden: vec![],
            acceptance_commands: vec![CommandSpec { command: "true".to_string(), shell: false, timeout_sec: 10 }],
            context_files: vec![],
            preconditions: vec![],
            postconditions: vec![],
            verify_exempt: false,
            notes: None,
            env: Default::default(),
        }
    }

    fn sample_run(id: Uuid, status: RunStatus) -> Run {
        Run {
            id,
            status,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            idempotency_key: None,
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
    fn default_branch_name_is_stable_and_short() {
        let id = Uuid::now_v7();
        let name = default_branch_name(id);
        assert!(name.starts_with("aos/run-"));
        assert_eq!(name.len(), "aos/run-".len() + 8);
    }

    #[test]
    fn run_job_exits_cleanly_for_already_canceled_run() {
        let td = tempfile::tempdir().unwrap();
        let store = Arc::new(store::FileRunStore::open(td.path().join("store")).unwrap());
        let run_id = Uuid::now_v7();
        store.create(sample_run(run_id, RunStatus::Canceled)).unwrap();

        let worker = Worker::new(
            store.clone(),
            WorkerConfig {
                workspace_root: td.path().join("ws"),
                artifacts_root: td.path().join("artifacts"),
                llm_model: "gpt-5".to_string(),
                llm_base_url: "https://api.openai.com".to_string(),
            },
        );
        worker.run_job(run_id).unwrap();

        let loaded = store.get(run_id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Canceled);
    }

    #[test]
    fn run_job_errors_for_unknown_run() {
        let td = tempfile::tempdir().unwrap();
        let store = Arc::new(store::FileRunStore::open(td.path().join("store")).unwrap());
        let worker = Worker::new(
            store,
            WorkerConfig {
                workspace_root: td.path().join("ws"),
                artifacts_root: td.path().join("artifacts"),
                llm_model: "gpt-5".to_string(),
                llm_base_url: "https://api.openai.com".to_string(),
            },
        );
        assert!(worker.run_job(Uuid::now_v7()).is_err());
    }

    #[tokio::test]
    async fn in_process_queue_delivers_submitted_ids() {
        let (queue, mut rx) = InProcessQueue::channel();
        let id = Uuid::now_v7();
        queue.submit(id).unwrap();
        assert_eq!(rx.recv().await, Some(id));
    }
}
