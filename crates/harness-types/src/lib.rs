//! # Types
//!
//! Core data model shared by the planner, the factory, and the orchestration
//! service: [`WorkOrder`]/[`Manifest`] (planner output), [`Proposal`]/
//! [`Attempt`]/[`FailureBrief`] (per-attempt factory records), and
//! [`Run`]/[`Event`]/[`Artifact`] (orchestration-service persistence).
//!
//! Field shapes for `WorkOrder`, `CmdResult`, `Run`, `Event`, and `Artifact`
//! are chosen so the JSON this crate produces is stable across the planner,
//! factory, and orchestration-service boundaries.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single unit of work the factory executes against a target repository.
///
/// `verify_exempt` is always overwritten by the plan compiler: only
/// WO-01, and only when its `allowed_files` contains the verify script path,
/// may be exempt from the global verify contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkOrder {
    /// Matches `^WO-\d{2}$` and must be contiguous within a manifest.
    pub id: String,
    pub title: String,
    pub intent: String,
    pub allowed_files: Vec<String>,
    #[serde(default)]
    pub forbidden: Vec<String>,
    pub acceptance_commands: Vec<CommandSpec>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub preconditions: Vec<Condition>,
    #[serde(default)]
    pub postconditions: Vec<Condition>,
    #[serde(default)]
    pub verify_exempt: bool,
    #[serde(default)]
    pub notes: Option<String>,
    /// Extra environment variables merged into each acceptance command's
    /// environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A command run as part of a work order's acceptance gate, or as a preflight
/// / global verify command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub shell: bool,
    #[serde(default = "default_command_timeout")]
    pub timeout_sec: u64,
}

fn default_command_timeout() -> u64 {
    120
}

/// A precondition/postcondition attached to a work order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    FileExists,
    FileAbsent,
}

/// A global invariant: once `requires` is satisfied by the cumulative file
/// state, `command` is implied to succeed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyContract {
    pub command: String,
    #[serde(default)]
    pub requires: Vec<Condition>,
}

/// The planner's output: an ordered, content-addressed sequence of work
/// orders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub manifest_version: String,
    /// First 16 hex digits of SHA-256(spec‖"\n"‖template‖"\n"‖model‖"\n"‖effort).
    pub compile_hash: String,
    pub model: String,
    pub reasoning_effort: String,
    #[serde(default)]
    pub system_overview: Vec<String>,
    #[serde(default)]
    pub verify_contract: Option<VerifyContract>,
    pub work_orders: Vec<WorkOrder>,
}

impl Manifest {
    /// Test/builder convenience: attach a verify contract.
    pub fn with_verify_contract(mut self, contract: VerifyContract) -> Self {
        self.verify_contract = Some(contract);
        self
    }
}

/// Cumulative knowledge of which paths exist after applying work orders
/// 1..=k, used by the validator to check precondition/postcondition
/// satisfiability across the whole manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileState {
    pub existing_paths: BTreeMap<String, bool>,
}

impl FileState {
    pub fn exists(&self, path: &str) -> Option<bool> {
        self.existing_paths.get(path).copied()
    }

    pub fn apply_postconditions(&mut self, conditions: &[Condition]) {
        for cond in conditions {
            let present = matches!(cond.kind, ConditionKind::FileExists);
            self.existing_paths.insert(cond.path.clone(), present);
        }
    }
}

/// A validation finding. `code` is one of the E0xx/W1xx taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub work_order_id: Option<String>,
}

impl ValidationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            work_order_id: None,
        }
    }

    pub fn for_work_order(
        code: impl Into<String>,
        work_order_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            work_order_id: Some(work_order_id.into()),
        }
    }

    pub fn is_warning(&self) -> bool {
        self.code.starts_with('W')
    }
}

/// A single proposed write, as emitted by the SE node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteOp {
    pub path: String,
    pub mode: WriteMode,
    /// SHA-256 of the file's content at the moment the SE node read it, or
    /// `None` for a file that did not exist. Used for optimistic-concurrency
    /// staleness detection in the TR node.
    pub base_sha256: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Create,
    Replace,
    Delete,
}

/// SE node output: a natural-language summary plus an ordered list of writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proposal {
    pub summary: String,
    pub writes: Vec<WriteOp>,
}

/// Result of running one command (acceptance, verify, or preflight).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CmdResult {
    pub command: Vec<String>,
    pub exit_code: i32,
    pub stdout_trunc: String,
    pub stderr_trunc: String,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub duration_seconds: f64,
}

impl CmdResult {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// The stage at which a factory attempt ended, if it failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Preflight,
    LlmOutputInvalid,
    WriteScopeViolation,
    StaleContext,
    WriteFailed,
    VerifyFailed,
    AcceptanceFailed,
    Exception,
}

/// A structured account of why an attempt failed, handed back to the SE
/// node's prompt on the next attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureBrief {
    pub stage: FailureStage,
    pub summary: String,
    #[serde(default)]
    pub failing_commands: Vec<CmdResult>,
    #[serde(default)]
    pub constraints_reminder: Option<String>,
}

/// The verdict of one SE→TR→PO attempt at a single work order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// A complete record of one attempt at a work order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attempt {
    pub work_order_id: String,
    pub attempt_index: u32,
    pub verdict: Verdict,
    pub ended_stage: Option<FailureStage>,
    pub proposal: Option<Proposal>,
    #[serde(default)]
    pub applied: Vec<String>,
    pub all_commands_ok: bool,
    #[serde(default)]
    pub command_results: Vec<CmdResult>,
    pub failure_brief: Option<FailureBrief>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Status of an orchestrated run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Error,
}

/// Writeback configuration: where/how the factory's result is pushed back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WritebackSpec {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub push: bool,
}

/// The top-level run record persisted by the orchestration service's run
/// store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: uuid::Uuid,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub repo_url: String,
    pub repo_ref: String,
    #[serde(default)]
    pub git_sha: Option<String>,
    pub work_order: WorkOrder,
    pub work_order_body: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub writeback: WritebackSpec,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub queue_job_id: Option<String>,
    #[serde(default)]
    pub result_summary: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    pub artifact_root: PathBuf,
}

/// Severity of an [`Event`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single entry in a run's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: u64,
    pub run_id: uuid::Uuid,
    pub ts: DateTime<Utc>,
    pub level: EventLevel,
    pub kind: EventKind,
    #[serde(default)]
    pub iteration: Option<u32>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The taxonomy of events recorded across a run's lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    RunStart,
    RunEnd,
    SeOutput,
    TrApply,
    PoResult,
    Canceled,
    ErrorException,
}

/// A file produced during a run and recorded for later retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: u64,
    pub run_id: uuid::Uuid,
    pub name: String,
    pub path: PathBuf,
    pub content_type: String,
    pub bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_order_roundtrips_json() {
        let wo = WorkOrder {
            id: "WO-01".into(),
            title: "bootstrap".into(),
            intent: "create scripts/verify.sh".into(),
            allowed_files: vec!["scripts/verify.sh".into()],
            forbidden: vec![],
            acceptance_commands: vec![CommandSpec {
                command: "bash scripts/verify.sh".into(),
                shell: false,
                timeout_sec: 120,
            }],
            context_files: vec![],
            preconditions: vec![],
            postconditions: vec![Condition {
                kind: ConditionKind::FileExists,
                path: "scripts/verify.sh".into(),
            }],
            verify_exempt: true,
            notes: None,
            env: BTreeMap::new(),
        };
        let json = serde_json::to_string(&wo).unwrap();
        let rt: WorkOrder = serde_json::from_str(&json).unwrap();
        assert_eq!(rt, wo);
    }

    #[test]
    fn validation_error_is_warning_detects_w_prefix() {
        let e = ValidationError::new("W101", "module not importable");
        assert!(e.is_warning());
        let e = ValidationError::new("E001", "bad id");
        assert!(!e.is_warning());
    }

    #[test]
    fn file_state_tracks_postconditions() {
        let mut fs = FileState::default();
        fs.apply_postconditions(&[Condition {
            kind: ConditionKind::FileExists,
            path: "a.txt".into(),
        }]);
        assert_eq!(fs.exists("a.txt"), Some(true));
        assert_eq!(fs.exists("b.txt"), None);
    }

    #[test]
    fn run_status_roundtrips_snake_case() {
        let json = serde_json::to_string(&RunStatus::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
    }
}
