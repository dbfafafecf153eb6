//! Append-only JSONL event log for a single run.
//!
//! One file per run, named [`EVENTS_FILE`], opened in append mode and
//! `fsync`'d after every write so a crash mid-run leaves a truncated-but-valid
//! prefix rather than a corrupt tail.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use harness_types::{Event, EventKind, EventLevel};

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(run_dir: &Path) -> PathBuf {
    run_dir.join(EVENTS_FILE)
}

/// An append-only handle onto one run's event log.
pub struct EventLog {
    path: PathBuf,
    next_id: u64,
}

impl EventLog {
    /// Open (creating if absent) the event log for `run_dir`, resuming the
    /// `id` counter from whatever was already on disk.
    pub fn open(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)
            .with_context(|| format!("failed to create run dir {}", run_dir.display()))?;
        let path = events_path(run_dir);
        let next_id = match read_from_file(&path) {
            Ok(events) => events.last().map(|e| e.id + 1).unwrap_or(1),
            Err(_) => 1,
        };
        Ok(Self { path, next_id })
    }

    pub fn append(
        &mut self,
        run_id: uuid::Uuid,
        level: EventLevel,
        kind: EventKind,
        iteration: Option<u32>,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let event = Event {
            id: self.next_id,
            run_id,
            ts: Utc::now(),
            level,
            kind,
            iteration,
            payload,
        };
        write_to_file(&self.path, &event)?;
        self.next_id += 1;
        Ok(event)
    }

    pub fn read_all(&self) -> Result<Vec<Event>> {
        read_from_file(&self.path)
    }
}

/// Append a single event to `path`, creating the file if needed.
pub fn write_to_file(path: &Path, event: &Event) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open event log {}", path.display()))?;

    let line = serde_json::to_string(event).context("failed to serialize event")?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to fsync {}", path.display()))?;
    Ok(())
}

/// Read every event from `path` in on-disk order. Missing file = empty log.
pub fn read_from_file(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read line from {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse event log line: {line}"))?;
        events.push(event);
    }
    Ok(events)
}

/// Filter a run's events down to those recorded during a given iteration.
pub fn events_for_iteration(events: &[Event], iteration: u32) -> Vec<Event> {
    events
        .iter()
        .filter(|e| e.iteration == Some(iteration))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_roundtrips() {
        let td = tempdir().unwrap();
        let mut log = EventLog::open(td.path()).unwrap();
        let run_id = uuid::Uuid::now_v7();
        log.append(run_id, EventLevel::Info, EventKind::RunStart, None, serde_json::json!({}))
            .unwrap();
        log.append(
            run_id,
            EventLevel::Info,
            EventKind::SeOutput,
            Some(1),
            serde_json::json!({"summary": "ok"}),
        )
        .unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 1);
        assert_eq!(events[1].id, 2);
        assert_eq!(events[1].iteration, Some(1));
    }

    #[test]
    fn reopen_resumes_id_counter() {
        let td = tempdir().unwrap();
        {
            let mut log = EventLog::open(td.path()).unwrap();
            log.append(
                uuid::Uuid::now_v7(),
                EventLevel::Info,
                EventKind::RunStart,
                None,
                serde_json::json!({}),
            )
            .unwrap();
        }
        let mut log = EventLog::open(td.path()).unwrap();
        let e = log
            .append(
                uuid::Uuid::now_v7(),
                EventLevel::Info,
                EventKind::RunEnd,
                None,
                serde_json::json!({}),
            )
            .unwrap();
        assert_eq!(e.id, 2);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let td = tempdir().unwrap();
        let events = read_from_file(&events_path(td.path())).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn events_for_iteration_filters() {
        let td = tempdir().unwrap();
        let mut log = EventLog::open(td.path()).unwrap();
        let run_id = uuid::Uuid::now_v7();
        log.append(run_id, EventLevel::Info, EventKind::SeOutput, Some(1), serde_json::json!({}))
            .unwrap();
        log.append(run_id, EventLevel::Info, EventKind::SeOutput, Some(2), serde_json::json!({}))
            .unwrap();
        let events = log.read_all().unwrap();
        let filtered = events_for_iteration(&events, 1);
        assert_eq!(filtered.len(), 1);
    }
}
