//! Durable run ledger.
//!
//! Every state transition of every run is appended to the ledger before the
//! orchestrator proceeds, so a run can be reconstructed after a crash and
//! audited afterwards.
//!
//! # Layout (file ledger)
//!
//! ```text
//! <dir>/runs/<run_id>.log   JSON Lines, one RunEvent per line
//! <dir>/release.json        last known-good spec of every stack
//! ```
//!
//! # Recovery
//!
//! Reading a run replays the valid prefix of its log and never modifies the
//! file. A partial trailing line left by a crash is truncated only when the
//! writer reopens that run's log. [`load`] folds the surviving events into a
//! [`Run`].

pub mod event;
pub mod fsync;
pub mod log;
pub mod release;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::types::{Run, RunId, StackName};

pub use event::{RunEvent, RunEventPayload};
pub use log::{EventLog, EventLogError, Replay};
pub use release::Release;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("run log error: {0}")]
    Log(#[from] EventLogError),

    #[error("run {0} not found in ledger")]
    UnknownRun(RunId),

    #[error("invalid run id {0:?}")]
    InvalidRunId(String),

    #[error("run {run} cannot be reconstructed: {message}")]
    Corrupt { run: RunId, message: String },
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Storage for run events and the known-good release.
pub trait LedgerStore {
    /// Appends an event to a run's log. Critical events are durable on return.
    fn append(&mut self, run: &RunId, payload: RunEventPayload) -> Result<RunEvent>;

    /// All valid events of a run, in order.
    fn read(&self, run: &RunId) -> Result<Vec<RunEvent>>;

    /// Ids of all recorded runs, oldest first.
    fn runs(&self) -> Result<Vec<RunId>>;

    fn release(&self) -> Result<Release>;

    fn write_release(&mut self, release: &Release) -> Result<()>;
}

/// Reconstructs a run from its events.
///
/// The first event must be `run_started`. Later transitions replace the
/// record of their stack; `run_finished` sets the final state. A log cut
/// short by a crash yields a run still `IN_PROGRESS`.
pub fn replay(run_id: &RunId, events: &[RunEvent]) -> Result<Run> {
    let corrupt = |message: String| LedgerError::Corrupt {
        run: run_id.clone(),
        message,
    };

    let (first, rest) = events
        .split_first()
        .ok_or_else(|| corrupt("log is empty".to_string()))?;
    let mut run = match &first.payload {
        RunEventPayload::RunStarted {
            run_id: started_id,
            kind,
            bundle,
            plan,
        } => {
            let mut run = Run::new(started_id.clone(), *kind, bundle.clone(), plan);
            run.stamp_start(first.ts);
            run
        }
        other => return Err(corrupt(format!("first event is {}", other.name()))),
    };

    for event in rest {
        match &event.payload {
            RunEventPayload::StackTransition { record } => {
                let slot = run
                    .record_mut(&record.stack)
                    .ok_or_else(|| corrupt(format!("transition for unplanned stack {}", record.stack)))?;
                *slot = record.clone();
            }
            RunEventPayload::RunFinished {
                state,
                failed_stack,
                aborted,
                ..
            } => {
                run.state = *state;
                run.failed_stack = failed_stack.clone();
                run.aborted = *aborted;
                run.finished_at = Some(event.ts);
            }
            RunEventPayload::BackendStatus { .. } => {}
            RunEventPayload::RunStarted { .. } => {
                return Err(corrupt(format!("second run_started at seq {}", event.seq)));
            }
        }
    }

    Ok(run)
}

/// Loads and reconstructs a run from a store.
pub fn load(store: &impl LedgerStore, run_id: &RunId) -> Result<Run> {
    let events = store.read(run_id)?;
    if events.is_empty() {
        return Err(LedgerError::UnknownRun(run_id.clone()));
    }
    replay(run_id, &events)
}

// ─── File-backed ledger ───

/// Ledger stored in a directory on the local file system.
pub struct FileLedger {
    dir: PathBuf,
    /// The log currently open for appending.
    open: Option<(RunId, EventLog)>,
}

impl FileLedger {
    /// Opens (creating if needed) a ledger rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("runs"))?;
        Ok(FileLedger { dir, open: None })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_path(&self, run: &RunId) -> Result<PathBuf> {
        if !run.is_valid() {
            return Err(LedgerError::InvalidRunId(run.as_str().to_string()));
        }
        Ok(self.dir.join("runs").join(format!("{}.log", run)))
    }

    fn log_for(&mut self, run: &RunId) -> Result<&mut EventLog> {
        let reopen = !matches!(&self.open, Some((id, _)) if id == run);
        if reopen {
            let path = self.run_path(run)?;
            let (log, replay) = EventLog::open_for_append(&path)?;
            if replay.file_len == 0 {
                fsync::fsync_dir(&self.dir.join("runs"))?;
            }
            debug!(run = %run, next_seq = replay.next_seq, "opened run log");
            self.open = Some((run.clone(), log));
        }
        match &mut self.open {
            Some((_, log)) => Ok(log),
            None => Err(LedgerError::UnknownRun(run.clone())),
        }
    }
}

impl LedgerStore for FileLedger {
    fn append(&mut self, run: &RunId, payload: RunEventPayload) -> Result<RunEvent> {
        Ok(self.log_for(run)?.append(payload)?)
    }

    fn read(&self, run: &RunId) -> Result<Vec<RunEvent>> {
        Ok(EventLog::replay(self.run_path(run)?)?.events)
    }

    fn runs(&self) -> Result<Vec<RunId>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(self.dir.join("runs"))? {
            let name = entry?.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(".log") {
                let id = RunId::new(id);
                if id.is_valid() {
                    runs.push(id);
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    fn release(&self) -> Result<Release> {
        release::read_release(&self.dir)
    }

    fn write_release(&mut self, release: &Release) -> Result<()> {
        release::write_release(&self.dir, release)
    }
}

// ─── In-memory ledger ───

/// Ledger held in memory. Used for rehearsal runs and tests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    runs: Vec<RunId>,
    events: HashMap<RunId, Vec<RunEvent>>,
    release: Release,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing release.
    pub fn with_release(release: Release) -> Self {
        MemoryLedger {
            release,
            ..Self::default()
        }
    }
}

impl LedgerStore for MemoryLedger {
    fn append(&mut self, run: &RunId, payload: RunEventPayload) -> Result<RunEvent> {
        if !self.events.contains_key(run) {
            self.runs.push(run.clone());
        }
        let events = self.events.entry(run.clone()).or_default();
        let event = RunEvent::new(events.len() as u64, payload);
        events.push(event.clone());
        Ok(event)
    }

    fn read(&self, run: &RunId) -> Result<Vec<RunEvent>> {
        Ok(self.events.get(run).cloned().unwrap_or_default())
    }

    fn runs(&self) -> Result<Vec<RunId>> {
        Ok(self.runs.clone())
    }

    fn release(&self) -> Result<Release> {
        Ok(self.release.clone())
    }

    fn write_release(&mut self, release: &Release) -> Result<()> {
        self.release = release.clone();
        Ok(())
    }
}

/// Stacks named in a run's `run_finished` event as needing attention.
pub fn recorded_inconsistencies(events: &[RunEvent]) -> Option<Vec<StackName>> {
    events.iter().rev().find_map(|e| match &e.payload {
        RunEventPayload::RunFinished { inconsistent, .. } => Some(inconsistent.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::spec;
    use crate::types::{RunKind, RunState, StackRunRecord, StackState};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn started(run: &str) -> RunEventPayload {
        RunEventPayload::RunStarted {
            run_id: RunId::new(run),
            kind: RunKind::Deploy,
            bundle: None,
            plan: vec![spec("a", &[]), spec("b", &["a"])],
        }
    }

    fn transition(name: &str, state: StackState) -> RunEventPayload {
        let mut record = StackRunRecord::new(&spec(name, &[]));
        record.state = state;
        RunEventPayload::StackTransition { record }
    }

    fn write_run(store: &mut impl LedgerStore, run: &RunId) {
        store.append(run, started(run.as_str())).unwrap();
        store.append(run, transition("a", StackState::Deploying)).unwrap();
        store.append(run, transition("a", StackState::Deployed)).unwrap();
        store
            .append(
                run,
                RunEventPayload::BackendStatus {
                    stack: StackName::from("b"),
                    status: "CREATE_IN_PROGRESS".to_string(),
                },
            )
            .unwrap();
    }

    // ─── Replay ───

    #[test]
    fn replay_applies_transitions_in_order() {
        let mut store = MemoryLedger::new();
        let run_id = RunId::new("r1");
        write_run(&mut store, &run_id);

        let run = load(&store, &run_id).unwrap();
        assert_eq!(run.state, RunState::InProgress);
        assert_eq!(run.records[0].state, StackState::Deployed);
        assert_eq!(run.records[1].state, StackState::Pending);
    }

    #[test]
    fn replay_applies_run_finished() {
        let mut store = MemoryLedger::new();
        let run_id = RunId::new("r1");
        write_run(&mut store, &run_id);
        store
            .append(
                &run_id,
                RunEventPayload::RunFinished {
                    state: RunState::FailedRollbackIncomplete,
                    failed_stack: Some(StackName::from("b")),
                    aborted: false,
                    inconsistent: vec![StackName::from("a")],
                },
            )
            .unwrap();

        let run = load(&store, &run_id).unwrap();
        assert_eq!(run.state, RunState::FailedRollbackIncomplete);
        assert_eq!(run.failed_stack, Some(StackName::from("b")));
        assert!(run.finished_at.is_some());

        let events = store.read(&run_id).unwrap();
        assert_eq!(
            recorded_inconsistencies(&events),
            Some(vec![StackName::from("a")])
        );
    }

    #[test]
    fn replay_rejects_log_without_run_started() {
        let mut store = MemoryLedger::new();
        let run_id = RunId::new("r1");
        store
            .append(&run_id, transition("a", StackState::Deploying))
            .unwrap();

        assert!(matches!(
            load(&store, &run_id),
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[test]
    fn replay_rejects_transition_for_unplanned_stack() {
        let mut store = MemoryLedger::new();
        let run_id = RunId::new("r1");
        store.append(&run_id, started("r1")).unwrap();
        store
            .append(&run_id, transition("zzz", StackState::Deploying))
            .unwrap();

        assert!(matches!(
            load(&store, &run_id),
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[test]
    fn unknown_run_is_reported() {
        let store = MemoryLedger::new();
        assert!(matches!(
            load(&store, &RunId::new("nope")),
            Err(LedgerError::UnknownRun(_))
        ));
    }

    // ─── File ledger ───

    #[test]
    fn file_ledger_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = FileLedger::open(dir.path()).unwrap();
        let run_id = RunId::new("20240101T000000Z-aaaaaaaa");
        write_run(&mut store, &run_id);

        let reopened = FileLedger::open(dir.path()).unwrap();
        let events = reopened.read(&run_id).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(reopened.runs().unwrap(), vec![run_id.clone()]);

        let run = load(&reopened, &run_id).unwrap();
        assert_eq!(run.records[0].state, StackState::Deployed);
    }

    #[test]
    fn file_ledger_recovers_from_torn_write() {
        let dir = tempdir().unwrap();
        let run_id = RunId::new("r1");
        {
            let mut store = FileLedger::open(dir.path()).unwrap();
            write_run(&mut store, &run_id);
        }

        let path = dir.path().join("runs").join("r1.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, r#"{{"seq":4,"ts":"2024-01-01T00:00:00Z","type":"stack_tr"#).unwrap();
        drop(file);

        // Appending after a crash continues from the last valid sequence.
        let mut store = FileLedger::open(dir.path()).unwrap();
        let event = store
            .append(&run_id, transition("b", StackState::Deploying))
            .unwrap();
        assert_eq!(event.seq, 4);

        let run = load(&store, &run_id).unwrap();
        assert_eq!(run.records[1].state, StackState::Deploying);
    }

    #[test]
    fn reading_a_run_does_not_modify_its_log() {
        let dir = tempdir().unwrap();
        let run_id = RunId::new("r1");
        let mut writer = FileLedger::open(dir.path()).unwrap();
        write_run(&mut writer, &run_id);

        // A half-written line, as seen by a reader while the writer is busy.
        let path = dir.path().join("runs").join("r1.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, r#"{{"seq":4,"ts":"2024-01-01T00:00:00Z","type":"stack_tr"#).unwrap();
        drop(file);
        let len = std::fs::metadata(&path).unwrap().len();

        let reader = FileLedger::open(dir.path()).unwrap();
        assert_eq!(reader.read(&run_id).unwrap().len(), 4);
        assert_eq!(load(&reader, &run_id).unwrap().records[0].state, StackState::Deployed);
        assert_eq!(reader.runs().unwrap(), vec![run_id]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn run_ids_cannot_leave_the_ledger() {
        let root = tempdir().unwrap();
        let ledger_dir = root.path().join("ledger");
        let mut store = FileLedger::open(&ledger_dir).unwrap();

        let victim = root.path().join("victim.log");
        std::fs::write(&victim, "not a run log").unwrap();

        for id in ["../../victim", "../victim", "a/b", "a\\b", "..", ".hidden", ""] {
            let run_id = RunId::new(id);
            assert!(
                matches!(store.read(&run_id), Err(LedgerError::InvalidRunId(_))),
                "{:?}",
                id
            );
            assert!(
                matches!(
                    store.append(&run_id, started(id)),
                    Err(LedgerError::InvalidRunId(_))
                ),
                "{:?}",
                id
            );
        }
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "not a run log");
    }

    #[test]
    fn file_ledger_interleaves_runs() {
        let dir = tempdir().unwrap();
        let mut store = FileLedger::open(dir.path()).unwrap();
        let first = RunId::new("r1");
        let second = RunId::new("r2");

        store.append(&first, started("r1")).unwrap();
        store.append(&second, started("r2")).unwrap();
        let event = store
            .append(&first, transition("a", StackState::Deploying))
            .unwrap();

        assert_eq!(event.seq, 1);
        assert_eq!(store.runs().unwrap(), vec![first, second]);
    }

    #[test]
    fn file_ledger_persists_release() {
        let dir = tempdir().unwrap();
        let mut store = FileLedger::open(dir.path()).unwrap();
        let mut release = Release::default();
        release.record_success(&RunId::new("r1"), &[spec("a", &[])]);
        store.write_release(&release).unwrap();

        let reopened = FileLedger::open(dir.path()).unwrap();
        assert_eq!(reopened.release().unwrap(), release);
    }
}
