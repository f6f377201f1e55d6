//! Append-only record of per-organism outcomes.
//!
//! Three files live in the ledger directory:
//!
//! - `downloaded.txt`: one organism name per successful acquisition
//! - `failed.txt`: `organism — reason` per failed acquisition
//! - `events.jsonl`: timestamped JSON line for every lifecycle event,
//!   including skips and compression warnings
//!
//! Entries are never rewritten or removed. Truncating `failed.txt` by hand
//! is the only way to stop `--skip-known-failures` from filtering an
//! organism.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{FailureReason, GenomeSource, OrganismName, Outcome, OutcomeTag};
use crate::error::KiraError;

pub const DOWNLOADED_FILE: &str = "downloaded.txt";
pub const FAILED_FILE: &str = "failed.txt";
pub const EVENTS_FILE: &str = "events.jsonl";

const FAILURE_SEPARATOR: &str = " — ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: String,
    pub organism: OrganismName,
    pub outcome: OutcomeTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<GenomeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    RunStarted {
        run_id: String,
        timestamp: String,
        organisms: usize,
    },
    Organism(LedgerEntry),
    CompressionFailed {
        run_id: String,
        organism: OrganismName,
        detail: String,
        timestamp: String,
    },
    RunFinished {
        run_id: String,
        timestamp: String,
        summary: RunSummary,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub skipped: usize,
    pub downloaded: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a LedgerEntry>,
    {
        let mut summary = RunSummary::default();
        for entry in entries {
            summary.total += 1;
            match entry.outcome {
                OutcomeTag::SkippedExisting => summary.skipped += 1,
                OutcomeTag::Downloaded => summary.downloaded += 1,
                OutcomeTag::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.skipped + self.downloaded + self.failed
    }
}

#[derive(Debug, Clone)]
struct LedgerFiles {
    downloaded: Utf8PathBuf,
    failed: Utf8PathBuf,
    events: Utf8PathBuf,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    warnings: usize,
}

/// Ledger for one run. Appends are serialized, so a single instance can be
/// shared by parallel workers.
#[derive(Debug)]
pub struct Ledger {
    run_id: String,
    files: Option<LedgerFiles>,
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn open(dir: &Utf8Path) -> Result<Self, KiraError> {
        fs::create_dir_all(dir.as_std_path()).map_err(|err| KiraError::LedgerWrite {
            path: dir.as_std_path().to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(Self {
            run_id: new_run_id(),
            files: Some(LedgerFiles {
                downloaded: dir.join(DOWNLOADED_FILE),
                failed: dir.join(FAILED_FILE),
                events: dir.join(EVENTS_FILE),
            }),
            state: Mutex::new(LedgerState::default()),
        })
    }

    /// Ledger that keeps entries only in memory.
    pub fn in_memory() -> Self {
        Self {
            run_id: new_run_id(),
            files: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn begin_run(&self, organisms: usize) -> Result<(), KiraError> {
        let _guard = self.lock();
        self.append_event(&LedgerEvent::RunStarted {
            run_id: self.run_id.clone(),
            timestamp: iso_timestamp(),
            organisms,
        })
    }

    /// Appends the terminal outcome of one organism.
    pub fn record(
        &self,
        organism: &OrganismName,
        outcome: &Outcome,
    ) -> Result<LedgerEntry, KiraError> {
        let (source, reason) = match outcome {
            Outcome::SkippedExisting => (None, None),
            Outcome::Downloaded { source } => (Some(*source), None),
            Outcome::Failed { reason } => (None, Some(reason.clone().single_line())),
        };
        let entry = LedgerEntry {
            run_id: self.run_id.clone(),
            organism: organism.clone(),
            outcome: outcome.tag(),
            source,
            reason,
            timestamp: iso_timestamp(),
        };

        let mut state = self.lock();
        if let Some(files) = &self.files {
            match &entry.reason {
                Some(reason) if entry.outcome == OutcomeTag::Failed => append_line(
                    &files.failed,
                    &format!("{}{FAILURE_SEPARATOR}{reason}", organism.as_str()),
                )?,
                _ if entry.outcome == OutcomeTag::Downloaded => {
                    append_line(&files.downloaded, organism.as_str())?
                }
                _ => {}
            }
        }
        self.append_event(&LedgerEvent::Organism(entry.clone()))?;
        state.entries.push(entry.clone());
        Ok(entry)
    }

    /// Logs a non-fatal compression failure for an already finalized artifact.
    pub fn record_compression_failure(
        &self,
        organism: &OrganismName,
        detail: &str,
    ) -> Result<(), KiraError> {
        let mut state = self.lock();
        self.append_event(&LedgerEvent::CompressionFailed {
            run_id: self.run_id.clone(),
            organism: organism.clone(),
            detail: detail.to_string(),
            timestamp: iso_timestamp(),
        })?;
        state.warnings += 1;
        Ok(())
    }

    pub fn finish_run(&self) -> Result<RunSummary, KiraError> {
        let summary = self.summarize();
        let _guard = self.lock();
        self.append_event(&LedgerEvent::RunFinished {
            run_id: self.run_id.clone(),
            timestamp: iso_timestamp(),
            summary,
        })?;
        Ok(summary)
    }

    pub fn summarize(&self) -> RunSummary {
        RunSummary::from_entries(&self.lock().entries)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.lock().entries.clone()
    }

    pub fn warnings(&self) -> usize {
        self.lock().warnings
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Callers hold the state lock.
    fn append_event(&self, event: &LedgerEvent) -> Result<(), KiraError> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let line = serde_json::to_string(event).map_err(|err| KiraError::LedgerWrite {
            path: files.events.as_std_path().to_path_buf(),
            message: err.to_string(),
        })?;
        append_line(&files.events, &line)
    }
}

fn append_line(path: &Utf8Path, line: &str) -> Result<(), KiraError> {
    let to_error = |err: std::io::Error| KiraError::LedgerWrite {
        path: path.as_std_path().to_path_buf(),
        message: err.to_string(),
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_std_path())
        .map_err(to_error)?;
    file.write_all(format!("{line}\n").as_bytes())
        .map_err(to_error)?;
    file.flush().map_err(to_error)
}

/// Organisms listed in `failed.txt` of `dir` by any earlier run.
pub fn known_failures(dir: &Utf8Path) -> Result<BTreeSet<OrganismName>, KiraError> {
    let path = dir.join(FAILED_FILE);
    if !path.as_std_path().exists() {
        return Ok(BTreeSet::new());
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
    Ok(content
        .lines()
        .filter_map(|line| {
            let name = line
                .split_once(FAILURE_SEPARATOR)
                .map(|(name, _)| name)
                .unwrap_or(line);
            name.parse::<OrganismName>().ok()
        })
        .collect())
}

/// Reconstruction of one run from the event log.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: String,
    pub worklist_len: usize,
    pub finished: bool,
    pub compression_warnings: usize,
    pub summary: RunSummary,
    pub failures: Vec<LedgerEntry>,
}

/// Summarizes the most recent run recorded in `events.jsonl` of `dir`.
///
/// Malformed lines are skipped; a run without a `run_finished` event is
/// reported as unfinished.
pub fn scan_latest_run(dir: &Utf8Path) -> Result<Option<RunReport>, KiraError> {
    let path = dir.join(EVENTS_FILE);
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
    let events = content
        .lines()
        .filter_map(|line| serde_json::from_str::<LedgerEvent>(line).ok())
        .collect::<Vec<_>>();

    let Some((run_id, started_at, worklist_len)) =
        events.iter().rev().find_map(|event| match event {
            LedgerEvent::RunStarted {
                run_id,
                timestamp,
                organisms,
            } => Some((run_id.clone(), timestamp.clone(), *organisms)),
            _ => None,
        })
    else {
        return Ok(None);
    };

    let mut entries = Vec::new();
    let mut finished = false;
    let mut compression_warnings = 0usize;
    for event in events {
        match event {
            LedgerEvent::Organism(entry) if entry.run_id == run_id => entries.push(entry),
            LedgerEvent::CompressionFailed { run_id: id, .. } if id == run_id => {
                compression_warnings += 1
            }
            LedgerEvent::RunFinished { run_id: id, .. } if id == run_id => finished = true,
            _ => {}
        }
    }

    Ok(Some(RunReport {
        summary: RunSummary::from_entries(&entries),
        failures: entries
            .into_iter()
            .filter(|entry| entry.outcome == OutcomeTag::Failed)
            .collect(),
        run_id,
        started_at,
        worklist_len,
        finished,
        compression_warnings,
    }))
}

static RUN_SEQUENCE: AtomicU32 = AtomicU32::new(0);

// Sortable by start time; the sequence keeps ids distinct within a process.
fn new_run_id() -> String {
    format!(
        "{}-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        std::process::id(),
        RUN_SEQUENCE.fetch_add(1, Ordering::SeqCst)
    )
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
