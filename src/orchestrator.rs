//! Drives each organism of a worklist to a terminal outcome.
//!
//! Per organism the orchestrator walks an explicit state machine:
//!
//! ```text
//! Pending -> CheckExisting -> AttemptPrimary -> AttemptSecondary
//!         -> Extract -> Finalize -> Downloaded
//! ```
//!
//! with `Skipped` reachable from `CheckExisting` and `Failed` reachable from
//! every state after it. Per-organism failures end in the ledger; only a
//! ledger write failure aborts the run.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::catalog::Worklist;
use crate::config::ResolvedConfig;
use crate::domain::{
    AcquisitionAttempt, AssemblyLevel, AttemptOutcome, FailureReason, GenomeSource, OrganismName,
    Outcome,
};
use crate::error::KiraError;
use crate::fs_util::{self, ArchiveExtractor};
use crate::ledger::{Ledger, RunSummary};
use crate::ncbi::{FetchOutcome, GenomeProvider};
use crate::store::{ArtifactStore, GenomeArtifact};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub organism: Option<OrganismName>,
    pub message: String,
    pub elapsed: Option<Duration>,
    /// Installed files, set when the organism was downloaded in this run.
    pub artifact: Option<GenomeArtifact>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    pub assembly_level: AssemblyLevel,
    pub compress: bool,
    pub sequence_extension: String,
    pub jobs: usize,
}

impl From<&ResolvedConfig> for AcquisitionOptions {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            assembly_level: config.assembly_level,
            compress: config.compress,
            sequence_extension: config.sequence_extension.clone(),
            jobs: config.jobs,
        }
    }
}

#[derive(Debug)]
enum AcquisitionState {
    Pending,
    CheckExisting,
    AttemptPrimary,
    AttemptSecondary {
        primary: AcquisitionAttempt,
    },
    Extract {
        source: GenomeSource,
        archive: PathBuf,
    },
    Finalize {
        source: GenomeSource,
        sequence_file: PathBuf,
    },
    Done(Outcome),
}

impl AcquisitionState {
    fn label(&self) -> &'static str {
        match self {
            AcquisitionState::Pending => "Pending",
            AcquisitionState::CheckExisting => "CheckExisting",
            AcquisitionState::AttemptPrimary => "AttemptPrimary",
            AcquisitionState::AttemptSecondary { .. } => "AttemptSecondary",
            AcquisitionState::Extract { .. } => "Extract",
            AcquisitionState::Finalize { .. } => "Finalize",
            AcquisitionState::Done(Outcome::SkippedExisting) => "Skipped",
            AcquisitionState::Done(Outcome::Downloaded { .. }) => "Downloaded",
            AcquisitionState::Done(Outcome::Failed { .. }) => "Failed",
        }
    }
}

/// Working set of one organism while it moves through the states.
struct OrganismWork<'a> {
    organism: &'a OrganismName,
    scratch: Option<TempDir>,
    artifact: Option<GenomeArtifact>,
}

impl OrganismWork<'_> {
    fn scratch_path<S: ArtifactStore>(&mut self, store: &S) -> Result<PathBuf, KiraError> {
        if let Some(dir) = &self.scratch {
            return Ok(dir.path().to_path_buf());
        }
        let dir = store.scratch_dir(self.organism)?;
        let path = dir.path().to_path_buf();
        self.scratch = Some(dir);
        Ok(path)
    }

    fn cleanup(&mut self) {
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                tracing::warn!(
                    organism = %self.organism,
                    path = %path.display(),
                    error = %err,
                    "failed to remove scratch directory"
                );
            }
        }
    }
}

pub struct Orchestrator<P: GenomeProvider, S: ArtifactStore, X: ArchiveExtractor> {
    primary: P,
    secondary: P,
    store: S,
    extractor: X,
    options: AcquisitionOptions,
}

impl<P: GenomeProvider, S: ArtifactStore, X: ArchiveExtractor> Orchestrator<P, S, X> {
    pub fn new(
        primary: P,
        secondary: P,
        store: S,
        extractor: X,
        options: AcquisitionOptions,
    ) -> Self {
        Self {
            primary,
            secondary,
            store,
            extractor,
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Processes the whole worklist and closes the run in the ledger.
    ///
    /// With `jobs == 1` organisms are handled in worklist order. With more
    /// jobs each worker pulls the next unclaimed organism; every organism is
    /// still recorded exactly once.
    pub fn run(
        &self,
        worklist: &Worklist,
        ledger: &Ledger,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, KiraError> {
        ledger.begin_run(worklist.len())?;
        tracing::info!(
            run_id = ledger.run_id(),
            organisms = worklist.len(),
            level = %self.options.assembly_level,
            jobs = self.options.jobs,
            "starting acquisition run"
        );

        if self.options.jobs <= 1 {
            for organism in worklist.organisms() {
                self.process(organism, ledger, sink)?;
            }
        } else {
            self.run_parallel(worklist.organisms(), ledger, sink)?;
        }

        let summary = ledger.finish_run()?;
        tracing::info!(
            run_id = ledger.run_id(),
            total = summary.total,
            skipped = summary.skipped,
            downloaded = summary.downloaded,
            failed = summary.failed,
            "acquisition run finished"
        );
        Ok(summary)
    }

    fn run_parallel(
        &self,
        organisms: &[OrganismName],
        ledger: &Ledger,
        sink: &dyn ProgressSink,
    ) -> Result<(), KiraError> {
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let fatal: Mutex<Option<KiraError>> = Mutex::new(None);
        let workers = self.options.jobs.min(organisms.len().max(1));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while !abort.load(Ordering::SeqCst) {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(organism) = organisms.get(index) else {
                            break;
                        };
                        if let Err(err) = self.process(organism, ledger, sink) {
                            abort.store(true, Ordering::SeqCst);
                            let mut slot = fatal.lock().unwrap_or_else(|p| p.into_inner());
                            slot.get_or_insert(err);
                            break;
                        }
                    }
                });
            }
        });

        match fatal.into_inner().unwrap_or_else(|p| p.into_inner()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs one organism to its terminal state and appends the ledger entry.
    ///
    /// Only a ledger write failure is returned as an error.
    pub fn process(
        &self,
        organism: &OrganismName,
        ledger: &Ledger,
        sink: &dyn ProgressSink,
    ) -> Result<Outcome, KiraError> {
        let started = Instant::now();
        let mut work = OrganismWork {
            organism,
            scratch: None,
            artifact: None,
        };

        let mut state = AcquisitionState::Pending;
        let outcome = loop {
            state = match state {
                AcquisitionState::Done(outcome) => break outcome,
                current => {
                    let next = self.step(&mut work, current, ledger);
                    tracing::debug!(organism = %organism, state = next.label(), "transition");
                    next
                }
            };
        };
        work.cleanup();

        ledger.record(organism, &outcome)?;
        self.report(organism, &outcome, work.artifact.take(), started.elapsed(), sink);
        Ok(outcome)
    }

    fn step(
        &self,
        work: &mut OrganismWork<'_>,
        state: AcquisitionState,
        ledger: &Ledger,
    ) -> AcquisitionState {
        match state {
            AcquisitionState::Pending => AcquisitionState::CheckExisting,
            AcquisitionState::CheckExisting => {
                if self.store.contains(work.organism) {
                    AcquisitionState::Done(Outcome::SkippedExisting)
                } else {
                    AcquisitionState::AttemptPrimary
                }
            }
            AcquisitionState::AttemptPrimary => {
                match self.attempt(&self.primary, work) {
                    Ok((attempt, Some(archive))) => AcquisitionState::Extract {
                        source: attempt.source,
                        archive,
                    },
                    Ok((attempt, None)) => AcquisitionState::AttemptSecondary { primary: attempt },
                    Err(reason) => failed(reason),
                }
            }
            AcquisitionState::AttemptSecondary { primary } => {
                match self.attempt(&self.secondary, work) {
                    Ok((attempt, Some(archive))) => AcquisitionState::Extract {
                        source: attempt.source,
                        archive,
                    },
                    Ok((attempt, None)) => failed(exhausted_reason(&[primary, attempt])),
                    Err(reason) => failed(reason),
                }
            }
            AcquisitionState::Extract { source, archive } => {
                match self.extract(work, &archive) {
                    Ok(sequence_file) => AcquisitionState::Finalize {
                        source,
                        sequence_file,
                    },
                    Err(reason) => failed(reason),
                }
            }
            AcquisitionState::Finalize {
                source,
                sequence_file,
            } => self.finalize(work, source, &sequence_file, ledger),
            done @ AcquisitionState::Done(_) => done,
        }
    }

    /// Asks one source for the organism. Returns the archive path when the
    /// source produced a non-empty archive.
    fn attempt(
        &self,
        provider: &P,
        work: &mut OrganismWork<'_>,
    ) -> Result<(AcquisitionAttempt, Option<PathBuf>), FailureReason> {
        let source = provider.source();
        let scratch = work
            .scratch_path(&self.store)
            .map_err(|err| FailureReason::Filesystem(err.to_string()))?;
        let archive = scratch.join(format!("{}.zip", source.as_str()));

        let started = Instant::now();
        let fetched = provider.fetch(work.organism, self.options.assembly_level, &archive);
        let (outcome, error) = match &fetched {
            FetchOutcome::Archive { bytes } if *bytes > 0 => (AttemptOutcome::ArchivePresent, None),
            FetchOutcome::Archive { .. } | FetchOutcome::NotFound => {
                (AttemptOutcome::ArchiveAbsent, None)
            }
            FetchOutcome::Transient(detail) => (AttemptOutcome::ArchiveAbsent, Some(detail.clone())),
        };
        let attempt = AcquisitionAttempt {
            organism: work.organism.clone(),
            source,
            outcome,
            error,
        };
        tracing::info!(
            organism = %work.organism,
            source = %source,
            role = source.role(),
            found = outcome == AttemptOutcome::ArchivePresent,
            error = attempt.error.as_deref(),
            latency_ms = started.elapsed().as_millis() as u64,
            "source attempt"
        );

        let archive = (outcome == AttemptOutcome::ArchivePresent).then_some(archive);
        Ok((attempt, archive))
    }

    fn extract(&self, work: &mut OrganismWork<'_>, archive: &Path) -> Result<PathBuf, FailureReason> {
        let scratch = work
            .scratch_path(&self.store)
            .map_err(|err| FailureReason::Filesystem(err.to_string()))?;
        let target = scratch.join("extract");
        self.extractor
            .extract(archive, &target)
            .map_err(|err| match err {
                KiraError::ArchiveFormat(detail) => FailureReason::ArchiveCorrupt(detail),
                KiraError::Filesystem(detail) => FailureReason::Filesystem(detail),
                other => FailureReason::Filesystem(other.to_string()),
            })?;

        let mut candidates = fs_util::find_files_with_ext(&target, &self.options.sequence_extension)
            .map_err(|err| FailureReason::Filesystem(err.to_string()))?;
        if candidates.len() > 1 {
            tracing::warn!(
                organism = %work.organism,
                candidates = candidates.len(),
                chosen = %candidates[0].display(),
                "archive holds several sequence files; using the first"
            );
        }
        if candidates.is_empty() {
            return Err(FailureReason::EmptyArchive);
        }
        Ok(candidates.swap_remove(0))
    }

    fn finalize(
        &self,
        work: &mut OrganismWork<'_>,
        source: GenomeSource,
        sequence_file: &Path,
        ledger: &Ledger,
    ) -> AcquisitionState {
        let mut artifact = match self.store.install(work.organism, sequence_file) {
            Ok(artifact) => artifact,
            Err(err) => {
                work.cleanup();
                return failed(FailureReason::Filesystem(err.to_string()));
            }
        };
        work.cleanup();

        if self.options.compress {
            match self.store.compress(&artifact) {
                Ok(path) => artifact.compressed_path = Some(path),
                Err(err) => {
                    tracing::warn!(
                        organism = %work.organism,
                        path = %artifact.sequence_path,
                        error = %err,
                        "compression failed; keeping uncompressed artifact"
                    );
                    if let Err(ledger_err) =
                        ledger.record_compression_failure(work.organism, &err.to_string())
                    {
                        tracing::error!(error = %ledger_err, "failed to record compression warning");
                    }
                }
            }
        }
        work.artifact = Some(artifact);
        AcquisitionState::Done(Outcome::Downloaded { source })
    }

    fn report(
        &self,
        organism: &OrganismName,
        outcome: &Outcome,
        artifact: Option<GenomeArtifact>,
        elapsed: Duration,
        sink: &dyn ProgressSink,
    ) {
        let message = match outcome {
            Outcome::SkippedExisting => {
                tracing::info!(organism = %organism, "artifact present; skipped");
                "skipped-existing".to_string()
            }
            Outcome::Downloaded { source } => {
                let sequence_path = artifact
                    .as_ref()
                    .map(|artifact| artifact.sequence_path.clone())
                    .unwrap_or_else(|| self.store.artifact_path(organism));
                tracing::info!(
                    organism = %organism,
                    source = %source,
                    path = %sequence_path,
                    compressed = artifact
                        .as_ref()
                        .and_then(|artifact| artifact.compressed_path.as_ref())
                        .map(|path| path.as_str()),
                    "genome downloaded"
                );
                format!("downloaded ({})", source.role())
            }
            Outcome::Failed { reason } => {
                tracing::warn!(organism = %organism, reason = %reason, "acquisition failed");
                format!("failed: {reason}")
            }
        };
        sink.event(ProgressEvent {
            organism: Some(organism.clone()),
            message,
            elapsed: Some(elapsed),
            artifact,
        });
    }
}

fn failed(reason: FailureReason) -> AcquisitionState {
    AcquisitionState::Done(Outcome::Failed {
        reason: reason.single_line(),
    })
}

/// Both sources came back without an archive.
fn exhausted_reason(attempts: &[AcquisitionAttempt]) -> FailureReason {
    let errors = attempts
        .iter()
        .filter_map(|attempt| {
            attempt
                .error
                .as_ref()
                .map(|error| format!("{}: {error}", attempt.source))
        })
        .collect::<Vec<_>>();
    if errors.is_empty() {
        FailureReason::SourceUnavailable
    } else {
        FailureReason::FetchError(errors.join("; "))
    }
}
