use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use flate2::read::GzDecoder;
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use kira_genomes::catalog::Worklist;
use kira_genomes::domain::{
    AssemblyLevel, FailureReason, GenomeSource, OrganismName, Outcome, OutcomeTag,
};
use kira_genomes::error::KiraError;
use kira_genomes::fs_util::{ArchiveExtractor, ZipExtractor};
use kira_genomes::ledger::{self, DOWNLOADED_FILE, FAILED_FILE, Ledger, RunSummary};
use kira_genomes::ncbi::{FetchOutcome, GenomeProvider};
use kira_genomes::orchestrator::{AcquisitionOptions, Orchestrator, ProgressEvent, ProgressSink};
use kira_genomes::store::{ArtifactStore, FsArtifactStore, GenomeArtifact};

#[derive(Clone)]
enum Reply {
    Package(Vec<(&'static str, &'static str)>),
    ZeroBytes,
    Garbage,
    NotFound,
    Transient(&'static str),
}

struct MockProvider {
    source: GenomeSource,
    replies: HashMap<String, Reply>,
    calls: Mutex<Vec<String>>,
}

impl MockProvider {
    fn new(source: GenomeSource) -> Self {
        Self {
            source,
            replies: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with(mut self, organism: &str, reply: Reply) -> Self {
        self.replies.insert(organism.to_string(), reply);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl GenomeProvider for MockProvider {
    fn source(&self) -> GenomeSource {
        self.source
    }

    fn fetch(
        &self,
        organism: &OrganismName,
        _level: AssemblyLevel,
        destination: &Path,
    ) -> FetchOutcome {
        self.calls
            .lock()
            .unwrap()
            .push(organism.as_str().to_string());
        match self.replies.get(organism.as_str()).cloned() {
            Some(Reply::Package(entries)) => {
                write_zip(destination, &entries);
                FetchOutcome::Archive {
                    bytes: fs::metadata(destination).unwrap().len(),
                }
            }
            Some(Reply::ZeroBytes) => {
                fs::write(destination, b"").unwrap();
                FetchOutcome::Archive { bytes: 0 }
            }
            Some(Reply::Garbage) => {
                let body = b"<html>gateway timeout</html>";
                fs::write(destination, body).unwrap();
                FetchOutcome::Archive {
                    bytes: body.len() as u64,
                }
            }
            Some(Reply::Transient(detail)) => FetchOutcome::Transient(detail.to_string()),
            Some(Reply::NotFound) | None => FetchOutcome::NotFound,
        }
    }
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    for (name, body) in entries {
        writer
            .start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

fn genome_package(body: &'static str) -> Reply {
    Reply::Package(vec![
        ("ncbi_dataset/data/GCF_000001/GCF_000001_genomic.fna", body),
        ("ncbi_dataset/data/assembly_data_report.jsonl", "{}\n"),
    ])
}

/// Store whose compression step always fails.
struct NoGzipStore(FsArtifactStore);

impl ArtifactStore for NoGzipStore {
    fn contains(&self, organism: &OrganismName) -> bool {
        self.0.contains(organism)
    }

    fn artifact_path(&self, organism: &OrganismName) -> Utf8PathBuf {
        self.0.artifact_path(organism)
    }

    fn scratch_dir(&self, organism: &OrganismName) -> Result<TempDir, KiraError> {
        self.0.scratch_dir(organism)
    }

    fn install(
        &self,
        organism: &OrganismName,
        sequence_file: &Path,
    ) -> Result<GenomeArtifact, KiraError> {
        self.0.install(organism, sequence_file)
    }

    fn compress(&self, _artifact: &GenomeArtifact) -> Result<Utf8PathBuf, KiraError> {
        Err(KiraError::Filesystem("no space left on device".to_string()))
    }
}

/// Extractor that can never write its output.
struct FullDiskExtractor;

impl ArchiveExtractor for FullDiskExtractor {
    fn extract(&self, _archive: &Path, target_dir: &Path) -> Result<(), KiraError> {
        Err(KiraError::Filesystem(format!(
            "create {}: No space left on device",
            target_dir.display()
        )))
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingSink {
    fn last_artifact(&self) -> Option<GenomeArtifact> {
        self.events.lock().unwrap().last().and_then(|event| event.artifact.clone())
    }
}

struct Fixture {
    _temp: TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("genomes")).unwrap();
        fs::create_dir_all(root.as_std_path()).unwrap();
        Self { _temp: temp, root }
    }

    fn store(&self) -> FsArtifactStore {
        FsArtifactStore::new(self.root.clone(), "fna")
    }

    fn ledger(&self) -> Ledger {
        Ledger::open(&self.root).unwrap()
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.root.join(name).as_std_path()).unwrap_or_default()
    }

    fn scratch_is_empty(&self) -> bool {
        let scratch = self.store().scratch_root();
        !scratch.as_std_path().exists()
            || fs::read_dir(scratch.as_std_path()).unwrap().next().is_none()
    }
}

fn options(compress: bool, jobs: usize) -> AcquisitionOptions {
    AcquisitionOptions {
        assembly_level: AssemblyLevel::Complete,
        compress,
        sequence_extension: "fna".to_string(),
        jobs,
    }
}

fn worklist(names: &[&str]) -> Worklist {
    Worklist::from_names(names.iter().map(|name| name.parse::<OrganismName>().unwrap()))
}

fn organism(name: &str) -> OrganismName {
    name.parse().unwrap()
}

fn failure_of(outcome: Outcome) -> FailureReason {
    match outcome {
        Outcome::Failed { reason } => reason,
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn existing_artifact_skips_and_missing_falls_back_to_secondary() {
    let fixture = Fixture::new();
    let store = fixture.store();
    fs::write(store.artifact_path(&organism("Alpha")).as_std_path(), b">old\n").unwrap();

    let primary = MockProvider::new(GenomeSource::RefSeq).with("Beta", Reply::NotFound);
    let secondary =
        MockProvider::new(GenomeSource::GenBank).with("Beta", genome_package(">b\nGG\n"));
    let orchestrator =
        Orchestrator::new(&primary, &secondary, store, ZipExtractor, options(false, 1));
    let ledger = fixture.ledger();
    let sink = RecordingSink::default();

    let summary = orchestrator
        .run(&worklist(&["Beta", "Alpha"]), &ledger, &sink)
        .unwrap();

    assert_eq!(
        summary,
        RunSummary {
            total: 2,
            skipped: 1,
            downloaded: 1,
            failed: 0,
        }
    );
    let entries = ledger.entries();
    assert_eq!(entries[0].organism.as_str(), "Alpha");
    assert_eq!(entries[0].outcome, OutcomeTag::SkippedExisting);
    assert_eq!(entries[1].organism.as_str(), "Beta");
    assert_eq!(entries[1].source, Some(GenomeSource::GenBank));

    // Alpha is never sent to any source.
    assert_eq!(primary.calls(), vec!["Beta"]);
    assert_eq!(secondary.calls(), vec!["Beta"]);

    let store = orchestrator.store();
    assert_eq!(
        fs::read(store.artifact_path(&organism("Beta")).as_std_path()).unwrap(),
        b">b\nGG\n"
    );
    assert_eq!(
        fs::read(store.artifact_path(&organism("Alpha")).as_std_path()).unwrap(),
        b">old\n"
    );
    assert_eq!(fixture.read(DOWNLOADED_FILE), "Beta\n");
    assert_eq!(fixture.read(FAILED_FILE), "");
    assert_eq!(sink.events.lock().unwrap().len(), 2);
    assert!(fixture.scratch_is_empty());
}

#[test]
fn primary_hit_never_queries_secondary() {
    let fixture = Fixture::new();
    let primary =
        MockProvider::new(GenomeSource::RefSeq).with("Alpha", genome_package(">a\nAC\n"));
    let secondary =
        MockProvider::new(GenomeSource::GenBank).with("Alpha", genome_package(">x\n"));
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 1),
    );

    let outcome = orchestrator
        .process(
            &organism("Alpha"),
            &Ledger::in_memory(),
            &RecordingSink::default(),
        )
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::Downloaded {
            source: GenomeSource::RefSeq
        }
    );
    assert_eq!(primary.calls(), vec!["Alpha"]);
    assert!(secondary.calls().is_empty());
}

#[test]
fn both_sources_missing_is_source_unavailable() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq);
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(true, 1),
    );
    let ledger = fixture.ledger();

    let summary = orchestrator
        .run(&worklist(&["Gamma"]), &ledger, &RecordingSink::default())
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(fixture.read(FAILED_FILE), "Gamma — SourceUnavailable\n");
    assert_eq!(fixture.read(DOWNLOADED_FILE), "");
    assert!(!orchestrator.store().contains(&organism("Gamma")));
    assert_eq!(primary.calls(), vec!["Gamma"]);
    assert_eq!(secondary.calls(), vec!["Gamma"]);
}

#[test]
fn transient_error_is_reported_as_fetch_error() {
    let fixture = Fixture::new();
    let primary =
        MockProvider::new(GenomeSource::RefSeq).with("Delta", Reply::Transient("status 503"));
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 1),
    );

    let outcome = orchestrator
        .process(
            &organism("Delta"),
            &Ledger::in_memory(),
            &RecordingSink::default(),
        )
        .unwrap();

    assert_eq!(
        failure_of(outcome),
        FailureReason::FetchError("refseq: status 503".to_string())
    );
    assert_eq!(secondary.calls(), vec!["Delta"]);
}

#[test]
fn transient_primary_still_falls_back() {
    let fixture = Fixture::new();
    let primary =
        MockProvider::new(GenomeSource::RefSeq).with("Delta", Reply::Transient("timed out"));
    let secondary =
        MockProvider::new(GenomeSource::GenBank).with("Delta", genome_package(">d\n"));
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 1),
    );

    let outcome = orchestrator
        .process(
            &organism("Delta"),
            &Ledger::in_memory(),
            &RecordingSink::default(),
        )
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Downloaded {
            source: GenomeSource::GenBank
        }
    );
}

#[test]
fn zero_byte_primary_archive_counts_as_absent() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq).with("Eta", Reply::ZeroBytes);
    let secondary = MockProvider::new(GenomeSource::GenBank).with("Eta", genome_package(">e\n"));
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 1),
    );

    let outcome = orchestrator
        .process(
            &organism("Eta"),
            &Ledger::in_memory(),
            &RecordingSink::default(),
        )
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Downloaded {
            source: GenomeSource::GenBank
        }
    );
    assert_eq!(secondary.calls(), vec!["Eta"]);
}

#[test]
fn archive_without_sequence_is_empty_archive() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq).with(
        "Theta",
        Reply::Package(vec![("ncbi_dataset/data/dataset_catalog.json", "{}")]),
    );
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(true, 1),
    );
    let ledger = fixture.ledger();

    let outcome = orchestrator
        .process(&organism("Theta"), &ledger, &RecordingSink::default())
        .unwrap();

    assert_eq!(failure_of(outcome), FailureReason::EmptyArchive);
    assert!(!orchestrator.store().contains(&organism("Theta")));
    assert!(secondary.calls().is_empty());
    assert_eq!(fixture.read(FAILED_FILE), "Theta — EmptyArchive\n");
    assert!(fixture.scratch_is_empty());
}

#[test]
fn unreadable_archive_is_archive_corrupt() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq).with("Iota", Reply::Garbage);
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 1),
    );

    let outcome = orchestrator
        .process(
            &organism("Iota"),
            &Ledger::in_memory(),
            &RecordingSink::default(),
        )
        .unwrap();

    assert_matches!(failure_of(outcome), FailureReason::ArchiveCorrupt(_));
    assert!(!orchestrator.store().contains(&organism("Iota")));
    assert!(fixture.scratch_is_empty());
}

#[test]
fn extraction_write_failure_is_filesystem_error() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq).with("Iota", genome_package(">i\n"));
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        FullDiskExtractor,
        options(false, 1),
    );
    let ledger = fixture.ledger();

    let outcome = orchestrator
        .process(&organism("Iota"), &ledger, &RecordingSink::default())
        .unwrap();

    assert_matches!(failure_of(outcome), FailureReason::Filesystem(detail) if detail.contains("No space left"));
    assert!(fixture.read(FAILED_FILE).starts_with("Iota — FilesystemError: "));
    assert!(fixture.scratch_is_empty());
}

#[test]
fn multiline_fetch_error_keeps_failed_file_parseable() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq).with(
        "Beta",
        Reply::Transient("NCBI returned status 403: <html>\n<body>Forbidden</body>\n</html>"),
    );
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 1),
    );
    let ledger = fixture.ledger();
    let sink = RecordingSink::default();

    orchestrator
        .run(&worklist(&["Beta"]), &ledger, &sink)
        .unwrap();

    assert_eq!(
        fixture.read(FAILED_FILE),
        "Beta — FetchError: refseq: NCBI returned status 403: <html> <body>Forbidden</body> </html>\n"
    );
    assert_eq!(
        ledger::known_failures(&fixture.root).unwrap().into_iter().collect::<Vec<_>>(),
        vec![organism("Beta")]
    );
    let events = sink.events.lock().unwrap();
    assert!(!events[0].message.contains('\n'));
}

#[test]
fn several_sequence_files_use_the_first() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq).with(
        "Kappa",
        Reply::Package(vec![
            ("ncbi_dataset/data/GCF_2/GCF_2_genomic.fna", ">second\n"),
            ("ncbi_dataset/data/GCF_1/GCF_1_genomic.fna", ">first\n"),
        ]),
    );
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 1),
    );

    orchestrator
        .process(
            &organism("Kappa"),
            &Ledger::in_memory(),
            &RecordingSink::default(),
        )
        .unwrap();

    let path = orchestrator.store().artifact_path(&organism("Kappa"));
    assert_eq!(fs::read(path.as_std_path()).unwrap(), b">first\n");
}

#[test]
fn compression_writes_gzip_sibling() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq)
        .with("Bacillus subtilis", genome_package(">bs\nACGT\n"));
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(true, 1),
    );
    let sink = RecordingSink::default();

    orchestrator
        .process(&organism("Bacillus subtilis"), &Ledger::in_memory(), &sink)
        .unwrap();

    let gz = fixture.root.join("Bacillus_subtilis.fna.gz");
    let artifact = sink.last_artifact().unwrap();
    assert_eq!(artifact.sequence_path, fixture.root.join("Bacillus_subtilis.fna"));
    assert_eq!(artifact.compressed_path, Some(gz.clone()));
    let mut decoded = Vec::new();
    GzDecoder::new(fs::File::open(gz.as_std_path()).unwrap())
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, b">bs\nACGT\n");
    assert!(fixture.root.join("Bacillus_subtilis.fna").as_std_path().is_file());
}

#[test]
fn compression_failure_keeps_download() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq).with("Alpha", genome_package(">a\n"));
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        NoGzipStore(fixture.store()),
        ZipExtractor,
        options(true, 1),
    );
    let ledger = fixture.ledger();
    let sink = RecordingSink::default();

    let summary = orchestrator
        .run(&worklist(&["Alpha"]), &ledger, &sink)
        .unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(ledger.warnings(), 1);
    assert_eq!(sink.last_artifact().unwrap().compressed_path, None);
    assert!(fixture.store().contains(&organism("Alpha")));
    assert!(!fixture.root.join("Alpha.fna.gz").as_std_path().exists());

    let report = ledger::scan_latest_run(&fixture.root).unwrap().unwrap();
    assert_eq!(report.compression_warnings, 1);
    assert!(report.finished);
}

#[test]
fn second_run_skips_everything() {
    let fixture = Fixture::new();
    let primary = MockProvider::new(GenomeSource::RefSeq)
        .with("Alpha", genome_package(">a\n"))
        .with("Beta", genome_package(">b\n"));
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(true, 1),
    );
    let list = worklist(&["Alpha", "Beta"]);

    let first = orchestrator
        .run(&list, &fixture.ledger(), &RecordingSink::default())
        .unwrap();
    assert_eq!(first.downloaded, 2);
    let calls_after_first = primary.calls().len();

    let second = orchestrator
        .run(&list, &fixture.ledger(), &RecordingSink::default())
        .unwrap();
    assert_eq!(
        second,
        RunSummary {
            total: 2,
            skipped: 2,
            downloaded: 0,
            failed: 0,
        }
    );
    assert_eq!(primary.calls().len(), calls_after_first);
    assert_eq!(fixture.read(DOWNLOADED_FILE), "Alpha\nBeta\n");
}

#[test]
fn parallel_run_records_each_organism_once() {
    let fixture = Fixture::new();
    let names = [
        "Org 00", "Org 01", "Org 02", "Org 03", "Org 04", "Org 05", "Org 06", "Org 07", "Org 08",
        "Org 09", "Org 10", "Org 11",
    ];
    let mut primary = MockProvider::new(GenomeSource::RefSeq);
    let mut secondary = MockProvider::new(GenomeSource::GenBank);
    for (index, name) in names.iter().enumerate() {
        match index % 3 {
            0 => primary = primary.with(name, genome_package(">p\n")),
            1 => secondary = secondary.with(name, genome_package(">s\n")),
            _ => {}
        }
    }
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 4),
    );
    let ledger = fixture.ledger();

    let summary = orchestrator
        .run(&worklist(&names), &ledger, &RecordingSink::default())
        .unwrap();

    assert_eq!(
        summary,
        RunSummary {
            total: 12,
            skipped: 0,
            downloaded: 8,
            failed: 4,
        }
    );
    assert!(summary.is_consistent());
    let mut recorded = ledger
        .entries()
        .into_iter()
        .map(|entry| entry.organism.as_str().to_string())
        .collect::<Vec<_>>();
    recorded.sort();
    assert_eq!(recorded, names.iter().map(|n| n.to_string()).collect::<Vec<_>>());
    assert_eq!(fixture.read(FAILED_FILE).lines().count(), 4);
    assert!(fixture.scratch_is_empty());
}

#[test]
fn ledger_write_failure_aborts_run() {
    let fixture = Fixture::new();
    let ledger_dir = fixture.root.join("ledger");
    let ledger = Ledger::open(&ledger_dir).unwrap();
    // A directory where the success file should be makes every append fail.
    fs::create_dir_all(ledger_dir.join(DOWNLOADED_FILE).as_std_path()).unwrap();

    let primary = MockProvider::new(GenomeSource::RefSeq)
        .with("Alpha", genome_package(">a\n"))
        .with("Beta", genome_package(">b\n"));
    let secondary = MockProvider::new(GenomeSource::GenBank);
    let orchestrator = Orchestrator::new(
        &primary,
        &secondary,
        fixture.store(),
        ZipExtractor,
        options(false, 1),
    );

    let err = orchestrator
        .run(&worklist(&["Alpha", "Beta"]), &ledger, &RecordingSink::default())
        .unwrap_err();
    assert_matches!(err, KiraError::LedgerWrite { .. });
    assert_eq!(primary.calls(), vec!["Alpha"]);
}
