use std::io::{self, IsTerminal, Write};

use camino::Utf8Path;
use serde::Serialize;

use crate::catalog::{Worklist, WorklistOrigin};
use crate::ledger::{RunReport, RunSummary};
use crate::orchestrator::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

/// Result of `run`, as printed in JSON mode.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub worklist_len: usize,
    pub summary: RunSummary,
    pub compression_warnings: usize,
    pub output_dir: String,
    pub ledger_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorklistResult {
    pub path: String,
    pub origin: WorklistOrigin,
    pub organisms: Vec<String>,
}

impl WorklistResult {
    pub fn new(path: &Utf8Path, origin: WorklistOrigin, worklist: &Worklist) -> Self {
        Self {
            path: path.to_string(),
            origin,
            organisms: worklist
                .organisms()
                .iter()
                .map(|name| name.as_str().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanResult {
    pub scratch_dir: String,
    pub removed: usize,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_worklist(result: &WorklistResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(report: Option<&RunReport>) -> io::Result<()> {
        Self::print_json(&report)
    }

    pub fn print_clean(result: &CleanResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

struct Palette {
    green: &'static str,
    yellow: &'static str,
    cyan: &'static str,
    red: &'static str,
    reset: &'static str,
}

impl Palette {
    fn detect() -> Self {
        if io::stdout().is_terminal() {
            Self {
                green: "\x1b[32m",
                yellow: "\x1b[33m",
                cyan: "\x1b[36m",
                red: "\x1b[31m",
                reset: "\x1b[0m",
            }
        } else {
            Self {
                green: "",
                yellow: "",
                cyan: "",
                red: "",
                reset: "",
            }
        }
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_run(result: &RunResult) {
        let Palette {
            green,
            yellow,
            cyan,
            red,
            reset,
        } = Palette::detect();
        let summary = &result.summary;
        println!("{cyan}kira-genomes run {}{reset}", result.run_id);
        println!("  organisms:  {}", summary.total);
        println!("{green}  downloaded: {}{reset}", summary.downloaded);
        println!("{yellow}  skipped:    {}{reset}", summary.skipped);
        println!("{red}  failed:     {}{reset}", summary.failed);
        if result.compression_warnings > 0 {
            println!(
                "{yellow}  compression warnings: {}{reset}",
                result.compression_warnings
            );
        }
        println!("  artifacts:  {}", result.output_dir);
        println!("  ledger:     {}", result.ledger_dir);
    }

    pub fn print_worklist(result: &WorklistResult) {
        for name in &result.organisms {
            println!("{name}");
        }
    }

    pub fn print_report(report: Option<&RunReport>) {
        let Some(report) = report else {
            println!("no runs recorded");
            return;
        };
        let Palette {
            green,
            yellow,
            cyan,
            red,
            reset,
        } = Palette::detect();
        let state = if report.finished {
            "finished"
        } else {
            "interrupted"
        };
        println!(
            "{cyan}run {} ({state}, started {}){reset}",
            report.run_id, report.started_at
        );
        println!(
            "  processed {} of {} organisms",
            report.summary.total, report.worklist_len
        );
        println!("{green}  downloaded: {}{reset}", report.summary.downloaded);
        println!("{yellow}  skipped:    {}{reset}", report.summary.skipped);
        println!("{red}  failed:     {}{reset}", report.summary.failed);
        for entry in &report.failures {
            let reason = entry
                .reason
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            println!("{red}    {} — {reason}{reset}", entry.organism);
        }
    }

    pub fn print_clean(result: &CleanResult) {
        println!(
            "removed {} scratch entries from {}",
            result.removed, result.scratch_dir
        );
    }
}

/// Writes per-organism progress lines to stderr.
pub struct StderrProgress {
    total: usize,
    done: std::sync::atomic::AtomicUsize,
}

impl StderrProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            done: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let done = self
            .done
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let organism = event
            .organism
            .as_ref()
            .map(|name| name.as_str())
            .unwrap_or("-");
        let elapsed = event
            .elapsed
            .map(|elapsed| format!(" ({:.1}s)", elapsed.as_secs_f64()))
            .unwrap_or_default();
        let installed = event
            .artifact
            .as_ref()
            .map(|artifact| {
                let path = artifact
                    .compressed_path
                    .as_ref()
                    .unwrap_or(&artifact.sequence_path);
                format!(" -> {path}")
            })
            .unwrap_or_default();
        eprintln!(
            "[{done}/{}] {organism}: {}{installed}{elapsed}",
            self.total, event.message
        );
    }
}

/// Discards progress; used in JSON mode where stdout carries the result.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}
