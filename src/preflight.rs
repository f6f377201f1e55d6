use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::header::HeaderMap;

use crate::config::{ProviderKind, ResolvedConfig};
use crate::error::KiraError;
use crate::http;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Fetch,
    ArchiveExtract,
    Compress,
    TabularParse,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::Fetch => "fetch",
            Capability::ArchiveExtract => "archive-extract",
            Capability::Compress => "compress",
            Capability::TabularParse => "tabular-parse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Capability(Capability),
    WritableDir(Utf8PathBuf),
}

/// Checks a single requirement; `Err` carries the operator-facing remediation
/// line.
pub trait CapabilityProbe {
    fn probe(&self, requirement: &Requirement) -> Result<(), String>;
}

/// Probe against the running host.
#[derive(Debug, Clone, Copy)]
pub struct SystemProbe {
    provider: ProviderKind,
}

impl SystemProbe {
    pub fn new(provider: ProviderKind) -> Self {
        Self { provider }
    }
}

impl CapabilityProbe for SystemProbe {
    fn probe(&self, requirement: &Requirement) -> Result<(), String> {
        match requirement {
            Requirement::Capability(Capability::Fetch) => match self.provider {
                ProviderKind::Http => http::build_client(HeaderMap::new(), Duration::from_secs(5))
                    .map(|_| ())
                    .map_err(|err| format!("fetch (HTTP client unavailable: {err})")),
                ProviderKind::DatasetsCli => find_in_path("datasets")
                    .map(|_| ())
                    .ok_or_else(|| "fetch (`datasets` CLI not found on PATH)".to_string()),
            },
            // zip, flate2 and the TSV reader are compiled in.
            Requirement::Capability(_) => Ok(()),
            Requirement::WritableDir(path) => {
                fs::create_dir_all(path.as_std_path())
                    .and_then(|_| tempfile::tempfile_in(path.as_std_path()).map(|_| ()))
                    .map_err(|err| format!("writable directory {path} ({err})"))
            }
        }
    }
}

/// Everything a run needs before any work begins.
pub fn requirements(config: &ResolvedConfig) -> Vec<Requirement> {
    let mut required = vec![
        Requirement::Capability(Capability::Fetch),
        Requirement::Capability(Capability::ArchiveExtract),
        Requirement::Capability(Capability::TabularParse),
    ];
    if config.compress {
        required.push(Requirement::Capability(Capability::Compress));
    }
    required.push(Requirement::WritableDir(config.output_dir.clone()));
    if config.ledger_dir != config.output_dir {
        required.push(Requirement::WritableDir(config.ledger_dir.clone()));
    }
    required
}

/// Probes every requirement and reports all missing ones at once.
pub fn verify(requirements: &[Requirement], probe: &dyn CapabilityProbe) -> Result<(), KiraError> {
    let missing = requirements
        .iter()
        .filter_map(|requirement| probe.probe(requirement).err())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        tracing::debug!(checked = requirements.len(), "preflight passed");
        return Ok(());
    }
    for item in &missing {
        tracing::error!(missing = %item, "preflight requirement not met");
    }
    Err(KiraError::MissingDependency(missing))
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
