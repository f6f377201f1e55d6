use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::config::ProviderKind;
use crate::domain::{AssemblyLevel, GenomeSource, OrganismName};
use crate::error::KiraError;
use crate::http;
use crate::preflight::find_in_path;

pub const DEFAULT_BASE_URL: &str = "https://api.ncbi.nlm.nih.gov/datasets/v2";

/// Result of asking one source for an organism's genome package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Archive written to the destination path.
    Archive { bytes: u64 },
    /// The source has no assembly for this organism at the requested level.
    NotFound,
    /// The source could not be reached or kept failing after retries.
    Transient(String),
}

/// One remote assembly collection.
pub trait GenomeProvider: Send + Sync {
    fn source(&self) -> GenomeSource;

    fn fetch(
        &self,
        organism: &OrganismName,
        level: AssemblyLevel,
        destination: &Path,
    ) -> FetchOutcome;
}

impl<T: GenomeProvider + ?Sized> GenomeProvider for Box<T> {
    fn source(&self) -> GenomeSource {
        (**self).source()
    }

    fn fetch(
        &self,
        organism: &OrganismName,
        level: AssemblyLevel,
        destination: &Path,
    ) -> FetchOutcome {
        (**self).fetch(organism, level, destination)
    }
}

impl<T: GenomeProvider + ?Sized> GenomeProvider for &T {
    fn source(&self) -> GenomeSource {
        (**self).source()
    }

    fn fetch(
        &self,
        organism: &OrganismName,
        level: AssemblyLevel,
        destination: &Path,
    ) -> FetchOutcome {
        (**self).fetch(organism, level, destination)
    }
}

/// Builds the provider for `source` using the configured backend.
pub fn provider_for(
    kind: ProviderKind,
    source: GenomeSource,
) -> Result<Box<dyn GenomeProvider>, KiraError> {
    match kind {
        ProviderKind::Http => Ok(Box::new(NcbiHttpClient::new(source)?)),
        ProviderKind::DatasetsCli => Ok(Box::new(DatasetsCliClient::new(source))),
    }
}

#[derive(Debug, Deserialize)]
struct DatasetReportPage {
    #[serde(default)]
    reports: Vec<AssemblyReport>,
}

#[derive(Debug, Deserialize)]
struct AssemblyReport {
    accession: String,
}

/// NCBI Datasets v2 REST client restricted to a single assembly source.
#[derive(Clone)]
pub struct NcbiHttpClient {
    client: Client,
    base_url: String,
    source: GenomeSource,
}

impl NcbiHttpClient {
    pub fn new(source: GenomeSource) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert("X-Datasets-Client", HeaderValue::from_static("kira-genomes"));
        headers.insert(
            "X-Datasets-Client-Version",
            HeaderValue::from_str(env!("CARGO_PKG_VERSION"))
                .map_err(|err| KiraError::NcbiHttp(err.to_string()))?,
        );
        headers.insert(
            "X-Datasets-Client-OS",
            HeaderValue::from_str(std::env::consts::OS)
                .map_err(|err| KiraError::NcbiHttp(err.to_string()))?,
        );
        headers.insert(
            "X-Datasets-Client-Arch",
            HeaderValue::from_str(std::env::consts::ARCH)
                .map_err(|err| KiraError::NcbiHttp(err.to_string()))?,
        );

        if let Ok(api_key) = std::env::var("NCBI_API_KEY") {
            if !api_key.trim().is_empty() {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(api_key.trim())
                        .map_err(|err| KiraError::NcbiHttp(err.to_string()))?,
                );
            }
        }

        Ok(Self {
            client: http::build_client(headers, Duration::from_secs(300))?,
            base_url: DEFAULT_BASE_URL.to_string(),
            source,
        })
    }

    fn resolve_accession(
        &self,
        organism: &OrganismName,
        level: AssemblyLevel,
    ) -> Result<Option<String>, KiraError> {
        let url = taxon_report_url(&self.base_url, organism, self.source, level)?;
        let response = http::send_with_retries(|| self.client.get(url.clone()))
            .map_err(|err| KiraError::NcbiHttp(err.to_string()))?;
        let status = response.status().as_u16();
        if is_not_found_status(status) {
            return Ok(None);
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "NCBI request failed".to_string());
            return Err(KiraError::NcbiStatus { status, message });
        }
        let page: DatasetReportPage = response
            .json()
            .map_err(|err| KiraError::NcbiHttp(err.to_string()))?;
        Ok(page.reports.into_iter().next().map(|report| report.accession))
    }

    fn download_package(
        &self,
        accession: &str,
        destination: &Path,
    ) -> Result<Option<u64>, KiraError> {
        let url = package_url(&self.base_url, accession)?;
        let mut response = http::send_with_retries(|| self.client.get(url.clone()))
            .map_err(|err| KiraError::NcbiHttp(err.to_string()))?;
        let status = response.status().as_u16();
        if is_not_found_status(status) {
            return Ok(None);
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "NCBI request failed".to_string());
            return Err(KiraError::NcbiStatus { status, message });
        }

        let mut file =
            File::create(destination).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let bytes = std::io::copy(&mut response, &mut file)
            .map_err(|err| KiraError::NcbiHttp(err.to_string()))?;
        Ok(Some(bytes))
    }
}

impl GenomeProvider for NcbiHttpClient {
    fn source(&self) -> GenomeSource {
        self.source
    }

    fn fetch(
        &self,
        organism: &OrganismName,
        level: AssemblyLevel,
        destination: &Path,
    ) -> FetchOutcome {
        let accession = match self.resolve_accession(organism, level) {
            Ok(Some(accession)) => accession,
            Ok(None) => return FetchOutcome::NotFound,
            Err(err) => return FetchOutcome::Transient(err.to_string()),
        };
        tracing::debug!(
            organism = %organism,
            source = %self.source,
            accession = %accession,
            "resolved assembly accession"
        );
        match self.download_package(&accession, destination) {
            Ok(Some(bytes)) => FetchOutcome::Archive { bytes },
            Ok(None) => FetchOutcome::NotFound,
            Err(err) => FetchOutcome::Transient(err.to_string()),
        }
    }
}

fn is_not_found_status(status: u16) -> bool {
    matches!(status, 400 | 404)
}

pub fn taxon_report_url(
    base_url: &str,
    organism: &OrganismName,
    source: GenomeSource,
    level: AssemblyLevel,
) -> Result<Url, KiraError> {
    let mut url = Url::parse(base_url).map_err(|err| KiraError::NcbiHttp(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| KiraError::NcbiHttp(format!("base url cannot be a base: {base_url}")))?
        .extend(["genome", "taxon", organism.as_str(), "dataset_report"]);
    url.query_pairs_mut()
        .append_pair("filters.assembly_source", source.as_str())
        .append_pair("filters.assembly_level", level.api_value())
        .append_pair("page_size", "1");
    Ok(url)
}

pub fn package_url(base_url: &str, accession: &str) -> Result<Url, KiraError> {
    let mut url = Url::parse(base_url).map_err(|err| KiraError::NcbiHttp(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| KiraError::NcbiHttp(format!("base url cannot be a base: {base_url}")))?
        .extend(["genome", "accession", accession, "download"]);
    url.query_pairs_mut()
        .append_pair("include_annotation_type", "GENOME_FASTA");
    Ok(url)
}

/// Provider backed by the `datasets` command line tool.
#[derive(Debug, Clone)]
pub struct DatasetsCliClient {
    binary: Option<PathBuf>,
    source: GenomeSource,
}

impl DatasetsCliClient {
    pub fn new(source: GenomeSource) -> Self {
        Self {
            binary: find_in_path("datasets"),
            source,
        }
    }

    fn args(
        &self,
        organism: &OrganismName,
        level: AssemblyLevel,
        destination: &Path,
    ) -> Vec<String> {
        vec![
            "download".to_string(),
            "genome".to_string(),
            "taxon".to_string(),
            organism.as_str().to_string(),
            "--assembly-source".to_string(),
            self.source.as_str().to_string(),
            "--assembly-level".to_string(),
            level.to_string(),
            "--include".to_string(),
            "genome".to_string(),
            "--filename".to_string(),
            destination.to_string_lossy().to_string(),
            "--no-progressbar".to_string(),
        ]
    }
}

impl GenomeProvider for DatasetsCliClient {
    fn source(&self) -> GenomeSource {
        self.source
    }

    fn fetch(
        &self,
        organism: &OrganismName,
        level: AssemblyLevel,
        destination: &Path,
    ) -> FetchOutcome {
        let Some(binary) = self.binary.as_ref() else {
            return FetchOutcome::Transient(
                KiraError::MissingTool("datasets".to_string()).to_string(),
            );
        };
        let output = match Command::new(binary)
            .args(self.args(organism, level, destination))
            .output()
        {
            Ok(output) => output,
            Err(err) => {
                return FetchOutcome::Transient(KiraError::DatasetsCli(err.to_string()).to_string());
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return classify_cli_failure(&stderr);
        }

        match fs::metadata(destination) {
            Ok(meta) if meta.len() > 0 => FetchOutcome::Archive { bytes: meta.len() },
            _ => FetchOutcome::NotFound,
        }
    }
}

/// Maps a failed `datasets` invocation to not-found or transient.
pub fn classify_cli_failure(stderr: &str) -> FetchOutcome {
    let lowered = stderr.to_ascii_lowercase();
    let not_found = ["no assemblies", "no genome", "not found", "not recognized", "no match"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if not_found {
        FetchOutcome::NotFound
    } else if stderr.is_empty() {
        FetchOutcome::Transient(
            KiraError::DatasetsCli("exited with failure".to_string()).to_string(),
        )
    } else {
        FetchOutcome::Transient(KiraError::DatasetsCli(stderr.to_string()).to_string())
    }
}
