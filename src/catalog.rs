//! Organism catalog retrieval and worklist extraction.
//!
//! The catalog is a tab-separated table whose first row is a header and
//! whose first column holds organism names. Extraction yields a sorted,
//! deduplicated [`Worklist`] that is cached on disk; the cache's presence
//! suppresses re-extraction on later runs.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::config::CatalogLocation;
use crate::domain::OrganismName;
use crate::error::KiraError;
use crate::http;

/// Provider of the raw catalog text.
pub trait CatalogSource: Send + Sync {
    fn fetch_catalog(&self) -> Result<String, KiraError>;
}

#[derive(Clone)]
pub struct CatalogHttpClient {
    client: reqwest::blocking::Client,
    url: String,
}

impl CatalogHttpClient {
    pub fn new(url: impl Into<String>) -> Result<Self, KiraError> {
        let client = http::build_client(HeaderMap::new(), Duration::from_secs(60))
            .map_err(|err| KiraError::CatalogFetch(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl CatalogSource for CatalogHttpClient {
    fn fetch_catalog(&self) -> Result<String, KiraError> {
        let response = http::send_with_retries(|| self.client.get(&self.url))
            .map_err(|err| KiraError::CatalogFetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(KiraError::CatalogFetch(format!(
                "{} returned status {}",
                self.url,
                response.status().as_u16()
            )));
        }
        response
            .text()
            .map_err(|err| KiraError::CatalogFetch(err.to_string()))
    }
}

/// Catalog read from a local file.
#[derive(Debug, Clone)]
pub struct CatalogFile {
    path: Utf8PathBuf,
}

impl CatalogFile {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogSource for CatalogFile {
    fn fetch_catalog(&self) -> Result<String, KiraError> {
        fs::read_to_string(self.path.as_std_path())
            .map_err(|err| KiraError::CatalogFetch(format!("{}: {err}", self.path)))
    }
}

pub fn catalog_source(location: &CatalogLocation) -> Result<Box<dyn CatalogSource>, KiraError> {
    match location {
        CatalogLocation::Url(url) => Ok(Box::new(CatalogHttpClient::new(url.clone())?)),
        CatalogLocation::File(path) => Ok(Box::new(CatalogFile::new(path.clone()))),
    }
}

/// Ordered, duplicate-free list of organisms to process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Worklist {
    organisms: Vec<OrganismName>,
}

impl Worklist {
    pub fn from_names<I>(names: I) -> Self
    where
        I: IntoIterator<Item = OrganismName>,
    {
        let unique: BTreeSet<OrganismName> = names.into_iter().collect();
        Self {
            organisms: unique.into_iter().collect(),
        }
    }

    pub fn organisms(&self) -> &[OrganismName] {
        &self.organisms
    }

    pub fn len(&self) -> usize {
        self.organisms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.organisms.is_empty()
    }

    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&OrganismName) -> bool,
    {
        self.organisms.retain(keep);
    }

    pub fn truncate(&mut self, len: usize) {
        self.organisms.truncate(len);
    }

    /// One name per line, newline-terminated.
    pub fn to_cache_string(&self) -> String {
        let mut out = String::new();
        for organism in &self.organisms {
            out.push_str(organism.as_str());
            out.push('\n');
        }
        out
    }

    pub fn parse_cache(content: &str) -> Result<Self, KiraError> {
        let names = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<OrganismName>, KiraError>>()?;
        let worklist = Self::from_names(names);
        if worklist.is_empty() {
            return Err(KiraError::EmptyCatalog);
        }
        Ok(worklist)
    }

    pub fn read_cache(path: &Utf8Path) -> Result<Self, KiraError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("read worklist {path}: {err}")))?;
        Self::parse_cache(&content)
    }

    pub fn write_cache(&self, path: &Utf8Path) -> Result<(), KiraError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".worklist")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.write_all(self.to_cache_string().as_bytes())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Turns raw catalog text into a worklist.
///
/// The header row is skipped, as are rows whose first column is blank.
pub fn extract_worklist(tsv: &str) -> Result<Worklist, KiraError> {
    let names = tsv
        .lines()
        .skip(1)
        .filter_map(first_column)
        .filter_map(|value| value.parse::<OrganismName>().ok());
    let worklist = Worklist::from_names(names);
    if worklist.is_empty() {
        return Err(KiraError::EmptyCatalog);
    }
    Ok(worklist)
}

fn first_column(line: &str) -> Option<&str> {
    let line = line.trim_end_matches('\r');
    let cell = line.split('\t').next()?.trim();
    let cell = cell
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(cell)
        .trim();
    (!cell.is_empty()).then_some(cell)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorklistOrigin {
    Cache,
    Extracted,
}

/// Returns the cached worklist when `cache_path` exists (unless `refresh`),
/// otherwise fetches the catalog, extracts it and writes the cache.
pub fn load_or_extract(
    cache_path: &Utf8Path,
    source: &dyn CatalogSource,
    refresh: bool,
) -> Result<(Worklist, WorklistOrigin), KiraError> {
    if !refresh && cache_path.as_std_path().exists() {
        tracing::info!(path = %cache_path, "using cached worklist");
        return Ok((Worklist::read_cache(cache_path)?, WorklistOrigin::Cache));
    }

    let raw = source.fetch_catalog()?;
    let worklist = extract_worklist(&raw)?;
    worklist.write_cache(cache_path)?;
    tracing::info!(
        path = %cache_path,
        organisms = worklist.len(),
        "extracted worklist from catalog"
    );
    Ok((worklist, WorklistOrigin::Extracted))
}
