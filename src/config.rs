use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::AssemblyLevel;
use crate::error::KiraError;

pub const CONFIG_FILE_NAME: &str = "kira-genomes.json";

const DEFAULT_OUTPUT_DIR: &str = "genomes";
const DEFAULT_SEQUENCE_EXTENSION: &str = "fna";
const WORKLIST_FILE_NAME: &str = "worklist.txt";

/// On-disk configuration; every field is optional and falls back to a default.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub assembly_level: Option<AssemblyLevel>,
    #[serde(default)]
    pub compress: Option<bool>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub sequence_extension: Option<String>,
    #[serde(default)]
    pub worklist_path: Option<String>,
    #[serde(default)]
    pub ledger_dir: Option<String>,
    #[serde(default)]
    pub jobs: Option<usize>,
}

/// Backend used to reach the NCBI assembly collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// NCBI Datasets v2 REST API over HTTPS.
    Http,
    /// The `datasets` command line tool found on `PATH`.
    DatasetsCli,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogLocation {
    Url(String),
    File(Utf8PathBuf),
}

impl CatalogLocation {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return CatalogLocation::Url(trimmed.to_string());
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        CatalogLocation::File(Utf8PathBuf::from(path))
    }
}

/// Command line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub catalog: Option<String>,
    pub output_dir: Option<String>,
    pub assembly_level: Option<AssemblyLevel>,
    pub no_compress: bool,
    pub provider: Option<ProviderKind>,
    pub jobs: Option<usize>,
}

/// Immutable run configuration handed to every component at construction.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub catalog: Option<CatalogLocation>,
    pub output_dir: Utf8PathBuf,
    pub assembly_level: AssemblyLevel,
    pub compress: bool,
    pub provider: ProviderKind,
    pub sequence_extension: String,
    pub worklist_path: Utf8PathBuf,
    pub ledger_dir: Utf8PathBuf,
    pub jobs: usize,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the explicit `path`, else `./kira-genomes.json`, else the user
    /// config directory, else built-in defaults.
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, KiraError> {
        let config = match Self::locate(path) {
            Some(config_path) => Self::read(&config_path)?,
            None => Config::default(),
        };
        Self::resolve_config(config, overrides)
    }

    fn locate(path: Option<&str>) -> Option<PathBuf> {
        if let Some(path) = path {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "kira-genomes")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|candidate| candidate.exists())
    }

    fn read(config_path: &PathBuf) -> Result<Config, KiraError> {
        let content = fs::read_to_string(config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| KiraError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let output_dir = Utf8PathBuf::from(
            overrides
                .output_dir
                .or(config.output_dir)
                .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string()),
        );

        let catalog = overrides
            .catalog
            .or(config.catalog_url)
            .filter(|value| !value.trim().is_empty())
            .map(|value| CatalogLocation::parse(&value));

        let jobs = overrides.jobs.or(config.jobs).unwrap_or(1);
        if jobs == 0 {
            return Err(KiraError::ConfigParse(
                "jobs must be at least 1".to_string(),
            ));
        }

        let sequence_extension = config
            .sequence_extension
            .map(|ext| ext.trim().trim_start_matches('.').to_string())
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| DEFAULT_SEQUENCE_EXTENSION.to_string());

        let worklist_path = config
            .worklist_path
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| output_dir.join(WORKLIST_FILE_NAME));
        let ledger_dir = config
            .ledger_dir
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| output_dir.clone());

        Ok(ResolvedConfig {
            schema_version,
            catalog,
            output_dir,
            assembly_level: overrides
                .assembly_level
                .or(config.assembly_level)
                .unwrap_or(AssemblyLevel::Complete),
            compress: !overrides.no_compress && config.compress.unwrap_or(true),
            provider: overrides
                .provider
                .or(config.provider)
                .unwrap_or(ProviderKind::Http),
            sequence_extension,
            worklist_path,
            ledger_dir,
            jobs,
        })
    }
}
