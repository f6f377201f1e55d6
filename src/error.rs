use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("missing required dependencies: {}", .0.join(", "))]
    #[diagnostic(help("install or enable every listed capability, then rerun"))]
    MissingDependency(Vec<String>),

    #[error("failed to fetch organism catalog: {0}")]
    CatalogFetch(String),

    #[error("organism catalog contains no organism rows")]
    EmptyCatalog,

    #[error("no catalog source configured (set catalog_url or pass --catalog)")]
    MissingCatalogSource,

    #[error("failed to write ledger at {path}: {message}")]
    LedgerWrite { path: PathBuf, message: String },

    #[error("invalid organism name: {0:?}")]
    InvalidOrganism(String),

    #[error("invalid assembly level: {0}")]
    InvalidAssemblyLevel(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("NCBI request failed: {0}")]
    NcbiHttp(String),

    #[error("NCBI returned status {status}: {message}")]
    NcbiStatus { status: u16, message: String },

    #[error("datasets CLI failed: {0}")]
    DatasetsCli(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("unreadable archive: {0}")]
    ArchiveFormat(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
