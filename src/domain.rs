use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Taxonomic name used as the lookup key against genome sources.
///
/// Identity is the exact trimmed string; no case folding or spelling
/// normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrganismName(String);

impl OrganismName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem key for this organism.
    ///
    /// Spaces become `_`. Characters that are unsafe in a path component
    /// (and `_`/`%` themselves, so the mapping stays injective) are written
    /// as `%XX` per UTF-8 byte, as is a leading `.`.
    pub fn sanitized(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for (index, ch) in self.0.chars().enumerate() {
            match ch {
                ' ' => out.push('_'),
                '.' if index == 0 => push_escaped(ch, &mut out),
                '_' | '%' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => {
                    push_escaped(ch, &mut out)
                }
                ch if ch.is_control() => push_escaped(ch, &mut out),
                ch => out.push(ch),
            }
        }
        out
    }
}

fn push_escaped(ch: char, out: &mut String) {
    let mut buf = [0u8; 4];
    for byte in ch.encode_utf8(&mut buf).bytes() {
        out.push_str(&format!("%{byte:02X}"));
    }
}

impl fmt::Display for OrganismName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrganismName {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if normalized.is_empty() || normalized.contains(['\n', '\r']) {
            return Err(KiraError::InvalidOrganism(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for OrganismName {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OrganismName> for String {
    fn from(value: OrganismName) -> Self {
        value.0
    }
}

/// Completeness tier requested from the genome provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyLevel {
    Complete,
    Chromosome,
    Scaffold,
    Contig,
}

impl AssemblyLevel {
    /// Value of the `filters.assembly_level` query parameter of the
    /// NCBI Datasets v2 API.
    pub fn api_value(self) -> &'static str {
        match self {
            AssemblyLevel::Complete => "complete_genome",
            AssemblyLevel::Chromosome => "chromosome",
            AssemblyLevel::Scaffold => "scaffold",
            AssemblyLevel::Contig => "contig",
        }
    }
}

impl fmt::Display for AssemblyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyLevel::Complete => write!(f, "complete"),
            AssemblyLevel::Chromosome => write!(f, "chromosome"),
            AssemblyLevel::Scaffold => write!(f, "scaffold"),
            AssemblyLevel::Contig => write!(f, "contig"),
        }
    }
}

impl FromStr for AssemblyLevel {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "complete" | "complete_genome" => Ok(AssemblyLevel::Complete),
            "chromosome" => Ok(AssemblyLevel::Chromosome),
            "scaffold" => Ok(AssemblyLevel::Scaffold),
            "contig" => Ok(AssemblyLevel::Contig),
            _ => Err(KiraError::InvalidAssemblyLevel(value.to_string())),
        }
    }
}

/// Remote assembly collection; tried in [`GenomeSource::FALLBACK_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenomeSource {
    RefSeq,
    GenBank,
}

impl GenomeSource {
    pub const FALLBACK_ORDER: [GenomeSource; 2] = [GenomeSource::RefSeq, GenomeSource::GenBank];

    pub fn as_str(self) -> &'static str {
        match self {
            GenomeSource::RefSeq => "refseq",
            GenomeSource::GenBank => "genbank",
        }
    }

    pub fn role(self) -> &'static str {
        match self {
            GenomeSource::RefSeq => "primary",
            GenomeSource::GenBank => "secondary",
        }
    }
}

impl fmt::Display for GenomeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single organism ended in the failed state. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Neither source has the organism at the requested assembly level.
    SourceUnavailable,
    /// At least one source kept failing after its retries.
    FetchError(String),
    ArchiveCorrupt(String),
    EmptyArchive,
    /// Scratch space or the artifact directory could not be written.
    Filesystem(String),
}

impl FailureReason {
    /// Same reason with its detail folded onto one line.
    ///
    /// Details carry response bodies and tool stderr; `failed.txt` holds
    /// exactly one `organism — reason` pair per line.
    pub fn single_line(self) -> Self {
        match self {
            FailureReason::FetchError(detail) => FailureReason::FetchError(fold_lines(&detail)),
            FailureReason::ArchiveCorrupt(detail) => {
                FailureReason::ArchiveCorrupt(fold_lines(&detail))
            }
            FailureReason::Filesystem(detail) => FailureReason::Filesystem(fold_lines(&detail)),
            other => other,
        }
    }
}

fn fold_lines(detail: &str) -> String {
    detail
        .split(|ch: char| ch.is_control() || ch.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SourceUnavailable => write!(f, "SourceUnavailable"),
            FailureReason::FetchError(detail) => write!(f, "FetchError: {detail}"),
            FailureReason::ArchiveCorrupt(detail) => write!(f, "ArchiveCorrupt: {detail}"),
            FailureReason::EmptyArchive => write!(f, "EmptyArchive"),
            FailureReason::Filesystem(detail) => write!(f, "FilesystemError: {detail}"),
        }
    }
}

/// Terminal state of one organism within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    SkippedExisting,
    Downloaded { source: GenomeSource },
    Failed { reason: FailureReason },
}

impl Outcome {
    pub fn tag(&self) -> OutcomeTag {
        match self {
            Outcome::SkippedExisting => OutcomeTag::SkippedExisting,
            Outcome::Downloaded { .. } => OutcomeTag::Downloaded,
            Outcome::Failed { .. } => OutcomeTag::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeTag {
    SkippedExisting,
    Downloaded,
    Failed,
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeTag::SkippedExisting => write!(f, "skipped-existing"),
            OutcomeTag::Downloaded => write!(f, "downloaded"),
            OutcomeTag::Failed => write!(f, "failed"),
        }
    }
}

/// Whether a single source try produced archive bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    ArchivePresent,
    ArchiveAbsent,
}

/// One source-resolution try. Lives only inside a single orchestration step.
#[derive(Debug, Clone)]
pub struct AcquisitionAttempt {
    pub organism: OrganismName,
    pub source: GenomeSource,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}
