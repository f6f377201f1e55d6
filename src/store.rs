use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, TempDir};

use crate::domain::OrganismName;
use crate::error::KiraError;
use crate::fs_util;

const SCRATCH_DIR_NAME: &str = ".scratch";
const COMPRESSED_SUFFIX: &str = "gz";

/// Durable result of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenomeArtifact {
    pub organism: OrganismName,
    pub sequence_path: Utf8PathBuf,
    pub compressed_path: Option<Utf8PathBuf>,
}

/// Where finished artifacts live. Presence of an artifact is the
/// "already acquired" signal consulted before any network activity.
pub trait ArtifactStore: Send + Sync {
    fn contains(&self, organism: &OrganismName) -> bool;

    fn artifact_path(&self, organism: &OrganismName) -> Utf8PathBuf;

    /// Fresh scratch directory owned by a single in-flight organism.
    /// Removed when the returned guard is dropped.
    fn scratch_dir(&self, organism: &OrganismName) -> Result<TempDir, KiraError>;

    /// Moves `sequence_file` to the canonical artifact path.
    fn install(
        &self,
        organism: &OrganismName,
        sequence_file: &Path,
    ) -> Result<GenomeArtifact, KiraError>;

    /// Writes the compressed sibling and returns its path.
    fn compress(&self, artifact: &GenomeArtifact) -> Result<Utf8PathBuf, KiraError>;
}

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: Utf8PathBuf,
    extension: String,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<Utf8PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn scratch_root(&self) -> Utf8PathBuf {
        self.root.join(SCRATCH_DIR_NAME)
    }

    pub fn ensure_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn compressed_path(&self, organism: &OrganismName) -> Utf8PathBuf {
        compressed_sibling(&self.artifact_path(organism))
    }

    /// Removes scratch directories left behind by interrupted runs.
    /// Returns how many entries were deleted.
    pub fn clean_scratch(&self) -> Result<usize, KiraError> {
        let scratch = self.scratch_root();
        if !scratch.as_std_path().exists() {
            return Ok(0);
        }
        let mut removed = 0usize;
        let entries = fs::read_dir(scratch.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let path = entry
                .map_err(|err| KiraError::Filesystem(err.to_string()))?
                .path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            removed += 1;
        }
        Ok(removed)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn contains(&self, organism: &OrganismName) -> bool {
        self.artifact_path(organism).as_std_path().is_file()
    }

    fn artifact_path(&self, organism: &OrganismName) -> Utf8PathBuf {
        self.root
            .join(format!("{}.{}", organism.sanitized(), self.extension))
    }

    fn scratch_dir(&self, organism: &OrganismName) -> Result<TempDir, KiraError> {
        let scratch = self.scratch_root();
        fs::create_dir_all(scratch.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix(&format!("{}.", organism.sanitized()))
            .tempdir_in(scratch.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    fn install(
        &self,
        organism: &OrganismName,
        sequence_file: &Path,
    ) -> Result<GenomeArtifact, KiraError> {
        self.ensure_root()?;
        let dest = self.artifact_path(organism);
        if dest.as_std_path().exists() {
            return Err(KiraError::Filesystem(format!(
                "artifact already exists: {dest}"
            )));
        }
        move_file_atomic(sequence_file, dest.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(GenomeArtifact {
            organism: organism.clone(),
            sequence_path: dest,
            compressed_path: None,
        })
    }

    fn compress(&self, artifact: &GenomeArtifact) -> Result<Utf8PathBuf, KiraError> {
        let dest = compressed_sibling(&artifact.sequence_path);
        fs_util::gzip_file(artifact.sequence_path.as_std_path(), dest.as_std_path())?;
        Ok(dest)
    }
}

fn compressed_sibling(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.{COMPRESSED_SUFFIX}"))
}

/// Renames `from` onto `to`, falling back to copy-then-persist when the two
/// live on different filesystems.
pub fn move_file_atomic(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let parent = to
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid destination path"))?;
    let temp = Builder::new()
        .prefix(".kira-genomes-file")
        .tempfile_in(parent)?;
    fs::copy(from, temp.path())?;
    temp.persist(to).map_err(|err| err.error)?;
    fs::remove_file(from)
}
