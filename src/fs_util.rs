use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use zip::ZipArchive;

use crate::error::KiraError;

/// Capability to unpack a downloaded archive into a directory.
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, archive: &Path, target_dir: &Path) -> Result<(), KiraError>;
}

/// Extractor for the zip packages produced by NCBI Datasets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    /// Unpacks every entry below `target_dir`, which is created even for an
    /// archive without entries.
    ///
    /// An unreadable package (bad central directory, entry escaping the
    /// target, failed inflate) is [`KiraError::ArchiveFormat`]; failing to
    /// write the unpacked files is [`KiraError::Filesystem`].
    fn extract(&self, archive: &Path, target_dir: &Path) -> Result<(), KiraError> {
        let file = fs::File::open(archive).map_err(|err| io_failure("open", archive, err))?;
        let mut package = ZipArchive::new(BufReader::new(file))
            .map_err(|err| KiraError::ArchiveFormat(err.to_string()))?;
        fs::create_dir_all(target_dir).map_err(|err| io_failure("create", target_dir, err))?;

        for index in 0..package.len() {
            let mut entry = package
                .by_index(index)
                .map_err(|err| KiraError::ArchiveFormat(err.to_string()))?;
            let Some(relative) = entry.enclosed_name() else {
                return Err(KiraError::ArchiveFormat(format!(
                    "entry {:?} escapes the extraction directory",
                    entry.name()
                )));
            };
            let destination = target_dir.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&destination)
                    .map_err(|err| io_failure("create", &destination, err))?;
                continue;
            }
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|err| io_failure("create", parent, err))?;
            }
            let mut out = fs::File::create(&destination)
                .map_err(|err| io_failure("create", &destination, err))?;
            copy_entry(&mut entry, &mut out, &destination)?;
        }
        Ok(())
    }
}

/// Copies one unpacked entry; inflate errors and write errors stay apart.
fn copy_entry(entry: &mut impl Read, out: &mut impl Write, destination: &Path) -> Result<(), KiraError> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = match entry.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(KiraError::ArchiveFormat(err.to_string())),
        };
        out.write_all(&buf[..read])
            .map_err(|err| io_failure("write", destination, err))?;
    }
}

fn io_failure(action: &str, path: &Path, err: io::Error) -> KiraError {
    KiraError::Filesystem(format!("{action} {}: {err}", path.display()))
}

/// Every regular file below `root` whose extension matches `ext`
/// (case-insensitive), in sorted order. Unreadable directories are errors.
pub fn find_files_with_ext(root: &Path, ext: &str) -> Result<Vec<PathBuf>, KiraError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|err| io_failure("read", &dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| io_failure("read", &dir, err))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| io_failure("stat", &path, err))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|value| value.to_str())
                .is_some_and(|value| value.eq_ignore_ascii_case(ext))
            {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Gzips `source` into `destination`.
///
/// The header carries no file name and a zero mtime, so identical input
/// bytes always give identical output bytes.
pub fn gzip_file(source: &Path, destination: &Path) -> Result<(), KiraError> {
    let parent = destination
        .parent()
        .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
    let input = fs::File::open(source)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", source.display())))?;
    let temp = tempfile::Builder::new()
        .prefix(".kira-genomes-gz")
        .tempfile_in(parent)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;

    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(BufWriter::new(temp.as_file()), Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let mut writer = encoder
        .finish()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    writer
        .flush()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    drop(writer);

    temp.persist(destination)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}
