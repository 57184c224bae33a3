use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::ArchiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Bzip2,
    Gzip,
    Zip,
}

impl ArchiveKind {
    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".bz2") {
            Some(ArchiveKind::Bzip2)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            // container templates are deployed as-is
            None
        } else if name.ends_with(".gz") {
            Some(ArchiveKind::Gzip)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }
}

/// Decompresses verified artifacts next to the original archive.
///
/// The compressed original is always left in place, so a later run can
/// recognise the artifact as already downloaded.
pub struct ArchiveExpander;

impl ArchiveExpander {
    pub fn is_supported(path: &Path) -> bool {
        ArchiveKind::detect(path).is_some()
    }

    /// Expand `path` on the blocking pool and return the final artifact path.
    pub async fn expand(path: &Path) -> Result<PathBuf, ArchiveError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::expand_blocking(&path))
            .await
            .map_err(io::Error::other)?
    }

    pub fn expand_blocking(path: &Path) -> Result<PathBuf, ArchiveError> {
        let kind =
            ArchiveKind::detect(path).ok_or_else(|| ArchiveError::Unsupported(path.to_path_buf()))?;
        debug!("Expanding {:?} as {:?}", path, kind);

        let expanded = match kind {
            ArchiveKind::Bzip2 => {
                let output = path.with_extension("");
                decompress_stream(MultiBzDecoder::new(BufReader::new(File::open(path)?)), &output)?
            }
            ArchiveKind::Gzip => {
                let output = path.with_extension("");
                decompress_stream(MultiGzDecoder::new(BufReader::new(File::open(path)?)), &output)?
            }
            ArchiveKind::Zip => {
                let dest_dir = path.parent().unwrap_or_else(|| Path::new("."));
                extract_zip(path, dest_dir)?
            }
        };

        info!("Decompressed {:?} to {:?}", path, expanded);
        Ok(expanded)
    }
}

fn staging_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

fn decompress_stream<R: Read>(mut reader: R, output: &Path) -> Result<PathBuf, ArchiveError> {
    if output.exists() {
        debug!("{:?} already expanded, reusing it", output);
        return Ok(output.to_path_buf());
    }

    let staging = staging_path(output);
    let result = (|| -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(&staging)?);
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            fs::rename(&staging, output)?;
            Ok(output.to_path_buf())
        }
        Err(e) => {
            let _ = fs::remove_file(&staging);
            Err(e.into())
        }
    }
}

fn is_preferred_member(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("iso") || ext.eq_ignore_ascii_case("img"))
        .unwrap_or(false)
}

struct ZipMember {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// Validate every member before writing anything, then extract either the
/// first `.iso`/`.img` member or the whole archive.
fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;

    let mut members = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let has_parent_segment = Path::new(&name)
            .components()
            .any(|c| matches!(c, Component::ParentDir));

        let relative = match entry.enclosed_name() {
            Some(relative) if !has_parent_segment => relative,
            _ => {
                warn!("Refusing to extract {:?}: member '{}' escapes destination", archive_path, name);
                return Err(ArchiveError::PathTraversal { member: name });
            }
        };

        members.push(ZipMember {
            index,
            relative,
            is_dir: entry.is_dir(),
        });
    }

    let selected: Vec<&ZipMember> = match members
        .iter()
        .find(|m| !m.is_dir && is_preferred_member(&m.relative))
    {
        Some(image) => vec![image],
        None => members.iter().collect(),
    };

    let mut written: Vec<PathBuf> = Vec::new();
    let mut first_file: Option<PathBuf> = None;

    let result = (|| -> Result<(), ArchiveError> {
        for member in &selected {
            let target = dest_dir.join(&member.relative);
            if member.is_dir {
                fs::create_dir_all(&target)?;
                continue;
            }

            if first_file.is_none() {
                first_file = Some(target.clone());
            }
            if target.exists() {
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut entry = archive.by_index(member.index)?;
            let mut out = BufWriter::new(File::create(&target)?);
            written.push(target.clone());
            io::copy(&mut entry, &mut out)?;
            out.flush()?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        for path in &written {
            let _ = fs::remove_file(path);
        }
        return Err(e);
    }

    first_file.ok_or_else(|| ArchiveError::Empty(archive_path.to_path_buf()))
}
