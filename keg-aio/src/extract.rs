// keg-aio/src/extract.rs
// Unpacks source tarballs and bottles.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use keg_common::error::{KegError, Result};
use tracing::{debug, error, warn};
use xz2::read::XzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    TarXz,
    TarBz2,
}

/// Detects the archive type from the file's magic bytes, falling back to the
/// extension for plain tarballs.
pub fn detect_archive_kind(path: &Path) -> Result<ArchiveKind> {
    let mut header = [0u8; 512];
    let mut file = File::open(path)?;
    let n = read_up_to(&mut file, &mut header)?;
    let kind = match infer::get(&header[..n]).map(|t| t.mime_type()) {
        Some("application/gzip") => ArchiveKind::TarGz,
        Some("application/x-xz") => ArchiveKind::TarXz,
        Some("application/x-bzip2") => ArchiveKind::TarBz2,
        Some("application/x-tar") => ArchiveKind::Tar,
        other => {
            let ext = path
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or("")
                .to_lowercase();
            match ext.as_str() {
                "tar" => ArchiveKind::Tar,
                "gz" | "tgz" => ArchiveKind::TarGz,
                "xz" | "txz" => ArchiveKind::TarXz,
                "bz2" | "tbz" | "tbz2" => ArchiveKind::TarBz2,
                _ => {
                    return Err(KegError::Generic(format!(
                        "Unsupported archive type for {} (detected {:?})",
                        path.display(),
                        other
                    )))
                }
            }
        }
    };
    debug!("Detected {:?} for {}", kind, path.display());
    Ok(kind)
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Extracts `archive_path` into `target_dir`, dropping the first
/// `strip_components` path components of every entry. Returns the paths
/// created, in archive order.
pub fn extract_archive(
    archive_path: &Path,
    target_dir: &Path,
    strip_components: usize,
) -> Result<Vec<PathBuf>> {
    let kind = detect_archive_kind(archive_path)?;
    debug!(
        "Extracting archive '{}' ({:?}) to '{}' (strip_components={})",
        archive_path.display(),
        kind,
        target_dir.display(),
        strip_components
    );
    std::fs::create_dir_all(target_dir)?;
    let reader = BufReader::new(File::open(archive_path)?);
    match kind {
        ArchiveKind::Tar => extract_tar(reader, target_dir, strip_components, archive_path),
        ArchiveKind::TarGz => extract_tar(
            GzDecoder::new(reader),
            target_dir,
            strip_components,
            archive_path,
        ),
        ArchiveKind::TarXz => extract_tar(
            XzDecoder::new(reader),
            target_dir,
            strip_components,
            archive_path,
        ),
        ArchiveKind::TarBz2 => extract_tar(
            BzDecoder::new(reader),
            target_dir,
            strip_components,
            archive_path,
        ),
    }
}

fn extract_tar<R: Read>(
    reader: R,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let mut created = Vec::new();

    let entries = archive.entries().map_err(|e| {
        KegError::Generic(format!(
            "Failed to read TAR entries from {}: {}",
            archive_path_for_log.display(),
            e
        ))
    })?;
    for entry_result in entries {
        let mut entry = entry_result.map_err(|e| {
            KegError::Generic(format!(
                "Error reading TAR entry from {}: {}",
                archive_path_for_log.display(),
                e
            ))
        })?;
        let original_path: PathBuf = entry
            .path()
            .map_err(|e| {
                KegError::Generic(format!(
                    "Invalid path in TAR entry from {}: {}",
                    archive_path_for_log.display(),
                    e
                ))
            })?
            .into_owned();

        let stripped: Vec<_> = original_path.components().skip(strip_components).collect();
        if stripped.is_empty() {
            continue;
        }
        let mut target_path = target_dir.to_path_buf();
        for comp in stripped {
            match comp {
                Component::Normal(p) => target_path.push(p),
                Component::CurDir => {}
                _ => {
                    error!(
                        "Disallowed component {:?} in TAR path {} within {}",
                        comp,
                        original_path.display(),
                        archive_path_for_log.display()
                    );
                    return Err(KegError::Generic(format!(
                        "Unsafe path component in {}",
                        original_path.display()
                    )));
                }
            }
        }
        if target_path == target_dir {
            continue;
        }
        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target_path).map_err(|e| {
            error!(
                "Failed to unpack TAR entry {:?} to {}: {}",
                original_path,
                target_path.display(),
                e
            );
            KegError::Generic(format!("Failed to unpack TAR entry {original_path:?}: {e}"))
        })?;
        created.push(target_path);
    }
    if created.is_empty() {
        warn!(
            "Archive {} produced no files after stripping {} components",
            archive_path_for_log.display(),
            strip_components
        );
    }
    debug!(
        "Finished extraction of {} ({} entries)",
        archive_path_for_log.display(),
        created.len()
    );
    Ok(created)
}

/// The only entry of `dir` if it is a directory, as produced by source
/// tarballs that wrap everything in `name-version/`.
pub fn single_top_level_dir(dir: &Path) -> Option<PathBuf> {
    let mut entries = std::fs::read_dir(dir).ok()?.filter_map(|e| e.ok());
    let first = entries.next()?;
    if entries.next().is_some() {
        return None;
    }
    let path = first.path();
    path.is_dir().then_some(path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    #[test]
    fn extracts_gzip_tarball_by_content() {
        let dir = tempfile::tempdir().unwrap();
        // Misleading extension; detection goes by magic bytes.
        let archive = dir.path().join("amqp-1.11.0.download");
        tar_gz(
            &archive,
            &[
                ("amqp-1.11.0/configure", b"#!/bin/sh\nexit 0\n"),
                ("amqp-1.11.0/src/amqp.c", b"int x;"),
            ],
        );
        assert_eq!(detect_archive_kind(&archive).unwrap(), ArchiveKind::TarGz);

        let out = dir.path().join("out");
        let created = extract_archive(&archive, &out, 0).unwrap();
        assert_eq!(created.len(), 2);
        let top = single_top_level_dir(&out).unwrap();
        assert!(top.join("configure").is_file());
    }

    #[test]
    fn strips_leading_components() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bottle.tar.gz");
        tar_gz(&archive, &[("x/1.0.0/bin/x", b"#!/bin/sh\n")]);
        let keg = dir.path().join("keg");
        extract_archive(&archive, &keg, 2).unwrap();
        assert!(keg.join("bin/x").is_file());
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"just text").unwrap();
        assert!(detect_archive_kind(&path).is_err());
    }
}
