//! Zip bundle codec for case inputs and results.
//!
//! A bundle is an ordered list of files or directories. Order matters to
//! adapters, so each top-level entry is stored under a position-prefixed
//! name (`0_mesh.inp`, `1_loads/`...); unpacking strips the prefix and
//! returns the entries in their declared order. Directories are stored with
//! their full structure, empty directories included.
//!
//! Packing and unpacking are synchronous; callers on the async runtime wrap
//! them in `spawn_blocking`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn prefixed_name(position: usize, entry: &Path) -> Result<String> {
    let name = entry
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::bundle(format!("unusable entry name: {}", entry.display())))?;
    Ok(format!("{position}_{name}"))
}

fn relative_name(base: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(base)
        .map_err(|_| Error::internal("walked path escaped its base"))?;
    let segments: Vec<&str> = rel
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| Error::bundle(format!("unusable path segment in {}", path.display())))
        })
        .collect::<Result<_>>()?;
    Ok(segments.join("/"))
}

/// Packs an ordered list of files/directories into a zip bundle.
///
/// # Errors
///
/// Fails if an entry does not exist, has an unusable name, or the zip
/// stream cannot be written.
pub fn pack(files: &[PathBuf]) -> Result<Bytes> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for (position, entry) in files.iter().enumerate() {
        let prefixed = prefixed_name(position, entry)?;
        if entry.is_file() {
            writer.start_file(prefixed.as_str(), entry_options())?;
            let mut file =
                File::open(entry).map_err(|e| Error::from_io("opening bundle entry", e))?;
            io::copy(&mut file, &mut writer)
                .map_err(|e| Error::from_io("compressing bundle entry", e))?;
        } else if entry.is_dir() {
            writer.add_directory(format!("{prefixed}/"), entry_options())?;
            for walked in WalkDir::new(entry) {
                let walked = walked.map_err(|e| Error::bundle(e.to_string()))?;
                if walked.path() == entry {
                    continue;
                }
                let rel = relative_name(entry, walked.path())?;
                if walked.file_type().is_dir() {
                    writer.add_directory(format!("{prefixed}/{rel}/"), entry_options())?;
                } else if walked.file_type().is_file() {
                    writer.start_file(format!("{prefixed}/{rel}"), entry_options())?;
                    let mut file = File::open(walked.path())
                        .map_err(|e| Error::from_io("opening bundle entry", e))?;
                    io::copy(&mut file, &mut writer)
                        .map_err(|e| Error::from_io("compressing bundle entry", e))?;
                }
            }
        } else {
            return Err(Error::bundle(format!(
                "bundle entry does not exist: {}",
                entry.display()
            )));
        }
    }

    let cursor = writer.finish()?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Unpacks a bundle into `dest`, returning top-level entries in declared order.
///
/// Position prefixes are stripped, so adapters see the file names they were
/// given at submission.
///
/// # Errors
///
/// Fails on malformed zip data, entries without a position prefix, or
/// entries that would escape `dest`.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut ordered: BTreeMap<usize, PathBuf> = BTreeMap::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw = entry
            .enclosed_name()
            .ok_or_else(|| Error::bundle(format!("unsafe bundle entry: {}", entry.name())))?;

        let mut components = raw.components();
        let first = match components.next() {
            Some(Component::Normal(first)) => first
                .to_str()
                .ok_or_else(|| Error::bundle("unusable bundle entry name"))?,
            _ => return Err(Error::bundle(format!("unsafe bundle entry: {}", entry.name()))),
        };
        let (position, original) = first
            .split_once('_')
            .ok_or_else(|| Error::bundle(format!("entry without position prefix: {first}")))?;
        let position: usize = position
            .parse()
            .map_err(|_| Error::bundle(format!("entry with non-numeric position: {first}")))?;

        let top = dest.join(original);
        let target = components.fold(top.clone(), |acc, c| acc.join(c));

        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| Error::from_io("creating bundle directory", e))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::from_io("creating bundle directory", e))?;
            }
            let mut out =
                File::create(&target).map_err(|e| Error::from_io("extracting bundle entry", e))?;
            io::copy(&mut entry, &mut out)
                .map_err(|e| Error::from_io("extracting bundle entry", e))?;
        }

        ordered.entry(position).or_insert(top);
    }

    Ok(ordered.into_values().collect())
}
