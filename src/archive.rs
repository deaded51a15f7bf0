use std::collections::HashSet;
use std::io::{Cursor, Write};

use anyhow::{Context, Error};
use bytes::Bytes;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::OutputFormat;

pub const ARCHIVE_NAME: &str = "optimized-images.zip";
pub const DEFAULT_SUFFIX: &str = "-opt";

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub file_name: String,
    pub bytes: Bytes,
}

/// File name without its last extension. A leading dot is part of the name.
pub fn base_name(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => &file_name[..dot],
        _ => file_name,
    }
}

pub fn optimized_file_name(original: &str, suffix: &str, format: OutputFormat) -> String {
    format!("{}{}.{}", base_name(original), suffix, format.extension())
}

pub fn resized_file_name(
    original: &str,
    suffix: &str,
    format: OutputFormat,
    device_key: &str,
) -> String {
    format!(
        "{}{}-{}.{}",
        base_name(original),
        suffix,
        device_key,
        format.extension()
    )
}

/// Packs `entries` into an in-memory zip. Duplicate names get `-2`, `-3`, ...
/// appended to their base name.
pub fn build_archive(entries: &[ArchiveEntry]) -> Result<Vec<u8>, Error> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    // Encoded images do not shrink any further.
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let mut used = HashSet::new();
    for entry in entries {
        let name = unique_name(&entry.file_name, &mut used);
        zip.start_file(name.as_str(), options)
            .with_context(|| format!("Failed to add {} to archive", name))?;
        zip.write_all(&entry.bytes)
            .with_context(|| format!("Failed to write {} to archive", name))?;
    }

    let cursor = zip.finish().context("Failed to finish archive")?;
    Ok(cursor.into_inner())
}

fn unique_name(file_name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(file_name.to_owned()) {
        return file_name.to_owned();
    }

    let base = base_name(file_name);
    let ext = &file_name[base.len()..];
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}{}", base, n, ext);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
