//! Streaming access to gzip-compressed airgap bundles
//!
//! [`BundleArchive`] walks the tar entries of a bundle strictly in stream
//! order. Nothing seeks backward, so the same code serves files on disk and
//! arbitrary readers. [`extract_bundle`] unpacks the regular files of a bundle
//! below a directory.

use crate::error::{AirgapError, Result};
use crate::progress::ProgressOutput;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

/// What a tar entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Other,
}

impl From<EntryType> for EntryKind {
    fn from(entry_type: EntryType) -> Self {
        if entry_type.is_file() || entry_type == EntryType::Continuous {
            EntryKind::Regular
        } else if entry_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Other
        }
    }
}

/// A gzip tar stream
pub struct BundleArchive<R: Read> {
    archive: Archive<GzDecoder<R>>,
}

impl BundleArchive<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            AirgapError::Io(format!(
                "Failed to open airgap bundle {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> BundleArchive<R> {
    pub fn new(reader: R) -> Self {
        Self {
            archive: Archive::new(GzDecoder::new(reader)),
        }
    }

    pub fn entries(&mut self) -> Result<BundleEntries<'_, R>> {
        let inner = self
            .archive
            .entries()
            .map_err(|e| AirgapError::Io(format!("Failed to read tar entries: {}", e)))?;
        Ok(BundleEntries { inner })
    }
}

pub struct BundleEntries<'a, R: Read> {
    inner: tar::Entries<'a, GzDecoder<R>>,
}

impl<'a, R: Read> Iterator for BundleEntries<'a, R> {
    type Item = Result<BundleEntry<'a, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => {
                return Some(Err(AirgapError::Io(format!(
                    "Failed to read tar header: {}",
                    e
                ))));
            }
        };
        Some(BundleEntry::new(entry))
    }
}

/// One entry of the bundle; reading it yields the entry payload only
pub struct BundleEntry<'a, R: Read> {
    name: String,
    kind: EntryKind,
    size: u64,
    inner: tar::Entry<'a, GzDecoder<R>>,
}

impl<'a, R: Read> BundleEntry<'a, R> {
    fn new(inner: tar::Entry<'a, GzDecoder<R>>) -> Result<Self> {
        let raw = String::from_utf8_lossy(&inner.path_bytes()).into_owned();
        let kind = EntryKind::from(inner.header().entry_type());
        let size = inner
            .header()
            .size()
            .map_err(|e| AirgapError::Io(format!("Failed to read entry size of {}: {}", raw, e)))?;
        Ok(Self {
            name: normalize_entry_name(&raw),
            kind,
            size,
            inner,
        })
    }

    /// Entry name with any leading `./` and trailing `/` removed
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The `.` entry many tar producers emit first
    pub fn is_root(&self) -> bool {
        self.name.is_empty()
    }

    pub fn is_regular(&self) -> bool {
        self.kind == EntryKind::Regular
    }
}

impl<R: Read> Read for BundleEntry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

fn normalize_entry_name(raw: &str) -> String {
    let mut name = raw;
    while let Some(stripped) = name.strip_prefix("./") {
        name = stripped;
    }
    let name = name.trim_end_matches('/');
    if name == "." {
        String::new()
    } else {
        name.to_string()
    }
}

/// Splits a bundle-relative name into its path segments
pub fn path_segments(name: &str) -> Vec<String> {
    name.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolves an entry name below `dest_dir`, rejecting names that escape it
pub fn safe_join(dest_dir: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(AirgapError::MalformedBundle(format!(
                    "entry '{}' escapes the extraction directory",
                    name
                )));
            }
        }
    }
    Ok(dest_dir.join(relative))
}

/// Extracts the regular files of a bundle into `dest_dir`.
///
/// When `exclude_images` is set extraction stops at the first directory
/// entry, which is where the images section of a bundle begins.
pub fn extract_bundle(
    archive_path: &Path,
    dest_dir: &Path,
    exclude_images: bool,
    output: &ProgressOutput,
) -> Result<usize> {
    let mut archive = BundleArchive::open(archive_path)?;
    extract_entries(&mut archive, dest_dir, exclude_images, output)
}

pub fn extract_entries<R: Read>(
    archive: &mut BundleArchive<R>,
    dest_dir: &Path,
    exclude_images: bool,
    output: &ProgressOutput,
) -> Result<usize> {
    let mut extracted = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;

        if entry.is_root() {
            continue;
        }
        if exclude_images && entry.kind() == EntryKind::Directory {
            break;
        }
        if !entry.is_regular() {
            continue;
        }

        let dst_file_name = safe_join(dest_dir, entry.name())?;
        if let Some(parent) = dst_file_name.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AirgapError::Io(format!("Failed to create path {}: {}", parent.display(), e))
            })?;
        }

        output.write_line(&format!("Extracting {}", dst_file_name.display()))?;

        let mut dst_file = File::create(&dst_file_name).map_err(|e| {
            AirgapError::Io(format!(
                "Failed to create file {}: {}",
                dst_file_name.display(),
                e
            ))
        })?;
        io::copy(&mut entry, &mut dst_file).map_err(|e| {
            AirgapError::Io(format!("Failed to copy file data of {}: {}", entry.name(), e))
        })?;
        extracted += 1;
    }

    Ok(extracted)
}
