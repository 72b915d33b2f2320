//! Bundle classification and airgap metadata lookup

use super::{AirgapMeta, BundleKind};
use crate::archive::{BundleArchive, EntryKind};
use crate::error::{AirgapError, Result};
use std::io::Read;
use std::path::Path;

fn is_manifest_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Top-level manifest files of an extracted bundle, in name order
fn manifest_files(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    let read_dir = std::fs::read_dir(root).map_err(|e| {
        AirgapError::Io(format!("Failed to read dir {}: {}", root.display(), e))
    })?;

    let mut files = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && is_manifest_file(&entry.file_name().to_string_lossy()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// The first airgap metadata document directly under `root`, if any.
/// Unreadable and undecodable files are skipped.
fn scan_dir_for_meta(root: &Path) -> Result<Option<AirgapMeta>> {
    for path in manifest_files(root)? {
        let Ok(contents) = std::fs::read(&path) else {
            continue;
        };
        if let Ok(Some(meta)) = AirgapMeta::decode(&contents) {
            return Ok(Some(meta));
        }
    }
    Ok(None)
}

/// Classifies an extracted bundle once, so callers dispatch on the result
/// instead of probing content themselves.
pub fn classify_bundle(root: &Path) -> Result<BundleKind> {
    match scan_dir_for_meta(root)? {
        Some(_) => Ok(BundleKind::Application),
        None => Ok(BundleKind::KotsadmImages),
    }
}

pub fn find_airgap_meta_in_dir(root: &Path) -> Result<AirgapMeta> {
    scan_dir_for_meta(root)?.ok_or_else(|| {
        AirgapError::Metadata(format!(
            "no airgap metadata document found in {}",
            root.display()
        ))
    })
}

/// Reads the airgap metadata straight from a compressed bundle. Only the
/// top-level manifest files are decoded; the scan stops at the first match.
pub fn find_airgap_meta_in_bundle(bundle_path: &Path) -> Result<AirgapMeta> {
    let mut archive = BundleArchive::open(bundle_path)?;
    find_airgap_meta_in_archive(&mut archive).map_err(|e| {
        e.context(format!("failed to read airgap metadata from {}", bundle_path.display()))
    })
}

pub fn find_airgap_meta_in_archive<R: Read>(archive: &mut BundleArchive<R>) -> Result<AirgapMeta> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.kind() != EntryKind::Regular
            || entry.name().contains('/')
            || !is_manifest_file(entry.name())
        {
            continue;
        }

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(|e| {
            AirgapError::Io(format!("Failed to read {}: {}", entry.name(), e))
        })?;
        if let Ok(Some(meta)) = AirgapMeta::decode(&contents) {
            return Ok(meta);
        }
    }

    Err(AirgapError::Metadata(
        "no airgap metadata document found".to_string(),
    ))
}
