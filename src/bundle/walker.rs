//! Image enumeration for every bundle layout
//!
//! Three layouts carry archived images:
//! - `<root>/<format>/<image>/<tag>`: admin console images
//! - `<root>/images/<format>/<name...>/<tag>`: extracted application bundles
//! - the same `images/` tree inside a compressed bundle read as a stream
//!
//! Temp-registry bundles list their images in the airgap metadata instead.
//! Every [`ImageEntry`] produced here keeps the path segments following the
//! images root (`<format>/<name...>/<tag>`), which is what reference
//! rewriting needs.

use super::{IMAGES_DIR, TransportEncoding};
use crate::archive::{BundleArchive, BundleEntry, EntryKind, path_segments};
use crate::error::{AirgapError, Result};
use crate::image::{ImageEntry, read_archive_layers, read_archive_layers_from_reader};
use crate::registry::RunningRegistry;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Image identities need at least `<section>/<format>/<name>` worth of segments
const MIN_IDENTITY_SEGMENTS: usize = 3;

/// Tracks where the images section of a streamed bundle begins.
///
/// A bundle carries a few small metadata files first and the images in
/// folders after them, so the first entry that is neither the root nor a
/// regular file marks the boundary. This relies on the producer writing
/// metadata before images.
#[derive(Debug, Default)]
pub struct ImagesSection {
    found: bool,
}

impl ImagesSection {
    /// Returns true when `entry` is an image of the images section
    pub fn accept(&mut self, name: &str, kind: EntryKind) -> bool {
        if !self.found {
            if name.is_empty() || kind == EntryKind::Regular {
                return false;
            }
            self.found = true;
            return false;
        }
        kind == EntryKind::Regular
    }

    pub fn found(&self) -> bool {
        self.found
    }
}

fn check_identity(identity: &str, segments: &[String]) -> Result<()> {
    if segments.len() < MIN_IDENTITY_SEGMENTS {
        return Err(AirgapError::MalformedBundle(format!(
            "not enough parts in image path: {:?}",
            identity
        )));
    }
    Ok(())
}

/// Enumerates the images of a bundle
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleWalker {
    with_layers: bool,
}

impl BundleWalker {
    /// `with_layers` reads layer lists, needed only for UI progress
    pub fn new(with_layers: bool) -> Self {
        Self { with_layers }
    }

    /// `<root>/<format>/<image>/<tag>`: every regular file three levels down
    pub fn walk_format_dirs(&self, root: &Path) -> Result<Vec<ImageEntry>> {
        let mut files = Vec::new();
        collect_files(root, 0, &mut files)?;

        let mut images = Vec::new();
        for (path, _) in files.into_iter().filter(|(_, depth)| *depth == 3) {
            let segments = relative_segments(root, &path)?;
            images.push(self.archive_image(&path, segments)?);
        }
        Ok(images)
    }

    /// `<root>/images/**`: every regular file is an image
    pub fn walk_images_dir(&self, root: &Path) -> Result<Vec<ImageEntry>> {
        let mut files = Vec::new();
        collect_files(&root.join(IMAGES_DIR), 1, &mut files)?;

        let mut images = Vec::new();
        for (path, _) in files {
            let identity_segments = relative_segments(root, &path)?;
            let segments = identity_segments[1..].to_vec();
            images.push(self.archive_image(&path, segments)?);
        }
        Ok(images)
    }

    fn archive_image(&self, path: &Path, segments: Vec<String>) -> Result<ImageEntry> {
        let mut image = ImageEntry::new(path.to_string_lossy(), TransportEncoding::DockerArchive)
            .with_segments(segments);
        if self.with_layers {
            let layers = read_archive_layers(path)
                .map_err(|e| e.context("failed to get image layers"))?;
            image = image.with_layers(layers);
        }
        Ok(image)
    }

    /// Single pass over a compressed bundle. Images are keyed by entry name.
    pub fn scan_bundle(&self, bundle_path: &Path) -> Result<Vec<ImageEntry>> {
        let mut archive = BundleArchive::open(bundle_path)?;
        self.scan_archive(&mut archive)
            .map_err(|e| e.context("failed to get images info from bundle"))
    }

    pub fn scan_archive<R: Read>(&self, archive: &mut BundleArchive<R>) -> Result<Vec<ImageEntry>> {
        let mut section = ImagesSection::default();
        let mut seen = HashSet::new();
        let mut images = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !section.accept(entry.name(), entry.kind()) {
                continue;
            }

            let identity = entry.name().to_string();
            let identity_segments = path_segments(&identity);
            check_identity(&identity, &identity_segments)?;

            if !seen.insert(identity.clone()) {
                continue;
            }

            let mut image = ImageEntry::new(identity.clone(), TransportEncoding::DockerArchive)
                .with_segments(identity_segments[1..].to_vec());
            if self.with_layers {
                image = image.with_layers(stream_layers(&mut entry)?);
            }
            images.push(image);
        }

        Ok(images)
    }

    /// Images listed by a temp-registry bundle, keyed by image name
    pub fn walk_saved_images(
        &self,
        saved_images: &[String],
        registry: &dyn RunningRegistry,
    ) -> Result<Vec<ImageEntry>> {
        let mut seen = HashSet::new();
        let mut images = Vec::new();

        for saved in saved_images {
            if !seen.insert(saved.as_str()) {
                continue;
            }
            let mut image = ImageEntry::new(saved.clone(), TransportEncoding::TempRegistry);
            if self.with_layers {
                let layers = registry
                    .image_layers(saved)
                    .map_err(|e| e.context(format!("failed to get image layers for {}", saved)))?;
                image = image.with_layers(layers);
            }
            images.push(image);
        }

        Ok(images)
    }
}

/// Regular files below `dir` in name order, each with its depth below the
/// walk root. Symlinks are not followed.
fn collect_files(dir: &Path, depth: usize, files: &mut Vec<(PathBuf, usize)>) -> Result<()> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| {
        AirgapError::Io(format!("Failed to read dir {}: {}", dir.display(), e))
    })?;
    let mut entries = read_dir.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), depth + 1, files)?;
        } else if file_type.is_file() {
            files.push((entry.path(), depth + 1));
        }
    }
    Ok(())
}

/// Path segments of `path` below `root`, checked to name an image
fn relative_segments(root: &Path, path: &Path) -> Result<Vec<String>> {
    let relative = path.strip_prefix(root).map_err(|e| {
        AirgapError::Io(format!("Failed to resolve {}: {}", path.display(), e))
    })?;
    let identity = relative.to_string_lossy();
    let segments = path_segments(&identity);
    check_identity(&identity, &segments)?;
    Ok(segments)
}

fn stream_layers<R: Read>(entry: &mut BundleEntry<'_, R>) -> Result<Vec<crate::image::LayerDescriptor>> {
    let name = entry.name().to_string();
    read_archive_layers_from_reader(entry)
        .map_err(|e| e.context(format!("failed to get image layers from {}", name)))
}
