//! Layer introspection of docker-archive images
//!
//! Reads the `manifest.json` and image config of a `docker save` style
//! archive to list layer digests and sizes without unpacking any layer.
//! Configs without `rootfs.diff_ids` fall back to the sha256 of the layer
//! payload, hashed while streaming past it.
//! Works in a single forward pass because `manifest.json` is usually the
//! last entry of such archives.

use crate::error::{AirgapError, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tar::Archive;

/// Metadata entries larger than this are not buffered
const MAX_METADATA_SIZE: u64 = 4 * 1024 * 1024;

const MANIFEST_FILE: &str = "manifest.json";

/// Digest and size of one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub digest: String,
    pub size: u64,
}

impl LayerDescriptor {
    pub fn new(digest: impl Into<String>, size: u64) -> Self {
        Self {
            digest: digest.into(),
            size,
        }
    }

    /// Digest without the `sha256:` prefix
    pub fn id(&self) -> &str {
        self.digest
            .strip_prefix("sha256:")
            .unwrap_or(&self.digest)
    }
}

#[derive(Debug, Deserialize)]
struct ArchiveManifestItem {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    rootfs: Option<RootFs>,
}

#[derive(Debug, Default, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// Lists the layers of the docker-archive at `path`
pub fn read_archive_layers(path: &Path) -> Result<Vec<LayerDescriptor>> {
    let file = File::open(path).map_err(|e| {
        AirgapError::Io(format!(
            "Failed to open image archive {}: {}",
            path.display(),
            e
        ))
    })?;
    read_archive_layers_from_reader(file)
        .map_err(|e| e.context(format!("failed to read layers of {}", path.display())))
}

/// Lists the layers of a docker-archive read from a stream, plain or gzipped
pub fn read_archive_layers_from_reader<R: Read>(reader: R) -> Result<Vec<LayerDescriptor>> {
    let mut reader = BufReader::new(reader);
    let gzipped = {
        let head = reader
            .fill_buf()
            .map_err(|e| AirgapError::Io(format!("Failed to read image archive: {}", e)))?;
        is_gzipped(head)
    };

    if gzipped {
        scan_archive(Archive::new(GzDecoder::new(reader)))
    } else {
        scan_archive(Archive::new(reader))
    }
}

/// Check if data is in gzip format by examining the gzip magic number (0x1f 0x8b)
pub fn is_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn scan_archive<R: Read>(mut archive: Archive<R>) -> Result<Vec<LayerDescriptor>> {
    let mut sizes: HashMap<String, u64> = HashMap::new();
    let mut metadata: HashMap<String, Vec<u8>> = HashMap::new();
    let mut payload_digests: HashMap<String, String> = HashMap::new();

    let entries = archive
        .entries()
        .map_err(|e| AirgapError::Io(format!("Failed to read image archive entries: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| AirgapError::Io(format!("Failed to read image archive entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = String::from_utf8_lossy(&entry.path_bytes())
            .trim_start_matches("./")
            .to_string();
        let size = entry.header().size().map_err(|e| {
            AirgapError::Io(format!("Failed to read size of {}: {}", name, e))
        })?;

        if size <= MAX_METADATA_SIZE && is_metadata_candidate(&name) {
            let mut data = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut data).map_err(|e| {
                AirgapError::Io(format!("Failed to read {}: {}", name, e))
            })?;
            payload_digests.insert(name.clone(), sha256_digest(&data));
            metadata.insert(name.clone(), data);
        } else {
            let digest = stream_digest(&mut entry)
                .map_err(|e| AirgapError::Io(format!("Failed to read {}: {}", name, e)))?;
            payload_digests.insert(name.clone(), digest);
        }
        sizes.insert(name, size);
    }

    let manifest_data = metadata.get(MANIFEST_FILE).ok_or_else(|| {
        AirgapError::MalformedBundle(format!("image archive has no {}", MANIFEST_FILE))
    })?;
    let manifest: Vec<ArchiveManifestItem> = serde_json::from_slice(manifest_data)?;
    let item = manifest.into_iter().next().ok_or_else(|| {
        AirgapError::MalformedBundle(format!("{} lists no images", MANIFEST_FILE))
    })?;

    let config: ImageConfig = match metadata.get(item.config.trim_start_matches("./")) {
        Some(data) => serde_json::from_slice(data)?,
        None => ImageConfig::default(),
    };
    let diff_ids = config.rootfs.map(|r| r.diff_ids).unwrap_or_default();

    item.layers
        .iter()
        .enumerate()
        .map(|(i, layer_path)| {
            let layer_path = layer_path.trim_start_matches("./");
            let size = *sizes.get(layer_path).ok_or_else(|| {
                AirgapError::MalformedBundle(format!(
                    "layer {} listed in {} is missing from the archive",
                    layer_path, MANIFEST_FILE
                ))
            })?;
            let digest = match diff_ids.get(i) {
                Some(diff_id) => diff_id.clone(),
                None => payload_digests.get(layer_path).cloned().unwrap_or_default(),
            };
            Ok(LayerDescriptor::new(digest, size))
        })
        .collect()
}

/// `manifest.json`, `<id>.json` configs and OCI blobs may hold metadata
fn is_metadata_candidate(name: &str) -> bool {
    name.ends_with(".json") || name.starts_with("blobs/")
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn stream_digest<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
