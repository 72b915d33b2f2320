//! Read-only access to a registry's on-disk storage
//!
//! Temp-registry bundles ship the filesystem dataset of a registry. The
//! layer list of an image can be read straight from it:
//! `repositories/<repo>/_manifests/tags/<tag>/current/link` names the
//! manifest blob, which names the layer blobs.

use crate::error::{AirgapError, Result};
use crate::image::{ImageReference, LayerDescriptor};
use serde::Deserialize;
use std::path::PathBuf;

const STORAGE_PREFIX: &str = "docker/registry/v2";

const DIGEST_ALGORITHM: &str = "sha256";
const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredManifest {
    #[serde(default)]
    layers: Vec<Descriptor>,
    /// Set for manifest lists and OCI indexes
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    root: PathBuf,
}

impl RegistryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn repositories_dir(&self) -> PathBuf {
        self.root.join(STORAGE_PREFIX).join("repositories")
    }

    /// Digests come from bundle content, so only `sha256:` followed by 64
    /// lowercase hex characters is turned into a path
    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest
            .strip_prefix(DIGEST_ALGORITHM)
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|hex| {
                hex.len() == DIGEST_HEX_LEN
                    && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
            })
            .ok_or_else(|| {
                AirgapError::MalformedBundle(format!("invalid manifest digest '{}'", digest))
            })?;
        Ok(self
            .root
            .join(STORAGE_PREFIX)
            .join("blobs")
            .join(DIGEST_ALGORITHM)
            .join(&hex[..2])
            .join(hex)
            .join("data"))
    }

    /// Repository an image is stored under: its full path when present,
    /// otherwise its final segment
    pub fn repository_for(&self, reference: &ImageReference) -> Result<String> {
        let candidates = [reference.repository.as_str(), reference.image_name()];
        candidates
            .iter()
            .find(|repo| self.repositories_dir().join(repo).is_dir())
            .map(|repo| repo.to_string())
            .ok_or_else(|| {
                AirgapError::Registry(format!(
                    "image {} not found in registry storage",
                    reference.name()
                ))
            })
    }

    fn manifest_digest(&self, repository: &str, reference: &ImageReference) -> Result<String> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }
        let tag = reference.tag.as_deref().unwrap_or("latest");
        let link = self
            .repositories_dir()
            .join(repository)
            .join("_manifests/tags")
            .join(tag)
            .join("current/link");
        let digest = std::fs::read_to_string(&link).map_err(|e| {
            AirgapError::Registry(format!(
                "tag {}:{} not found in registry storage: {}",
                repository, tag, e
            ))
        })?;
        Ok(digest.trim().to_string())
    }

    fn read_manifest(&self, digest: &str) -> Result<StoredManifest> {
        let path = self.blob_path(digest)?;
        let data = std::fs::read(&path).map_err(|e| {
            AirgapError::Registry(format!("failed to read manifest {}: {}", digest, e))
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Layers of an image; indexes contribute the layers of every child
    /// manifest, since multi-architecture images are copied in full
    pub fn image_layers(&self, image: &str) -> Result<Vec<LayerDescriptor>> {
        let reference = ImageReference::parse(image)?;
        let repository = self.repository_for(&reference)?;
        let digest = self.manifest_digest(&repository, &reference)?;
        let manifest = self.read_manifest(&digest)?;

        let mut layers = Vec::new();
        if manifest.manifests.is_empty() {
            layers.extend(
                manifest
                    .layers
                    .into_iter()
                    .map(|l| LayerDescriptor::new(l.digest, l.size)),
            );
        } else {
            for child in manifest.manifests {
                let child_manifest = self.read_manifest(&child.digest)?;
                for layer in child_manifest.layers {
                    if !layers.iter().any(|l: &LayerDescriptor| l.digest == layer.digest) {
                        layers.push(LayerDescriptor::new(layer.digest, layer.size));
                    }
                }
            }
        }
        Ok(layers)
    }
}
