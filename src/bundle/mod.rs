//! Airgap bundle model: kinds, transport encodings and the airgap metadata
//! document

pub mod detect;
pub mod walker;

use crate::error::{AirgapError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub use detect::{classify_bundle, find_airgap_meta_in_bundle, find_airgap_meta_in_dir};
pub use walker::BundleWalker;

pub const AIRGAP_API_VERSION: &str = "kots.io/v1beta1";
pub const AIRGAP_KIND: &str = "Airgap";

/// Name of the directory holding the images of an application bundle
pub const IMAGES_DIR: &str = "images";

/// How images are serialized inside a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportEncoding {
    /// Images served from an embedded on-disk registry dataset
    TempRegistry,
    /// One `docker save` archive per image, laid out by format/name/tag
    DockerArchive,
}

impl TransportEncoding {
    /// Maps `spec.format` of the airgap metadata; empty means docker-archive
    pub fn from_format(format: &str) -> Result<Self> {
        match format {
            "docker-registry" => Ok(TransportEncoding::TempRegistry),
            "docker-archive" | "" => Ok(TransportEncoding::DockerArchive),
            other => Err(AirgapError::MalformedBundle(format!(
                "airgap bundle format '{}' is not supported",
                other
            ))),
        }
    }

    /// Transport prefix understood by the copier
    pub fn transport(self) -> &'static str {
        match self {
            TransportEncoding::TempRegistry => "docker-registry",
            TransportEncoding::DockerArchive => "docker-archive",
        }
    }
}

impl fmt::Display for TransportEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEncoding::TempRegistry => f.write_str("temp-registry"),
            TransportEncoding::DockerArchive => f.write_str("docker-archive"),
        }
    }
}

/// What an extracted bundle contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    /// Application bundle carrying an airgap metadata document
    Application,
    /// Flat `<format>/<image>/<tag>` layout of admin console images
    KotsadmImages,
}

/// `kots.io/v1beta1` `Airgap` document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirgapMeta {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub spec: AirgapSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirgapSpec {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub saved_images: Vec<String>,
}

impl AirgapMeta {
    /// Decodes a YAML document; `None` when it is valid YAML of another kind
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        let meta: AirgapMeta = serde_yaml::from_slice(data)?;
        Ok(meta.is_airgap().then_some(meta))
    }

    pub fn is_airgap(&self) -> bool {
        self.api_version == AIRGAP_API_VERSION && self.kind == AIRGAP_KIND
    }

    pub fn encoding(&self) -> Result<TransportEncoding> {
        TransportEncoding::from_format(&self.spec.format)
    }
}

/// Where a bundle's content is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    /// A bundle already extracted to a directory
    Directory(PathBuf),
    /// A gzip tar read front to back
    Stream(PathBuf),
}

/// A source archive and the encoding of its images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirgapBundle {
    pub source: BundleSource,
    pub encoding: TransportEncoding,
}

impl AirgapBundle {
    pub fn from_directory(root: impl Into<PathBuf>, meta: &AirgapMeta) -> Result<Self> {
        Ok(Self {
            source: BundleSource::Directory(root.into()),
            encoding: meta.encoding()?,
        })
    }

    pub fn from_stream(path: impl Into<PathBuf>, meta: &AirgapMeta) -> Result<Self> {
        Ok(Self {
            source: BundleSource::Stream(path.into()),
            encoding: meta.encoding()?,
        })
    }
}
