//! Image work units of a push run
//!
//! An [`ImageEntry`] is created for every image the bundle walker finds and
//! lives until the run ends. Its status only moves forward, see
//! [`ImageStatus::can_advance_to`].

pub mod layers;
pub mod reference;

use crate::bundle::TransportEncoding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use layers::{LayerDescriptor, read_archive_layers, read_archive_layers_from_reader};
pub use reference::{ImageReference, RewrittenImage};

/// Upload state of one image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Queued,
    Uploading,
    Uploaded,
    Failed,
}

impl ImageStatus {
    fn rank(self) -> u8 {
        match self {
            ImageStatus::Queued => 0,
            ImageStatus::Uploading => 1,
            ImageStatus::Uploaded | ImageStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ImageStatus::Uploaded | ImageStatus::Failed)
    }

    /// Terminal statuses are final; everything else may only move forward.
    pub fn can_advance_to(self, next: ImageStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::Queued => "queued",
            ImageStatus::Uploading => "uploading",
            ImageStatus::Uploaded => "uploaded",
            ImageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One content-addressed layer of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// Digest without the `sha256:` prefix
    pub id: String,
    pub size: u64,
    pub upload_start: Option<DateTime<Utc>>,
    pub upload_end: Option<DateTime<Utc>>,
}

impl LayerEntry {
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            size,
            upload_start: None,
            upload_end: None,
        }
    }

    pub fn is_uploaded(&self) -> bool {
        self.upload_end.is_some()
    }
}

/// One image:tag unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Full path for archive images, entry name for streamed bundles, image
    /// name for registry images
    pub id: String,
    pub encoding: TransportEncoding,
    /// Segments used to rebuild the destination reference of archive images
    pub segments: Vec<String>,
    pub status: ImageStatus,
    pub error: Option<String>,
    pub upload_start: Option<DateTime<Utc>>,
    pub upload_end: Option<DateTime<Utc>>,
    pub layers: BTreeMap<String, LayerEntry>,
}

impl ImageEntry {
    pub fn new(id: impl Into<String>, encoding: TransportEncoding) -> Self {
        Self {
            id: id.into(),
            encoding,
            segments: Vec::new(),
            status: ImageStatus::Queued,
            error: None,
            upload_start: None,
            upload_end: None,
            layers: BTreeMap::new(),
        }
    }

    pub fn with_segments(mut self, segments: Vec<String>) -> Self {
        self.segments = segments;
        self
    }

    /// Registers layers, keyed by digest without the algorithm prefix
    pub fn with_layers(mut self, layers: Vec<LayerDescriptor>) -> Self {
        for layer in layers {
            let id = layer.id().to_string();
            self.layers.insert(id.clone(), LayerEntry::new(id, layer.size));
        }
        self
    }

    pub fn layers_uploaded(&self) -> usize {
        self.layers.values().filter(|l| l.is_uploaded()).count()
    }

    /// `nginx:latest` for `.../nginx/latest`, the identity itself otherwise
    pub fn display_name(&self) -> String {
        match self.encoding {
            TransportEncoding::DockerArchive => path_to_display_name(&self.id),
            TransportEncoding::TempRegistry => self.id.clone(),
        }
    }

    /// Moves the status forward; returns false when the transition is refused
    pub fn advance(&mut self, next: ImageStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

fn path_to_display_name(path: &str) -> String {
    let mut parts = path.rsplit(['/', '\\']).filter(|p| !p.is_empty());
    let tag = parts.next().unwrap_or_default();
    let image = parts.next().unwrap_or_default();
    format!("{}:{}", image, tag)
}

/// Destination credentials handed to the copier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() || self.password.is_empty()
    }
}

/// Per-image copy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    /// Transport-qualified source, e.g. `docker-archive:/tmp/x` or `docker://host/img:tag`
    pub src_ref: String,
    /// Transport-qualified destination, always `docker://...`
    pub dest_ref: String,
    pub dest_auth: RegistryAuth,
    pub skip_src_tls_verify: bool,
    pub skip_dest_tls_verify: bool,
    /// Copy every platform of a manifest list; only set for digest destinations
    pub copy_all: bool,
}
