//! Per-image and per-layer upload state, rendered as full snapshots
//!
//! The tracker is the only writer of image state during a run. It is driven
//! by [`ProgressLine`]s and renders a complete [`ProgressSnapshot`] on
//! demand, so a consumer that misses snapshots only loses granularity.

use super::protocol::ProgressLine;
use crate::image::{ImageEntry, ImageStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Source of timestamps for upload start/end times
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub const REPORT_TYPE: &str = "progressReport";

/// Point-in-time view of every known image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    #[serde(rename = "type")]
    pub report_type: String,
    /// The last plain progress line, for consumers without structured support
    pub compatibility_message: String,
    pub images: Vec<ProgressImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressImage {
    pub display_name: String,
    pub status: ImageStatus,
    /// Empty unless the status is failed
    pub error: String,
    /// Layers uploaded so far
    pub current: usize,
    pub total: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

pub struct ProgressTracker {
    images: BTreeMap<String, ImageEntry>,
    current_image: Option<String>,
    current_layer: Option<String>,
    current_line: String,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    pub fn new(images: Vec<ImageEntry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            images: images
                .into_iter()
                .map(|image| (image.id.clone(), image))
                .collect(),
            current_image: None,
            current_layer: None,
            current_line: String::new(),
            clock,
        }
    }

    pub fn image(&self, id: &str) -> Option<&ImageEntry> {
        self.images.get(id)
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.values()
    }

    pub fn apply(&mut self, line: &ProgressLine) {
        if let Some(text) = line.compatibility_text() {
            self.current_line = text.to_string();
        }

        match line {
            ProgressLine::Blob { layer_id, .. } => {
                self.layer_ended();
                self.current_layer = Some(layer_id.clone());
                self.layer_started();
            }
            ProgressLine::Config { .. } => {
                self.layer_ended();
                self.current_layer = None;
            }
            ProgressLine::ImageBegin(id) => {
                self.current_image = Some(id.clone());
                self.current_layer = None;
                let now = self.clock.now();
                if let Some(image) = self.images.get_mut(id)
                    && image.advance(ImageStatus::Uploading)
                {
                    image.upload_start = Some(now);
                }
            }
            ProgressLine::ImageEnd(id) => {
                let now = self.clock.now();
                if let Some(image) = self.lookup_mut(Some(id))
                    && image.advance(ImageStatus::Uploaded)
                {
                    image.upload_end = Some(now);
                }
            }
            ProgressLine::ImageError(error) => {
                let now = self.clock.now();
                if let Some(image) = self.lookup_mut(None)
                    && image.advance(ImageStatus::Failed)
                {
                    image.error = Some(error.clone());
                    image.upload_end = Some(now);
                }
            }
            ProgressLine::Flush | ProgressLine::Text(_) => {}
        }
    }

    /// The named image when it is known, else the image currently uploading
    fn lookup_mut(&mut self, id: Option<&str>) -> Option<&mut ImageEntry> {
        let key = match id {
            Some(id) if self.images.contains_key(id) => id.to_string(),
            _ => self.current_image.clone()?,
        };
        self.images.get_mut(&key)
    }

    fn layer_started(&mut self) {
        let now = self.clock.now();
        let layer_id = self.current_layer.clone();
        let Some(image) = self.lookup_mut(None) else {
            return;
        };
        if !image.advance(ImageStatus::Uploading) {
            return;
        }
        if let Some(layer) = layer_id.and_then(|id| image.layers.get_mut(&id)) {
            layer.upload_start = Some(now);
        }
    }

    fn layer_ended(&mut self) {
        let now = self.clock.now();
        let layer_id = self.current_layer.clone();
        let Some(image) = self.lookup_mut(None) else {
            return;
        };
        if !image.advance(ImageStatus::Uploading) {
            return;
        }
        if let Some(layer) = layer_id.and_then(|id| image.layers.get_mut(&id)) {
            layer.upload_end = Some(now);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            report_type: REPORT_TYPE.to_string(),
            compatibility_message: self.current_line.clone(),
            images: self
                .images
                .values()
                .map(|image| ProgressImage {
                    display_name: image.display_name(),
                    status: image.status,
                    error: image.error.clone().unwrap_or_default(),
                    current: image.layers_uploaded(),
                    total: image.layers.len(),
                    start_time: image.upload_start,
                    end_time: image.upload_end,
                })
                .collect(),
        }
    }
}
