//! Shared fixtures for the integration tests: in-memory output, fake
//! collaborators and bundle builders

#![allow(dead_code)]

use airgap_image_pusher::error::{AirgapError, Result};
use airgap_image_pusher::image::{CopySpec, ImageReference, LayerDescriptor};
use airgap_image_pusher::progress::{Clock, ProgressSink};
use airgap_image_pusher::push::Sleeper;
use airgap_image_pusher::registry::{ImageCopier, RunningRegistry, TempRegistry};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tar::{Builder, EntryType, Header};

/// `Write` sink whose content stays readable after being handed out
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    /// Every JSON progress snapshot written so far
    pub fn snapshots(&self) -> Vec<serde_json::Value> {
        self.lines()
            .iter()
            .filter(|line| line.starts_with('{'))
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub fn last_snapshot(&self) -> serde_json::Value {
        self.snapshots().pop().expect("no snapshot written")
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// One second per reading
pub struct TickingClock(AtomicI64);

impl TickingClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(0)))
    }
}

impl Clock for TickingClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.0.fetch_add(1, Ordering::SeqCst);
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    pub delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

impl RecordingSleeper {
    pub fn count(&self) -> usize {
        self.delays.lock().unwrap().len()
    }
}

/// Copier that fails its first `failures` calls and then plays back
/// skopeo-like progress for the layers registered per destination
#[derive(Default)]
pub struct FakeCopier {
    failures: usize,
    layers: Vec<(String, Vec<String>)>,
    calls: Mutex<Vec<CopySpec>>,
    staged_sources: Mutex<Vec<bool>>,
}

impl FakeCopier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    /// Layers reported for destinations containing `fragment`
    pub fn with_layers(mut self, fragment: &str, layer_ids: &[&str]) -> Self {
        self.layers.push((
            fragment.to_string(),
            layer_ids.iter().map(|id| id.to_string()).collect(),
        ));
        self
    }

    pub fn calls(&self) -> Vec<CopySpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether each docker-archive source existed when it was copied
    pub fn staged_sources(&self) -> Vec<bool> {
        self.staged_sources.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageCopier for FakeCopier {
    async fn copy_image(&self, spec: &CopySpec, progress: &ProgressSink) -> Result<()> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(spec.clone());
            calls.len()
        };
        if let Some(path) = spec.src_ref.strip_prefix("docker-archive:") {
            self.staged_sources
                .lock()
                .unwrap()
                .push(Path::new(path).is_file());
        }

        if call <= self.failures {
            return Err(AirgapError::Copy(format!(
                "connection reset by peer (call {})",
                call
            )));
        }

        let layers: Vec<String> = self
            .layers
            .iter()
            .filter(|(fragment, _)| spec.dest_ref.contains(fragment.as_str()))
            .flat_map(|(_, ids)| ids.clone())
            .collect();
        for id in layers {
            progress
                .send_line(format!("Copying blob sha256:{}", id))
                .await?;
        }
        progress.send_line("Copying config sha256:c0ffee").await?;
        progress
            .send_line("Writing manifest to image destination")
            .await?;
        Ok(())
    }
}

/// Temp registry answering from an in-memory layer table
#[derive(Default)]
pub struct FakeRegistry {
    layers: HashMap<String, Vec<LayerDescriptor>>,
    pub started: Arc<Mutex<Vec<PathBuf>>>,
    pub stopped: Arc<AtomicBool>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: &str, layers: &[(&str, u64)]) -> Self {
        self.layers.insert(
            image.to_string(),
            layers
                .iter()
                .map(|(hex, size)| LayerDescriptor::new(format!("sha256:{}", hex), *size))
                .collect(),
        );
        self
    }
}

struct FakeRunningRegistry {
    layers: HashMap<String, Vec<LayerDescriptor>>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl TempRegistry for FakeRegistry {
    async fn start(&self, data_dir: &Path) -> Result<Box<dyn RunningRegistry>> {
        self.started.lock().unwrap().push(data_dir.to_path_buf());
        Ok(Box::new(FakeRunningRegistry {
            layers: self.layers.clone(),
            stopped: self.stopped.clone(),
        }))
    }
}

#[async_trait]
impl RunningRegistry for FakeRunningRegistry {
    fn src_ref(&self, image: &str) -> Result<String> {
        let reference = ImageReference::parse(image)?;
        Ok(format!(
            "docker://127.0.0.1:5000/{}:{}",
            reference.image_name(),
            reference.tag.clone().unwrap_or_default()
        ))
    }

    fn image_layers(&self, image: &str) -> Result<Vec<LayerDescriptor>> {
        self.layers
            .get(image)
            .cloned()
            .ok_or_else(|| AirgapError::Registry(format!("unknown image {}", image)))
    }

    async fn stop(self: Box<Self>) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One tar entry of a test bundle
pub enum Entry {
    Dir(String),
    File(String, Vec<u8>),
}

impl Entry {
    pub fn dir(name: &str) -> Self {
        Entry::Dir(name.to_string())
    }

    pub fn file(name: &str, data: impl Into<Vec<u8>>) -> Self {
        Entry::File(name.to_string(), data.into())
    }
}

fn tar_bytes(entries: &[Entry]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for entry in entries {
        match entry {
            Entry::Dir(name) => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_cksum();
                builder
                    .append_data(&mut header, format!("{}/", name), std::io::empty())
                    .unwrap();
            }
            Entry::File(name, data) => {
                let mut header = Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, &data[..]).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

/// Writes a gzip tar bundle named `name` into `dir`
pub fn write_bundle(dir: &Path, name: &str, entries: &[Entry]) -> PathBuf {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&tar_bytes(entries)).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, encoder.finish().unwrap()).unwrap();
    path
}

/// `docker save` style archive whose config lists `layers` as diff ids
pub fn docker_archive(layers: &[(&str, usize)]) -> Vec<u8> {
    let mut entries = Vec::new();
    let mut layer_paths = Vec::new();
    let mut diff_ids = Vec::new();
    for (hex, size) in layers {
        let path = format!("{}/layer.tar", hex);
        entries.push(Entry::file(&path, vec![0u8; *size]));
        layer_paths.push(path);
        diff_ids.push(format!("sha256:{}", hex));
    }
    let config = serde_json::json!({ "rootfs": { "type": "layers", "diff_ids": diff_ids } });
    entries.push(Entry::file("config.json", config.to_string()));
    let manifest = serde_json::json!([{ "Config": "config.json", "RepoTags": [], "Layers": layer_paths }]);
    entries.push(Entry::file("manifest.json", manifest.to_string()));
    tar_bytes(&entries)
}

pub fn airgap_yaml(format: &str, saved_images: &[&str]) -> String {
    let mut yaml = format!(
        "apiVersion: kots.io/v1beta1\nkind: Airgap\nmetadata:\n  name: app\nspec:\n  format: \"{}\"\n",
        format
    );
    if !saved_images.is_empty() {
        yaml.push_str("  savedImages:\n");
        for image in saved_images {
            yaml.push_str(&format!("    - \"{}\"\n", image));
        }
    }
    yaml
}

/// Writes `data` at `root/relative`, creating parents
pub fn write_file(root: &Path, relative: &str, data: impl AsRef<[u8]>) -> PathBuf {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    path
}

/// Incompressible bytes from a fixed-seed LCG
pub fn noise(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

/// A docker-archive application bundle cut off at `keep_percent` of its
/// compressed size. The airgap document comes first and stays readable;
/// the cut lands in the noisy app payload that follows it.
pub fn truncated_bundle(dir: &Path, keep_percent: usize) -> PathBuf {
    let full = write_bundle(
        dir,
        "full.airgap",
        &[
            Entry::file("airgap.yaml", airgap_yaml("docker-archive", &[])),
            Entry::file("app.tar.gz", noise(128 * 1024)),
            Entry::dir("images"),
            Entry::dir("images/docker-archive"),
            Entry::file("images/docker-archive/redis/6", docker_archive(&[("bbb1", 8)])),
        ],
    );
    let data = std::fs::read(&full).unwrap();
    let path = dir.join("truncated.airgap");
    std::fs::write(&path, &data[..data.len() * keep_percent / 100]).unwrap();
    path
}
