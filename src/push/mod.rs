//! Push orchestration
//!
//! [`AirgapPusher`] drives one run: extract or stream the bundle, enumerate
//! its images, rewrite every reference, then push images one at a time while
//! a background reporter renders progress. Every destination reference is
//! computed before the first push, so malformed bundles fail without any
//! network activity.

pub mod pusher;
pub mod retry;

pub use pusher::ImagePusher;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};

use crate::archive::{BundleArchive, extract_bundle};
use crate::bundle::walker::ImagesSection;
use crate::bundle::{
    AirgapBundle, AirgapMeta, BundleKind, BundleSource, BundleWalker, IMAGES_DIR,
    TransportEncoding, classify_bundle, find_airgap_meta_in_bundle, find_airgap_meta_in_dir,
};
use crate::config::PushImagesOptions;
use crate::error::{AirgapError, Result};
use crate::image::reference::{dest_image_name, rewrite_archive_image, rewrite_registry_image};
use crate::image::{CopySpec, ImageEntry, RegistryAuth, RewrittenImage};
use crate::logging::Logger;
use crate::progress::{
    Clock, ProgressOutput, ProgressReporter, ProgressSink, ProgressTracker, ReportMode, SystemClock,
};
use crate::registry::{ImageCopier, RunningRegistry, TempRegistry};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

const READING_IMAGES_LINE: &str = "Reading image information from bundle...";

/// One image ready to be pushed
#[derive(Debug, Clone)]
struct PlannedPush {
    image_id: String,
    spec: CopySpec,
    rewritten: RewrittenImage,
}

pub struct AirgapPusher {
    copier: Arc<dyn ImageCopier>,
    temp_registry: Arc<dyn TempRegistry>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    logger: Logger,
    output: ProgressOutput,
}

impl AirgapPusher {
    pub fn new(
        copier: Arc<dyn ImageCopier>,
        temp_registry: Arc<dyn TempRegistry>,
        logger: Logger,
    ) -> Self {
        Self {
            copier,
            temp_registry,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            logger,
            output: ProgressOutput::stdout(),
        }
    }

    pub fn with_output(mut self, output: ProgressOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn extract_blocking(&self, bundle_path: &Path, dest_dir: &Path) -> Result<usize> {
        let bundle_path = bundle_path.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();
        let output = self.output.clone();
        run_blocking(move || extract_bundle(&bundle_path, &dest_dir, false, &output)).await
    }

    fn pusher(&self) -> ImagePusher {
        ImagePusher::new(self.copier.clone(), self.retry.clone(), self.logger.clone())
    }

    /// Extracts `bundle_path` to a scratch directory and pushes whatever it
    /// holds: an application bundle or the admin console images layout
    pub async fn push_images(
        &self,
        bundle_path: &Path,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        options.registry.validate()?;

        let scratch = tempfile::Builder::new().prefix("airgap-root").tempdir()?;
        self.logger.section("Extracting airgap bundle");
        let extracted = self
            .extract_blocking(bundle_path, scratch.path())
            .await
            .map_err(|e| e.context("failed to extract images"))?;
        self.logger.detail(&format!("Extracted {} files", extracted));

        match classify_bundle(scratch.path())? {
            BundleKind::Application => self.push_app_images_from_path(scratch.path(), options).await,
            BundleKind::KotsadmImages => {
                self.push_kotsadm_images_from_path(scratch.path(), options)
                    .await
            }
        }
    }

    /// Pushes the images of an extracted application bundle
    pub async fn push_app_images_from_path(
        &self,
        root: &Path,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        let meta = find_airgap_meta_in_dir(root)
            .map_err(|e| e.context("failed to find airgap meta"))?;
        let bundle = AirgapBundle::from_directory(root, &meta)?;
        self.push_airgap_bundle(&bundle, &meta, options).await
    }

    /// Pushes the images of a compressed application bundle. Docker-archive
    /// bundles are streamed; temp-registry bundles need the dataset on disk.
    pub async fn push_app_images_from_bundle(
        &self,
        bundle_path: &Path,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        options.registry.validate()?;
        let meta = read_meta_blocking(bundle_path)
            .await
            .map_err(|e| e.context("failed to find airgap meta"))?;
        let bundle = AirgapBundle::from_stream(bundle_path, &meta)?;
        self.push_airgap_bundle(&bundle, &meta, options).await
    }

    async fn push_airgap_bundle(
        &self,
        bundle: &AirgapBundle,
        meta: &AirgapMeta,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        self.logger.info(&format!("Bundle images are encoded as {}", bundle.encoding));
        match (&bundle.source, bundle.encoding) {
            (BundleSource::Directory(root), TransportEncoding::TempRegistry) => {
                self.push_from_temp_registry(root, &meta.spec.saved_images, options)
                    .await
            }
            (BundleSource::Directory(root), TransportEncoding::DockerArchive) => {
                self.push_from_docker_archive_path(root, options).await
            }
            (BundleSource::Stream(path), TransportEncoding::TempRegistry) => {
                let scratch = tempfile::Builder::new()
                    .prefix("extracted-airgap")
                    .tempdir()?;
                self.extract_blocking(path, scratch.path())
                    .await
                    .map_err(|e| e.context("failed to unarchive airgap bundle"))?;
                self.push_from_temp_registry(scratch.path(), &meta.spec.saved_images, options)
                    .await
            }
            (BundleSource::Stream(path), TransportEncoding::DockerArchive) => {
                self.push_from_docker_archive_bundle(path, options).await
            }
        }
    }

    /// Serves `<root>/images` from a temporary registry and copies every
    /// saved image out of it. The registry is stopped on every exit path.
    pub async fn push_from_temp_registry(
        &self,
        root: &Path,
        saved_images: &[String],
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        let registry = self
            .temp_registry
            .start(&root.join(IMAGES_DIR))
            .await
            .map_err(|e| e.context("failed to start temp registry"))?;

        let result = self
            .push_saved_images(registry.as_ref(), saved_images, options)
            .await;
        let stopped = registry.stop().await;

        let images = result?;
        stopped?;
        Ok(images)
    }

    async fn push_saved_images(
        &self,
        registry: &dyn RunningRegistry,
        saved_images: &[String],
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        let images = BundleWalker::new(options.log_for_ui).walk_saved_images(saved_images, registry)?;

        let mut plan = Vec::with_capacity(images.len());
        for image in &images {
            let rewritten = rewrite_registry_image(&options.registry, &image.id)
                .map_err(|e| e.context(format!("failed to rewrite image {}", image.id)))?;
            let src_ref = registry
                .src_ref(&image.id)
                .map_err(|e| e.context(format!("failed to parse source image {}", image.id)))?;
            let spec = CopySpec {
                src_ref,
                dest_ref: format!("docker://{}", rewritten.dest_image()),
                dest_auth: dest_auth(options),
                skip_src_tls_verify: true,
                skip_dest_tls_verify: options.registry.skip_tls_verify,
                // Multi-architecture images are only supported by digest
                copy_all: rewritten.is_digest(),
            };
            plan.push(PlannedPush {
                image_id: image.id.clone(),
                spec,
                rewritten,
            });
        }

        self.push_planned(images, plan, options).await
    }

    /// Pushes every docker-archive under `<root>/images`
    pub async fn push_from_docker_archive_path(
        &self,
        root: &Path,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        let images = BundleWalker::new(options.log_for_ui).walk_images_dir(root)?;

        let mut plan = Vec::with_capacity(images.len());
        for image in &images {
            let rewritten = rewrite_archive_image(&options.registry, &image.segments[1..])
                .map_err(|e| e.context("failed to rewrite docker archive image"))?;
            plan.push(PlannedPush {
                image_id: image.id.clone(),
                spec: archive_copy_spec(&image.id, &rewritten, options),
                rewritten,
            });
        }

        self.push_planned(images, plan, options).await
    }

    /// Pushes the images of a compressed docker-archive bundle without
    /// extracting it. The bundle is read twice: once to list images, once
    /// to stage each image in a temporary file right before its push.
    pub async fn push_from_docker_archive_bundle(
        &self,
        bundle_path: &Path,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        if options.log_for_ui {
            self.output.write_line(READING_IMAGES_LINE)?;
        }
        let images = scan_blocking(bundle_path, options.log_for_ui).await?;

        let mut plan = Vec::with_capacity(images.len());
        for image in &images {
            let rewritten = rewrite_archive_image(&options.registry, &image.segments[1..])
                .map_err(|e| e.context("failed to rewrite docker archive image"))?;
            plan.push(PlannedPush {
                image_id: image.id.clone(),
                // Staged path filled in once the image is on disk
                spec: archive_copy_spec("", &rewritten, options),
                rewritten,
            });
        }
        let rewritten: Vec<RewrittenImage> = plan.iter().map(|p| p.rewritten.clone()).collect();
        let by_id: HashMap<String, PlannedPush> = plan
            .into_iter()
            .map(|p| (p.image_id.clone(), p))
            .collect();

        let pusher = self.pusher();
        let log_for_ui = options.log_for_ui;
        let bundle_path = bundle_path.to_path_buf();
        self.tracked(images, options, |sink| async move {
            let known: HashSet<String> = by_id.keys().cloned().collect();
            let (tx, mut rx) = mpsc::channel(1);
            let producer =
                tokio::task::spawn_blocking(move || stage_bundle_images(&bundle_path, known, tx));

            let mut pushed = Ok(());
            while let Some((image_id, staged)) = rx.recv().await {
                pushed = push_staged(&pusher, &by_id, &image_id, &staged, &sink, log_for_ui).await;
                // Removes the staged file
                drop(staged);
                if pushed.is_err() {
                    break;
                }
            }
            drop(rx);

            let staged = producer
                .await
                .map_err(|e| AirgapError::Io(format!("image staging task failed: {}", e)))?;
            pushed?;
            staged
        })
        .await?;

        Ok(rewritten)
    }

    /// Pushes the two-level `<format>/<image>/<tag>` layout of admin console
    /// images. A configured kotsadm tag replaces every tag.
    pub async fn push_kotsadm_images_from_path(
        &self,
        root: &Path,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        let images = BundleWalker::new(options.log_for_ui).walk_format_dirs(root)?;

        let mut plan = Vec::with_capacity(images.len());
        for image in &images {
            let [format, name, tag] = image.segments.as_slice() else {
                return Err(AirgapError::MalformedBundle(format!(
                    "unexpected image path {}",
                    image.id
                )));
            };
            let tag = options.kotsadm_tag.clone().unwrap_or_else(|| tag.clone());
            let rewritten = RewrittenImage {
                name: name.clone(),
                new_name: dest_image_name(&options.registry, name),
                new_tag: Some(tag),
                digest: None,
            };
            let spec = CopySpec {
                src_ref: format!("{}:{}", format, image.id),
                dest_ref: format!("docker://{}", rewritten.dest_image()),
                dest_auth: dest_auth(options),
                skip_src_tls_verify: options.skip_src_tls_verify,
                skip_dest_tls_verify: options.registry.skip_tls_verify,
                copy_all: false,
            };
            plan.push(PlannedPush {
                image_id: image.id.clone(),
                spec,
                rewritten,
            });
        }

        self.push_planned(images, plan, options).await
    }

    /// Destination references of every image in a compressed bundle,
    /// without pushing anything
    pub async fn list_images_from_bundle(
        &self,
        bundle_path: &Path,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        if options.log_for_ui {
            self.output.write_line(READING_IMAGES_LINE)?;
        }
        let meta = read_meta_blocking(bundle_path)
            .await
            .map_err(|e| e.context("failed to find airgap meta"))?;

        match meta.encoding()? {
            TransportEncoding::TempRegistry => meta
                .spec
                .saved_images
                .iter()
                .map(|image| {
                    rewrite_registry_image(&options.registry, image)
                        .map_err(|e| e.context(format!("failed to rewrite image {}", image)))
                })
                .collect(),
            TransportEncoding::DockerArchive => scan_blocking(bundle_path, false)
                .await?
                .iter()
                .map(|image| {
                    rewrite_archive_image(&options.registry, &image.segments[1..])
                        .map_err(|e| e.context("failed to rewrite docker archive image"))
                })
                .collect(),
        }
    }

    async fn push_planned(
        &self,
        images: Vec<ImageEntry>,
        plan: Vec<PlannedPush>,
        options: &PushImagesOptions,
    ) -> Result<Vec<RewrittenImage>> {
        self.logger
            .section(&format!("Pushing {} images to {}", plan.len(), options.registry.endpoint));

        let pusher = self.pusher();
        let log_for_ui = options.log_for_ui;
        let plan = self
            .tracked(images, options, |sink| async move {
                for step in &plan {
                    pusher
                        .push(&step.image_id, &step.spec, &sink, log_for_ui)
                        .await
                        .map_err(|e| e.context(format!("failed to push app image {}", step.image_id)))?;
                }
                Ok::<_, AirgapError>(plan)
            })
            .await?;

        self.logger.success(&format!(
            "Pushed {} images in {}",
            plan.len(),
            self.logger.format_duration(self.logger.elapsed())
        ));
        Ok(plan.into_iter().map(|p| p.rewritten).collect())
    }

    /// Runs `body` with a progress sink feeding a fresh tracker. The
    /// reporter is drained and flushed before any error of `body` is
    /// returned, so the last snapshot shows the failed image.
    async fn tracked<T, F, Fut>(
        &self,
        images: Vec<ImageEntry>,
        options: &PushImagesOptions,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(ProgressSink) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mode = if options.log_for_ui {
            ReportMode::Structured
        } else {
            ReportMode::Plain
        };
        let tracker = ProgressTracker::new(images, self.clock.clone());
        let reporter = ProgressReporter::spawn(tracker, self.output.clone(), mode);

        let result = body(reporter.sink()).await;
        let finished = reporter.finish().await;

        let value = result?;
        finished?;
        Ok(value)
    }
}

/// Runs tar, gzip and filesystem work on the blocking pool
async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| AirgapError::Io(format!("blocking task failed: {}", e)))?
}

async fn read_meta_blocking(bundle_path: &Path) -> Result<AirgapMeta> {
    let bundle_path = bundle_path.to_path_buf();
    run_blocking(move || find_airgap_meta_in_bundle(&bundle_path)).await
}

async fn scan_blocking(bundle_path: &Path, log_for_ui: bool) -> Result<Vec<ImageEntry>> {
    let bundle_path = bundle_path.to_path_buf();
    run_blocking(move || BundleWalker::new(log_for_ui).scan_bundle(&bundle_path)).await
}

fn dest_auth(options: &PushImagesOptions) -> RegistryAuth {
    RegistryAuth {
        username: options.registry.username.clone(),
        password: options.registry.password.clone(),
    }
}

/// Docker-archive images cannot carry a manifest list, so `copy_all` stays off
fn archive_copy_spec(path: &str, rewritten: &RewrittenImage, options: &PushImagesOptions) -> CopySpec {
    CopySpec {
        src_ref: format!("{}:{}", TransportEncoding::DockerArchive.transport(), path),
        dest_ref: format!("docker://{}", rewritten.dest_image()),
        dest_auth: dest_auth(options),
        skip_src_tls_verify: options.skip_src_tls_verify,
        skip_dest_tls_verify: options.registry.skip_tls_verify,
        copy_all: false,
    }
}

async fn push_staged(
    pusher: &ImagePusher,
    by_id: &HashMap<String, PlannedPush>,
    image_id: &str,
    staged: &NamedTempFile,
    sink: &ProgressSink,
    log_for_ui: bool,
) -> Result<()> {
    let planned = by_id.get(image_id).ok_or_else(|| {
        AirgapError::MalformedBundle(format!("image {} was not listed in the bundle", image_id))
    })?;
    if log_for_ui {
        sink.send_line(format!("Extracting image {}", image_id)).await?;
    }

    let spec = CopySpec {
        src_ref: format!(
            "{}:{}",
            TransportEncoding::DockerArchive.transport(),
            staged.path().display()
        ),
        ..planned.spec.clone()
    };
    pusher
        .push(image_id, &spec, sink, log_for_ui)
        .await
        .map_err(|e| e.context(format!("failed to push app image {}", image_id)))
}

/// Blocking half of the streamed push: copies each listed image of the
/// bundle to a temporary file and hands it over. Returns early once the
/// receiving side is gone.
fn stage_bundle_images(
    bundle_path: &Path,
    mut known: HashSet<String>,
    tx: mpsc::Sender<(String, NamedTempFile)>,
) -> Result<()> {
    let mut archive = BundleArchive::open(bundle_path)?;
    let mut section = ImagesSection::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !section.accept(entry.name(), entry.kind()) {
            continue;
        }
        let image_id = entry.name().to_string();
        if !known.remove(&image_id) {
            continue;
        }

        let mut staged = tempfile::Builder::new()
            .prefix("airgap-app-image-")
            .tempfile()?;
        std::io::copy(&mut entry, staged.as_file_mut()).map_err(|e| {
            AirgapError::Io(format!("failed to write file {:?}: {}", image_id, e))
        })?;

        if tx.blocking_send((image_id, staged)).is_err() {
            break;
        }
    }
    Ok(())
}
