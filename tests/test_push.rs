mod common;

use airgap_image_pusher::config::{PushImagesOptions, RegistryOptions};
use airgap_image_pusher::error::AirgapError;
use airgap_image_pusher::logging::Logger;
use airgap_image_pusher::progress::ProgressOutput;
use airgap_image_pusher::push::{AirgapPusher, RetryPolicy};
use common::{
    Entry, FakeCopier, FakeRegistry, RecordingSleeper, SharedBuffer, TickingClock, airgap_yaml,
    docker_archive, truncated_bundle, write_bundle, write_file,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    copier: Arc<FakeCopier>,
    registry: Arc<FakeRegistry>,
    sleeper: Arc<RecordingSleeper>,
    output: SharedBuffer,
}

impl Harness {
    fn new(copier: FakeCopier, registry: FakeRegistry) -> Self {
        Self {
            copier: Arc::new(copier),
            registry: Arc::new(registry),
            sleeper: Arc::new(RecordingSleeper::default()),
            output: SharedBuffer::default(),
        }
    }

    fn pusher(&self) -> AirgapPusher {
        AirgapPusher::new(self.copier.clone(), self.registry.clone(), Logger::new_quiet())
            .with_output(ProgressOutput::new(self.output.clone()))
            .with_retry(RetryPolicy::default().with_sleeper(self.sleeper.clone()))
            .with_clock(TickingClock::new())
    }
}

fn options(log_for_ui: bool) -> PushImagesOptions {
    PushImagesOptions::new(
        RegistryOptions::new("registry.local:5000")
            .with_namespace("app")
            .with_credentials("admin", "secret"),
    )
    .with_log_for_ui(log_for_ui)
}

fn temp_registry_bundle_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "airgap.yaml",
        airgap_yaml("docker-registry", &["nginx:latest", "redis:6"]),
    );
    std::fs::create_dir_all(dir.path().join("images")).unwrap();
    dir
}

fn registry_with_layers() -> FakeRegistry {
    FakeRegistry::new()
        .with_image("nginx:latest", &[("aaa1", 100), ("aaa2", 200)])
        .with_image("redis:6", &[("bbb1", 300)])
}

fn image<'a>(snapshot: &'a serde_json::Value, name: &str) -> &'a serde_json::Value {
    snapshot["images"]
        .as_array()
        .unwrap()
        .iter()
        .find(|image| image["displayName"] == name)
        .unwrap_or_else(|| panic!("{} missing from snapshot", name))
}

fn duration_secs(image: &serde_json::Value) -> i64 {
    let start: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(image["startTime"].clone()).unwrap();
    let end: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(image["endTime"].clone()).unwrap();
    (end - start).num_seconds()
}

#[tokio::test]
async fn test_temp_registry_end_to_end() {
    let dir = temp_registry_bundle_dir();
    let harness = Harness::new(
        FakeCopier::new()
            .with_layers("/nginx:", &["aaa1", "aaa2"])
            .with_layers("/redis:", &["bbb1"]),
        registry_with_layers(),
    );

    let rewritten = harness
        .pusher()
        .push_app_images_from_path(dir.path(), &options(true))
        .await
        .unwrap();

    let dests: Vec<String> = rewritten.iter().map(|r| r.dest_image()).collect();
    assert_eq!(
        dests,
        vec!["registry.local:5000/app/nginx:latest", "registry.local:5000/app/redis:6"]
    );
    assert_eq!(
        harness.registry.started.lock().unwrap().as_slice(),
        &[dir.path().join("images")]
    );
    assert!(harness.registry.stopped.load(Ordering::SeqCst));

    let calls = harness.copier.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].src_ref, "docker://127.0.0.1:5000/nginx:latest");
    assert_eq!(calls[0].dest_ref, "docker://registry.local:5000/app/nginx:latest");
    assert_eq!(calls[0].dest_auth.username, "admin");
    assert!(calls[0].skip_src_tls_verify);
    assert!(!calls[0].copy_all);

    let snapshot = harness.output.last_snapshot();
    assert_eq!(snapshot["type"], "progressReport");
    for (name, total) in [("nginx:latest", 2), ("redis:6", 1)] {
        let image = image(&snapshot, name);
        assert_eq!(image["status"], "uploaded");
        assert_eq!(image["error"], "");
        assert_eq!(image["total"], total);
        assert_eq!(image["current"], total);
        assert!(duration_secs(image) > 0);
    }
    println!("✅ {} snapshots rendered", harness.output.snapshots().len());
}

#[tokio::test]
async fn test_every_snapshot_lists_every_image() {
    let dir = temp_registry_bundle_dir();
    let harness = Harness::new(
        FakeCopier::new().with_layers("/nginx:", &["aaa1", "aaa2"]),
        registry_with_layers(),
    );
    harness
        .pusher()
        .push_app_images_from_path(dir.path(), &options(true))
        .await
        .unwrap();

    let snapshots = harness.output.snapshots();
    assert!(!snapshots.is_empty());
    for snapshot in &snapshots {
        assert_eq!(snapshot["images"].as_array().unwrap().len(), 2);
    }
}

#[tokio::test]
async fn test_digest_images_are_copied_in_full() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path(),
        "airgap.yaml",
        airgap_yaml("docker-registry", &["quay.io/org/app@sha256:abc123"]),
    );
    let harness = Harness::new(FakeCopier::new(), FakeRegistry::new());

    let rewritten = harness
        .pusher()
        .push_app_images_from_path(dir.path(), &options(false))
        .await
        .unwrap();

    assert_eq!(rewritten[0].dest_image(), "registry.local:5000/app/app@sha256:abc123");
    assert!(harness.copier.calls()[0].copy_all);
}

#[tokio::test]
async fn test_retry_recovers_after_four_failures() {
    let dir = temp_registry_bundle_dir();
    std::fs::write(
        dir.path().join("airgap.yaml"),
        airgap_yaml("docker-registry", &["redis:6"]),
    )
    .unwrap();
    let harness = Harness::new(
        FakeCopier::failing(4).with_layers("/redis:", &["bbb1"]),
        registry_with_layers(),
    );

    harness
        .pusher()
        .push_app_images_from_path(dir.path(), &options(true))
        .await
        .unwrap();

    assert_eq!(harness.copier.calls().len(), 5);
    assert_eq!(
        *harness.sleeper.delays.lock().unwrap(),
        vec![Duration::from_secs(10); 4]
    );
    let redis = image(&harness.output.last_snapshot(), "redis:6").clone();
    assert_eq!(redis["status"], "uploaded");
    assert_eq!(redis["current"], 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let dir = temp_registry_bundle_dir();
    let harness = Harness::new(FakeCopier::failing(usize::MAX), registry_with_layers());

    let err = harness
        .pusher()
        .push_app_images_from_path(dir.path(), &options(true))
        .await
        .unwrap_err();

    assert!(matches!(err, AirgapError::Copy(_)));
    // The run stops at the first image
    assert_eq!(harness.copier.calls().len(), 5);
    assert_eq!(harness.sleeper.count(), 4);
    assert!(harness.registry.stopped.load(Ordering::SeqCst));

    let snapshot = harness.output.last_snapshot();
    let nginx = image(&snapshot, "nginx:latest");
    assert_eq!(nginx["status"], "failed");
    assert!(nginx["error"].as_str().unwrap().contains("connection reset"));
    assert!(!nginx["endTime"].is_null());
    assert_eq!(image(&snapshot, "redis:6")["status"], "queued");
}

#[tokio::test]
async fn test_short_identity_fails_before_any_copy() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "airgap.yaml", airgap_yaml("docker-archive", &[]));
    write_file(
        dir.path(),
        "images/docker-archive/redis/6",
        docker_archive(&[("bbb1", 4)]),
    );
    write_file(dir.path(), "images/nginx", b"x");
    let harness = Harness::new(FakeCopier::new(), FakeRegistry::new());

    let err = harness
        .pusher()
        .push_app_images_from_path(dir.path(), &options(false))
        .await
        .unwrap_err();

    assert!(matches!(err, AirgapError::MalformedBundle(_)));
    assert!(harness.copier.calls().is_empty());
}

#[tokio::test]
async fn test_docker_archive_bundle_is_pushed_from_the_stream() {
    let dir = TempDir::new().unwrap();
    let bundle = write_bundle(
        dir.path(),
        "app.airgap",
        &[
            Entry::file("airgap.yaml", airgap_yaml("docker-archive", &[])),
            Entry::file("app.tar.gz", b"manifests".to_vec()),
            Entry::dir("images"),
            Entry::dir("images/docker-archive"),
            Entry::file(
                "images/docker-archive/docker.io/library/nginx/latest",
                docker_archive(&[("aaa1", 16), ("aaa2", 32)]),
            ),
            Entry::file("images/docker-archive/redis/6", docker_archive(&[("bbb1", 8)])),
        ],
    );
    let harness = Harness::new(
        FakeCopier::new()
            .with_layers("/nginx:", &["aaa1", "aaa2"])
            .with_layers("/redis:", &["bbb1"]),
        FakeRegistry::new(),
    );

    let rewritten = harness
        .pusher()
        .push_app_images_from_bundle(&bundle, &options(true))
        .await
        .unwrap();

    assert_eq!(rewritten[0].name, "docker.io/library/nginx");
    assert_eq!(rewritten[0].dest_image(), "registry.local:5000/app/nginx:latest");
    assert_eq!(rewritten[1].dest_image(), "registry.local:5000/app/redis:6");

    let calls = harness.copier.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| !c.copy_all));
    // Each image was staged on disk while it was copied, and removed after
    assert_eq!(harness.copier.staged_sources(), vec![true, true]);
    for call in &calls {
        let path = call.src_ref.strip_prefix("docker-archive:").unwrap();
        assert!(!std::path::Path::new(path).exists());
    }

    let lines = harness.output.lines();
    assert_eq!(lines[0], "Reading image information from bundle...");
    let snapshot = harness.output.last_snapshot();
    for (name, total) in [("nginx:latest", 2), ("redis:6", 1)] {
        let image = image(&snapshot, name);
        assert_eq!(image["status"], "uploaded");
        assert_eq!(image["current"], total);
        assert_eq!(image["total"], total);
    }
    assert!(
        snapshot["compatibilityMessage"]
            .as_str()
            .unwrap()
            .contains("Writing manifest")
    );
}

#[tokio::test]
async fn test_truncated_bundle_fails_before_any_copy() {
    let dir = TempDir::new().unwrap();
    let bundle = truncated_bundle(dir.path(), 60);
    let harness = Harness::new(FakeCopier::new(), FakeRegistry::new());

    let err = harness
        .pusher()
        .push_app_images_from_bundle(&bundle, &options(true))
        .await
        .unwrap_err();

    assert!(matches!(err, AirgapError::Io(_)), "unexpected error: {:?}", err);
    assert!(harness.copier.calls().is_empty());
}

#[tokio::test]
async fn test_kotsadm_bundle_uses_tag_override() {
    let dir = TempDir::new().unwrap();
    let bundle = write_bundle(
        dir.path(),
        "kotsadm.tar.gz",
        &[
            Entry::dir("docker-archive"),
            Entry::dir("docker-archive/kotsadm"),
            Entry::file("docker-archive/kotsadm/v1.50.0", docker_archive(&[("k1", 4)])),
            Entry::dir("docker-archive/minio"),
            Entry::file("docker-archive/minio/RELEASE", docker_archive(&[("m1", 4)])),
        ],
    );
    let harness = Harness::new(FakeCopier::new(), FakeRegistry::new());
    let options = options(false).with_kotsadm_tag(Some("v2.0.0".to_string()));

    let rewritten = harness.pusher().push_images(&bundle, &options).await.unwrap();

    let dests: Vec<String> = harness
        .copier
        .calls()
        .iter()
        .map(|c| c.dest_ref.clone())
        .collect();
    assert_eq!(
        dests,
        vec![
            "docker://registry.local:5000/app/kotsadm:v2.0.0",
            "docker://registry.local:5000/app/minio:v2.0.0",
        ]
    );
    assert_eq!(rewritten.len(), 2);
    assert!(harness.copier.calls()[0].src_ref.starts_with("docker-archive:"));

    // Plain mode: extraction and copier lines pass through, markers do not
    let output = harness.output.contents();
    assert!(output.contains("Extracting "));
    assert!(output.contains("Pushing image docker://registry.local:5000/app/kotsadm:v2.0.0"));
    assert!(output.contains("Writing manifest to image destination"));
    assert!(!output.contains("+file."));
    assert!(!output.contains("+status.flush"));
    assert!(harness.output.snapshots().is_empty());
}

#[tokio::test]
async fn test_extracted_application_bundle_dispatches_on_format() {
    let dir = TempDir::new().unwrap();
    let bundle = write_bundle(
        dir.path(),
        "app.airgap",
        &[
            Entry::file("airgap.yaml", airgap_yaml("", &[])),
            Entry::dir("images"),
            Entry::file("images/docker-archive/redis/6", docker_archive(&[("bbb1", 8)])),
        ],
    );
    let harness = Harness::new(FakeCopier::new(), FakeRegistry::new());

    let rewritten = harness
        .pusher()
        .push_images(&bundle, &options(false))
        .await
        .unwrap();

    assert_eq!(rewritten.len(), 1);
    assert_eq!(rewritten[0].dest_image(), "registry.local:5000/app/redis:6");
    assert!(harness.registry.started.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_compressed_temp_registry_bundle_is_extracted_then_served() {
    let dir = TempDir::new().unwrap();
    let bundle = write_bundle(
        dir.path(),
        "registry.airgap",
        &[
            Entry::file("airgap.yaml", airgap_yaml("docker-registry", &["redis:6"])),
            Entry::dir("images"),
            Entry::file(
                "images/docker/registry/v2/repositories/redis/_manifests/tags/6/current/link",
                b"sha256:0000".to_vec(),
            ),
        ],
    );
    let harness = Harness::new(FakeCopier::new(), FakeRegistry::new());

    let rewritten = harness
        .pusher()
        .push_app_images_from_bundle(&bundle, &options(false))
        .await
        .unwrap();

    assert_eq!(rewritten[0].dest_image(), "registry.local:5000/app/redis:6");
    let started = harness.registry.started.lock().unwrap().clone();
    assert_eq!(started.len(), 1);
    assert!(started[0].ends_with("images"));
    assert!(harness.registry.stopped.load(Ordering::SeqCst));

    let calls = harness.copier.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].src_ref, "docker://127.0.0.1:5000/redis:6");
}

#[tokio::test]
async fn test_list_images_without_pushing() {
    let dir = TempDir::new().unwrap();
    let bundle = write_bundle(
        dir.path(),
        "registry.airgap",
        &[
            Entry::file(
                "airgap.yaml",
                airgap_yaml("docker-registry", &["docker.io/library/nginx:1.25", "redis:6"]),
            ),
            Entry::dir("images"),
        ],
    );
    let harness = Harness::new(FakeCopier::new(), FakeRegistry::new());

    let images = harness
        .pusher()
        .list_images_from_bundle(&bundle, &options(false))
        .await
        .unwrap();

    let dests: Vec<String> = images.iter().map(|i| i.dest_image()).collect();
    assert_eq!(
        dests,
        vec!["registry.local:5000/app/nginx:1.25", "registry.local:5000/app/redis:6"]
    );
    assert!(harness.copier.calls().is_empty());
}

#[tokio::test]
async fn test_unsupported_format_is_malformed() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "airgap.yaml", airgap_yaml("oci-layout", &[]));
    let harness = Harness::new(FakeCopier::new(), FakeRegistry::new());

    let err = harness
        .pusher()
        .push_app_images_from_path(dir.path(), &options(false))
        .await
        .unwrap_err();
    assert!(matches!(err, AirgapError::MalformedBundle(_)));
}
