//! Temporary registry serving a temp-registry bundle's image dataset
//!
//! Temp-registry bundles carry the storage directory of a docker registry.
//! To push from it, a local registry is started on a free loopback port and
//! every image is copied from there to the destination.

use super::store::RegistryStore;
use crate::error::{AirgapError, Result};
use crate::image::{ImageReference, LayerDescriptor};
use crate::image::reference::dest_image_name;
use crate::config::RegistryOptions;
use async_trait::async_trait;
use serde::Serialize;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use url::Url;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Starts a registry over an on-disk dataset
#[async_trait]
pub trait TempRegistry: Send + Sync {
    async fn start(&self, data_dir: &Path) -> Result<Box<dyn RunningRegistry>>;
}

/// A started registry; stopped explicitly once the push is over
#[async_trait]
pub trait RunningRegistry: Send + Sync {
    /// Transport-qualified source reference of a saved image
    fn src_ref(&self, image: &str) -> Result<String>;

    fn image_layers(&self, image: &str) -> Result<Vec<LayerDescriptor>>;

    async fn stop(self: Box<Self>) -> Result<()>;
}

#[derive(Serialize)]
struct RegistryConfig {
    version: String,
    storage: StorageConfig,
    http: HttpConfig,
}

#[derive(Serialize)]
struct StorageConfig {
    filesystem: FilesystemConfig,
}

#[derive(Serialize)]
struct FilesystemConfig {
    rootdirectory: PathBuf,
}

#[derive(Serialize)]
struct HttpConfig {
    addr: String,
}

/// Runs the `registry` binary (`registry serve <config>`)
pub struct RegistryProcess {
    binary: PathBuf,
    start_timeout: Duration,
}

impl RegistryProcess {
    pub fn new(binary: impl Into<PathBuf>, start_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            start_timeout,
        }
    }

    fn free_port() -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| AirgapError::Registry(format!("failed to find a free port: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| AirgapError::Registry(format!("failed to find a free port: {}", e)))?
            .port();
        Ok(port)
    }

    fn write_config(data_dir: &Path, addr: &str) -> Result<NamedTempFile> {
        let config = RegistryConfig {
            version: "0.1".to_string(),
            storage: StorageConfig {
                filesystem: FilesystemConfig {
                    rootdirectory: data_dir.to_path_buf(),
                },
            },
            http: HttpConfig {
                addr: addr.to_string(),
            },
        };
        let yaml = serde_yaml::to_string(&config)?;
        let file = tempfile::Builder::new()
            .prefix("registry-config")
            .suffix(".yml")
            .tempfile()?;
        std::fs::write(file.path(), yaml)?;
        Ok(file)
    }

    async fn wait_ready(&self, child: &mut Child, addr: &str) -> Result<()> {
        let url = Url::parse(&format!("http://{}/v2/", addr))?;
        let client = reqwest::Client::builder()
            .timeout(READY_POLL_INTERVAL * 4)
            .build()?;
        let deadline = Instant::now() + self.start_timeout;

        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| AirgapError::Registry(format!("failed to poll registry: {}", e)))?
            {
                return Err(AirgapError::Registry(format!(
                    "registry exited before becoming ready: {}",
                    status
                )));
            }

            // Any HTTP answer, 401 included, means the server is up
            if client.get(url.clone()).send().await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(AirgapError::Registry(format!(
                    "registry did not answer on {} within {}s",
                    url,
                    self.start_timeout.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl TempRegistry for RegistryProcess {
    async fn start(&self, data_dir: &Path) -> Result<Box<dyn RunningRegistry>> {
        let port = Self::free_port()?;
        let addr = format!("127.0.0.1:{}", port);
        let config = Self::write_config(data_dir, &addr)?;

        let mut child = Command::new(&self.binary)
            .arg("serve")
            .arg(config.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AirgapError::Registry(format!(
                    "failed to start {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        self.wait_ready(&mut child, &addr).await?;

        Ok(Box::new(RegistryHandle {
            child,
            endpoint: addr,
            store: RegistryStore::new(data_dir),
            _config: config,
        }))
    }
}

struct RegistryHandle {
    child: Child,
    endpoint: String,
    store: RegistryStore,
    _config: NamedTempFile,
}

/// `docker://<endpoint>/<repo>:<tag>` for an image stored in `store`
pub fn local_src_ref(endpoint: &str, store: &RegistryStore, image: &str) -> Result<String> {
    let reference = ImageReference::parse(image)?;
    let repository = store.repository_for(&reference)?;
    let name = dest_image_name(&RegistryOptions::new(endpoint), &repository);
    Ok(match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("docker://{}@{}", name, digest),
        (None, Some(tag)) => format!("docker://{}:{}", name, tag),
        (None, None) => format!("docker://{}:latest", name),
    })
}

#[async_trait]
impl RunningRegistry for RegistryHandle {
    fn src_ref(&self, image: &str) -> Result<String> {
        local_src_ref(&self.endpoint, &self.store, image)
    }

    fn image_layers(&self, image: &str) -> Result<Vec<LayerDescriptor>> {
        self.store.image_layers(image)
    }

    async fn stop(self: Box<Self>) -> Result<()> {
        let mut handle = self;
        handle
            .child
            .kill()
            .await
            .map_err(|e| AirgapError::Registry(format!("failed to stop registry: {}", e)))
    }
}
