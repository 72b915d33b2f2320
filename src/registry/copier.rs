//! Image copy collaborator
//!
//! The byte-level transfer (manifests, layers, TLS, auth) is delegated to an
//! [`ImageCopier`]. [`SkopeoCopier`] runs `skopeo copy` and forwards its
//! progress lines into the progress pipe.

use crate::error::{AirgapError, Result};
use crate::image::CopySpec;
use crate::progress::ProgressSink;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

#[async_trait]
pub trait ImageCopier: Send + Sync {
    /// Copies one image, writing progress lines into `progress`
    async fn copy_image(&self, spec: &CopySpec, progress: &ProgressSink) -> Result<()>;
}

pub struct SkopeoCopier {
    binary: PathBuf,
}

impl SkopeoCopier {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments of `skopeo` for one copy. Credentials are only referenced
    /// through `auth_file`.
    pub fn args(spec: &CopySpec, auth_file: Option<&Path>) -> Vec<String> {
        let mut args = vec!["copy".to_string(), "--remove-signatures".to_string()];
        if spec.copy_all {
            args.push("--all".to_string());
        }
        if spec.skip_src_tls_verify {
            args.push("--src-tls-verify=false".to_string());
        }
        if spec.skip_dest_tls_verify {
            args.push("--dest-tls-verify=false".to_string());
        }
        if let Some(auth_file) = auth_file {
            args.push(format!("--dest-authfile={}", auth_file.display()));
        }
        args.push(spec.src_ref.clone());
        args.push(spec.dest_ref.clone());
        args
    }

    /// Writes the destination credentials to a private docker-style auth
    /// file. The file is removed when the handle drops.
    pub fn write_auth_file(spec: &CopySpec) -> Result<Option<NamedTempFile>> {
        if spec.dest_auth.is_empty() {
            return Ok(None);
        }
        let mut file = tempfile::Builder::new()
            .prefix("airgap-auth-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(file.as_file_mut(), &auth_file_contents(spec))?;
        Ok(Some(file))
    }
}

fn auth_file_contents(spec: &CopySpec) -> serde_json::Value {
    let token = STANDARD.encode(format!(
        "{}:{}",
        spec.dest_auth.username, spec.dest_auth.password
    ));
    let host = registry_host(&spec.dest_ref);
    json!({ "auths": { host: { "auth": token } } })
}

/// Registry host of a `docker://host/repo:tag` reference
fn registry_host(dest_ref: &str) -> &str {
    let image = dest_ref.strip_prefix("docker://").unwrap_or(dest_ref);
    image.split('/').next().unwrap_or(image)
}

impl Default for SkopeoCopier {
    fn default() -> Self {
        Self::new("skopeo")
    }
}

#[async_trait]
impl ImageCopier for SkopeoCopier {
    async fn copy_image(&self, spec: &CopySpec, progress: &ProgressSink) -> Result<()> {
        // Kept alive until the copier exits
        let auth_file = Self::write_auth_file(spec)?;
        let mut child = Command::new(&self.binary)
            .args(Self::args(spec, auth_file.as_ref().map(|f| f.path())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AirgapError::Copy(format!(
                    "failed to start {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AirgapError::Copy("copier stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AirgapError::Copy("copier stderr not captured".to_string()))?;

        // Drain stderr concurrently so a chatty copier cannot block on it
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AirgapError::Copy(format!("failed to read copier output: {}", e)))?
        {
            progress.send_line(line).await?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AirgapError::Copy(format!("failed to wait for copier: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            let message = stderr.trim();
            Err(AirgapError::Copy(if message.is_empty() {
                format!("copier exited with {}", status)
            } else {
                message.to_string()
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::RegistryAuth;

    fn spec() -> CopySpec {
        CopySpec {
            src_ref: "docker-archive:/tmp/nginx".to_string(),
            dest_ref: "docker://registry.local/app/nginx:latest".to_string(),
            dest_auth: RegistryAuth::default(),
            skip_src_tls_verify: false,
            skip_dest_tls_verify: true,
            copy_all: false,
        }
    }

    #[test]
    fn test_args_for_archive_copy() {
        assert_eq!(
            SkopeoCopier::args(&spec(), None),
            vec![
                "copy",
                "--remove-signatures",
                "--dest-tls-verify=false",
                "docker-archive:/tmp/nginx",
                "docker://registry.local/app/nginx:latest",
            ]
        );
    }

    fn auth_spec() -> CopySpec {
        CopySpec {
            dest_ref: "docker://registry.local:5000/app/nginx:latest".to_string(),
            dest_auth: RegistryAuth {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
            ..spec()
        }
    }

    #[test]
    fn test_args_for_multi_arch_copy_with_auth() {
        let spec = CopySpec {
            copy_all: true,
            skip_src_tls_verify: true,
            ..auth_spec()
        };
        let auth_file = SkopeoCopier::write_auth_file(&spec).unwrap().unwrap();
        let args = SkopeoCopier::args(&spec, Some(auth_file.path()));

        assert!(args.contains(&"--all".to_string()));
        assert!(args.contains(&"--src-tls-verify=false".to_string()));
        assert!(args.contains(&format!("--dest-authfile={}", auth_file.path().display())));
        assert!(args.iter().all(|arg| !arg.contains("secret")));
        assert_eq!(args.last().unwrap(), "docker://registry.local:5000/app/nginx:latest");
    }

    #[test]
    fn test_auth_file_holds_encoded_credentials() {
        let auth_file = SkopeoCopier::write_auth_file(&auth_spec()).unwrap().unwrap();
        let contents: serde_json::Value =
            serde_json::from_slice(&std::fs::read(auth_file.path()).unwrap()).unwrap();

        assert_eq!(
            contents["auths"]["registry.local:5000"]["auth"],
            STANDARD.encode("admin:secret")
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(auth_file.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }

        let path = auth_file.path().to_path_buf();
        drop(auth_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_no_auth_file_without_credentials() {
        assert!(SkopeoCopier::write_auth_file(&spec()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_copy_error() {
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let copier = SkopeoCopier::new("/nonexistent/skopeo");
        let err = copier
            .copy_image(&spec(), &ProgressSink::new(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, AirgapError::Copy(_)));
    }
}
