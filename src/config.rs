//! Configuration for registry destinations, push runs and the collaborators
//! the pusher shells out to

use crate::error::{AirgapError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Attempts made per image before the run is aborted
pub const DEFAULT_RETRY_ATTEMPTS: usize = 5;

/// Fixed delay between two attempts of the same image
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Destination registry and the credentials passed through to the copier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryOptions {
    /// Registry host, optionally with port (e.g. `registry.local:5000`)
    pub endpoint: String,
    /// Path prefix placed between the endpoint and the image name
    pub namespace: String,
    pub username: String,
    pub password: String,
    pub skip_tls_verify: bool,
}

impl RegistryOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            skip_tls_verify: true,
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn has_auth(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(AirgapError::Config(
                "Registry endpoint cannot be empty".to_string(),
            ));
        }
        if endpoint.contains("://") {
            return Err(AirgapError::Config(format!(
                "Registry endpoint '{}' must not include a scheme",
                endpoint
            )));
        }
        if self.username.is_empty() != self.password.is_empty() {
            return Err(AirgapError::Config(
                "Username and password must be provided together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options of one push invocation
#[derive(Debug, Clone, Default)]
pub struct PushImagesOptions {
    pub registry: RegistryOptions,
    /// Replaces every tag of the kotsadm images layout when set
    pub kotsadm_tag: Option<String>,
    /// Render JSON progress snapshots instead of plain text lines
    pub log_for_ui: bool,
    pub skip_src_tls_verify: bool,
}

impl PushImagesOptions {
    pub fn new(registry: RegistryOptions) -> Self {
        Self {
            registry,
            ..Default::default()
        }
    }

    pub fn with_log_for_ui(mut self, log_for_ui: bool) -> Self {
        self.log_for_ui = log_for_ui;
        self
    }

    pub fn with_kotsadm_tag(mut self, tag: Option<String>) -> Self {
        self.kotsadm_tag = tag.filter(|t| !t.is_empty());
        self
    }
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// `skopeo` binary used as the image copier
    pub skopeo_path: PathBuf,
    /// `registry` binary serving temp-registry bundles
    pub registry_path: PathBuf,
    /// How long to wait for the temporary registry to answer
    pub registry_start_timeout: u64,
    /// Skip TLS verification when pulling from the source registry.
    /// Development only.
    pub insecure_src_registry: bool,
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            skopeo_path: PathBuf::from("skopeo"),
            registry_path: PathBuf::from("registry"),
            registry_start_timeout: 30,
            insecure_src_registry: false,
            verbose: false,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.skopeo_path.as_os_str().is_empty() {
            return Err(AirgapError::Config(
                "skopeo_path cannot be empty".to_string(),
            ));
        }
        if self.registry_path.as_os_str().is_empty() {
            return Err(AirgapError::Config(
                "registry_path cannot be empty".to_string(),
            ));
        }
        if self.registry_start_timeout == 0 {
            return Err(AirgapError::Config(
                "registry_start_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config from environment variables and defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("AIRGAP_PUSHER_SKOPEO_PATH") {
            config.skopeo_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("AIRGAP_PUSHER_REGISTRY_PATH") {
            config.registry_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("AIRGAP_PUSHER_REGISTRY_START_TIMEOUT")
            && let Ok(timeout) = val.parse()
        {
            config.registry_start_timeout = timeout;
        }
        if let Some(val) = lookup("AIRGAP_PUSHER_INSECURE_SRCREGISTRY") {
            config.insecure_src_registry = val == "true";
        }
        if let Some(val) = lookup("AIRGAP_PUSHER_VERBOSE") {
            config.verbose = val.to_lowercase() == "true" || val == "1";
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("AIRGAP_PUSHER_SKOPEO_PATH", "/usr/local/bin/skopeo"),
            ("AIRGAP_PUSHER_INSECURE_SRCREGISTRY", "true"),
            ("AIRGAP_PUSHER_REGISTRY_START_TIMEOUT", "not-a-number"),
            ("AIRGAP_PUSHER_VERBOSE", "1"),
        ]
        .into_iter()
        .collect();

        let config = AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.skopeo_path, PathBuf::from("/usr/local/bin/skopeo"));
        assert_eq!(config.registry_path, PathBuf::from("registry"));
        assert_eq!(config.registry_start_timeout, 30);
        assert!(config.insecure_src_registry);
        assert!(config.verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_start_timeout_is_applied() {
        let config = AppConfig::from_lookup(|key| {
            (key == "AIRGAP_PUSHER_REGISTRY_START_TIMEOUT").then(|| "5".to_string())
        });
        assert_eq!(config.registry_start_timeout, 5);
    }

    #[test]
    fn test_insecure_toggle_requires_exact_true() {
        let config = AppConfig::from_lookup(|key| {
            (key == "AIRGAP_PUSHER_INSECURE_SRCREGISTRY").then(|| "yes".to_string())
        });
        assert!(!config.insecure_src_registry);
    }

    #[test]
    fn test_registry_options_validation() {
        assert!(RegistryOptions::new("registry.local:5000").validate().is_ok());
        assert!(RegistryOptions::new("").validate().is_err());
        assert!(RegistryOptions::new("https://registry.local").validate().is_err());

        let half_auth = RegistryOptions {
            username: "admin".to_string(),
            ..RegistryOptions::new("registry.local")
        };
        assert!(half_auth.validate().is_err());

        let auth = RegistryOptions::new("registry.local").with_credentials("admin", "secret");
        assert!(auth.has_auth());
        assert!(auth.validate().is_ok());
    }

    #[test]
    fn test_empty_kotsadm_tag_is_ignored() {
        let options = PushImagesOptions::new(RegistryOptions::new("registry.local"))
            .with_kotsadm_tag(Some(String::new()));
        assert!(options.kotsadm_tag.is_none());
    }
}
