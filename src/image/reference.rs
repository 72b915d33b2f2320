//! Image reference parsing and rewriting to the destination registry
//!
//! Images keep their final repository segment and their tag or digest; the
//! registry host and any intermediate namespaces are replaced by the
//! configured endpoint and namespace.

use crate::config::RegistryOptions;
use crate::error::{AirgapError, Result};
use serde::{Deserialize, Serialize};

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host when the reference names one (e.g. "quay.io", "localhost:5000")
    pub registry: Option<String>,
    /// Repository path (e.g. "library/nginx", "org/app")
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → repository `nginx`, tag `latest`
    /// - `quay.io/org/app:1.2` → registry `quay.io`
    /// - `localhost:5000/app@sha256:abc...` → digest reference
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(AirgapError::MalformedBundle(
                "empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(AirgapError::MalformedBundle(format!(
                        "invalid digest in image reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon can only appear after the last slash; earlier colons are ports
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        let (registry, repository) = split_registry(name);
        if repository.is_empty() {
            return Err(AirgapError::MalformedBundle(format!(
                "empty repository in image reference '{}'",
                reference
            )));
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Reference without tag or digest, as written in the source
    pub fn name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// Final repository segment, e.g. `nginx` for `library/nginx`
    pub fn image_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

fn split_registry(name: &str) -> (Option<String>, String) {
    if let Some((first, rest)) = name.split_once('/')
        && (first.contains('.') || first.contains(':') || first == "localhost")
    {
        return (Some(first.to_string()), rest.to_string());
    }
    (None, name.to_string())
}

/// An image rewritten to the destination registry, shaped like a kustomize
/// image override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewrittenImage {
    pub name: String,
    pub new_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl RewrittenImage {
    /// Full destination reference; digests win over tags
    pub fn dest_image(&self) -> String {
        match (&self.digest, &self.new_tag) {
            (Some(digest), _) => format!("{}@{}", self.new_name, digest),
            (None, Some(tag)) => format!("{}:{}", self.new_name, tag),
            (None, None) => format!("{}:{}", self.new_name, DEFAULT_TAG),
        }
    }

    /// Multi-architecture images are only supported when addressed by digest
    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }
}

/// `<endpoint>/<namespace>/<image_name>`, skipping an empty namespace
pub fn dest_image_name(registry: &RegistryOptions, image_name: &str) -> String {
    let endpoint = registry.endpoint.trim_end_matches('/');
    let namespace = registry.namespace.trim_matches('/');
    if namespace.is_empty() {
        format!("{}/{}", endpoint, image_name)
    } else {
        format!("{}/{}/{}", endpoint, namespace, image_name)
    }
}

/// Rewrites an image saved by name, as listed in a temp-registry bundle
pub fn rewrite_registry_image(registry: &RegistryOptions, image: &str) -> Result<RewrittenImage> {
    let reference = ImageReference::parse(image)?;
    let name = reference.name();
    let new_name = dest_image_name(registry, reference.image_name());
    let (new_tag, digest) = match reference.digest {
        Some(digest) => (None, Some(digest)),
        None => (reference.tag, None),
    };
    Ok(RewrittenImage {
        name,
        new_name,
        new_tag,
        digest,
    })
}

/// Rewrites an archived image from its `<name segments...>/<tag>` path parts
pub fn rewrite_archive_image(registry: &RegistryOptions, parts: &[String]) -> Result<RewrittenImage> {
    let Some((tag, name_parts)) = parts.split_last() else {
        return Err(AirgapError::MalformedBundle(
            "empty image path".to_string(),
        ));
    };
    if name_parts.is_empty() {
        return Err(AirgapError::MalformedBundle(format!(
            "not enough path parts to rewrite image '{}'",
            parts.join("/")
        )));
    }

    let name = name_parts.join("/");
    let image_name = &name_parts[name_parts.len() - 1];
    let (new_tag, digest) = if tag.starts_with("sha256:") {
        (None, Some(tag.clone()))
    } else {
        (Some(tag.clone()), None)
    };

    Ok(RewrittenImage {
        name,
        new_name: dest_image_name(registry, image_name),
        new_tag,
        digest,
    })
}
