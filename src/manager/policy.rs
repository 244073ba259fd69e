//! Image admission policy
//!
//! Images are validated before any runtime call: an optional explicit
//! allow-list, otherwise a registry allow-list (Docker Hub only by
//! default). Digest pins pass through untouched.

use crate::config::PolicyConfiguration;
use crate::error::DaemonError;

const DEFAULT_REGISTRY: &str = "docker.io";

pub struct ImagePolicy {
    allowed_registries: Vec<String>,
    allowed_images: Vec<String>,
}

impl ImagePolicy {
    pub fn from_config(config: &PolicyConfiguration) -> Self {
        Self {
            allowed_registries: config.allowed_registries.clone(),
            allowed_images: config.allowed_images.clone(),
        }
    }

    /// Validate an image reference, returning it unchanged on success.
    pub fn validate(&self, image: &str) -> Result<String, DaemonError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(DaemonError::InvalidRequest("image must not be empty".into()));
        }

        if !self.allowed_images.is_empty() {
            if self.allowed_images.iter().any(|allowed| allowed == image) {
                return Ok(image.to_string());
            }
            return Err(DaemonError::ImagePolicy(format!(
                "image '{}' is not on the allow-list",
                image
            )));
        }

        let registry = registry_of(image);
        let allowed = if self.allowed_registries.is_empty() {
            registry == DEFAULT_REGISTRY
        } else {
            self.allowed_registries.iter().any(|r| r == registry)
        };

        if allowed {
            Ok(image.to_string())
        } else {
            Err(DaemonError::ImagePolicy(format!(
                "registry '{}' is not allowed",
                registry
            )))
        }
    }
}

/// Registry host of an image reference, following docker reference
/// rules: the part before the first `/` is a registry only when it looks
/// like a hostname.
fn registry_of(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => DEFAULT_REGISTRY,
    }
}
