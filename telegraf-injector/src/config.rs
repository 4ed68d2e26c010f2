//! This module defines the operator configuration file.

use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::quantity::parse_quantity;

pub const DEFAULT_TELEGRAF_IMAGE: &str = "docker.io/library/telegraf:1.19";
pub const DEFAULT_REQUESTS_CPU: &str = "10m";
pub const DEFAULT_REQUESTS_MEMORY: &str = "10Mi";
pub const DEFAULT_LIMITS_CPU: &str = "200m";
pub const DEFAULT_LIMITS_MEMORY: &str = "200Mi";

/// Operator wide defaults applied to every injected sidecar.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Image used for sidecars unless the pod overrides it.
    pub telegraf_image: String,
    /// Class used when the pod does not select one.
    pub default_class: String,
    /// Directory holding one file per class.
    pub classes_directory: PathBuf,
    /// Add the internal input plugin to every sidecar.
    pub enable_default_internal_plugin: bool,
    /// Add a second sidecar scraping the istio proxy on pods istio injected.
    pub enable_istio_injection: bool,
    /// Image for the istio sidecar. Defaults to `telegraf_image`.
    pub istio_telegraf_image: Option<String>,
    /// Class holding the outputs for the istio sidecar.
    pub istio_output_class: String,
    pub requests_cpu: String,
    pub requests_memory: String,
    pub limits_cpu: String,
    pub limits_memory: String,
    /// Only treat secrets carrying the managed-by annotation as ours.
    pub require_annotations_for_secret: bool,
    /// Quiet period after a class change before secrets are refreshed.
    pub watch_delay_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegraf_image: DEFAULT_TELEGRAF_IMAGE.to_string(),
            default_class: "default".to_string(),
            classes_directory: PathBuf::from("/config/classes"),
            enable_default_internal_plugin: false,
            enable_istio_injection: false,
            istio_telegraf_image: None,
            istio_output_class: "istio".to_string(),
            requests_cpu: DEFAULT_REQUESTS_CPU.to_string(),
            requests_memory: DEFAULT_REQUESTS_MEMORY.to_string(),
            limits_cpu: DEFAULT_LIMITS_CPU.to_string(),
            limits_memory: DEFAULT_LIMITS_MEMORY.to_string(),
            require_annotations_for_secret: true,
            watch_delay_seconds: 10,
        }
    }
}

impl Config {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_file(file_path: &Path) -> anyhow::Result<Self> {
        let config_content = fs::read_to_string(file_path)?;
        Self::from_str(&config_content)
    }

    /// The default requests and limits must be valid, as they are the fallback for
    /// every malformed override.
    pub fn validate_requests_and_limits(&self) -> Result<(), Error> {
        for (name, value) in [
            ("requestsCpu", &self.requests_cpu),
            ("requestsMemory", &self.requests_memory),
            ("limitsCpu", &self.limits_cpu),
            ("limitsMemory", &self.limits_memory),
        ] {
            parse_quantity(value).map_err(|err| Error::Settings(format!("{}: {}", name, err)))?;
        }
        Ok(())
    }

    pub fn istio_image(&self) -> &str {
        self.istio_telegraf_image
            .as_deref()
            .unwrap_or(&self.telegraf_image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_load() {
        let config = Config::from_str(
            r#"
            telegrafImage: docker.io/library/telegraf:1.11
            defaultClass: app
            classesDirectory: /etc/classes
            enableIstioInjection: true
            istioOutputClass: mesh
            limitsMemory: 400Mi
            requireAnnotationsForSecret: false
        "#,
        )
        .unwrap();

        assert_eq!(config.telegraf_image, "docker.io/library/telegraf:1.11");
        assert_eq!(config.default_class, "app");
        assert_eq!(config.classes_directory, PathBuf::from("/etc/classes"));
        assert!(config.enable_istio_injection);
        assert_eq!(config.istio_output_class, "mesh");
        assert_eq!(config.istio_image(), "docker.io/library/telegraf:1.11");
        assert_eq!(config.limits_memory, "400Mi");
        assert!(!config.require_annotations_for_secret);

        // Omitted fields keep their defaults.
        assert_eq!(config.requests_cpu, DEFAULT_REQUESTS_CPU);
        assert_eq!(config.watch_delay_seconds, 10);
        assert!(!config.enable_default_internal_plugin);
    }

    #[test]
    fn test_config_empty_document() {
        let config = Config::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_requests_and_limits() {
        assert!(Config::default().validate_requests_and_limits().is_ok());

        let config = Config {
            requests_cpu: "10x".to_string(),
            ..Config::default()
        };
        let err = config.validate_requests_and_limits().unwrap_err();
        assert!(err.to_string().contains("requestsCpu"));
    }

    #[test]
    fn test_istio_image_override() {
        let config = Config {
            istio_telegraf_image: Some("telegraf:istio".to_string()),
            ..Config::default()
        };
        assert_eq!(config.istio_image(), "telegraf:istio");
    }
}
