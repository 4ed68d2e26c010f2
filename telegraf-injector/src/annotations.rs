//! Pod annotations understood by the injector and their typed form.

use std::collections::BTreeMap;

/// The shared prefix for all annotations.
pub const TELEGRAF_ANNOTATION_COMMON: &str = "telegraf.influxdata.com/";
/// A single port telegraf should scrape, equivalent to `ports: "6060"`.
pub const TELEGRAF_METRICS_PORT: &str = "telegraf.influxdata.com/port";
/// Comma separated list of ports to scrape.
pub const TELEGRAF_METRICS_PORTS: &str = "telegraf.influxdata.com/ports";
/// Path to scrape, applies to all ports.
pub const TELEGRAF_METRICS_PATH: &str = "telegraf.influxdata.com/path";
/// Scheme to scrape with, applies to all ports.
pub const TELEGRAF_METRICS_SCHEME: &str = "telegraf.influxdata.com/scheme";
/// Scrape interval (Go style duration, e.g 5s, 30s, 2m).
pub const TELEGRAF_INTERVAL: &str = "telegraf.influxdata.com/interval";
/// Raw TOML appended to the configuration.
pub const TELEGRAF_RAW_INPUT: &str = "telegraf.influxdata.com/inputs";
/// Boolean toggle for the internal input plugin.
pub const TELEGRAF_ENABLE_INTERNAL: &str = "telegraf.influxdata.com/internal";
/// The class to use, classes are configured on the operator.
pub const TELEGRAF_CLASS: &str = "telegraf.influxdata.com/class";
/// Secret whose keys are exposed as environment variables to the sidecar.
pub const TELEGRAF_SECRET_ENV: &str = "telegraf.influxdata.com/secret-env";
/// Custom image for the sidecar container.
pub const TELEGRAF_IMAGE: &str = "telegraf.influxdata.com/image";
pub const TELEGRAF_REQUESTS_CPU: &str = "telegraf.influxdata.com/requests-cpu";
pub const TELEGRAF_REQUESTS_MEMORY: &str = "telegraf.influxdata.com/requests-memory";
pub const TELEGRAF_LIMITS_CPU: &str = "telegraf.influxdata.com/limits-cpu";
pub const TELEGRAF_LIMITS_MEMORY: &str = "telegraf.influxdata.com/limits-memory";

pub const TELEGRAF_ENV_LITERAL_PREFIX: &str = "telegraf.influxdata.com/env-literal-";
pub const TELEGRAF_ENV_FIELD_REF_PREFIX: &str = "telegraf.influxdata.com/env-fieldref-";
pub const TELEGRAF_ENV_CONFIG_MAP_KEY_REF_PREFIX: &str =
    "telegraf.influxdata.com/env-configmapkeyref-";
pub const TELEGRAF_ENV_SECRET_KEY_REF_PREFIX: &str = "telegraf.influxdata.com/env-secretkeyref-";
pub const TELEGRAF_GLOBAL_TAG_LITERAL_PREFIX: &str =
    "telegraf.influxdata.com/global-tag-literal-";

/// Set by istio on pods that received the istio proxy sidecar. Only its presence matters.
pub const ISTIO_SIDECAR_ANNOTATION: &str = "sidecar.istio.io/status";

/// Typed view of every annotation the injector reads from a pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodOptions {
    pub port: Option<String>,
    pub ports: Option<String>,
    pub path: Option<String>,
    pub scheme: Option<String>,
    pub interval: Option<String>,
    pub raw_input: Option<String>,
    pub internal: Option<String>,
    pub class: Option<String>,
    pub secret_env: Option<String>,
    pub image: Option<String>,
    pub requests_cpu: Option<String>,
    pub requests_memory: Option<String>,
    pub limits_cpu: Option<String>,
    pub limits_memory: Option<String>,
    pub env_literal: Vec<(String, String)>,
    pub env_field_ref: Vec<(String, String)>,
    pub env_config_map_key_ref: Vec<(String, String)>,
    pub env_secret_key_ref: Vec<(String, String)>,
    pub global_tags: Vec<(String, String)>,
    pub istio_sidecar: bool,
    /// Whether any annotation under the telegraf prefix is present.
    pub has_telegraf_annotations: bool,
}

impl PodOptions {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| annotations.get(key).cloned();

        Self {
            port: get(TELEGRAF_METRICS_PORT),
            ports: get(TELEGRAF_METRICS_PORTS),
            path: get(TELEGRAF_METRICS_PATH),
            scheme: get(TELEGRAF_METRICS_SCHEME),
            interval: get(TELEGRAF_INTERVAL),
            raw_input: get(TELEGRAF_RAW_INPUT),
            internal: get(TELEGRAF_ENABLE_INTERNAL),
            class: get(TELEGRAF_CLASS),
            secret_env: get(TELEGRAF_SECRET_ENV),
            image: get(TELEGRAF_IMAGE),
            requests_cpu: get(TELEGRAF_REQUESTS_CPU),
            requests_memory: get(TELEGRAF_REQUESTS_MEMORY),
            limits_cpu: get(TELEGRAF_LIMITS_CPU),
            limits_memory: get(TELEGRAF_LIMITS_MEMORY),
            env_literal: with_prefix(annotations, TELEGRAF_ENV_LITERAL_PREFIX),
            env_field_ref: with_prefix(annotations, TELEGRAF_ENV_FIELD_REF_PREFIX),
            env_config_map_key_ref: with_prefix(
                annotations,
                TELEGRAF_ENV_CONFIG_MAP_KEY_REF_PREFIX,
            ),
            env_secret_key_ref: with_prefix(annotations, TELEGRAF_ENV_SECRET_KEY_REF_PREFIX),
            global_tags: with_prefix(annotations, TELEGRAF_GLOBAL_TAG_LITERAL_PREFIX),
            istio_sidecar: annotations.contains_key(ISTIO_SIDECAR_ANNOTATION),
            has_telegraf_annotations: annotations
                .keys()
                .any(|key| key.starts_with(TELEGRAF_ANNOTATION_COMMON)),
        }
    }

    /// Gathers and merges unique ports from both the `port` and `ports` annotations,
    /// sorted so the rendered configuration is stable.
    pub fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .port
            .iter()
            .cloned()
            .chain(
                self.ports
                    .iter()
                    .flat_map(|ports| ports.split(',').map(str::to_string)),
            )
            .filter(|port| !port.is_empty())
            .collect();
        ports.sort();
        ports.dedup();
        ports
    }
}

/// Returns `(suffix, value)` pairs for every annotation starting with `prefix`, ordered by suffix.
/// An annotation equal to the bare prefix is ignored.
fn with_prefix(annotations: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    annotations
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .filter(|suffix| !suffix.is_empty())
                .map(|suffix| (suffix.to_string(), value.clone()))
        })
        .collect()
}
