//! Assembles the Telegraf configuration stored in the sidecar secret.
//!
//! The output is built from, in order: a prometheus input for the scrape
//! ports, the internal input, the raw `inputs` annotation, the class data and
//! finally the global tags. The result must parse as TOML.

use crate::annotations::PodOptions;
use crate::error::Result;

const DEFAULT_METRICS_PATH: &str = "/metrics";
const DEFAULT_METRICS_SCHEME: &str = "http";
const GLOBAL_TAGS_SECTION: &str = "[global_tags]";

/// The endpoint the istio proxy exposes its own metrics on.
pub const ISTIO_METRICS_URL: &str = "http://127.0.0.1:15090/stats/prometheus";

/// Builds the configuration for the regular telegraf sidecar.
pub fn assemble_conf(
    options: &PodOptions,
    class_data: &str,
    enable_default_internal_plugin: bool,
) -> Result<String> {
    let mut conf = String::new();

    if let Some(section) = prometheus_section(options) {
        append(&mut conf, &section);
    }

    if internal_enabled(options, enable_default_internal_plugin) {
        append(&mut conf, "[[inputs.internal]]\n");
    }

    if let Some(raw) = &options.raw_input {
        append(&mut conf, raw);
    }

    append(&mut conf, class_data);

    let conf = with_global_tags(conf, &options.global_tags);
    validate(&conf)?;

    Ok(conf)
}

/// Builds the configuration for the istio sidecar, which scrapes the istio proxy and
/// sends the metrics to the istio output class.
pub fn assemble_istio_conf(options: &PodOptions, class_data: &str) -> Result<String> {
    let mut conf = String::new();
    append(
        &mut conf,
        &format!("[[inputs.prometheus]]\n  urls = [\"{}\"]\n\n", ISTIO_METRICS_URL),
    );
    append(&mut conf, class_data);

    let conf = with_global_tags(conf, &options.global_tags);
    validate(&conf)?;

    Ok(conf)
}

fn append(conf: &mut String, section: &str) {
    conf.push('\n');
    conf.push_str(section);
}

fn prometheus_section(options: &PodOptions) -> Option<String> {
    let ports = options.ports();
    if ports.is_empty() {
        return None;
    }

    let path = options.path.as_deref().unwrap_or(DEFAULT_METRICS_PATH);
    let scheme = options.scheme.as_deref().unwrap_or(DEFAULT_METRICS_SCHEME);
    let interval = options
        .interval
        .as_ref()
        .map(|interval| format!("interval = \"{}\"", interval))
        .unwrap_or_default();

    let urls = ports
        .iter()
        .map(|port| format!("{}://127.0.0.1:{}{}", scheme, port, path))
        .collect::<Vec<_>>()
        .join("\", \"");

    Some(format!(
        "[[inputs.prometheus]]\n  urls = [\"{}\"]\n  {}\n",
        urls, interval
    ))
}

/// An annotation value that is not a boolean leaves the default in place.
fn internal_enabled(options: &PodOptions, default: bool) -> bool {
    options
        .internal
        .as_deref()
        .and_then(parse_bool)
        .unwrap_or(default)
}

/// Accepts the same spellings as Go's `strconv.ParseBool`.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Merges the global tag annotations into the configuration. Tags are inserted at
/// the top of an existing `[global_tags]` table, or appended as a new one.
fn with_global_tags(conf: String, tags: &[(String, String)]) -> String {
    if tags.is_empty() {
        return conf;
    }

    let lines = tags
        .iter()
        .map(|(key, value)| {
            format!(
                "  {} = {}",
                key,
                toml::Value::String(value.clone())
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    if conf.contains(GLOBAL_TAGS_SECTION) {
        conf.replacen(
            GLOBAL_TAGS_SECTION,
            &format!("{}\n{}", GLOBAL_TAGS_SECTION, lines),
            1,
        )
    } else {
        format!("{}\n{}\n{}", conf, GLOBAL_TAGS_SECTION, lines)
    }
}

fn validate(conf: &str) -> Result<()> {
    toml::from_str::<toml::Table>(conf)?;
    Ok(())
}
