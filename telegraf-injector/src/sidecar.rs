//! Decides which sidecars a pod gets and builds them.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, Container, EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    Pod, ResourceRequirements, SecretEnvSource, SecretKeySelector, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::annotations::PodOptions;
use crate::assemble::{assemble_conf, assemble_istio_conf};
use crate::class_data::ClassDataSource;
use crate::config::Config;
use crate::error::Result;
use crate::quantity::resolve_with_fallback;
use crate::secrets::{new_secret, Variant};

const TELEGRAF_CONFIG_DIRECTORY: &str = "/etc/telegraf";

/// What `add_sidecars` produced besides the containers appended to the pod.
#[derive(Debug, Default)]
pub struct SidecarResult {
    /// Secrets to create or update, one per added sidecar.
    pub secrets: Vec<Secret>,
    /// Reasons a sidecar was not added, reported back as admission warnings.
    pub messages: Vec<String>,
}

pub struct SidecarHandler {
    pub config: Config,
    classes: Arc<dyn ClassDataSource>,
}

impl SidecarHandler {
    pub fn new(config: Config, classes: Arc<dyn ClassDataSource>) -> Self {
        Self { config, classes }
    }

    /// Whether the given sidecar should be added to the pod. Pods that already have
    /// the container are left alone, so re-admitting a pod is a no-op.
    pub fn should_add(&self, pod: &Pod, options: &PodOptions, variant: Variant) -> bool {
        if has_container(pod, variant.container_name()) {
            return false;
        }

        match variant {
            Variant::Telegraf => options.has_telegraf_annotations,
            Variant::Istio => self.config.enable_istio_injection && options.istio_sidecar,
        }
    }

    /// True if the pod gets no sidecar at all.
    pub fn skip(&self, pod: &Pod) -> bool {
        let options = PodOptions::from_annotations(pod.annotations());
        !Variant::ALL
            .into_iter()
            .any(|variant| self.should_add(pod, &options, variant))
    }

    /// The class a sidecar's configuration is rendered from.
    pub fn class_name(&self, options: &PodOptions, variant: Variant) -> String {
        match variant {
            Variant::Telegraf => options
                .class
                .clone()
                .unwrap_or_else(|| self.config.default_class.clone()),
            Variant::Istio => self.config.istio_output_class.clone(),
        }
    }

    /// Renders the configuration of one sidecar.
    pub fn assemble_conf(
        &self,
        options: &PodOptions,
        variant: Variant,
        class_name: &str,
    ) -> Result<String> {
        let class_data = self.classes.get_data(class_name)?;
        match variant {
            Variant::Telegraf => assemble_conf(
                options,
                &class_data,
                self.config.enable_default_internal_plugin,
            ),
            Variant::Istio => assemble_istio_conf(options, &class_data),
        }
    }

    /// Appends every applicable sidecar and its volume to the pod. A sidecar whose
    /// configuration cannot be built is skipped and reported in the result messages.
    pub fn add_sidecars(&self, pod: &mut Pod, name: &str, namespace: &str) -> Result<SidecarResult> {
        let options = PodOptions::from_annotations(pod.annotations());
        let mut result = SidecarResult::default();

        for variant in Variant::ALL {
            if !self.should_add(pod, &options, variant) {
                continue;
            }

            let class_name = self.class_name(&options, variant);
            let telegraf_conf = match self.assemble_conf(&options, variant, &class_name) {
                Ok(conf) => conf,
                Err(err) if err.is_non_fatal() => {
                    info!(
                        "unable to add {} sidecar container: {} ; not adding sidecar container, but allowing creation",
                        variant.container_name(),
                        err
                    );
                    result.messages.push(format!(
                        "telegraf-injector could not create sidecar container {}: {}",
                        variant.container_name(),
                        err
                    ));
                    continue;
                }
                Err(err) => return Err(err),
            };

            let container = self.new_container(&options, variant)?;
            let spec = pod.spec.get_or_insert_with(Default::default);
            spec.containers.push(container);
            spec.volumes
                .get_or_insert_with(Vec::new)
                .push(new_volume(variant, name));

            debug!("adding {} sidecar to pod {}", variant.container_name(), name);
            result.secrets.push(new_secret(
                variant,
                name,
                namespace,
                &class_name,
                telegraf_conf,
            ));
        }

        Ok(result)
    }

    fn new_container(&self, options: &PodOptions, variant: Variant) -> Result<Container> {
        let image = match variant {
            Variant::Telegraf => options
                .image
                .clone()
                .unwrap_or_else(|| self.config.telegraf_image.clone()),
            Variant::Istio => self.config.istio_image().to_string(),
        };

        let requests_cpu = resolve_resource(
            "requests-cpu",
            options.requests_cpu.as_deref(),
            &self.config.requests_cpu,
        )?;
        let requests_memory = resolve_resource(
            "requests-memory",
            options.requests_memory.as_deref(),
            &self.config.requests_memory,
        )?;
        let limits_cpu = resolve_resource(
            "limits-cpu",
            options.limits_cpu.as_deref(),
            &self.config.limits_cpu,
        )?;
        let limits_memory = resolve_resource(
            "limits-memory",
            options.limits_memory.as_deref(),
            &self.config.limits_memory,
        )?;

        let env_from = options.secret_env.as_ref().map(|secret| {
            vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: secret.clone(),
                    optional: Some(true),
                }),
                ..EnvFromSource::default()
            }]
        });

        Ok(Container {
            name: variant.container_name().to_string(),
            image: Some(image),
            command: Some(vec![
                "telegraf".to_string(),
                "--config".to_string(),
                format!("{}/telegraf.conf", TELEGRAF_CONFIG_DIRECTORY),
            ]),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), limits_cpu),
                    ("memory".to_string(), limits_memory),
                ])),
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), requests_cpu),
                    ("memory".to_string(), requests_memory),
                ])),
                ..ResourceRequirements::default()
            }),
            env: Some(env_vars(options)),
            env_from,
            volume_mounts: Some(vec![VolumeMount {
                name: variant.config_name().to_string(),
                mount_path: TELEGRAF_CONFIG_DIRECTORY.to_string(),
                ..VolumeMount::default()
            }]),
            ..Container::default()
        })
    }
}

/// The override for one resource, or the operator default when it is absent or invalid.
fn resolve_resource(resource: &str, custom: Option<&str>, default: &str) -> Result<Quantity> {
    let resolved = resolve_with_fallback(custom, default)?;
    if resolved.used_fallback && custom.is_some() {
        debug!("ignoring {} override {:?}, using {}", resource, custom, default);
    }
    Ok(resolved.value)
}

fn has_container(pod: &Pod, name: &str) -> bool {
    pod.spec
        .as_ref()
        .is_some_and(|spec| spec.containers.iter().any(|c| c.name == name))
}

fn new_volume(variant: Variant, pod_name: &str) -> Volume {
    Volume {
        name: variant.config_name().to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(variant.secret_name(pod_name)),
            ..SecretVolumeSource::default()
        }),
        ..Volume::default()
    }
}

fn value_from(name: &str, source: EnvVarSource) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(source),
        ..EnvVar::default()
    }
}

/// Splits `<object>.<key>` at the first dot. Both parts must be non-empty.
fn split_key_ref(value: &str) -> Option<(String, String)> {
    let (name, key) = value.split_once('.')?;
    if name.is_empty() || key.is_empty() {
        return None;
    }
    Some((name.to_string(), key.to_string()))
}

/// NODENAME followed by the variables requested through the env annotations.
fn env_vars(options: &PodOptions) -> Vec<EnvVar> {
    let mut env = vec![value_from(
        "NODENAME",
        EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "spec.nodeName".to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        },
    )];

    for (name, value) in &options.env_literal {
        env.push(EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        });
    }

    for (name, field_path) in &options.env_field_ref {
        env.push(value_from(
            name,
            EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: field_path.clone(),
                    ..ObjectFieldSelector::default()
                }),
                ..EnvVarSource::default()
            },
        ));
    }

    for (name, value) in &options.env_config_map_key_ref {
        let Some((config_map, key)) = split_key_ref(value) else {
            info!("unable to parse configmapkeyref {:?} for {}, skipping", value, name);
            continue;
        };
        env.push(value_from(
            name,
            EnvVarSource {
                config_map_key_ref: Some(ConfigMapKeySelector {
                    name: config_map,
                    key,
                    ..ConfigMapKeySelector::default()
                }),
                ..EnvVarSource::default()
            },
        ));
    }

    for (name, value) in &options.env_secret_key_ref {
        let Some((secret, key)) = split_key_ref(value) else {
            info!("unable to parse secretkeyref {:?} for {}, skipping", value, name);
            continue;
        };
        env.push(value_from(
            name,
            EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret,
                    key,
                    ..SecretKeySelector::default()
                }),
                ..EnvVarSource::default()
            },
        ));
    }

    env
}
