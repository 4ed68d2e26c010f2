//! Secrets holding the sidecar configuration: naming, ownership and the
//! create-or-update protocol.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{error, info};

use crate::annotations::TELEGRAF_CLASS;
use crate::error::{Error, Result};
use crate::k8s::KubeApi;

/// The data key holding the configuration.
pub const TELEGRAF_SECRET_DATA_KEY: &str = "telegraf.conf";
/// Label recording the class the configuration was rendered from.
pub const TELEGRAF_SECRET_LABEL_CLASS_NAME: &str = TELEGRAF_CLASS;
/// Label recording the pod the secret belongs to.
pub const TELEGRAF_SECRET_LABEL_POD: &str = "telegraf.influxdata.com/pod";
pub const TELEGRAF_SECRET_ANNOTATION_KEY: &str = "app.kubernetes.io/managed-by";
pub const TELEGRAF_SECRET_ANNOTATION_VALUE: &str = "telegraf-operator";

const SECRET_TYPE_OPAQUE: &str = "Opaque";

/// The kinds of sidecar the injector adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Scrapes the pod itself, driven by the pod annotations.
    Telegraf,
    /// Scrapes the istio proxy running next to the pod.
    Istio,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::Telegraf, Variant::Istio];

    pub fn container_name(self) -> &'static str {
        match self {
            Variant::Telegraf => "telegraf",
            Variant::Istio => "telegraf-istio",
        }
    }

    /// Also used as the volume name and as the prefix of the secret name.
    pub fn config_name(self) -> &'static str {
        match self {
            Variant::Telegraf => "telegraf-config",
            Variant::Istio => "telegraf-istio-config",
        }
    }

    pub fn secret_name(self, pod_name: &str) -> String {
        format!("{}-{}", self.config_name(), pod_name)
    }

    /// Recovers the variant a secret was created for from its name.
    pub fn from_secret_name(secret_name: &str) -> Option<Variant> {
        Self::ALL.into_iter().find(|variant| {
            secret_name
                .strip_prefix(variant.config_name())
                .is_some_and(|rest| rest.starts_with('-') && rest.len() > 1)
        })
    }
}

/// Builds the secret for one sidecar of a pod.
pub fn new_secret(
    variant: Variant,
    pod_name: &str,
    namespace: &str,
    class_name: &str,
    telegraf_conf: String,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(variant.secret_name(pod_name)),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                TELEGRAF_SECRET_ANNOTATION_KEY.to_string(),
                TELEGRAF_SECRET_ANNOTATION_VALUE.to_string(),
            )])),
            labels: Some(BTreeMap::from([
                (
                    TELEGRAF_SECRET_LABEL_CLASS_NAME.to_string(),
                    class_name.to_string(),
                ),
                (TELEGRAF_SECRET_LABEL_POD.to_string(), pod_name.to_string()),
            ])),
            ..ObjectMeta::default()
        },
        type_: Some(SECRET_TYPE_OPAQUE.to_string()),
        data: Some(BTreeMap::from([(
            TELEGRAF_SECRET_DATA_KEY.to_string(),
            ByteString(telegraf_conf.into_bytes()),
        )])),
        ..Secret::default()
    }
}

/// Returns the stored configuration of a secret, if it has one.
pub fn secret_conf(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(TELEGRAF_SECRET_DATA_KEY))
        .map(|value| value.0.as_slice())
}

/// A secret is ours only if it is opaque, holds exactly the configuration key and,
/// when required, carries the managed-by annotation.
pub fn is_secret_managed(secret: &Secret, require_annotations: bool) -> bool {
    // The API server defaults a missing type to Opaque.
    if secret.type_.as_deref().unwrap_or(SECRET_TYPE_OPAQUE) != SECRET_TYPE_OPAQUE {
        info!("assuming secret already exists and is not telegraf-matched as its type is not Opaque");
        return false;
    }

    let data_len = secret.data.as_ref().map_or(0, BTreeMap::len);
    if data_len != 1 || secret_conf(secret).map_or(true, <[u8]>::is_empty) {
        info!("assuming secret already exists and is not telegraf-matched as its data has non-standard keys");
        return false;
    }

    if require_annotations
        && secret.annotations().get(TELEGRAF_SECRET_ANNOTATION_KEY).map(String::as_str)
            != Some(TELEGRAF_SECRET_ANNOTATION_VALUE)
    {
        info!("assuming secret already exists and is not telegraf-matched as it is missing the annotation");
        return false;
    }

    true
}

/// Creates and updates configuration secrets without ever taking over secrets
/// that were not created by the injector.
#[derive(Clone)]
pub struct SecretManager {
    kube: Arc<dyn KubeApi>,
    require_annotations: bool,
}

impl SecretManager {
    pub fn new(kube: Arc<dyn KubeApi>, require_annotations: bool) -> Self {
        Self {
            kube,
            require_annotations,
        }
    }

    pub async fn create_or_update_secrets(&self, secrets: &[Secret]) -> Result<()> {
        for secret in secrets {
            self.create_or_update(secret).await?;
        }
        Ok(())
    }

    /// Creates the secret, or overwrites it if it already exists and is managed by us.
    pub async fn create_or_update(&self, secret: &Secret) -> Result<()> {
        let name = secret.name_any();
        let namespace = secret.namespace().unwrap_or_default();

        match self.kube.create_secret(secret).await {
            Ok(()) => {
                info!(%namespace, %name, "created secret");
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                let existing = self
                    .kube
                    .get_secret(&namespace, &name)
                    .await
                    .inspect_err(|err| {
                        error!(%namespace, %name, "unable to get secret: {}", err)
                    })?;

                if !is_secret_managed(&existing, self.require_annotations) {
                    return Err(Error::NotManaged { name, namespace });
                }

                let mut updated = secret.clone();
                updated.metadata.resource_version = existing.metadata.resource_version;
                self.kube
                    .replace_secret(&updated)
                    .await
                    .inspect_err(|err| {
                        error!(%namespace, %name, "unable to update secret: {}", err)
                    })?;
                info!(%namespace, %name, "updated secret");
                Ok(())
            }
            Err(err) => {
                error!(%namespace, %name, "unable to create secret: {}", err);
                Err(err)
            }
        }
    }

    /// Deletes the secrets of every variant for a pod. Missing secrets are fine;
    /// returns false if any deletion failed.
    pub async fn delete_pod_secrets(&self, namespace: &str, pod_name: &str) -> bool {
        let mut all_deleted = true;
        for variant in Variant::ALL {
            let name = variant.secret_name(pod_name);
            info!(%namespace, %name, "deleting secret");
            match self.kube.delete_secret(namespace, &name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    error!(%namespace, %name, "unable to delete secret: {}", err);
                    all_deleted = false;
                }
            }
        }
        all_deleted
    }
}
