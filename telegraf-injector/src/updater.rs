//! Re-renders the configuration secrets of running pods after a class change.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, error, info};

use crate::annotations::PodOptions;
use crate::error::{Error, Result};
use crate::k8s::KubeApi;
use crate::secrets::{
    secret_conf, Variant, TELEGRAF_SECRET_DATA_KEY, TELEGRAF_SECRET_LABEL_CLASS_NAME,
    TELEGRAF_SECRET_LABEL_POD,
};
use crate::sidecar::SidecarHandler;
use crate::watcher::OnChange;

pub struct SecretsUpdater {
    kube: Arc<dyn KubeApi>,
    sidecar: Arc<SidecarHandler>,
}

impl SecretsUpdater {
    pub fn new(kube: Arc<dyn KubeApi>, sidecar: Arc<SidecarHandler>) -> Self {
        Self { kube, sidecar }
    }

    /// Walks every namespace and refreshes the secrets whose configuration changed.
    /// The first error aborts the pass.
    pub async fn update_all(&self) -> Result<()> {
        for namespace in self.kube.list_namespaces().await? {
            self.update_namespace(&namespace).await?;
        }
        Ok(())
    }

    async fn update_namespace(&self, namespace: &str) -> Result<()> {
        debug!(%namespace, "updating secrets");
        let secrets = self
            .kube
            .list_secrets(namespace, TELEGRAF_SECRET_LABEL_CLASS_NAME)
            .await?;

        for secret in secrets {
            self.update_secret(namespace, secret).await?;
        }
        Ok(())
    }

    async fn update_secret(&self, namespace: &str, mut secret: Secret) -> Result<()> {
        let name = secret.name_any();
        let labels = secret.labels();
        let pod_name = labels
            .get(TELEGRAF_SECRET_LABEL_POD)
            .cloned()
            .unwrap_or_default();
        let class_name = labels
            .get(TELEGRAF_SECRET_LABEL_CLASS_NAME)
            .cloned()
            .unwrap_or_default();

        if pod_name.is_empty() || class_name.is_empty() {
            return Err(Error::MissingSecretLabels {
                name,
                namespace: namespace.to_string(),
                pod: pod_name,
                class: class_name,
            });
        }

        let Some(variant) = Variant::from_secret_name(&name) else {
            debug!(%namespace, %name, "not a sidecar configuration secret, skipping");
            return Ok(());
        };

        let pod = self.kube.get_pod(namespace, &pod_name).await?;
        let options = PodOptions::from_annotations(pod.annotations());
        let telegraf_conf = self
            .sidecar
            .assemble_conf(&options, variant, &class_name)
            .inspect_err(|err| {
                error!(%namespace, %name, "unable to assemble configuration: {}", err)
            })?;

        if secret_conf(&secret) == Some(telegraf_conf.as_bytes()) {
            debug!(%namespace, %name, "secret is up to date");
            return Ok(());
        }

        info!(%namespace, %name, pod = %pod_name, "updating secret");
        secret
            .data
            .get_or_insert_with(Default::default)
            .insert(
                TELEGRAF_SECRET_DATA_KEY.to_string(),
                k8s_openapi::ByteString(telegraf_conf.into_bytes()),
            );
        self.kube.replace_secret(&secret).await
    }
}

#[async_trait]
impl OnChange for SecretsUpdater {
    async fn on_change(&self) {
        if let Err(err) = self.update_all().await {
            error!("unable to update secrets: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;

    use super::*;
    use crate::class_data::tests::StaticClasses;
    use crate::config::Config;
    use crate::k8s::MockKubeApi;
    use crate::secrets::new_secret;

    const OUTPUTS: &str = "[[outputs.file]]\n  files = [\"stdout\"]\n";

    fn sidecar() -> Arc<SidecarHandler> {
        Arc::new(SidecarHandler::new(
            Config::default(),
            Arc::new(StaticClasses::new(&[("default", OUTPUTS), ("istio", "")])),
        ))
    }

    fn pod() -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": "myname",
                "namespace": "mynamespace",
                "annotations": { "telegraf.influxdata.com/port": "6060" }
            },
            "spec": { "containers": [{ "name": "app" }] }
        }))
        .unwrap()
    }

    fn expected_conf() -> String {
        format!(
            "\n[[inputs.prometheus]]\n  urls = [\"http://127.0.0.1:6060/metrics\"]\n  \n\n{}",
            OUTPUTS
        )
    }

    fn kube_with_secrets(secrets: Vec<Secret>) -> MockKubeApi {
        let mut kube = MockKubeApi::new();
        kube.expect_list_namespaces()
            .returning(|| Ok(vec!["mynamespace".to_string()]));
        kube.expect_list_secrets()
            .withf(|namespace, selector| {
                namespace == "mynamespace" && selector == TELEGRAF_SECRET_LABEL_CLASS_NAME
            })
            .returning(move |_, _| Ok(secrets.clone()));
        kube.expect_get_pod()
            .withf(|namespace, name| namespace == "mynamespace" && name == "myname")
            .returning(|_, _| Ok(pod()));
        kube
    }

    #[tokio::test]
    async fn test_up_to_date_secret_is_untouched() {
        let secret = new_secret(
            Variant::Telegraf,
            "myname",
            "mynamespace",
            "default",
            expected_conf(),
        );
        let mut kube = kube_with_secrets(vec![secret]);
        kube.expect_replace_secret().never();

        let updater = SecretsUpdater::new(Arc::new(kube), sidecar());
        updater.update_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_changed_secret_is_updated() {
        let secret = new_secret(
            Variant::Telegraf,
            "myname",
            "mynamespace",
            "default",
            "outdated".to_string(),
        );
        let mut kube = kube_with_secrets(vec![secret]);
        kube.expect_replace_secret()
            .withf(|secret| {
                secret.name_any() == "telegraf-config-myname"
                    && secret_conf(secret) == Some(expected_conf().as_bytes())
            })
            .times(1)
            .returning(|_| Ok(()));

        let updater = SecretsUpdater::new(Arc::new(kube), sidecar());
        updater.update_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_istio_secret_uses_istio_template() {
        let secret = new_secret(
            Variant::Istio,
            "myname",
            "mynamespace",
            "istio",
            "outdated".to_string(),
        );
        let mut kube = kube_with_secrets(vec![secret]);
        kube.expect_replace_secret()
            .withf(|secret| {
                let conf = String::from_utf8_lossy(secret_conf(secret).unwrap()).to_string();
                conf.contains("15090/stats/prometheus") && !conf.contains(":6060")
            })
            .times(1)
            .returning(|_| Ok(()));

        let updater = SecretsUpdater::new(Arc::new(kube), sidecar());
        updater.update_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_labels_abort_the_pass() {
        let mut secret = new_secret(
            Variant::Telegraf,
            "myname",
            "mynamespace",
            "default",
            "outdated".to_string(),
        );
        secret
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(TELEGRAF_SECRET_LABEL_POD);
        let other = new_secret(
            Variant::Telegraf,
            "myname",
            "mynamespace",
            "default",
            "outdated".to_string(),
        );

        let mut kube = kube_with_secrets(vec![secret, other]);
        kube.expect_replace_secret().never();

        let updater = SecretsUpdater::new(Arc::new(kube), sidecar());
        let err = updater.update_all().await.unwrap_err();
        assert!(matches!(err, Error::MissingSecretLabels { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_missing_pod_aborts_the_pass() {
        let stale = new_secret(
            Variant::Telegraf,
            "gone",
            "mynamespace",
            "default",
            "outdated".to_string(),
        );
        let outdated = new_secret(
            Variant::Telegraf,
            "myname",
            "mynamespace",
            "default",
            "outdated".to_string(),
        );

        let mut kube = MockKubeApi::new();
        kube.expect_list_namespaces()
            .returning(|| Ok(vec!["mynamespace".to_string()]));
        kube.expect_list_secrets()
            .returning(move |_, _| Ok(vec![stale.clone(), outdated.clone()]));
        kube.expect_get_pod()
            .withf(|namespace, name| namespace == "mynamespace" && name == "gone")
            .times(1)
            .returning(|_, _| Err(crate::error::api_error(404, "NotFound")));
        kube.expect_get_pod()
            .withf(|_, name| name == "myname")
            .never();
        kube.expect_replace_secret().never();

        let updater = SecretsUpdater::new(Arc::new(kube), sidecar());
        let err = updater.update_all().await.unwrap_err();
        assert!(matches!(err, Error::Kube(_)), "{:?}", err);
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_namespace_error_aborts_the_pass() {
        let mut kube = MockKubeApi::new();
        kube.expect_list_namespaces()
            .returning(|| Ok(vec!["first".to_string(), "second".to_string()]));
        kube.expect_list_secrets()
            .withf(|namespace, _| namespace == "first")
            .times(1)
            .returning(|_, _| Err(crate::error::api_error(403, "Forbidden")));
        kube.expect_list_secrets()
            .withf(|namespace, _| namespace == "second")
            .never();

        let updater = SecretsUpdater::new(Arc::new(kube), sidecar());
        assert!(updater.update_all().await.is_err());
    }
}
