//! The subset of the Kubernetes API the injector talks to.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Trait abstracting the Kubernetes client so the secret handling can be tested
/// without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Overwrite an existing secret.
    async fn replace_secret(&self, secret: &Secret) -> Result<()>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Names of all namespaces in the cluster.
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;
}

#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(secret: &Secret) -> Result<String> {
    secret
        .namespace()
        .ok_or_else(|| Error::MissingNamespace {
            name: secret.name_any(),
        })
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        self.secrets(&namespace_of(secret)?)
            .create(&PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        Ok(self.secrets(namespace).get(name).await?)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        self.secrets(&namespace_of(secret)?)
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces.list(&ListParams::default().timeout(10)).await?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>> {
        let list_params = ListParams::default().labels(label_selector).timeout(10);
        Ok(self.secrets(namespace).list(&list_params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get(name).await?)
    }
}
