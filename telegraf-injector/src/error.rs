//! Error types shared by the admission path and the class reloader.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The assembled Telegraf configuration does not parse as TOML.
    #[error("resulting Telegraf configuration is not a valid file: {0}")]
    InvalidConfiguration(#[from] toml::de::Error),

    /// The requested class has no data in the classes directory.
    #[error("unable to retrieve class data for {class}: {source}")]
    ClassNotFound {
        class: String,
        #[source]
        source: std::io::Error,
    },

    /// An existing secret failed the ownership check.
    #[error("unable to update existing secret {name} in namespace {namespace} as it is not managed by telegraf-operator")]
    NotManaged { name: String, namespace: String },

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("secret {name} has no namespace")]
    MissingNamespace { name: String },

    #[error("unable to parse quantity {0:?}")]
    InvalidQuantity(String),

    #[error("unable to get pod and class name for secret {name} in namespace {namespace}; podName={pod:?}; className={class:?}")]
    MissingSecretLabels {
        name: String,
        namespace: String,
        pod: String,
        class: String,
    },

    #[error("class data error: {0}")]
    ClassData(String),

    #[error("invalid settings: {0}")]
    Settings(String),
}

impl Error {
    /// Errors that only prevent a single sidecar from being injected. The pod is
    /// still admitted and the message is reported back as a warning.
    pub fn is_non_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_) | Error::ClassNotFound { .. }
        )
    }

    /// True when the Kubernetes API rejected a create because the object exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("test {}", reason),
        reason: reason.to_string(),
        code,
    }))
}
