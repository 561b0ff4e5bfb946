use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{tool} failed: {message}")]
    CommandError { tool: String, message: String },

    #[error("Policy persistence failed: {0}")]
    PersistenceError(#[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}
