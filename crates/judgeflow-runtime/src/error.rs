use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Cannot connect to the cluster API: {0}")]
    Connect(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Workload '{name}' was created but the cluster assigned no identity")]
    IdentityMissing { name: String },

    #[error("Cannot delete workload '{target}': {reason}")]
    Delete { target: String, reason: String },

    #[error("Workload operation cancelled")]
    Cancelled,
}

impl RuntimeError {
    pub fn not_found(target: &str) -> Self {
        RuntimeError::Delete {
            target: target.to_string(),
            reason: "no such workload".to_string(),
        }
    }

    /// API サーバー / デーモンに届いた上で拒否されたエラーか
    pub fn is_api_rejection(&self) -> bool {
        matches!(
            self,
            RuntimeError::Kube(kube::Error::Api(_))
                | RuntimeError::Docker(bollard::errors::Error::DockerResponseServerError { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
