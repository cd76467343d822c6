use judgeflow_build::{BuildError, BuildFailure, BuildStage};
use judgeflow_config::ConfigError;
use judgeflow_runtime::RuntimeError;
use thiserror::Error;

/// 呼び出し側に返すエラー分類
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Malformed build context archive: {0}")]
    ArchiveFormat(String),

    #[error("Archive entry escapes the build context: {0}")]
    PathTraversal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Workload '{name}' was created but the cluster assigned no identity")]
    IdentityMissing { name: String },

    #[error("Cannot delete workload '{target}': {reason}")]
    Delete { target: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// レスポンスに載せる安定した種別名
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::ArchiveFormat(_) => "archive_format",
            PipelineError::PathTraversal(_) => "path_traversal",
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Connect(_) => "connect",
            PipelineError::BuildFailed(_) => "build_failed",
            PipelineError::IdentityMissing { .. } => "identity_missing",
            PipelineError::Delete { .. } => "delete",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Configuration(err.to_string())
    }
}

impl From<BuildError> for PipelineError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::ArchiveFormat(msg) => PipelineError::ArchiveFormat(msg),
            BuildError::PathTraversal(path) => PipelineError::PathTraversal(path),
            BuildError::InvalidConfig(msg) => PipelineError::Configuration(msg),
            BuildError::Connect(msg) => PipelineError::Connect(msg),
            BuildError::DockerConnection(e) => PipelineError::Connect(e.to_string()),
            BuildError::Cancelled => PipelineError::Cancelled,
            BuildError::BuildFailed(msg) => PipelineError::BuildFailed(msg),
            other => PipelineError::BuildFailed(other.to_string()),
        }
    }
}

/// 失敗した段階を優先して分類する
impl From<BuildFailure> for PipelineError {
    fn from(failure: BuildFailure) -> Self {
        match (failure.stage, failure.error) {
            (_, BuildError::Cancelled) => PipelineError::Cancelled,
            (BuildStage::Configuration, e) => PipelineError::Configuration(e.to_string()),
            (BuildStage::Connect, e) => PipelineError::Connect(e.to_string()),
            (_, e) => e.into(),
        }
    }
}

impl From<RuntimeError> for PipelineError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::IdentityMissing { name } => PipelineError::IdentityMissing { name },
            RuntimeError::Delete { target, reason } => PipelineError::Delete { target, reason },
            RuntimeError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Connect(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_failure_stage_wins() {
        let err: PipelineError = BuildFailure {
            stage: BuildStage::Connect,
            error: BuildError::Io(std::io::Error::other("refused")),
        }
        .into();
        assert_eq!(err.kind(), "connect");

        let err: PipelineError = BuildFailure {
            stage: BuildStage::ContextExtraction,
            error: BuildError::PathTraversal("../etc/passwd".to_string()),
        }
        .into();
        assert_eq!(err.kind(), "path_traversal");

        let err: PipelineError = BuildFailure {
            stage: BuildStage::Solve,
            error: BuildError::Cancelled,
        }
        .into();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn test_runtime_errors() {
        let err: PipelineError = RuntimeError::IdentityMissing {
            name: "judgeflow-workload-1".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "identity_missing");

        let err: PipelineError = RuntimeError::not_found("abc").into();
        assert_eq!(err.kind(), "delete");

        let err: PipelineError = RuntimeError::Connect("no kubeconfig".to_string()).into();
        assert_eq!(err.kind(), "connect");
    }
}
