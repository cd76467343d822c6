use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Malformed build context archive: {0}")]
    ArchiveFormat(String),

    #[error("Archive entry escapes the build context: {0}")]
    PathTraversal(String),

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Cannot connect to build engine: {0}")]
    Connect(String),

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Push failed: {message}")]
    PushFailed { message: String },

    #[error("Invalid tag: {tag}")]
    InvalidTag { tag: String },

    #[error("Registry authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("Build cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::Connect(msg) => {
                format!(
                    "Cannot reach the build engine: {}\n\
                     \n\
                     Check JUDGEFLOW_BUILDKIT_HOST and the TLS settings \
                     (JUDGEFLOW_TLS_CA / JUDGEFLOW_TLS_CERT / JUDGEFLOW_TLS_KEY).",
                    msg
                )
            }
            BuildError::PathTraversal(path) => {
                format!(
                    "The uploaded archive contains an unsafe path: {}\n\
                     \n\
                     Entries must be relative and stay inside the archive root.",
                    path
                )
            }
            _ => format!("{}", self),
        }
    }
}

/// ビルドが失敗した段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Configuration,
    ContextExtraction,
    Connect,
    Solve,
    Push,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Configuration => "configuration",
            BuildStage::ContextExtraction => "context-extraction",
            BuildStage::Connect => "connect",
            BuildStage::Solve => "solve",
            BuildStage::Push => "push",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
