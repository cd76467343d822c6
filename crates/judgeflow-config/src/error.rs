use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("registry address is not configured (set JUDGEFLOW_REGISTRY)")]
    MissingRegistry,

    #[error(
        "build engine endpoint is not configured (set JUDGEFLOW_BUILDKIT_HOST or BUILDKIT_HOST)"
    )]
    MissingEngineEndpoint,

    #[error("TLS client certificate and key must be configured together")]
    IncompleteTlsPair,

    #[error(
        "registry '{registry}' uses plaintext HTTP; set JUDGEFLOW_INSECURE_REGISTRY=true to allow it"
    )]
    InsecureRegistryNotAllowed { registry: String },

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
