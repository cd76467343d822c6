//! JudgeFlow の設定
//!
//! パイプライン構築時に一度だけ読み込み・検証される明示的な設定構造体。
//! 読み込み順: デフォルト値 → `JUDGEFLOW_CONFIG_PATH` の YAML ファイル → 環境変数

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_PATH_ENV: &str = "JUDGEFLOW_CONFIG_PATH";
pub const REGISTRY_ENV: &str = "JUDGEFLOW_REGISTRY";
pub const BUILDKIT_HOST_ENV: &str = "JUDGEFLOW_BUILDKIT_HOST";
pub const BUILDKIT_HOST_FALLBACK_ENV: &str = "BUILDKIT_HOST";
pub const BUILDCTL_ENV: &str = "JUDGEFLOW_BUILDCTL";
pub const TLS_CERT_ENV: &str = "JUDGEFLOW_TLS_CERT";
pub const TLS_KEY_ENV: &str = "JUDGEFLOW_TLS_KEY";
pub const TLS_CA_ENV: &str = "JUDGEFLOW_TLS_CA";
pub const TLS_SERVER_NAME_ENV: &str = "JUDGEFLOW_TLS_SERVER_NAME";
pub const INSECURE_REGISTRY_ENV: &str = "JUDGEFLOW_INSECURE_REGISTRY";
pub const BUILDER_ENV: &str = "JUDGEFLOW_BUILDER";
pub const RUNTIME_ENV: &str = "JUDGEFLOW_RUNTIME";
pub const NAMESPACE_ENV: &str = "JUDGEFLOW_NAMESPACE";
pub const NAMESPACE_FILE_ENV: &str = "JUDGEFLOW_NAMESPACE_FILE";
pub const DEFAULT_NAMESPACE_ENV: &str = "JUDGEFLOW_DEFAULT_NAMESPACE";

pub const DEFAULT_SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
pub const DEFAULT_NAMESPACE: &str = "default";

/// イメージビルドに使うエンジン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderBackend {
    /// リモートの buildkitd (buildctl 経由)
    #[default]
    Buildkit,
    /// Docker デーモン
    Docker,
}

impl FromStr for BuilderBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buildkit" => Ok(Self::Buildkit),
            "docker" => Ok(Self::Docker),
            other => Err(ConfigError::InvalidValue {
                key: BUILDER_ENV.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BuilderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buildkit => write!(f, "buildkit"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// ワークロードを起動する先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    #[default]
    Kubernetes,
    Docker,
}

impl FromStr for RuntimeBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "docker" => Ok(Self::Docker),
            other => Err(ConfigError::InvalidValue {
                key: RUNTIME_ENV.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RuntimeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// ビルドエンジンとの mTLS 設定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    /// サーバー証明書の検証に使うホスト名
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 例: `tcp://buildkitd:1234`
    pub endpoint: Option<String>,
    /// buildctl バイナリのパス
    pub buildctl: PathBuf,
    pub tls: TlsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            buildctl: PathBuf::from("buildctl"),
            tls: TlsConfig::default(),
        }
    }
}

/// Namespace 解決の設定
///
/// オーバーライド用の環境変数は解決のたびに読まれるため、
/// ここには変数名だけを保持する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub override_var: String,
    pub service_account_file: PathBuf,
    pub default_namespace: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            override_var: NAMESPACE_ENV.to_string(),
            service_account_file: PathBuf::from(DEFAULT_SERVICE_ACCOUNT_NAMESPACE_FILE),
            default_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// プッシュ先レジストリ (例: `registry.internal:5000`)
    pub registry: Option<String>,
    pub allow_insecure_registry: bool,
    pub builder: BuilderBackend,
    pub runtime: RuntimeBackend,
    pub engine: EngineConfig,
    pub namespace: NamespaceConfig,
}

impl PipelineConfig {
    /// 設定を読み込む
    ///
    /// 1. `JUDGEFLOW_CONFIG_PATH` が指定されていれば YAML ファイルを読む
    /// 2. 環境変数で上書き
    pub fn load() -> Result<Self> {
        let base = match env_var(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        base.with_env_overrides()
    }

    /// 環境変数のみから設定を作成
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(registry) = env_var(REGISTRY_ENV) {
            self.registry = Some(registry);
        }
        if let Some(endpoint) =
            env_var(BUILDKIT_HOST_ENV).or_else(|| env_var(BUILDKIT_HOST_FALLBACK_ENV))
        {
            self.engine.endpoint = Some(endpoint);
        }
        if let Some(buildctl) = env_var(BUILDCTL_ENV) {
            self.engine.buildctl = PathBuf::from(buildctl);
        }
        if let Some(cert) = env_var(TLS_CERT_ENV) {
            self.engine.tls.cert = Some(PathBuf::from(cert));
        }
        if let Some(key) = env_var(TLS_KEY_ENV) {
            self.engine.tls.key = Some(PathBuf::from(key));
        }
        if let Some(ca) = env_var(TLS_CA_ENV) {
            self.engine.tls.ca = Some(PathBuf::from(ca));
        }
        if let Some(server_name) = env_var(TLS_SERVER_NAME_ENV) {
            self.engine.tls.server_name = Some(server_name);
        }
        if let Some(flag) = env_var(INSECURE_REGISTRY_ENV) {
            self.allow_insecure_registry = parse_bool(INSECURE_REGISTRY_ENV, &flag)?;
        }
        if let Some(builder) = env_var(BUILDER_ENV) {
            self.builder = builder.parse()?;
        }
        if let Some(runtime) = env_var(RUNTIME_ENV) {
            self.runtime = runtime.parse()?;
        }
        if let Some(file) = env_var(NAMESPACE_FILE_ENV) {
            self.namespace.service_account_file = PathBuf::from(file);
        }
        if let Some(namespace) = env_var(DEFAULT_NAMESPACE_ENV) {
            self.namespace.default_namespace = namespace;
        }
        Ok(self)
    }

    /// ビルドに必要な設定が揃っているか検証
    pub fn validate(&self) -> Result<()> {
        let registry = self
            .registry
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or(ConfigError::MissingRegistry)?;

        if registry.starts_with("http://") && !self.allow_insecure_registry {
            return Err(ConfigError::InsecureRegistryNotAllowed {
                registry: registry.to_string(),
            });
        }

        if self.builder == BuilderBackend::Buildkit && self.endpoint().is_none() {
            return Err(ConfigError::MissingEngineEndpoint);
        }

        let tls = &self.engine.tls;
        if tls.cert.is_some() != tls.key.is_some() {
            return Err(ConfigError::IncompleteTlsPair);
        }

        Ok(())
    }

    /// スキームと末尾の `/` を取り除いたレジストリアドレス
    pub fn registry_host(&self) -> Option<&str> {
        let registry = self.registry.as_deref()?.trim();
        let host = registry
            .strip_prefix("http://")
            .or_else(|| registry.strip_prefix("https://"))
            .unwrap_or(registry)
            .trim_end_matches('/');
        (!host.is_empty()).then_some(host)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.engine
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
