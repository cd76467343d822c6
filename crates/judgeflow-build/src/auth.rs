//! レジストリ認証処理
//!
//! Docker config.json (または credential helper) からプッシュ先レジストリの
//! 認証情報を取得する。Docker ビルダーのプッシュ段階でのみ使う。

use crate::error::{BuildError, Result};
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Docker Hub の config.json 上のキー
const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    /// 全レジストリ共通の credential helper
    #[serde(default)]
    creds_store: Option<String>,
    /// レジストリごとの credential helper
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64 の "username:password"
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

#[derive(Debug, Clone)]
pub struct RegistryAuth {
    config_path: PathBuf,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    /// `$DOCKER_CONFIG/config.json`、未設定なら `~/.docker/config.json`
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self { config_path }
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// イメージ参照のレジストリに対する認証情報
    ///
    /// config.json が無い、または該当エントリが無ければ `Ok(None)` (匿名プッシュ)。
    pub async fn credentials_for(&self, image: &str) -> Result<Option<DockerCredentials>> {
        let registry = registry_of(image);

        let content = match tokio::fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Docker config.json not found at {:?}", self.config_path);
                return Ok(None);
            }
            Err(e) => {
                return Err(BuildError::AuthFailed {
                    registry,
                    message: format!("Failed to read {}: {}", self.config_path.display(), e),
                });
            }
        };

        let config: DockerConfig =
            serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
                registry: registry.clone(),
                message: format!("Failed to parse {}: {}", self.config_path.display(), e),
            })?;

        if let Some(auth_b64) = lookup_auth(&config, &registry)
            && let Some(creds) = decode_auth(auth_b64, &registry)?
        {
            tracing::debug!("Found credentials in auths for {}", registry);
            return Ok(Some(creds));
        }

        let helper = config
            .cred_helpers
            .get(&registry)
            .or(config.creds_store.as_ref());
        if let Some(helper) = helper {
            tracing::debug!("Trying credential helper: {}", helper);
            match from_helper(helper, &registry).await {
                Ok(Some(creds)) => return Ok(Some(creds)),
                Ok(None) => {}
                Err(e) => tracing::debug!("Credential helper failed: {}", e),
            }
        }

        tracing::debug!("No credentials found for {}", registry);
        Ok(None)
    }
}

/// イメージ参照からレジストリホストを取り出す
///
/// - `ghcr.io/org/app:tag` -> `ghcr.io`
/// - `localhost:5000/app` -> `localhost:5000`
/// - `myuser/app` -> `docker.io`
pub fn registry_of(image: &str) -> String {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first.to_string()
        }
        _ => "docker.io".to_string(),
    }
}

fn lookup_auth<'a>(config: &'a DockerConfig, registry: &str) -> Option<&'a str> {
    let entry = if registry == "docker.io" {
        config
            .auths
            .get(DOCKER_HUB_AUTH_KEY)
            .or_else(|| config.auths.get(registry))
    } else {
        config.auths.get(registry).or_else(|| {
            // "https://registry.example.com/" 形式のキー
            config.auths.iter().find_map(|(key, entry)| {
                let host = key
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/');
                (host == registry).then_some(entry)
            })
        })
    };

    entry.and_then(|e| e.auth.as_deref())
}

fn decode_auth(auth_b64: &str, registry: &str) -> Result<Option<DockerCredentials>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64.trim())
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to decode auth: {}", e),
        })?;

    let auth_str = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
        registry: registry.to_string(),
        message: format!("Invalid UTF-8 in auth: {}", e),
    })?;

    Ok(auth_str
        .split_once(':')
        .map(|(username, password)| DockerCredentials {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }))
}

async fn from_helper(helper: &str, registry: &str) -> Result<Option<DockerCredentials>> {
    let helper_cmd = format!("docker-credential-{}", helper);

    let mut child = Command::new(&helper_cmd)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to run {}: {}", helper_cmd, e),
        })?;

    // レジストリ名は stdin で渡す
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(registry.as_bytes()).await.ok();
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Credential helper failed: {}", e),
        })?;

    if !output.status.success() {
        tracing::debug!(
            "Credential helper has no entry for {}: {}",
            registry,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Ok(None);
    }

    let response: CredentialResponse =
        serde_json::from_slice(&output.stdout).map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to parse credential helper response: {}", e),
        })?;

    Ok(Some(DockerCredentials {
        username: Some(response.username),
        password: Some(response.secret),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, RegistryAuth) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, content).unwrap();
        (dir, RegistryAuth::with_config_path(path))
    }

    #[test]
    fn test_registry_of() {
        assert_eq!(registry_of("ghcr.io/org/app:v1.0"), "ghcr.io");
        assert_eq!(registry_of("localhost:5000/judgeflow-image-1"), "localhost:5000");
        assert_eq!(registry_of("localhost/app"), "localhost");
        assert_eq!(registry_of("myuser/app"), "docker.io");
        assert_eq!(registry_of("nginx"), "docker.io");
    }

    #[tokio::test]
    async fn test_credentials_from_auths() {
        // "user:secret"
        let (_dir, auth) = write_config(
            r#"{"auths":{"https://registry.local:5000/":{"auth":"dXNlcjpzZWNyZXQ="}}}"#,
        );

        let creds = auth
            .credentials_for("registry.local:5000/judgeflow-image-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(creds.username.as_deref(), Some("user"));
        assert_eq!(creds.password.as_deref(), Some("secret"));
        assert_eq!(creds.serveraddress.as_deref(), Some("registry.local:5000"));
    }

    #[tokio::test]
    async fn test_missing_config_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let auth = RegistryAuth::with_config_path(dir.path().join("config.json"));
        assert!(auth.credentials_for("ghcr.io/org/app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broken_config_is_error() {
        let (_dir, auth) = write_config("{not json");
        let result = auth.credentials_for("ghcr.io/org/app").await;
        assert!(matches!(result, Err(BuildError::AuthFailed { .. })));
    }

    #[tokio::test]
    async fn test_unknown_registry_without_helper() {
        let (_dir, auth) = write_config(r#"{"auths":{"ghcr.io":{"auth":"dXNlcjpzZWNyZXQ="}}}"#);
        assert!(
            auth.credentials_for("registry.local:5000/app")
                .await
                .unwrap()
                .is_none()
        );
    }
}
