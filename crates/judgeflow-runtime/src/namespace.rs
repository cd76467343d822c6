//! 配置先 namespace の解決
//!
//! 優先順位:
//! 1. オーバーライド用の環境変数 (前後の空白を除去)
//! 2. サービスアカウントの namespace ファイル (読めて空でなければ)
//! 3. 固定のデフォルト値

use judgeflow_config::NamespaceConfig;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceResolver {
    override_var: String,
    service_account_file: PathBuf,
    default_namespace: String,
}

impl Default for NamespaceResolver {
    fn default() -> Self {
        Self::new(&NamespaceConfig::default())
    }
}

impl NamespaceResolver {
    pub fn new(config: &NamespaceConfig) -> Self {
        Self {
            override_var: config.override_var.clone(),
            service_account_file: config.service_account_file.clone(),
            default_namespace: config.default_namespace.clone(),
        }
    }

    /// 失敗しない。呼び出しごとに環境変数とファイルを読み直す
    pub fn resolve(&self) -> String {
        if let Ok(value) = std::env::var(&self.override_var) {
            let value = value.trim();
            if !value.is_empty() {
                tracing::debug!("Namespace from {}: {}", self.override_var, value);
                return value.to_string();
            }
        }

        match std::fs::read_to_string(&self.service_account_file) {
            Ok(content) if !content.trim().is_empty() => {
                let namespace = content.trim().to_string();
                tracing::debug!(
                    "Namespace from {}: {}",
                    self.service_account_file.display(),
                    namespace
                );
                return namespace;
            }
            Ok(_) => {}
            Err(e) => tracing::trace!(
                "Service account namespace file unavailable ({}): {}",
                self.service_account_file.display(),
                e
            ),
        }

        self.default_namespace.clone()
    }
}
