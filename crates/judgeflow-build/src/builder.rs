//! イメージビルダーの抽象化
//!
//! ビルドコンテキストを受け取り、レジストリにプッシュ済みのイメージ参照と
//! ビルドログを返す。BuildKit と Docker の2つの実装がある。

use crate::context::BuildContext;
use crate::error::{BuildError, BuildStage, Result};
use crate::progress::{BuildProgress, LogEvent};
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// "image builder" 能力
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// ビルダー名 (例: "buildkit", "docker")
    fn name(&self) -> &str;

    /// `<registry>/<image_name>` としてビルド・プッシュする
    ///
    /// 失敗時も `BuildOutput` を返し、それまでのトランスクリプトを保持する。
    async fn build(
        &self,
        image_name: &str,
        context: BuildContext,
        cancel: &CancellationToken,
    ) -> BuildOutput;
}

#[derive(Debug)]
pub struct BuildFailure {
    pub stage: BuildStage,
    pub error: BuildError,
}

/// ビルド結果
#[derive(Debug, Default)]
pub struct BuildOutput {
    /// 失敗時は空文字列
    pub image_reference: String,
    pub log_transcript: String,
    pub digest: Option<String>,
    pub failure: Option<BuildFailure>,
}

impl BuildOutput {
    pub fn succeeded(
        image_reference: impl Into<String>,
        log_transcript: String,
        digest: Option<String>,
    ) -> Self {
        Self {
            image_reference: image_reference.into(),
            log_transcript,
            digest,
            failure: None,
        }
    }

    /// 失敗結果を作る
    ///
    /// エンジンのログが1行も無い段階 (設定・展開・接続) で失敗した場合は、
    /// エラー自体を `[<stage>][stream:2]` の行としてトランスクリプトに残す。
    pub fn failed_at(stage: BuildStage, error: BuildError, log_transcript: String) -> Self {
        tracing::warn!("Build failed during {}: {}", stage, error);
        let log_transcript = if log_transcript.is_empty() {
            failure_transcript(stage, &error)
        } else {
            log_transcript
        };
        Self {
            image_reference: String::new(),
            log_transcript,
            digest: None,
            failure: Some(BuildFailure { stage, error }),
        }
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

fn failure_transcript(stage: BuildStage, error: &BuildError) -> String {
    let mut progress = BuildProgress::new();
    for line in error.user_message().lines() {
        progress.observe(LogEvent::chunk(stage.to_string(), 2, line));
    }
    progress.transcript()
}

/// レジストリとイメージ名から完全なイメージ参照を組み立てる
pub fn image_reference(registry: &str, image_name: &str) -> String {
    format!("{}/{}", registry.trim_end_matches('/'), image_name)
}

/// キャンセルされたら `BuildError::Cancelled` を返す
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BuildError::Cancelled),
        result = fut => result,
    }
}
