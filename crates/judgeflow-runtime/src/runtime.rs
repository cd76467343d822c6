use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// ビルド元 Dockerfile を保持するアノテーション (Docker ではラベル) のキー
pub const DOCKERFILE_ANNOTATION: &str = "judgeflow.dev/dockerfile";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "judgeflow";

/// 起動するワークロードの内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub image_reference: String,
    /// 実行はせず、来歴として残す
    pub dockerfile: String,
}

/// 起動済みのワークロード
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    /// クラスタが割り当てた識別子 (Pod UID / コンテナ ID)
    pub identity: String,
    pub namespace: String,
    pub image_reference: String,
    pub source_dockerfile: String,
}

/// "workload runtime" 能力
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// ランタイム名 (例: "kubernetes", "docker")
    fn name(&self) -> &str;

    /// 再起動しない単一コンテナのワークロードを作成する
    async fn launch(&self, spec: &WorkloadSpec, cancel: &CancellationToken) -> Result<Workload>;

    /// 識別子または名前でワークロードを削除し、確認メッセージを返す
    ///
    /// 存在しないワークロードの削除はエラー。
    async fn teardown(&self, identity_or_name: &str, cancel: &CancellationToken)
    -> Result<String>;
}

/// キャンセルされたら `RuntimeError::Cancelled` を返す
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
        result = fut => result,
    }
}
