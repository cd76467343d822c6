//! ワークロードの削除
//!
//! 起動時の状態を必要とせず、識別子 (または名前) だけで削除する。

use crate::error::{PipelineError, Result};
use crate::request::{TeardownRequest, TeardownResponse};
use judgeflow_config::{PipelineConfig, RuntimeBackend};
use judgeflow_runtime::{DockerRuntime, KubeRuntime, RuntimeError, WorkloadRuntime};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Teardown {
    runtime: Arc<dyn WorkloadRuntime>,
}

impl Teardown {
    pub fn new(runtime: Arc<dyn WorkloadRuntime>) -> Self {
        Self { runtime }
    }

    /// ランタイムにだけ接続する (ビルド設定は不要)
    pub async fn connect(config: &PipelineConfig) -> Result<Self> {
        let runtime: Arc<dyn WorkloadRuntime> = match config.runtime {
            RuntimeBackend::Kubernetes => Arc::new(KubeRuntime::connect(config).await?),
            RuntimeBackend::Docker => Arc::new(DockerRuntime::connect()?),
        };
        Ok(Self::new(runtime))
    }

    pub async fn run(
        &self,
        request: &TeardownRequest,
        cancel: &CancellationToken,
    ) -> Result<TeardownResponse> {
        let target = request.workload_identity_or_name.trim();
        tracing::info!("Tearing down workload {} ({})", target, self.runtime.name());

        let confirmation_message = self
            .runtime
            .teardown(target, cancel)
            .await
            .map_err(|e| into_delete_error(target, e))?;

        Ok(TeardownResponse {
            confirmation_message,
        })
    }
}

/// API に拒否された削除は `Delete` として扱う
fn into_delete_error(target: &str, err: RuntimeError) -> PipelineError {
    if err.is_api_rejection() {
        PipelineError::Delete {
            target: target.to_string(),
            reason: err.to_string(),
        }
    } else {
        err.into()
    }
}
