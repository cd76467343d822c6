//! ビルド & デプロイパイプライン
//!
//! Assembling → Building → Deploying → Done の順に進み、どの段階でも
//! Failed に遷移できる。失敗時もそこまでのビルドログを結果に残す。

use crate::error::{PipelineError, Result};
use crate::teardown::Teardown;
use judgeflow_build::{BuildKitBuilder, ContextBuilder, DockerBuilder, ImageBuilder};
use judgeflow_config::{BuilderBackend, PipelineConfig, RuntimeBackend};
use judgeflow_runtime::{DockerRuntime, KubeRuntime, Workload, WorkloadRuntime, WorkloadSpec};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const IMAGE_NAME_PREFIX: &str = "judgeflow-image";
pub const WORKLOAD_NAME_PREFIX: &str = "judgeflow-workload";

/// 1回のパイプライン実行への入力
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    pub docker_text: String,
    /// tar (gzip 圧縮も可)
    pub context_archive: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Assembling,
    Building,
    Deploying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Assembling,
    Building,
    Deploying,
    Done,
    Failed(Stage),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Assembling => "assembling",
            Stage::Building => "building",
            Stage::Deploying => "deploying",
        };
        f.write_str(name)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Assembling => write!(f, "{}", Stage::Assembling),
            PipelineState::Building => write!(f, "{}", Stage::Building),
            PipelineState::Deploying => write!(f, "{}", Stage::Deploying),
            PipelineState::Done => f.write_str("done"),
            PipelineState::Failed(stage) => write!(f, "failed:{}", stage),
        }
    }
}

/// パイプラインの実行結果
#[derive(Debug)]
pub struct PipelineOutcome {
    pub state: PipelineState,
    /// ビルドが成功していれば、デプロイに失敗しても設定される
    pub image_reference: String,
    pub digest: Option<String>,
    pub workload: Option<Workload>,
    pub log_transcript: String,
    pub error: Option<PipelineError>,
}

impl PipelineOutcome {
    fn failed_at(
        stage: Stage,
        error: PipelineError,
        image_reference: String,
        log_transcript: String,
    ) -> Self {
        tracing::warn!("Pipeline failed while {}: {}", stage, error);
        Self {
            state: PipelineState::Failed(stage),
            image_reference,
            digest: None,
            workload: None,
            log_transcript,
            error: Some(error),
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// ビルダーとランタイムを束ねたパイプライン
///
/// 両者は複数の実行から同時に使われる。実行ごとの状態は持たない。
#[derive(Clone)]
pub struct Pipeline {
    builder: Arc<dyn ImageBuilder>,
    runtime: Arc<dyn WorkloadRuntime>,
}

impl Pipeline {
    /// 設定を検証し、選択されたバックエンドに接続する
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let builder: Arc<dyn ImageBuilder> = match config.builder {
            BuilderBackend::Buildkit => Arc::new(BuildKitBuilder::new(&config)),
            BuilderBackend::Docker => Arc::new(DockerBuilder::connect(&config)?),
        };
        let runtime: Arc<dyn WorkloadRuntime> = match config.runtime {
            RuntimeBackend::Kubernetes => Arc::new(KubeRuntime::connect(&config).await?),
            RuntimeBackend::Docker => Arc::new(DockerRuntime::connect()?),
        };

        tracing::info!(
            "Pipeline ready (builder: {}, runtime: {})",
            builder.name(),
            runtime.name()
        );
        Ok(Self::with_backends(builder, runtime))
    }

    pub fn with_backends(
        builder: Arc<dyn ImageBuilder>,
        runtime: Arc<dyn WorkloadRuntime>,
    ) -> Self {
        Self { builder, runtime }
    }

    /// 同じランタイムを使う削除エントリポイント
    pub fn teardown(&self) -> Teardown {
        Teardown::new(self.runtime.clone())
    }

    pub async fn run(&self, request: BuildRequest, cancel: &CancellationToken) -> PipelineOutcome {
        tracing::info!("Pipeline state: {}", PipelineState::Assembling);

        if request.docker_text.trim().is_empty() {
            return PipelineOutcome::failed_at(
                Stage::Assembling,
                PipelineError::Validation("Dockerfile text is empty".to_string()),
                String::new(),
                String::new(),
            );
        }

        let context =
            match ContextBuilder::merge(request.context_archive.as_deref(), &request.docker_text) {
                Ok(context) => context,
                Err(e) => {
                    return PipelineOutcome::failed_at(
                        Stage::Assembling,
                        e.into(),
                        String::new(),
                        String::new(),
                    );
                }
            };
        if cancel.is_cancelled() {
            return PipelineOutcome::failed_at(
                Stage::Assembling,
                PipelineError::Cancelled,
                String::new(),
                String::new(),
            );
        }

        tracing::info!(
            "Pipeline state: {} ({} byte context, {})",
            PipelineState::Building,
            context.len(),
            self.builder.name()
        );
        let image_name = generate_name(IMAGE_NAME_PREFIX);
        let output = self.builder.build(&image_name, context, cancel).await;

        if let Some(failure) = output.failure {
            return PipelineOutcome::failed_at(
                Stage::Building,
                failure.into(),
                String::new(),
                output.log_transcript,
            );
        }

        tracing::info!(
            "Pipeline state: {} ({})",
            PipelineState::Deploying,
            output.image_reference
        );
        let spec = WorkloadSpec {
            name: generate_name(WORKLOAD_NAME_PREFIX),
            image_reference: output.image_reference.clone(),
            dockerfile: request.docker_text,
        };

        match self.runtime.launch(&spec, cancel).await {
            Ok(workload) => {
                tracing::info!(
                    "Pipeline state: {} ({} in {})",
                    PipelineState::Done,
                    workload.name,
                    workload.namespace
                );
                PipelineOutcome {
                    state: PipelineState::Done,
                    image_reference: output.image_reference,
                    digest: output.digest,
                    workload: Some(workload),
                    log_transcript: output.log_transcript,
                    error: None,
                }
            }
            Err(e) => {
                let mut outcome = PipelineOutcome::failed_at(
                    Stage::Deploying,
                    e.into(),
                    output.image_reference,
                    output.log_transcript,
                );
                outcome.digest = output.digest;
                outcome
            }
        }
    }
}

/// `<prefix>-<uuid>`
pub fn generate_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}
