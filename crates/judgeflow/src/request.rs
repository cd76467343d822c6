//! 外部 (HTTP / エージェント層) とやり取りするリクエスト・レスポンス

use crate::error::{PipelineError, Result};
use crate::pipeline::{BuildRequest, PipelineOutcome};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub docker_text: String,
    /// base64 エンコードされた tar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_archive: Option<String>,
}

impl DeployRequest {
    /// アーカイブをデコードしてパイプライン入力にする
    ///
    /// デコードに失敗した時点で `ArchiveFormat` を返す。
    pub fn into_build_request(self) -> Result<BuildRequest> {
        let context_archive = match self
            .context_archive
            .as_deref()
            .map(str::trim)
            .filter(|encoded| !encoded.is_empty())
        {
            Some(encoded) => Some(decode_archive(encoded)?),
            None => None,
        };

        Ok(BuildRequest {
            docker_text: self.docker_text,
            context_archive,
        })
    }
}

/// URL-safe (パディングなし) を優先し、標準アルファベットも受け付ける
pub fn decode_archive(encoded: &str) -> Result<Vec<u8>> {
    [URL_SAFE_NO_PAD, URL_SAFE, STANDARD, STANDARD_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(encoded).ok())
        .ok_or_else(|| {
            PipelineError::ArchiveFormat("context archive is not valid base64".to_string())
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub image_reference: String,
    pub workload_name: String,
    pub workload_identity: String,
    pub namespace: String,
    pub failed: bool,
    pub log_transcript: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeployResponse {
    /// パイプラインに入る前のエラー (デコード失敗など)
    pub fn rejected(error: &PipelineError) -> Self {
        Self {
            failed: true,
            state: "failed:assembling".to_string(),
            error_kind: Some(error.kind().to_string()),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

impl From<PipelineOutcome> for DeployResponse {
    fn from(outcome: PipelineOutcome) -> Self {
        let failed = outcome.failed();
        let (workload_name, workload_identity, namespace) = match outcome.workload {
            Some(workload) => (workload.name, workload.identity, workload.namespace),
            None => Default::default(),
        };

        Self {
            image_reference: outcome.image_reference,
            workload_name,
            workload_identity,
            namespace,
            failed,
            log_transcript: outcome.log_transcript,
            state: outcome.state.to_string(),
            error_kind: outcome.error.as_ref().map(|e| e.kind().to_string()),
            error: outcome.error.as_ref().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownRequest {
    pub workload_identity_or_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownResponse {
    pub confirmation_message: String,
}
