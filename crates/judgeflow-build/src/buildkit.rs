//! リモート BuildKit によるビルド
//!
//! buildkitd への接続は `buildctl` クライアントに任せる。進捗は
//! `--progress rawjson` の出力 (1行1つの SolveStatus JSON) をイベント
//! チャネルとして読み取る。

use crate::builder::{BuildOutput, ImageBuilder, cancellable, image_reference};
use crate::context::{BuildContext, ContextBuilder, ExtractSummary};
use crate::error::{BuildError, BuildStage, Result};
use crate::progress::{self, LogEvent, ProgressSender};
use async_trait::async_trait;
use base64::Engine;
use judgeflow_config::{PipelineConfig, TlsConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// JSON 以外の出力行に付ける vertex 名
pub const BUILDCTL_VERTEX: &str = "buildctl";

/// ビルドエンジンへの接続情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConnection {
    pub endpoint: String,
    pub tls: TlsConfig,
}

impl EngineConnection {
    /// buildctl のグローバルオプション
    pub fn global_args(&self) -> Vec<String> {
        let mut args = vec!["--addr".to_string(), self.endpoint.clone()];

        if let Some(ca) = &self.tls.ca {
            args.push("--tlscacert".to_string());
            args.push(ca.display().to_string());
        }
        if let Some(cert) = &self.tls.cert {
            args.push("--tlscert".to_string());
            args.push(cert.display().to_string());
        }
        if let Some(key) = &self.tls.key {
            args.push("--tlskey".to_string());
            args.push(key.display().to_string());
        }
        if let Some(server_name) = &self.tls.server_name {
            args.push("--tlsservername".to_string());
            args.push(server_name.clone());
        }

        args
    }
}

/// solve 操作の内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveRequest {
    /// ビルドコンテキストと Dockerfile の両方をここから読む
    pub context_dir: PathBuf,
    pub image_reference: String,
    pub push: bool,
    pub insecure_registry: bool,
    pub metadata_file: PathBuf,
}

impl SolveRequest {
    pub fn build_args(&self) -> Vec<String> {
        let dir = self.context_dir.display();
        vec![
            "build".to_string(),
            "--frontend".to_string(),
            "dockerfile.v0".to_string(),
            "--local".to_string(),
            format!("context={}", dir),
            "--local".to_string(),
            format!("dockerfile={}", dir),
            "--output".to_string(),
            self.output_spec(),
            "--progress".to_string(),
            "rawjson".to_string(),
            "--metadata-file".to_string(),
            self.metadata_file.display().to_string(),
        ]
    }

    fn output_spec(&self) -> String {
        let mut spec = format!("type=image,name={},push={}", self.image_reference, self.push);
        if self.insecure_registry {
            spec.push_str(",registry.insecure=true");
        }
        spec
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveResponse {
    pub image_name: Option<String>,
    pub digest: Option<String>,
}

/// ビルドエンジンの呼び出し
///
/// 本番は [`Buildctl`]、テストではスクリプト化した実装を使う。
#[async_trait]
pub trait SolveExecutor: Send + Sync {
    /// エンジンに到達できるか確認する
    async fn connect(&self, connection: &EngineConnection) -> Result<()>;

    /// solve を実行する
    ///
    /// 進捗は `events` に送る。戻る前に `events` を閉じてよい
    /// (呼び出し側は二重クローズを無害として扱う)。
    async fn solve(
        &self,
        connection: &EngineConnection,
        request: &SolveRequest,
        events: ProgressSender,
    ) -> Result<SolveResponse>;
}

/// buildctl CLI
#[derive(Debug, Clone)]
pub struct Buildctl {
    program: PathBuf,
}

impl Buildctl {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Buildctl {
    fn default() -> Self {
        Self::new("buildctl")
    }
}

#[async_trait]
impl SolveExecutor for Buildctl {
    async fn connect(&self, connection: &EngineConnection) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(connection.global_args());
        cmd.args(["debug", "workers"]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!("Probing build engine at {}", connection.endpoint);

        let output = cmd.output().await.map_err(|e| {
            BuildError::Connect(format!("failed to run {}: {}", self.program.display(), e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BuildError::Connect(if stderr.is_empty() {
                format!("{} exited with {}", self.program.display(), output.status)
            } else {
                stderr
            }));
        }

        Ok(())
    }

    async fn solve(
        &self,
        connection: &EngineConnection,
        request: &SolveRequest,
        events: ProgressSender,
    ) -> Result<SolveResponse> {
        let mut args = connection.global_args();
        args.extend(request.build_args());

        tracing::debug!("Running: {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BuildError::Connect(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        // rawjson の進捗は stderr に出る
        let stderr = child.stderr.take().ok_or_else(|| {
            BuildError::BuildFailed("buildctl stderr was not captured".to_string())
        })?;

        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        let mut last_message = None;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);

            match decode_progress_line(&line) {
                Some(decoded) => {
                    for event in decoded {
                        events.send(event).await;
                    }
                }
                None => {
                    let message = line.trim();
                    if message.is_empty() {
                        continue;
                    }
                    last_message = Some(message.to_string());
                    events
                        .send(LogEvent::chunk(BUILDCTL_VERTEX, 2, message))
                        .await;
                }
            }
        }

        // エンジン側のクローズ
        drop(events);

        let status = child.wait().await?;
        if !status.success() {
            return Err(BuildError::BuildFailed(last_message.unwrap_or_else(|| {
                format!("{} exited with {}", self.program.display(), status)
            })));
        }

        Ok(read_metadata(&request.metadata_file).await)
    }
}

#[derive(Debug, Deserialize)]
struct SolveStatus {
    #[serde(default)]
    vertexes: Option<Vec<RawVertex>>,
    #[serde(default)]
    logs: Option<Vec<RawLog>>,
}

#[derive(Debug, Deserialize)]
struct RawVertex {
    #[serde(default)]
    digest: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct RawLog {
    #[serde(default)]
    vertex: String,
    #[serde(default)]
    stream: i64,
    /// base64 エンコードされたバイト列
    #[serde(default)]
    data: String,
}

/// rawjson の1行を進捗イベントに変換する
///
/// SolveStatus でない行は `None`。
pub fn decode_progress_line(line: &str) -> Option<Vec<LogEvent>> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let status: SolveStatus = serde_json::from_str(trimmed).ok()?;

    let mut events = Vec::new();

    for vertex in status.vertexes.unwrap_or_default() {
        if !vertex.name.is_empty() {
            events.push(LogEvent::vertex_name(&vertex.digest, vertex.name));
        }
        if !vertex.error.is_empty() {
            events.push(LogEvent::chunk(vertex.digest, 2, vertex.error));
        }
    }

    for log in status.logs.unwrap_or_default() {
        let data = base64::engine::general_purpose::STANDARD
            .decode(&log.data)
            .unwrap_or_else(|_| log.data.into_bytes());
        events.push(LogEvent::chunk(log.vertex, log.stream, data));
    }

    Some(events)
}

async fn read_metadata(path: &Path) -> SolveResponse {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read build metadata {}: {}", path.display(), e);
            }
            return SolveResponse::default();
        }
    };

    match serde_json::from_slice::<serde_json::Value>(&content) {
        Ok(value) => {
            let field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
            SolveResponse {
                image_name: field("image.name"),
                digest: field("containerimage.digest"),
            }
        }
        Err(e) => {
            tracing::warn!("Failed to parse build metadata {}: {}", path.display(), e);
            SolveResponse::default()
        }
    }
}

/// リモート BuildKit ビルダー
pub struct BuildKitBuilder<E: SolveExecutor = Buildctl> {
    executor: E,
    registry: Option<String>,
    endpoint: Option<String>,
    tls: TlsConfig,
    insecure_registry: bool,
}

impl BuildKitBuilder<Buildctl> {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_executor(config, Buildctl::new(config.engine.buildctl.clone()))
    }
}

impl<E: SolveExecutor> BuildKitBuilder<E> {
    pub fn with_executor(config: &PipelineConfig, executor: E) -> Self {
        Self {
            executor,
            registry: config.registry_host().map(str::to_string),
            endpoint: config.endpoint().map(str::to_string),
            tls: config.engine.tls.clone(),
            insecure_registry: config.allow_insecure_registry,
        }
    }

    /// ネットワーク I/O の前に設定を確認する
    fn preflight(&self) -> Result<(&str, EngineConnection)> {
        let registry = self.registry.as_deref().ok_or_else(|| {
            BuildError::InvalidConfig("registry address is not configured".to_string())
        })?;
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            BuildError::InvalidConfig("build engine endpoint is not configured".to_string())
        })?;

        Ok((
            registry,
            EngineConnection {
                endpoint: endpoint.to_string(),
                tls: self.tls.clone(),
            },
        ))
    }
}

#[async_trait]
impl<E: SolveExecutor> ImageBuilder for BuildKitBuilder<E> {
    fn name(&self) -> &str {
        "buildkit"
    }

    async fn build(
        &self,
        image_name: &str,
        context: BuildContext,
        cancel: &CancellationToken,
    ) -> BuildOutput {
        let (registry, connection) = match self.preflight() {
            Ok(preflight) => preflight,
            Err(e) => return BuildOutput::failed_at(BuildStage::Configuration, e, String::new()),
        };
        let image_reference = image_reference(registry, image_name);
        tracing::info!("Building {} on {}", image_reference, connection.endpoint);

        // TempDir の drop で全ての経路で削除される
        let scratch = match tempfile::Builder::new()
            .prefix("judgeflow-build-")
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                return BuildOutput::failed_at(
                    BuildStage::ContextExtraction,
                    e.into(),
                    String::new(),
                );
            }
        };
        let context_dir = scratch.path().join("context");
        let metadata_file = scratch.path().join("metadata.json");

        // 展開は途中で中断せず、完了後にキャンセルを確認する
        match materialize(context, context_dir.clone()).await {
            Ok(summary) => tracing::debug!("Materialized build context: {:?}", summary),
            Err(e) => {
                return BuildOutput::failed_at(BuildStage::ContextExtraction, e, String::new());
            }
        }
        if cancel.is_cancelled() {
            return BuildOutput::failed_at(
                BuildStage::ContextExtraction,
                BuildError::Cancelled,
                String::new(),
            );
        }

        if let Err(e) = cancellable(cancel, self.executor.connect(&connection)).await {
            return BuildOutput::failed_at(BuildStage::Connect, e, String::new());
        }

        let request = SolveRequest {
            context_dir,
            image_reference: image_reference.clone(),
            push: true,
            insecure_registry: self.insecure_registry,
            metadata_file,
        };

        let (mut sender, collector) = progress::spawn_collector();
        let solved = cancellable(
            cancel,
            self.executor.solve(&connection, &request, sender.clone()),
        )
        .await;

        sender.close();
        let log_transcript = collector.finish().await;

        if let Err(e) = scratch.close() {
            tracing::warn!("Failed to remove build scratch directory: {}", e);
        }

        match solved {
            Ok(response) => {
                tracing::info!(
                    "Pushed {} ({})",
                    image_reference,
                    response.digest.as_deref().unwrap_or("digest unknown")
                );
                BuildOutput::succeeded(image_reference, log_transcript, response.digest)
            }
            Err(e) => BuildOutput::failed_at(BuildStage::Solve, e, log_transcript),
        }
    }
}

async fn materialize(context: BuildContext, dest: PathBuf) -> Result<ExtractSummary> {
    tokio::task::spawn_blocking(move || ContextBuilder::extract(context.as_bytes(), &dest))
        .await
        .map_err(|e| BuildError::Io(std::io::Error::other(e)))?
}
