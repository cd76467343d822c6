//! Docker デーモンによるビルド
//!
//! BuildKit を使えない環境向け。ビルド後に [`ImagePusher`] でレジストリへ
//! プッシュする。

use crate::builder::{BuildOutput, ImageBuilder, cancellable, image_reference};
use crate::context::{BuildContext, DOCKERFILE_ENTRY};
use crate::error::{BuildError, BuildStage, Result};
use crate::progress::{self, LogEvent, ProgressSender};
use crate::pusher::{ImagePusher, split_image_tag};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::BuildInfo;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use http_body_util::{Either, Full};
use judgeflow_config::PipelineConfig;
use tokio_util::sync::CancellationToken;

/// ステップ行より前の出力に付ける vertex 名
const PREAMBLE_VERTEX: &str = "build";

pub struct DockerBuilder {
    docker: Docker,
    registry: Option<String>,
    pusher: ImagePusher,
}

impl DockerBuilder {
    pub fn new(docker: Docker, config: &PipelineConfig) -> Self {
        Self {
            pusher: ImagePusher::new(docker.clone()),
            docker,
            registry: config.registry_host().map(str::to_string),
        }
    }

    /// DOCKER_HOST などの環境設定で接続する
    pub fn connect(config: &PipelineConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, config))
    }

    async fn build_and_push(
        &self,
        image_reference: &str,
        context: BuildContext,
        events: &ProgressSender,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<String>, (BuildStage, BuildError)> {
        cancellable(cancel, self.run_build(image_reference, context, events))
            .await
            .map_err(|e| (BuildStage::Solve, e))?;

        cancellable(cancel, self.pusher.push(image_reference, events))
            .await
            .map_err(|e| (BuildStage::Push, e))?;

        Ok(self.pushed_digest(image_reference).await)
    }

    async fn run_build(
        &self,
        image_reference: &str,
        context: BuildContext,
        events: &ProgressSender,
    ) -> Result<()> {
        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions {
            dockerfile: DOCKERFILE_ENTRY,
            t: image_reference,
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let body = Full::new(Bytes::from(context.into_bytes()));
        #[allow(deprecated)]
        let mut stream = self
            .docker
            .build_image(options, None, Some(Either::Left(body)));

        let mut translator = StepTranslator::default();
        while let Some(msg) = stream.next().await {
            let info = msg.map_err(|e| BuildError::BuildFailed(e.to_string()))?;

            for event in translator.translate(&info) {
                events.send(event).await;
            }
            if let Some(message) = build_error(&info) {
                return Err(BuildError::BuildFailed(message));
            }
        }

        Ok(())
    }

    /// プッシュ済みイメージのダイジェスト (取得できなければ `None`)
    async fn pushed_digest(&self, image_reference: &str) -> Option<String> {
        let (repository, _) = split_image_tag(image_reference);
        let prefix = format!("{}@", repository);

        match self.docker.inspect_image(image_reference).await {
            Ok(image) => image
                .repo_digests
                .unwrap_or_default()
                .into_iter()
                .find_map(|d| d.strip_prefix(&prefix).map(str::to_string)),
            Err(e) => {
                tracing::debug!("Could not inspect {}: {}", image_reference, e);
                None
            }
        }
    }
}

#[async_trait]
impl ImageBuilder for DockerBuilder {
    fn name(&self) -> &str {
        "docker"
    }

    async fn build(
        &self,
        image_name: &str,
        context: BuildContext,
        cancel: &CancellationToken,
    ) -> BuildOutput {
        let Some(registry) = self.registry.as_deref() else {
            return BuildOutput::failed_at(
                BuildStage::Configuration,
                BuildError::InvalidConfig("registry address is not configured".to_string()),
                String::new(),
            );
        };
        let image_reference = image_reference(registry, image_name);
        tracing::info!("Building {} with the Docker daemon", image_reference);

        let ping = async {
            self.docker
                .ping()
                .await
                .map(|_| ())
                .map_err(|e| BuildError::Connect(e.to_string()))
        };
        if let Err(e) = cancellable(cancel, ping).await {
            return BuildOutput::failed_at(BuildStage::Connect, e, String::new());
        }

        let (mut sender, collector) = progress::spawn_collector();
        let outcome = self
            .build_and_push(&image_reference, context, &sender, cancel)
            .await;

        sender.close();
        let log_transcript = collector.finish().await;

        match outcome {
            Ok(digest) => BuildOutput::succeeded(image_reference, log_transcript, digest),
            Err((stage, e)) => BuildOutput::failed_at(stage, e, log_transcript),
        }
    }
}

fn build_error(info: &BuildInfo) -> Option<String> {
    info.error_detail
        .as_ref()
        .and_then(|detail| detail.message.clone())
        .or_else(|| info.error.clone())
}

/// "Step N/M : INSTRUCTION" を vertex `step-N` として扱う
fn parse_step(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("Step ")?;
    let (counter, instruction) = rest.split_once(" : ")?;
    let (current, total) = counter.split_once('/')?;
    if current.is_empty() || !current.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some((
        format!("step-{}", current),
        format!("[{}/{}] {}", current, total, instruction.trim_end()),
    ))
}

/// デーモンのビルド出力を進捗イベントに変換する
#[derive(Debug, Default)]
struct StepTranslator {
    current: Option<String>,
}

impl StepTranslator {
    fn vertex(&self) -> String {
        self.current
            .clone()
            .unwrap_or_else(|| PREAMBLE_VERTEX.to_string())
    }

    fn translate(&mut self, info: &BuildInfo) -> Vec<LogEvent> {
        let mut events = Vec::new();

        if let Some(stream) = &info.stream {
            for line in stream.split_inclusive('\n') {
                match parse_step(line) {
                    Some((vertex, name)) => {
                        events.push(LogEvent::vertex_name(vertex.as_str(), name));
                        self.current = Some(vertex);
                    }
                    None => events.push(LogEvent::chunk(self.vertex(), 1, line)),
                }
            }
        }

        // ベースイメージ pull の進捗は捨てる
        if let Some(status) = &info.status
            && !matches!(
                status.as_str(),
                "Downloading" | "Extracting" | "Waiting" | "Verifying Checksum"
            )
        {
            events.push(LogEvent::chunk(self.vertex(), 1, status.as_str()));
        }

        if let Some(message) = build_error(info) {
            events.push(LogEvent::chunk(self.vertex(), 2, message));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::BuildProgress;
    use bollard::models::ErrorDetail;

    fn stream(text: &str) -> BuildInfo {
        BuildInfo {
            stream: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_step() {
        assert_eq!(
            parse_step("Step 2/3 : RUN echo hello\n"),
            Some(("step-2".to_string(), "[2/3] RUN echo hello".to_string()))
        );
        assert_eq!(parse_step(" ---> Running in 1a2b3c\n"), None);
        assert_eq!(parse_step("Step x/3 : RUN echo\n"), None);
    }

    #[test]
    fn test_translator_groups_output_by_step() {
        let mut translator = StepTranslator::default();
        let mut progress = BuildProgress::new();

        for info in [
            stream("Step 1/2 : FROM alpine:3.20\n"),
            stream(" ---> 9c6f07244728\n"),
            stream("Step 2/2 : RUN echo hello\n"),
            stream(" ---> Running in 1a2b3c\nhello\n"),
            BuildInfo {
                status: Some("Downloading".to_string()),
                ..Default::default()
            },
        ] {
            for event in translator.translate(&info) {
                progress.observe(event);
            }
        }

        assert_eq!(
            progress.lines(),
            &[
                "[[1/2] FROM alpine:3.20][stream:1]  ---> 9c6f07244728".to_string(),
                "[[2/2] RUN echo hello][stream:1]  ---> Running in 1a2b3c".to_string(),
                "[[2/2] RUN echo hello][stream:1] hello".to_string(),
            ]
        );
    }

    #[test]
    fn test_translator_reports_errors_on_stderr() {
        let mut translator = StepTranslator::default();
        translator.translate(&stream("Step 1/1 : RUN false\n"));

        let info = BuildInfo {
            error_detail: Some(ErrorDetail {
                message: Some(
                    "The command '/bin/sh -c false' returned a non-zero code: 1".to_string(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        let events = translator.translate(&info);

        assert_eq!(
            events,
            vec![LogEvent::chunk(
                "step-1",
                2,
                "The command '/bin/sh -c false' returned a non-zero code: 1"
            )]
        );
        assert!(build_error(&info).is_some());
    }

    #[tokio::test]
    #[ignore] // Docker デーモンとローカルレジストリが必要
    async fn test_build_and_push_with_daemon() {
        use crate::context::ContextBuilder;

        let config = PipelineConfig {
            registry: Some("localhost:5000".to_string()),
            ..Default::default()
        };
        let builder = DockerBuilder::connect(&config).unwrap();
        let context = ContextBuilder::merge(None, "FROM alpine:3.20\nCMD [\"true\"]\n").unwrap();

        let output = builder
            .build("judgeflow-docker-test", context, &CancellationToken::new())
            .await;

        assert!(!output.failed(), "{:?}", output.failure);
        assert_eq!(output.image_reference, "localhost:5000/judgeflow-docker-test");
    }
}
