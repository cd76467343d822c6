//! Docker ランタイム
//!
//! クラスタを使わずローカルの Docker デーモン上でワークロードを動かす。
//! 識別子はコンテナ ID。

use crate::error::{Result, RuntimeError};
use crate::runtime::{
    DOCKERFILE_ANNOTATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE, Workload, WorkloadRuntime,
    WorkloadSpec, cancellable,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use futures_util::StreamExt;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Docker ランタイムの namespace 表記
pub const DOCKER_NAMESPACE: &str = "docker";

/// Docker Engine API のうち必要な操作
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// ローカルに無い場合のみ pull する
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// コンテナを作成し ID を返す (起動はしない)
    async fn create(&self, spec: &WorkloadSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// 強制削除する。コンテナが存在しなければ `Ok(false)`
    async fn remove(&self, id_or_name: &str) -> Result<bool>;
}

/// bollard による [`ContainerApi`]
#[derive(Clone)]
pub struct BollardContainers {
    docker: Docker,
}

impl BollardContainers {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerApi for BollardContainers {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Pulling {}", image);
        let (from_image, tag) = split_tag(image);

        #[allow(deprecated)]
        let options = bollard::image::CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        #[allow(deprecated)]
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(info) = stream.next().await {
            let info = info?;
            if let Some(status) = info.status {
                tracing::debug!("pull {}: {}", image, status);
            }
        }

        Ok(())
    }

    async fn create(&self, spec: &WorkloadSpec) -> Result<String> {
        let labels = HashMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (DOCKERFILE_ANNOTATION.to_string(), spec.dockerfile.clone()),
        ]);

        #[allow(deprecated)]
        let config = bollard::container::Config {
            image: Some(spec.image_reference.clone()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::NO),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        #[allow(deprecated)]
        let options = bollard::container::CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<bollard::query_parameters::StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id_or_name: &str) -> Result<bool> {
        let options = bollard::query_parameters::RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(id_or_name, Some(options)).await {
            Ok(()) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(bollard::errors::Error::DockerResponseServerError { message, .. }) => {
                Err(RuntimeError::Delete {
                    target: id_or_name.to_string(),
                    reason: message,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct DockerRuntime<C: ContainerApi = BollardContainers> {
    containers: C,
}

impl DockerRuntime<BollardContainers> {
    pub fn new(docker: Docker) -> Self {
        Self::with_api(BollardContainers::new(docker))
    }

    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;
        Ok(Self::new(docker))
    }
}

impl<C: ContainerApi> DockerRuntime<C> {
    pub fn with_api(containers: C) -> Self {
        Self { containers }
    }

    /// 作成済みで起動に至らなかったコンテナを片付ける
    async fn discard(&self, id: &str) {
        match self.containers.remove(id).await {
            Ok(_) => tracing::debug!("Removed unstarted container {}", id),
            Err(e) => tracing::warn!("Failed to remove unstarted container {}: {}", id, e),
        }
    }
}

/// `image:tag` を分離する (タグが無ければ `latest`)
fn split_tag(image: &str) -> (String, String) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

#[async_trait]
impl<C: ContainerApi> WorkloadRuntime for DockerRuntime<C> {
    fn name(&self) -> &str {
        "docker"
    }

    async fn launch(&self, spec: &WorkloadSpec, cancel: &CancellationToken) -> Result<Workload> {
        tracing::info!("Creating container {} from {}", spec.name, spec.image_reference);

        cancellable(cancel, self.containers.ensure_image(&spec.image_reference)).await?;

        // 作成は中断しない。ID を得てからでないと片付けられない
        let identity = self.containers.create(spec).await?;
        if identity.is_empty() {
            return Err(RuntimeError::IdentityMissing {
                name: spec.name.clone(),
            });
        }

        if let Err(e) = cancellable(cancel, self.containers.start(&identity)).await {
            self.discard(&identity).await;
            return Err(e);
        }

        tracing::info!("Container {} started ({})", spec.name, identity);
        Ok(Workload {
            name: spec.name.clone(),
            identity,
            namespace: DOCKER_NAMESPACE.to_string(),
            image_reference: spec.image_reference.clone(),
            source_dockerfile: spec.dockerfile.clone(),
        })
    }

    async fn teardown(&self, identity_or_name: &str, cancel: &CancellationToken) -> Result<String> {
        let target = identity_or_name.trim();
        if target.is_empty() {
            return Err(RuntimeError::Delete {
                target: String::new(),
                reason: "workload identity or name is empty".to_string(),
            });
        }

        if !cancellable(cancel, self.containers.remove(target)).await? {
            return Err(RuntimeError::not_found(target));
        }

        tracing::info!("Removed container {}", target);
        Ok(format!("Removed container {}", target))
    }
}
