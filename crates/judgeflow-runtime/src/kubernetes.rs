//! Kubernetes ランタイム
//!
//! ワークロードは単一コンテナ・再起動なしの Pod として作成する。

use crate::error::{Result, RuntimeError};
use crate::namespace::NamespaceResolver;
use crate::runtime::{
    DOCKERFILE_ANNOTATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE, Workload, WorkloadRuntime,
    WorkloadSpec, cancellable,
};
use async_trait::async_trait;
use judgeflow_config::PipelineConfig;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Pod API のうち必要な操作
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// 削除する。Pod が存在しなければ `Ok(false)`
    ///
    /// `uid` を指定すると UID の前提条件付きで削除する。
    async fn delete(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<bool>;

    /// judgeflow が管理する Pod の一覧
    async fn list_managed(&self, namespace: &str) -> Result<Vec<Pod>>;
}

/// kube クライアントによる [`PodApi`]
#[derive(Clone)]
pub struct KubePodApi {
    client: Client,
}

impl KubePodApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// in-cluster 設定または kubeconfig から接続する
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self.api(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn delete(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<bool> {
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..Default::default()
        };

        match self.api(namespace).delete(name, &params).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            // UID の前提条件が一致しない
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(RuntimeError::Delete {
                target: name.to_string(),
                reason: ae.message,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_managed(&self, namespace: &str) -> Result<Vec<Pod>> {
        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items)
    }
}

/// ワークロードの Pod マニフェスト
pub fn pod_manifest(spec: &WorkloadSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                DOCKERFILE_ANNOTATION.to_string(),
                spec.dockerfile.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: spec.name.clone(),
                image: Some(spec.image_reference.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                ..Default::default()
            }],
            // 一回限りの評価実行
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct KubeRuntime<P: PodApi = KubePodApi> {
    pods: P,
    namespaces: NamespaceResolver,
}

impl KubeRuntime<KubePodApi> {
    pub async fn connect(config: &PipelineConfig) -> Result<Self> {
        let pods = KubePodApi::try_default().await?;
        Ok(Self::with_api(pods, NamespaceResolver::new(&config.namespace)))
    }
}

impl<P: PodApi> KubeRuntime<P> {
    pub fn with_api(pods: P, namespaces: NamespaceResolver) -> Self {
        Self { pods, namespaces }
    }
}

#[async_trait]
impl<P: PodApi> WorkloadRuntime for KubeRuntime<P> {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn launch(&self, spec: &WorkloadSpec, cancel: &CancellationToken) -> Result<Workload> {
        let namespace = self.namespaces.resolve();
        let pod = pod_manifest(spec);

        tracing::info!("Creating pod {} in namespace {}", spec.name, namespace);
        let created = cancellable(cancel, self.pods.create(&namespace, &pod)).await?;

        let identity = created
            .metadata
            .uid
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| RuntimeError::IdentityMissing {
                name: spec.name.clone(),
            })?;
        let name = created.metadata.name.unwrap_or_else(|| spec.name.clone());

        tracing::info!("Pod {} created ({})", name, identity);
        Ok(Workload {
            name,
            identity,
            namespace,
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
        let namespace = self.namespaces.resolve();

        if cancellable(cancel, self.pods.delete(&namespace, target, None)).await? {
            tracing::info!("Deleted pod {} in namespace {}", target, namespace);
            return Ok(format!("Deleted pod {} in namespace {}", target, namespace));
        }

        // 名前で見つからなければ UID として探す
        let pods = cancellable(cancel, self.pods.list_managed(&namespace)).await?;
        let name = pods
            .into_iter()
            .find(|pod| pod.metadata.uid.as_deref() == Some(target))
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| RuntimeError::not_found(target))?;

        if cancellable(cancel, self.pods.delete(&namespace, &name, Some(target))).await? {
            tracing::info!("Deleted pod {} ({}) in namespace {}", name, target, namespace);
            Ok(format!(
                "Deleted pod {} ({}) in namespace {}",
                name, target, namespace
            ))
        } else {
            Err(RuntimeError::not_found(target))
        }
    }
}
