//! JudgeFlow workload runtimes
//!
//! Launches a built image as a single-container, non-restarting workload
//! and tears it down again by identity or name. Kubernetes is the primary
//! runtime; a local Docker daemon can stand in for it.

pub mod docker;
pub mod error;
pub mod kubernetes;
pub mod namespace;
pub mod runtime;

pub use docker::{BollardContainers, ContainerApi, DockerRuntime};
pub use error::{Result, RuntimeError};
pub use kubernetes::{KubePodApi, KubeRuntime, PodApi, pod_manifest};
pub use namespace::NamespaceResolver;
pub use runtime::{
    DOCKERFILE_ANNOTATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE, Workload, WorkloadRuntime,
    WorkloadSpec,
};
