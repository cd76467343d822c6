//! JudgeFlow image build functionality
//!
//! This crate assembles build contexts from an uploaded archive and a
//! Dockerfile text, runs the build on a remote BuildKit engine (or a Docker
//! daemon) and pushes the result to the configured registry.

pub mod auth;
pub mod builder;
pub mod buildkit;
pub mod context;
pub mod docker;
pub mod error;
pub mod progress;
pub mod pusher;

pub use auth::RegistryAuth;
pub use builder::{BuildFailure, BuildOutput, ImageBuilder, image_reference};
pub use buildkit::{
    BuildKitBuilder, Buildctl, EngineConnection, SolveExecutor, SolveRequest, SolveResponse,
};
pub use context::{BuildContext, ContextBuilder, DOCKERFILE_ENTRY, ExtractSummary};
pub use docker::DockerBuilder;
pub use error::{BuildError, BuildStage, Result};
pub use progress::{BuildProgress, LogEvent, ProgressSender};
pub use pusher::{ImagePusher, split_image_tag};
