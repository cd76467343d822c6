//! JudgeFlow - build a container image from a Dockerfile and deploy it
//!
//! The pipeline assembles a build context from the uploaded archive and the
//! Dockerfile text, builds and pushes the image, then launches it as a
//! single-container workload. Every failure still returns the build log
//! gathered so far.
//!
//! ```no_run
//! use judgeflow::{BuildRequest, Pipeline, PipelineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> judgeflow::Result<()> {
//! let pipeline = Pipeline::connect(PipelineConfig::load()?).await?;
//! let outcome = pipeline
//!     .run(
//!         BuildRequest {
//!             docker_text: "FROM alpine\nCMD [\"echo\", \"hello\"]".to_string(),
//!             context_archive: None,
//!         },
//!         &CancellationToken::new(),
//!     )
//!     .await;
//! println!("{}", outcome.log_transcript);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod pipeline;
pub mod request;
pub mod teardown;

pub use error::{PipelineError, Result};
pub use judgeflow_config::PipelineConfig;
pub use pipeline::{BuildRequest, Pipeline, PipelineOutcome, PipelineState, Stage};
pub use request::{DeployRequest, DeployResponse, TeardownRequest, TeardownResponse};
pub use teardown::Teardown;
