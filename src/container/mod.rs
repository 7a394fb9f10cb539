//! Container runtime and agent adapter interfaces.
//!
//! The concrete runtime driver (Docker, Podman, or a remote sandbox API)
//! and the per-agent command construction live outside this crate. The
//! session and batch layers depend only on the capability traits here.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Creation parameters for a runtime container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub workdir: Option<String>,
}

/// Snapshot of a container's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub running: bool,
    /// Raw status string as reported by the runtime (e.g. "running",
    /// "exited").
    pub status: String,
}

/// Captured output of one in-container command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Structured result of one agent invocation, parsed from the agent CLI's
/// output by the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Final message text.
    pub result: String,
    pub is_error: bool,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Capability interface over the container runtime.
///
/// All methods address containers by the runtime-assigned id returned from
/// [`create`](ContainerRuntime::create). Exec cancellation is cooperative:
/// callers race the returned future against their own deadline or
/// cancellation token and drop it to abandon the execution.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container and returns its id. The container is not started.
    async fn create(&self, config: &ContainerConfig) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerState>;

    /// Runs a command to completion and returns its captured output.
    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecOutput>;

    /// Runs a command and returns a line-oriented reader over its combined
    /// output stream.
    async fn exec_stream(
        &self,
        id: &str,
        command: &[String],
    ) -> Result<Pin<Box<dyn AsyncRead + Send>>>;

    /// Copies a local file or directory into the container filesystem.
    async fn copy_to_container(&self, id: &str, src: &Path, dst: &str) -> Result<()>;
}

/// Capability interface over per-agent command construction and output
/// parsing. Implementations map an opaque agent reference onto a container
/// image and the argument vector that drives the agent CLI.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Resolves an agent reference to container creation parameters.
    /// Unknown references are validation errors.
    async fn resolve(&self, agent_ref: &str) -> Result<ContainerConfig>;

    /// Builds the in-container command for one prompt.
    fn command(&self, agent_ref: &str, prompt: &str) -> Result<Vec<String>>;

    /// Parses the agent CLI's captured output into a structured result.
    fn parse_output(&self, output: &ExecOutput) -> Result<AgentOutput>;
}
