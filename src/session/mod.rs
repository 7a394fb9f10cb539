//! Session lifecycle for container-backed agents.
//!
//! A session is a running container with an agent CLI available inside it.
//! Batch workers hold one session each for their full lifetime; interactive
//! callers hold one long-lived session and issue sequential `execute` calls
//! against it. The manager here owns the bookkeeping; the container runtime
//! and agent adapter are injected collaborators.

use crate::container::{AgentAdapter, AgentOutput, ContainerRuntime};
use crate::{Result, VesselError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A running container instance bound to one agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_ref: String,
    pub container_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Stopped,
}

/// The session capability the batch layer consumes.
///
/// Kept narrow so tests can substitute an in-memory backend and so the
/// manager never reaches past session ids into container internals.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Checks that an agent reference resolves to a runnable configuration.
    async fn resolve(&self, agent_ref: &str) -> Result<()>;

    /// Creates and starts a session for the agent reference.
    async fn create_session(&self, agent_ref: &str) -> Result<Session>;

    async fn get_session(&self, id: &str) -> Option<Session>;

    /// Executes one prompt inside the session. Sequential calls against the
    /// same session share the container's working state.
    async fn execute(&self, session_id: &str, prompt: &str) -> Result<AgentOutput>;

    /// Stops the session's container and releases it.
    async fn stop_session(&self, id: &str) -> Result<()>;
}

/// Session manager driving the container runtime through an agent adapter.
pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    adapter: Arc<dyn AgentAdapter>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, adapter: Arc<dyn AgentAdapter>) -> Self {
        Self {
            runtime,
            adapter,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// All sessions currently tracked, including stopped ones not yet
    /// swept.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    /// Stops and forgets sessions idle for longer than `max_idle`.
    /// Returns the number of sessions swept.
    pub async fn cleanup_idle(&self, max_idle: Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_idle;
        let idle_ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.state == SessionState::Active && s.last_used < cutoff)
                .map(|s| s.id.clone())
                .collect()
        };

        let mut swept = 0;
        for id in idle_ids {
            match self.stop_session(&id).await {
                Ok(()) => swept += 1,
                Err(e) => warn!("Failed to sweep idle session {}: {}", id, e),
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| s.state == SessionState::Active);
        Ok(swept)
    }
}

#[async_trait]
impl SessionBackend for SessionManager {
    async fn resolve(&self, agent_ref: &str) -> Result<()> {
        self.adapter.resolve(agent_ref).await.map(|_| ())
    }

    async fn create_session(&self, agent_ref: &str) -> Result<Session> {
        let config = self.adapter.resolve(agent_ref).await?;
        let container_id = self.runtime.create(&config).await?;

        if let Err(e) = self.runtime.start(&container_id).await {
            // Creation is all-or-nothing: a container that failed to start
            // must not leak.
            if let Err(remove_err) = self.runtime.remove(&container_id).await {
                warn!(
                    "Failed to remove container {} after start error: {}",
                    container_id, remove_err
                );
            }
            return Err(e);
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent_ref: agent_ref.to_string(),
            container_id,
            state: SessionState::Active,
            created_at: now,
            last_used: now,
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.clone(), session.clone());
        info!(
            "Created session {} for agent {} (container {})",
            session.id, agent_ref, session.container_id
        );
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    async fn execute(&self, session_id: &str, prompt: &str) -> Result<AgentOutput> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| VesselError::NotFound(format!("session {session_id}")))?
        };

        if session.state != SessionState::Active {
            return Err(VesselError::Session {
                message: format!("session {session_id} is not active"),
            });
        }

        let command = self.adapter.command(&session.agent_ref, prompt)?;
        debug!(
            "Executing agent command in session {} (container {})",
            session_id, session.container_id
        );
        let output = self.runtime.exec(&session.container_id, &command).await?;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(s) = sessions.get_mut(session_id) {
                s.last_used = Utc::now();
            }
        }

        self.adapter.parse_output(&output)
    }

    async fn stop_session(&self, id: &str) -> Result<()> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .get(id)
                .cloned()
                .ok_or_else(|| VesselError::NotFound(format!("session {id}")))?
        };

        if session.state == SessionState::Stopped {
            return Ok(());
        }

        self.runtime.stop(&session.container_id).await?;
        if let Err(e) = self.runtime.remove(&session.container_id).await {
            warn!("Failed to remove container {}: {}", session.container_id, e);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(id) {
            s.state = SessionState::Stopped;
        }
        info!("Stopped session {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, ContainerState, ExecOutput};
    use std::path::Path;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncRead;

    /// Runtime double that tracks container lifecycles in memory.
    struct FakeRuntime {
        created: AtomicUsize,
        removed: AtomicUsize,
        fail_start: bool,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                removed: AtomicUsize::new(0),
                fail_start: false,
            }
        }

        fn failing_start() -> Self {
            Self {
                fail_start: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create(&self, _config: &ContainerConfig) -> Result<String> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("ctr-{n}"))
        }

        async fn start(&self, _id: &str) -> Result<()> {
            if self.fail_start {
                return Err(VesselError::Container {
                    message: "start refused".to_string(),
                });
            }
            Ok(())
        }

        async fn stop(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _id: &str) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn inspect(&self, _id: &str) -> Result<ContainerState> {
            Ok(ContainerState {
                running: true,
                status: "running".to_string(),
            })
        }

        async fn exec(&self, _id: &str, command: &[String]) -> Result<ExecOutput> {
            Ok(ExecOutput {
                stdout: command.join(" "),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn exec_stream(
            &self,
            _id: &str,
            _command: &[String],
        ) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
            Ok(Box::pin(tokio::io::empty()))
        }

        async fn copy_to_container(&self, _id: &str, _src: &Path, _dst: &str) -> Result<()> {
            Ok(())
        }
    }

    struct EchoAdapter;

    #[async_trait]
    impl AgentAdapter for EchoAdapter {
        async fn resolve(&self, agent_ref: &str) -> Result<ContainerConfig> {
            if agent_ref == "unknown" {
                return Err(VesselError::Validation(format!(
                    "unknown agent reference: {agent_ref}"
                )));
            }
            Ok(ContainerConfig {
                image: format!("agents/{agent_ref}:latest"),
                ..ContainerConfig::default()
            })
        }

        fn command(&self, _agent_ref: &str, prompt: &str) -> Result<Vec<String>> {
            Ok(vec!["agent".to_string(), prompt.to_string()])
        }

        fn parse_output(&self, output: &ExecOutput) -> Result<AgentOutput> {
            Ok(AgentOutput {
                result: output.stdout.clone(),
                is_error: output.exit_code != 0,
                duration_ms: None,
                num_turns: None,
                input_tokens: None,
                output_tokens: None,
            })
        }
    }

    fn manager_with(runtime: FakeRuntime) -> SessionManager {
        SessionManager::new(Arc::new(runtime), Arc::new(EchoAdapter))
    }

    #[tokio::test]
    async fn test_create_execute_stop() {
        let manager = manager_with(FakeRuntime::new());
        let session = manager.create_session("claude").await.unwrap();
        assert_eq!(session.state, SessionState::Active);

        let output = manager.execute(&session.id, "hello").await.unwrap();
        assert_eq!(output.result, "agent hello");
        assert!(!output.is_error);

        manager.stop_session(&session.id).await.unwrap();
        let stopped = manager.get_session(&session.id).await.unwrap();
        assert_eq!(stopped.state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_agent_ref_is_validation_error() {
        let manager = manager_with(FakeRuntime::new());
        assert!(matches!(
            manager.resolve("unknown").await,
            Err(VesselError::Validation(_))
        ));
        assert!(manager.create_session("unknown").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_start_removes_container() {
        let runtime = FakeRuntime::failing_start();
        let manager = SessionManager::new(Arc::new(runtime), Arc::new(EchoAdapter));
        assert!(manager.create_session("claude").await.is_err());
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_execute_on_stopped_session_fails() {
        let manager = manager_with(FakeRuntime::new());
        let session = manager.create_session("claude").await.unwrap();
        manager.stop_session(&session.id).await.unwrap();
        assert!(manager.execute(&session.id, "hello").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_idle_sweeps_stale_sessions() {
        let manager = manager_with(FakeRuntime::new());
        let session = manager.create_session("claude").await.unwrap();

        // Backdate the session so the sweep sees it as idle.
        {
            let mut sessions = manager.sessions.write().await;
            if let Some(s) = sessions.get_mut(&session.id) {
                s.last_used = Utc::now() - Duration::hours(2);
            }
        }

        let swept = manager.cleanup_idle(Duration::hours(1)).await.unwrap();
        assert_eq!(swept, 1);
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_session_is_idempotent() {
        let manager = manager_with(FakeRuntime::new());
        let session = manager.create_session("claude").await.unwrap();
        manager.stop_session(&session.id).await.unwrap();
        manager.stop_session(&session.id).await.unwrap();
    }
}
