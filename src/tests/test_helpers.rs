//! Shared test doubles and fixtures for scheduler tests.

use crate::batch::{BatchManager, BatchManagerConfig, CreateBatchRequest};
use crate::container::AgentOutput;
use crate::models::{Batch, BatchStatus};
use crate::session::{Session, SessionBackend, SessionState};
use crate::store::MemoryStore;
use crate::{Result, VesselError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Session backend double. Echoes prompts, optionally failing prompts that
/// contain a marker substring, delaying executions, or refusing session
/// creation after a budget.
pub struct MockSessionBackend {
    next_id: AtomicUsize,
    sessions: Mutex<HashMap<String, Session>>,
    fail_substring: Mutex<Option<String>>,
    fail_message: Mutex<String>,
    exec_delay: Mutex<Option<Duration>>,
    create_budget: Mutex<Option<usize>>,
    pub exec_count: AtomicUsize,
    pub created_count: AtomicUsize,
    pub stopped_count: AtomicUsize,
}

impl Default for MockSessionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSessionBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
            fail_substring: Mutex::new(None),
            fail_message: Mutex::new("mock agent failure".to_string()),
            exec_delay: Mutex::new(None),
            create_budget: Mutex::new(None),
            exec_count: AtomicUsize::new(0),
            created_count: AtomicUsize::new(0),
            stopped_count: AtomicUsize::new(0),
        }
    }

    /// Prompts containing `marker` fail every attempt.
    pub fn fail_on(self, marker: &str) -> Self {
        *self.fail_substring.lock().unwrap() = Some(marker.to_string());
        self
    }

    /// Error text reported for failing prompts.
    pub fn with_fail_message(self, message: &str) -> Self {
        *self.fail_message.lock().unwrap() = message.to_string();
        self
    }

    pub fn with_exec_delay(self, delay: Duration) -> Self {
        *self.exec_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Allows only `n` successful session creations.
    pub fn with_create_budget(self, n: usize) -> Self {
        *self.create_budget.lock().unwrap() = Some(n);
        self
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.state == SessionState::Active)
            .count()
    }
}

#[async_trait]
impl SessionBackend for MockSessionBackend {
    async fn resolve(&self, agent_ref: &str) -> Result<()> {
        if agent_ref == "missing-agent" {
            return Err(VesselError::Validation(format!(
                "unknown agent reference: {agent_ref}"
            )));
        }
        Ok(())
    }

    async fn create_session(&self, agent_ref: &str) -> Result<Session> {
        {
            let mut budget = self.create_budget.lock().unwrap();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(VesselError::Session {
                        message: "mock session budget exhausted".to_string(),
                    });
                }
                *remaining -= 1;
            }
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created_count.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let session = Session {
            id: format!("mock-sess-{n}"),
            agent_ref: agent_ref.to_string(),
            container_id: format!("mock-ctr-{n}"),
            state: SessionState::Active,
            created_at: now,
            last_used: now,
        };
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    async fn execute(&self, session_id: &str, prompt: &str) -> Result<AgentOutput> {
        let delay = *self.exec_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.exec_count.fetch_add(1, Ordering::SeqCst);

        if self.get_session(session_id).await.is_none() {
            return Err(VesselError::NotFound(format!("session {session_id}")));
        }

        let marker = self.fail_substring.lock().unwrap().clone();
        if let Some(marker) = marker {
            if prompt.contains(&marker) {
                let message = self.fail_message.lock().unwrap().clone();
                return Err(VesselError::Session { message });
            }
        }

        Ok(AgentOutput {
            result: format!("echo: {prompt}"),
            is_error: false,
            duration_ms: None,
            num_turns: None,
            input_tokens: None,
            output_tokens: None,
        })
    }

    async fn stop_session(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            if session.state == SessionState::Active {
                session.state = SessionState::Stopped;
                self.stopped_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Installs a fmt subscriber for test diagnostics, honoring `RUST_LOG`.
/// Safe to call from every test; only the first call installs.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scheduler config tuned for fast tests.
pub fn fast_config() -> BatchManagerConfig {
    BatchManagerConfig {
        poll_interval: Duration::from_millis(10),
        progress_interval: Duration::from_millis(25),
        settle_delay: Duration::from_millis(10),
        recovery_interval: Duration::from_millis(50),
        ..BatchManagerConfig::default()
    }
}

pub fn test_manager(sessions: Arc<MockSessionBackend>) -> (BatchManager, Arc<MemoryStore>) {
    test_manager_with(sessions, fast_config())
}

pub fn test_manager_with(
    sessions: Arc<MockSessionBackend>,
    config: BatchManagerConfig,
) -> (BatchManager, Arc<MemoryStore>) {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let manager = BatchManager::new(store.clone(), sessions, None, None, config);
    (manager, store)
}

/// Builds a request with one task per value, substituting `{{.x}}`.
pub fn simple_request(name: &str, values: &[&str]) -> CreateBatchRequest {
    CreateBatchRequest {
        name: name.to_string(),
        user_id: "user1".to_string(),
        agent_ref: "claude".to_string(),
        prompt_template: "Say {{.x}}".to_string(),
        inputs: values
            .iter()
            .map(|v| {
                let mut input = HashMap::new();
                input.insert("x".to_string(), v.to_string());
                input
            })
            .collect(),
        concurrency: Some(2),
        timeout_secs: Some(5),
        max_retries: Some(0),
        auto_start: false,
    }
}

/// Polls until the batch reaches the wanted status, panicking after two
/// seconds.
pub async fn wait_for_status(
    manager: &BatchManager,
    batch_id: &str,
    status: BatchStatus,
) -> Batch {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let batch = manager.get_batch(batch_id).await.unwrap();
        if batch.status == status {
            return batch;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "batch {} never reached {:?} (currently {:?})",
                batch_id, status, batch.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
