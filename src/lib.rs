//! # Vessel Core
//!
//! Vessel Core is the scheduling core of a container-isolated AI agent
//! execution platform. Callers submit natural-language prompts; the platform
//! drives an agent CLI inside sandboxed runtime containers and collects
//! structured output.
//!
//! ## Architecture
//!
//! The core consists of:
//! - **Batch Manager**: batch CRUD, worker pool, dispatcher, progress
//!   reporting, crash recovery, and event broadcast
//! - **Task Queue**: at-most-one-claim distribution with visibility timeout,
//!   retry, and dead-letter, either process-local or Redis-backed
//! - **Durable Store**: transactional persistence interface for batches and
//!   tasks, with an in-memory implementation for tests and single-node runs
//! - **Session Management**: container-backed agent sessions, one per worker
//!   for a batch, or long-lived for interactive use
//! - **Event Bus**: bounded, lossy fan-out of batch/worker/task events
//!
//! The HTTP API, relational store, container runtime driver, and per-adapter
//! command construction are external collaborators; this crate defines the
//! traits they implement and depends only on those.

/// Batch scheduling: manager, worker pool, dispatcher, progress reporter
pub mod batch;
/// System configuration
pub mod config;
/// System-wide constants and defaults
pub mod constants;
/// Container runtime and agent adapter interfaces
pub mod container;
/// Error types and handling
pub mod error;
/// Per-batch event fan-out
pub mod events;
/// Core data models
pub mod models;
/// Task distribution queue: local and Redis implementations
pub mod queue;
/// Session lifecycle for container-backed agents
pub mod session;
/// Durable persistence interface and in-memory store
pub mod store;
/// Prompt template rendering
pub mod template;

#[cfg(test)]
mod tests;

pub use error::{Result, VesselError};
