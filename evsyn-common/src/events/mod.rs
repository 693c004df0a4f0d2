//! Event types for the evsyn event system
//!
//! Provides the service-wide lifecycle event definitions and the EventBus.
//! Per-run progress streams are separate (see evsyn-ingest `progress`); this
//! bus only carries coarse lifecycle notifications for dashboards.

mod run_types;

pub use run_types::OutcomeCounts;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Service lifecycle events
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceEvent {
    /// A pipeline configuration was registered
    PipelineCreated {
        pipeline_id: Uuid,
        project_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A pipeline was deleted or evicted
    PipelineDeleted {
        pipeline_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A run was accepted and its task spawned
    RunStarted {
        run_id: Uuid,
        pipeline_id: Uuid,
        study_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A run reached a terminal state
    RunFinished {
        run_id: Uuid,
        pipeline_id: Uuid,
        /// Terminal status in snake_case (e.g. "partial_success")
        status: String,
        counts: OutcomeCounts,
        /// Explanation for fatal failures
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Retention sweep removed records
    RunsEvicted {
        runs: usize,
        pipelines: usize,
        timestamp: DateTime<Utc>,
    },
}

impl ServiceEvent {
    /// Event type string used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            ServiceEvent::PipelineCreated { .. } => "PipelineCreated",
            ServiceEvent::PipelineDeleted { .. } => "PipelineDeleted",
            ServiceEvent::RunStarted { .. } => "RunStarted",
            ServiceEvent::RunFinished { .. } => "RunFinished",
            ServiceEvent::RunsEvicted { .. } => "RunsEvicted",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for service-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use evsyn_common::events::{EventBus, ServiceEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(ServiceEvent::PipelineDeleted {
///     pipeline_id: uuid::Uuid::new_v4(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ServiceEvent,
    ) -> Result<usize, broadcast::error::SendError<ServiceEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ServiceEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
