//! Per-run progress fan-out
//!
//! The channel keeps the run's full event history and a broadcast sender for
//! live delivery. History append and broadcast happen under one lock, and a
//! subscription snapshots history and attaches its receiver under the same
//! lock, so a subscriber sees every event exactly once in sequence order.
//!
//! Each live receiver has a bounded buffer (`subscriber_buffer`). A slow
//! subscriber loses its oldest buffered events and is marked lossy; publish
//! never waits on subscribers.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{ProgressEvent, ProgressKind, RunStatus, StageKind, StudyDelta};

struct ChannelState {
    history: Vec<ProgressEvent>,
    /// None once the run is terminal
    sender: Option<broadcast::Sender<ProgressEvent>>,
}

pub struct ProgressChannel {
    run_id: Uuid,
    state: Mutex<ChannelState>,
}

impl ProgressChannel {
    pub fn new(run_id: Uuid, subscriber_buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(subscriber_buffer.max(1));
        Self {
            run_id,
            state: Mutex::new(ChannelState {
                history: Vec::new(),
                sender: Some(sender),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append to history and fan out to live subscribers
    pub fn publish(&self, event: ProgressEvent) {
        let mut state = self.lock();
        if let Some(sender) = &state.sender {
            // Err only means nobody is listening right now
            let _ = sender.send(event.clone());
        }
        state.history.push(event);
    }

    /// Stop live delivery; subscribers drain what they hold and then end
    pub fn close(&self) {
        let mut state = self.lock();
        if state.sender.take().is_some() {
            debug!(run_id = %self.run_id, events = state.history.len(), "Progress channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().sender.is_none()
    }

    pub fn history(&self) -> Vec<ProgressEvent> {
        self.lock().history.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .sender
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// History so far, followed by live events until the run is terminal
    pub fn subscribe(&self) -> ProgressSubscription {
        let state = self.lock();
        ProgressSubscription {
            run_id: self.run_id,
            backlog: state.history.iter().cloned().collect(),
            live: state.sender.as_ref().map(|sender| sender.subscribe()),
            lossy: false,
            dropped: 0,
        }
    }
}

/// Item delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event(ProgressEvent),
    /// This many events were dropped for this subscriber
    Lagged(u64),
}

pub struct ProgressSubscription {
    run_id: Uuid,
    backlog: VecDeque<ProgressEvent>,
    live: Option<broadcast::Receiver<ProgressEvent>>,
    lossy: bool,
    dropped: u64,
}

impl ProgressSubscription {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next item, or None once the run is terminal and everything was delivered
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(SubscriptionItem::Event(event));
        }

        let receiver = self.live.as_mut()?;
        match receiver.recv().await {
            Ok(event) => Some(SubscriptionItem::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                self.lossy = true;
                self.dropped += skipped;
                debug!(run_id = %self.run_id, skipped, "Progress subscriber lagged");
                Some(SubscriptionItem::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.live = None;
                None
            }
        }
    }

    /// Next event, skipping lag notices
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.recv().await? {
                SubscriptionItem::Event(event) => return Some(event),
                SubscriptionItem::Lagged(_) => continue,
            }
        }
    }

    /// True once any event was dropped for this subscriber
    pub fn is_lossy(&self) -> bool {
        self.lossy
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Sequence and percent bookkeeping for one run
///
/// Percent is derived from stage position plus the share of the current
/// stage's calls that have completed, and is clamped so it never decreases.
pub struct ProgressTracker {
    run_id: Uuid,
    channel: Arc<ProgressChannel>,
    sequence: u64,
    total_stages: usize,
    completed_stages: usize,
    stage_calls: usize,
    stage_done: usize,
    percent: u8,
}

impl ProgressTracker {
    pub fn new(channel: Arc<ProgressChannel>, total_stages: usize) -> Self {
        Self {
            run_id: channel.run_id(),
            channel,
            sequence: 0,
            total_stages: total_stages.max(1),
            completed_stages: 0,
            stage_calls: 0,
            stage_done: 0,
            percent: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn recompute(&mut self) -> u8 {
        let in_stage = if self.stage_calls > 0 {
            self.stage_done.min(self.stage_calls) as f64 / self.stage_calls as f64
        } else {
            0.0
        };
        let raw = ((self.completed_stages as f64 + in_stage) / self.total_stages as f64) * 100.0;
        let raw = raw.floor().clamp(0.0, 100.0) as u8;
        self.percent = self.percent.max(raw);
        self.percent
    }

    fn emit(
        &mut self,
        stage: Option<StageKind>,
        kind: ProgressKind,
        delta: Option<StudyDelta>,
        status: Option<RunStatus>,
    ) -> ProgressEvent {
        self.sequence += 1;
        let event = ProgressEvent {
            run_id: self.run_id,
            sequence: self.sequence,
            stage,
            kind,
            percent: self.percent,
            delta,
            status,
            emitted_at: Utc::now(),
        };
        self.channel.publish(event.clone());
        event
    }

    pub fn stage_started(&mut self, stage: StageKind, expected_calls: usize) -> ProgressEvent {
        self.stage_calls = expected_calls;
        self.stage_done = 0;
        self.recompute();
        self.emit(Some(stage), ProgressKind::StageStarted, None, None)
    }

    pub fn study_completed(&mut self, stage: StageKind, delta: StudyDelta) -> ProgressEvent {
        self.stage_done += 1;
        self.recompute();
        self.emit(Some(stage), ProgressKind::StudyCompleted, Some(delta), None)
    }

    pub fn stage_completed(&mut self, stage: StageKind) -> ProgressEvent {
        self.completed_stages += 1;
        self.stage_calls = 0;
        self.stage_done = 0;
        self.recompute();
        self.emit(Some(stage), ProgressKind::StageCompleted, None, None)
    }

    pub fn run_finished(&mut self, status: RunStatus) -> ProgressEvent {
        self.percent = 100;
        self.emit(None, ProgressKind::RunFinished, None, Some(status))
    }
}
