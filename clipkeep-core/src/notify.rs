//! In-process publish/subscribe channel for pipeline events.
//!
//! Subscribers receive events through bounded queues. A subscriber that falls
//! behind loses events instead of stalling the publisher; a subscriber whose
//! receiver was dropped is removed on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use crate::job::{FailureKind, JobStage, QualityHint};
use crate::library::Artifact;
use crate::lifecycle::DeletionReason;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Descriptions longer than this are cut before they are published.
pub const MAX_DESCRIPTION_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Progress,
    Completed,
    Failed,
    ArtifactDeleted,
    StatsChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::ArtifactDeleted => "artifact_deleted",
            EventKind::StatsChanged => "stats_changed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Completed | EventKind::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Job {
        job_id: i64,
        url: String,
        quality: QualityHint,
    },
    Stage {
        job_id: i64,
        stage: JobStage,
    },
    Completed {
        job_id: i64,
        artifact: Box<Artifact>,
        description: Option<String>,
    },
    Failed {
        job_id: i64,
        stage: JobStage,
        kind: FailureKind,
        message: String,
    },
    Deleted {
        artifact_id: String,
        reason: DeletionReason,
        size_bytes: u64,
    },
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub kind: EventKind,
    pub submitter: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl PipelineEvent {
    pub fn started(
        submitter: &str,
        job_id: i64,
        url: &str,
        quality: QualityHint,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EventKind::Started,
            submitter: submitter.to_string(),
            emitted_at: at,
            payload: EventPayload::Job {
                job_id,
                url: url.to_string(),
                quality,
            },
        }
    }

    pub fn progress(submitter: &str, job_id: i64, stage: JobStage, at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::Progress,
            submitter: submitter.to_string(),
            emitted_at: at,
            payload: EventPayload::Stage { job_id, stage },
        }
    }

    pub fn completed(
        job_id: i64,
        artifact: &Artifact,
        description: Option<&str>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EventKind::Completed,
            submitter: artifact.submitter.clone(),
            emitted_at: at,
            payload: EventPayload::Completed {
                job_id,
                artifact: Box::new(artifact.clone()),
                description: description.map(truncate_description),
            },
        }
    }

    pub fn failed(
        submitter: &str,
        job_id: i64,
        stage: JobStage,
        kind: FailureKind,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EventKind::Failed,
            submitter: submitter.to_string(),
            emitted_at: at,
            payload: EventPayload::Failed {
                job_id,
                stage,
                kind,
                message: message.into(),
            },
        }
    }

    pub fn artifact_deleted(artifact: &Artifact, reason: DeletionReason, at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::ArtifactDeleted,
            submitter: artifact.submitter.clone(),
            emitted_at: at,
            payload: EventPayload::Deleted {
                artifact_id: artifact.id.clone(),
                reason,
                size_bytes: artifact.size_bytes,
            },
        }
    }

    pub fn stats_changed(submitter: &str, at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::StatsChanged,
            submitter: submitter.to_string(),
            emitted_at: at,
            payload: EventPayload::None,
        }
    }

    pub fn job_id(&self) -> Option<i64> {
        match &self.payload {
            EventPayload::Job { job_id, .. }
            | EventPayload::Stage { job_id, .. }
            | EventPayload::Completed { job_id, .. }
            | EventPayload::Failed { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

fn truncate_description(text: &str) -> String {
    text.chars().take(MAX_DESCRIPTION_CHARS).collect()
}

/// Receiving half handed out by [`Notifier::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<PipelineEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.receiver.recv().await
    }

    /// Everything already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Debug)]
pub struct Notifier {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<PipelineEvent>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        Subscription { id, receiver }
    }

    /// Returns false when the id was not subscribed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Delivers the event to every subscriber and returns how many got it.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        subscribers.retain(|id, sender| match sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, kind = event.kind.as_str(), "subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        trace!(kind = event.kind.as_str(), delivered, "event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
