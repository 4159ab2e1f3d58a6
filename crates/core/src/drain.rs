//! One-item-per-pass queue draining.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::pipeline::{Outcome, Pipeline};
use crate::queue::{Queue, QueueError};
use crate::types::WebhookPayload;

#[derive(Debug, Clone, PartialEq)]
pub enum DrainReport {
    /// Another pass is running, in this process or another.
    Busy,
    Empty,
    /// The item was handled (applied, acknowledged or rejected) and removed.
    Processed { key: String, outcome: Outcome },
    /// Processing failed; the item stays at the head of the queue.
    Retained {
        key: String,
        outcome: Outcome,
        attempts: u32,
    },
    DeadLettered { key: String, reason: String },
}

impl DrainReport {
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            DrainReport::Processed { outcome, .. } | DrainReport::Retained { outcome, .. } => {
                Some(outcome)
            }
            _ => None,
        }
    }
}

pub struct Drainer<Q> {
    queue: Q,
    pipeline: Arc<Pipeline>,
    max_attempts: u32,
    gate: Mutex<()>,
}

impl<Q: Queue> Drainer<Q> {
    /// `max_attempts` of zero retries a transiently failing item forever.
    pub fn new(queue: Q, pipeline: Arc<Pipeline>, max_attempts: u32) -> Self {
        Self {
            queue,
            pipeline,
            max_attempts,
            gate: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Processes at most the oldest pending item.
    pub async fn drain_once(&self) -> Result<DrainReport, QueueError> {
        let Ok(_gate) = self.gate.try_lock() else {
            return Ok(DrainReport::Busy);
        };
        let Some(_lease) = self.queue.try_lease()? else {
            return Ok(DrainReport::Busy);
        };
        let Some(item) = self.queue.peek_oldest()? else {
            return Ok(DrainReport::Empty);
        };

        let payload = match WebhookPayload::from_slice(&item.payload) {
            Ok(payload) => payload,
            Err(err) => {
                let reason = format!("unreadable payload: {err}");
                error!(key = %item.key, %reason, "moving queue item to dead letters");
                self.queue.dead_letter(&item, &reason)?;
                return Ok(DrainReport::DeadLettered {
                    key: item.key,
                    reason,
                });
            }
        };

        let outcome = self.pipeline.process(&payload).await;

        if outcome.is_retryable() {
            let attempts = self.queue.record_failure(&item)?;
            if self.max_attempts > 0 && attempts >= self.max_attempts {
                let reason = format!("gave up after {attempts} attempts");
                error!(key = %item.key, attempts, "moving queue item to dead letters");
                self.queue.dead_letter(&item, &reason)?;
                return Ok(DrainReport::DeadLettered {
                    key: item.key,
                    reason,
                });
            }
            warn!(key = %item.key, attempts, "queue item kept for retry");
            return Ok(DrainReport::Retained {
                key: item.key,
                outcome,
                attempts,
            });
        }

        if let Outcome::Undeliverable(err) = &outcome {
            let reason = format!("crm rejected the event: {err}");
            error!(key = %item.key, %reason, "moving queue item to dead letters");
            self.queue.dead_letter(&item, &reason)?;
            return Ok(DrainReport::DeadLettered {
                key: item.key,
                reason,
            });
        }

        self.queue.remove(&item)?;
        info!(key = %item.key, "queue item processed");
        Ok(DrainReport::Processed {
            key: item.key,
            outcome,
        })
    }
}
