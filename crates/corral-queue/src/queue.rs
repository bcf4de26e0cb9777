//! Typed facade over a [`Broker`].

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use corral_core::SharedClock;

use crate::broker::{Broker, QueueStats};
use crate::error::{QueueError, QueueResult};

/// A unit of work as the broker sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub enqueued_at_ms: u64,
    /// Deliveries so far, including the current one.
    pub attempt: u32,
}

/// A claimed task with its decoded body.
#[derive(Debug, Clone)]
pub struct Task<T> {
    pub id: Uuid,
    pub queue: String,
    pub attempt: u32,
    pub enqueued_at_ms: u64,
    pub body: T,
}

/// Queue names are short lowercase identifiers: `[a-z0-9._-]{1,64}`.
pub fn validate_queue_name(name: &str) -> QueueResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(QueueError::InvalidQueue(name.to_string()))
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    clock: SharedClock,
    visibility: Duration,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn Broker>, clock: SharedClock) -> Self {
        Self {
            broker,
            clock,
            visibility: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn enqueue<T: Serialize>(&self, queue: &str, body: &T) -> QueueResult<Uuid> {
        self.enqueue_raw(queue, serde_json::to_value(body)?).await
    }

    /// Enqueue an already-encoded payload (the REST API path).
    pub async fn enqueue_raw(&self, queue: &str, payload: serde_json::Value) -> QueueResult<Uuid> {
        validate_queue_name(queue)?;
        let envelope = TaskEnvelope {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload,
            enqueued_at_ms: self.clock.now_ms(),
            attempt: 0,
        };
        let id = envelope.id;
        self.broker.publish(envelope).await?;
        debug!(%queue, %id, "task enqueued");
        Ok(id)
    }

    /// Claim up to `max` tasks and decode them as `T`.
    ///
    /// Payloads that do not decode are dead-lettered rather than handed
    /// back, so one malformed task cannot block the queue.
    pub async fn consume<T: DeserializeOwned>(
        &self,
        queue: &str,
        max: usize,
    ) -> QueueResult<Vec<Task<T>>> {
        let mut out = Vec::new();
        for env in self.claim(queue, max).await? {
            match serde_json::from_value::<T>(env.payload.clone()) {
                Ok(body) => out.push(Task {
                    id: env.id,
                    queue: env.queue,
                    attempt: env.attempt,
                    enqueued_at_ms: env.enqueued_at_ms,
                    body,
                }),
                Err(e) => {
                    warn!(%queue, id = %env.id, error = %e, "undecodable task dead-lettered");
                    self.broker.nack(queue, env.id, false).await?;
                }
            }
        }
        Ok(out)
    }

    /// Claim raw envelopes.
    pub async fn claim(&self, queue: &str, max: usize) -> QueueResult<Vec<TaskEnvelope>> {
        validate_queue_name(queue)?;
        self.broker.fetch(queue, max, self.visibility).await
    }

    pub async fn ack(&self, queue: &str, id: Uuid) -> QueueResult<()> {
        validate_queue_name(queue)?;
        self.broker.ack(queue, id).await
    }

    /// Hand a task back for redelivery. Once it has been delivered
    /// `max_attempts` times it is dead-lettered instead.
    pub async fn nack(&self, queue: &str, id: Uuid, attempt: u32) -> QueueResult<()> {
        validate_queue_name(queue)?;
        let requeue = attempt < self.max_attempts;
        if !requeue {
            info!(%queue, %id, attempt, "task exhausted its attempts");
        }
        self.broker.nack(queue, id, requeue).await
    }

    pub async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        validate_queue_name(queue)?;
        self.broker.stats(queue).await
    }

    pub async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<TaskEnvelope>> {
        validate_queue_name(queue)?;
        self.broker.dead_letters(queue).await
    }
}
