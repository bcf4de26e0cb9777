//! Broker interface and the in-process implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use corral_core::SharedClock;

use crate::error::{QueueError, QueueResult};
use crate::queue::TaskEnvelope;

/// The operations the bridge needs from a message broker.
///
/// Delivery is at-least-once: a fetched task that is neither acked nor
/// nacked before its visibility timeout is delivered again.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, envelope: TaskEnvelope) -> QueueResult<()>;

    /// Claim up to `max` tasks. Each claimed task has its `attempt`
    /// incremented and stays invisible for `visibility`.
    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> QueueResult<Vec<TaskEnvelope>>;

    async fn ack(&self, queue: &str, id: Uuid) -> QueueResult<()>;

    /// Return an in-flight task. With `requeue` false it is dead-lettered.
    async fn nack(&self, queue: &str, id: Uuid, requeue: bool) -> QueueResult<()>;

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats>;

    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<TaskEnvelope>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub dead: usize,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskEnvelope>,
    in_flight: HashMap<Uuid, (TaskEnvelope, u64)>,
    dead: Vec<TaskEnvelope>,
}

impl QueueState {
    /// Put tasks whose visibility expired back at the front, oldest first.
    fn reclaim_expired(&mut self, now_ms: u64) {
        let mut expired: Vec<TaskEnvelope> = Vec::new();
        self.in_flight.retain(|_, (env, deadline)| {
            if *deadline <= now_ms {
                expired.push(env.clone());
                false
            } else {
                true
            }
        });
        expired.sort_by_key(|e| std::cmp::Reverse((e.enqueued_at_ms, e.id)));
        for env in expired {
            debug!(queue = %env.queue, id = %env.id, "visibility expired, redelivering");
            self.ready.push_front(env);
        }
    }
}

/// In-process broker for standalone deployments and tests.
pub struct MemoryBroker {
    clock: SharedClock,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryBroker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> QueueResult<R> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| QueueError::Unavailable("broker state poisoned".into()))?;
        let state = queues.entry(queue.to_string()).or_default();
        state.reclaim_expired(self.clock.now_ms());
        Ok(f(state))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, envelope: TaskEnvelope) -> QueueResult<()> {
        let queue = envelope.queue.clone();
        self.with_queue(&queue, |q| q.ready.push_back(envelope))
    }

    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> QueueResult<Vec<TaskEnvelope>> {
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(u64::try_from(visibility.as_millis()).unwrap_or(u64::MAX));
        self.with_queue(queue, |q| {
            let mut out = Vec::new();
            while out.len() < max {
                let Some(mut env) = q.ready.pop_front() else {
                    break;
                };
                env.attempt += 1;
                q.in_flight.insert(env.id, (env.clone(), deadline));
                out.push(env);
            }
            out
        })
    }

    async fn ack(&self, queue: &str, id: Uuid) -> QueueResult<()> {
        let removed = self.with_queue(queue, |q| q.in_flight.remove(&id).is_some())?;
        if removed {
            Ok(())
        } else {
            Err(QueueError::NotFound {
                queue: queue.to_string(),
                id,
            })
        }
    }

    async fn nack(&self, queue: &str, id: Uuid, requeue: bool) -> QueueResult<()> {
        let found = self.with_queue(queue, |q| match q.in_flight.remove(&id) {
            Some((env, _)) if requeue => {
                q.ready.push_back(env);
                true
            }
            Some((env, _)) => {
                q.dead.push(env);
                true
            }
            None => false,
        })?;
        if found {
            Ok(())
        } else {
            Err(QueueError::NotFound {
                queue: queue.to_string(),
                id,
            })
        }
    }

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.with_queue(queue, |q| QueueStats {
            ready: q.ready.len(),
            in_flight: q.in_flight.len(),
            dead: q.dead.len(),
        })
    }

    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<TaskEnvelope>> {
        self.with_queue(queue, |q| q.dead.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use corral_core::ManualClock;

    fn envelope(queue: &str, n: u64) -> TaskEnvelope {
        TaskEnvelope {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload: serde_json::json!({ "n": n }),
            enqueued_at_ms: n,
            attempt: 0,
        }
    }

    fn broker() -> (MemoryBroker, ManualClock) {
        let clock = ManualClock::new(1_000);
        (MemoryBroker::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn fetch_is_fifo_and_hides_claimed_tasks() {
        let (broker, _) = broker();
        for n in 0..3 {
            broker.publish(envelope("jobs", n)).await.unwrap();
        }
        let first = broker.fetch("jobs", 2, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].payload["n"], 0);
        assert_eq!(first[0].attempt, 1);

        let rest = broker.fetch("jobs", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload["n"], 2);

        let stats = broker.stats("jobs").await.unwrap();
        assert_eq!(stats, QueueStats { ready: 0, in_flight: 3, dead: 0 });
    }

    #[tokio::test]
    async fn unacked_tasks_come_back_after_visibility() {
        let (broker, clock) = broker();
        broker.publish(envelope("jobs", 0)).await.unwrap();
        let claimed = broker.fetch("jobs", 1, Duration::from_secs(5)).await.unwrap();
        assert!(broker.fetch("jobs", 1, Duration::from_secs(5)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(5));
        let again = broker.fetch("jobs", 1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(again[0].id, claimed[0].id);
        assert_eq!(again[0].attempt, 2);
    }

    #[tokio::test]
    async fn ack_and_nack_settle_in_flight_tasks() {
        let (broker, _) = broker();
        broker.publish(envelope("jobs", 0)).await.unwrap();
        broker.publish(envelope("jobs", 1)).await.unwrap();
        let claimed = broker.fetch("jobs", 2, Duration::from_secs(30)).await.unwrap();

        broker.ack("jobs", claimed[0].id).await.unwrap();
        assert!(matches!(
            broker.ack("jobs", claimed[0].id).await,
            Err(QueueError::NotFound { .. })
        ));

        broker.nack("jobs", claimed[1].id, false).await.unwrap();
        let dead = broker.dead_letters("jobs").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, claimed[1].id);
        assert_eq!(
            broker.stats("jobs").await.unwrap(),
            QueueStats { ready: 0, in_flight: 0, dead: 1 }
        );
    }

    #[tokio::test]
    async fn queues_are_independent() {
        let (broker, _) = broker();
        broker.publish(envelope("a", 0)).await.unwrap();
        assert!(broker.fetch("b", 5, Duration::from_secs(1)).await.unwrap().is_empty());
        assert_eq!(broker.fetch("a", 5, Duration::from_secs(1)).await.unwrap().len(), 1);
    }
}
