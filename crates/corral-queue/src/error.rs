use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue name: {0:?}")]
    InvalidQueue(String),

    #[error("task {id} is not in flight on queue {queue}")]
    NotFound { queue: String, id: Uuid },

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("payload codec: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;
