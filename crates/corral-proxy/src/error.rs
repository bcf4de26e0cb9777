use std::time::Duration;

use thiserror::Error;

use corral_coord::CoordError;

#[derive(Debug, Error)]
pub enum RoutingError {
    /// The rendered document failed validation; nothing was applied.
    #[error("config validation failed: {0}")]
    Validation(String),

    #[error("config apply failed: {0}")]
    Apply(String),

    #[error("config apply timed out after {0:?}")]
    ApplyTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

pub type RoutingResult<T> = Result<T, RoutingError>;
