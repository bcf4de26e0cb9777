use thiserror::Error;

use corral_coord::CoordError;
use corral_lifecycle::LifecycleError;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

pub type HealthResult<T> = Result<T, HealthError>;
