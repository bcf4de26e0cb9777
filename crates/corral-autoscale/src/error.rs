use thiserror::Error;

use corral_coord::CoordError;
use corral_placement::AssignError;
use corral_registry::RegistryError;

#[derive(Debug, Error)]
pub enum ScalingError {
    #[error(transparent)]
    Assign(#[from] AssignError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

pub type ScalingResult<T> = Result<T, ScalingError>;
