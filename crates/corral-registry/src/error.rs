//! Error types for the node registry.

use corral_coord::CoordError;
use corral_core::MemberId;
use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("member not found: {0}")]
    NotFound(MemberId),

    /// The cache lost its watch and has not resynced yet.
    #[error("member cache is stale, resync pending")]
    Stale,

    #[error("member record {0} kept changing, update abandoned")]
    Conflict(MemberId),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Stale | Self::Conflict(_) => true,
            Self::Coord(e) => e.is_transient(),
            Self::NotFound(_) => false,
        }
    }
}
