//! Error types for role assignment.

use corral_coord::CoordError;
use corral_core::RoleTag;
use corral_registry::RegistryError;
use thiserror::Error;

pub type AssignResult<T> = Result<T, AssignError>;

#[derive(Debug, Error)]
pub enum AssignError {
    /// Not enough eligible members; nothing was applied.
    #[error("topology infeasible: {role} needs {required} instances, only {available} placeable")]
    Infeasible {
        role: RoleTag,
        required: u32,
        available: u32,
    },

    #[error("unknown role: {0}")]
    UnknownRole(RoleTag),

    #[error("{role} requests {count} instances, below its quorum of {quorum}")]
    BelowQuorum { role: RoleTag, count: u32, quorum: u32 },

    #[error("{role} depends on {dependency}, which the topology does not request")]
    MissingDependency { role: RoleTag, dependency: RoleTag },

    #[error("assignment kept changing, gave up after {attempts} attempts")]
    AssignmentConflict { attempts: u32 },

    #[error("this controller is not the leader")]
    NotLeader,

    #[error("leadership lost while writing the assignment")]
    Cancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

impl AssignError {
    /// Business errors are reported without retry; the rest are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AssignmentConflict { .. } | Self::NotLeader | Self::Cancelled => true,
            Self::Registry(e) => e.is_transient(),
            Self::Coord(e) => e.is_transient(),
            Self::Infeasible { .. }
            | Self::UnknownRole(_)
            | Self::BelowQuorum { .. }
            | Self::MissingDependency { .. } => false,
        }
    }
}
