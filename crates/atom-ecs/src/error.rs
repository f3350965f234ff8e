use thiserror::Error;

use crate::entity::Entity;
use crate::system::SystemId;

/// Errors raised synchronously by the World and the dependency graph.
///
/// These are programmer errors: they are returned to the caller of the
/// offending API and never swallowed. Failures inside a running system are
/// reported through [`crate::SystemFault`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EcsError {
    #[error("entity {0} is not valid (destroyed or never allocated)")]
    InvalidEntity(Entity),

    #[error("component {component} not found on entity {entity}")]
    ComponentNotFound {
        entity: Entity,
        component: &'static str,
    },

    #[error("component {component} on entity {entity} is already borrowed by this thread")]
    BorrowConflict {
        entity: Entity,
        component: &'static str,
    },

    #[error("system {0} is not registered")]
    UnknownSystem(SystemId),

    #[error("system {0} cannot depend on itself")]
    SelfDependency(SystemId),

    #[error("adding dependency {dependent} -> {dependency} would create a cycle: {}", path.join(" -> "))]
    CyclicDependency {
        dependent: SystemId,
        dependency: SystemId,
        /// Labels along the existing path from `dependency` back to `dependent`.
        path: Vec<String>,
    },
}

pub type EcsResult<T> = Result<T, EcsError>;
