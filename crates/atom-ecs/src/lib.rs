//! Atom ECS - Entity Component System
//!
//! Entities are generational handles, components live in per-type sparse
//! sets, and systems are scheduled in dependency-ordered execution levels.
//! Every World operation takes `&self`, so a World can be shared between
//! threads behind an `Arc` while systems of the same level run in parallel.

mod component;
mod config;
mod entity;
mod error;
mod graph;
mod query;
mod schedule;
mod system;
mod world;

pub use component::{Component, ComponentId, ComponentInfo, ComponentMut, ComponentRef, SparseSet};
pub use config::WorldConfig;
pub use entity::{Entity, EntityAllocator};
pub use error::{EcsError, EcsResult};
pub use graph::{ExecutionLevels, GraphChange, SystemDependencyGraph};
pub use query::{ComponentSet, GroupedQuery, QueryEntity};
pub use schedule::{FrameReport, SystemFault};
pub use system::{FnSystem, System, SystemId};
pub use world::World;
