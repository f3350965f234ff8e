//! Atom Core - shared primitives for the Atom engine
//!
//! - Frame clock producing the per-frame delta time fed to the ECS scheduler
//! - Math types re-exported from glam

pub mod time;

pub use glam::{Vec2, Vec3};
pub use time::{ClockConfig, ClockError, FrameClock};
