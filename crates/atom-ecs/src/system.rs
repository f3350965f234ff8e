use std::fmt;

use crate::component::short_type_name;
use crate::world::World;

/// Handle of a system registered in a World or a dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub(crate) u32);

impl SystemId {
    /// Create a handle from a raw index (mainly for standalone graphs and tests).
    pub fn from_raw(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of per-frame logic operating on the world.
///
/// The World is passed into every call instead of being stored in the
/// system. Systems of the same execution level may run on different threads
/// at the same time, each with exclusive access to itself and shared access
/// to the World.
pub trait System: Send + 'static {
    /// Name used in logs, fault reports and graph diagnostics.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn update(&mut self, world: &World, delta_time: f32) -> anyhow::Result<()>;
}

/// Blanket implementation so closures can be used as systems.
impl<F> System for F
where
    F: FnMut(&World, f32) -> anyhow::Result<()> + Send + 'static,
{
    fn name(&self) -> &str {
        "closure"
    }

    fn update(&mut self, world: &World, delta_time: f32) -> anyhow::Result<()> {
        (self)(world, delta_time)
    }
}

/// A closure-backed system with a readable name.
pub struct FnSystem<F> {
    name: String,
    f: F,
}

impl<F> FnSystem<F>
where
    F: FnMut(&World, f32) -> anyhow::Result<()> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> System for FnSystem<F>
where
    F: FnMut(&World, f32) -> anyhow::Result<()> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&mut self, world: &World, delta_time: f32) -> anyhow::Result<()> {
        (self.f)(world, delta_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Counter {
        ticks: u32,
    }

    impl System for Counter {
        fn update(&mut self, _world: &World, _delta_time: f32) -> anyhow::Result<()> {
            self.ticks += 1;
            Ok(())
        }
    }

    #[test]
    fn default_name_is_short_type_name() {
        let counter = Counter { ticks: 0 };
        assert_eq!(counter.name(), "Counter");
    }

    #[test]
    fn closure_system() {
        let world = World::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let mut system = move |_: &World, dt: f32| {
            log.lock().unwrap().push(dt);
            Ok::<(), anyhow::Error>(())
        };
        system.update(&world, 0.5).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0.5]);
    }

    #[test]
    fn named_fn_system() {
        let world = World::new();
        let mut system = FnSystem::new("physics", |_: &World, _| anyhow::bail!("boom"));
        assert_eq!(system.name(), "physics");
        assert!(system.update(&world, 0.0).is_err());
    }
}
