//! Frame scheduler.
//!
//! Systems run level by level, in the order computed by the
//! [`SystemDependencyGraph`]. [`World::update`] runs every system of a level
//! on the calling thread; [`World::update_async`] starts all systems of a
//! level on tokio's blocking pool and waits for all of them before the next
//! level starts. Either way a level is a barrier: nothing in level `k + 1`
//! starts before everything in level `k` has returned.
//!
//! A system that returns an error or panics is reported as a
//! [`SystemFault`] in the [`FrameReport`] and logged. The rest of the frame
//! still runs, and the faulted system is called again next frame.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::Instrument;

use crate::error::{EcsError, EcsResult};
use crate::graph::{ExecutionLevels, GraphChange, SystemDependencyGraph};
use crate::system::{System, SystemId};
use crate::world::World;

type SharedSystem = Arc<Mutex<Box<dyn System>>>;

struct RegisteredSystem {
    name: String,
    system: SharedSystem,
}

/// Systems owned by a World together with their dependency graph.
#[derive(Default)]
pub(crate) struct SystemTable {
    next_id: u32,
    graph: SystemDependencyGraph,
    systems: HashMap<SystemId, RegisteredSystem>,
}

#[derive(Clone)]
struct PlannedSystem {
    id: SystemId,
    name: String,
    system: SharedSystem,
}

impl SystemTable {
    fn plan(&self) -> Vec<Vec<PlannedSystem>> {
        self.graph
            .execution_levels()
            .iter()
            .map(|level| {
                level
                    .iter()
                    .filter_map(|id| {
                        self.systems.get(id).map(|entry| PlannedSystem {
                            id: *id,
                            name: entry.name.clone(),
                            system: entry.system.clone(),
                        })
                    })
                    .collect()
            })
            .collect()
    }
}

/// A system failure caught by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFault {
    pub system: SystemId,
    pub name: String,
    /// Execution level the system was running in.
    pub level: usize,
    pub message: String,
    /// Whether the system panicked rather than returning an error.
    pub panicked: bool,
}

impl fmt::Display for SystemFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.panicked { "panicked" } else { "failed" };
        write!(
            f,
            "system {} ({}) {} in level {}: {}",
            self.name, self.system, kind, self.level, self.message
        )
    }
}

/// Summary of one scheduled frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub levels: usize,
    pub systems_run: usize,
    pub faults: Vec<SystemFault>,
    pub elapsed: Duration,
}

impl FrameReport {
    /// True when no system faulted.
    pub fn is_ok(&self) -> bool {
        self.faults.is_empty()
    }

    fn record(&mut self, fault: Option<SystemFault>) {
        self.systems_run += 1;
        if let Some(fault) = fault {
            self.faults.push(fault);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl World {
    // ---- System registration ----

    /// Register a system and return its handle.
    pub fn add_system(&self, system: impl System) -> SystemId {
        self.add_boxed_system(Box::new(system))
    }

    pub fn add_boxed_system(&self, system: Box<dyn System>) -> SystemId {
        let mut table = self.systems.lock();
        let id = SystemId(table.next_id);
        table.next_id += 1;
        let name = system.name().to_string();
        table.graph.add_system(id, name.clone());
        tracing::debug!("added system {} ({})", name, id);
        table.systems.insert(
            id,
            RegisteredSystem {
                name,
                system: Arc::new(Mutex::new(system)),
            },
        );
        id
    }

    /// Declare that `dependent` must run after `dependency` in every frame.
    /// Both systems must already be registered.
    pub fn add_system_dependency(&self, dependent: SystemId, dependency: SystemId) -> EcsResult<()> {
        let mut table = self.systems.lock();
        for id in [dependent, dependency] {
            if !table.systems.contains_key(&id) {
                return Err(EcsError::UnknownSystem(id));
            }
        }
        table.graph.add_dependency(dependent, dependency)
    }

    /// Unregister a system. Systems that depended on it keep running after
    /// its own dependencies.
    pub fn remove_system(&self, id: SystemId) -> bool {
        let mut table = self.systems.lock();
        let Some(entry) = table.systems.remove(&id) else {
            return false;
        };
        table.graph.remove_system(id);
        tracing::debug!("removed system {} ({})", entry.name, id);
        true
    }

    pub fn system_count(&self) -> usize {
        self.systems.lock().systems.len()
    }

    pub fn system_name(&self, id: SystemId) -> Option<String> {
        self.systems.lock().systems.get(&id).map(|e| e.name.clone())
    }

    /// Execution levels of the registered systems.
    pub fn execution_levels(&self) -> ExecutionLevels {
        self.systems.lock().graph.execution_levels()
    }

    pub fn dependency_graph_info(&self) -> String {
        self.systems.lock().graph.dependency_graph_info()
    }

    /// Subscribe to dependency graph changes. The listener runs while the
    /// system table is locked and must not call back into system
    /// registration.
    pub fn on_graph_changed(&self, listener: impl Fn(&GraphChange) + Send + Sync + 'static) {
        self.systems.lock().graph.on_graph_changed(listener);
    }

    // ---- Frame execution ----

    /// Run one frame on the calling thread.
    pub fn update(&self, delta_time: f32) -> FrameReport {
        let started = Instant::now();
        let span = tracing::debug_span!("frame", delta_time);
        let _enter = span.enter();

        let plan = self.systems.lock().plan();
        let mut report = FrameReport {
            levels: plan.len(),
            ..FrameReport::default()
        };
        for (level, systems) in plan.iter().enumerate() {
            for planned in systems {
                if self.is_registered(planned.id) {
                    report.record(self.run_system(level, planned, delta_time));
                }
            }
        }
        report.elapsed = started.elapsed();
        report
    }

    /// Run one frame, executing the systems of each level concurrently.
    pub async fn update_async(self: &Arc<Self>, delta_time: f32) -> FrameReport {
        let span = tracing::debug_span!("frame", delta_time, parallel = true);
        self.run_levels_parallel(delta_time).instrument(span).await
    }

    async fn run_levels_parallel(self: &Arc<Self>, delta_time: f32) -> FrameReport {
        let started = Instant::now();
        let plan = self.systems.lock().plan();
        let mut report = FrameReport {
            levels: plan.len(),
            ..FrameReport::default()
        };

        for (level, systems) in plan.into_iter().enumerate() {
            let handles: Vec<_> = systems
                .into_iter()
                .filter(|planned| self.is_registered(planned.id))
                .map(|planned| {
                    let world = Arc::clone(self);
                    let id = planned.id;
                    let name = planned.name.clone();
                    let handle = tokio::task::spawn_blocking(move || {
                        world.run_system(level, &planned, delta_time)
                    });
                    (id, name, handle)
                })
                .collect();

            // Barrier: every task of this level finishes before the next starts.
            for (id, name, handle) in handles {
                match handle.await {
                    Ok(fault) => report.record(fault),
                    Err(err) if err.is_panic() && !self.config().isolate_panics => {
                        panic::resume_unwind(err.into_panic());
                    }
                    Err(err) => {
                        let fault = SystemFault {
                            system: id,
                            name,
                            level,
                            message: err.to_string(),
                            panicked: err.is_panic(),
                        };
                        tracing::error!("{}", fault);
                        report.record(Some(fault));
                    }
                }
            }
        }
        report.elapsed = started.elapsed();
        report
    }

    fn is_registered(&self, id: SystemId) -> bool {
        self.systems.lock().systems.contains_key(&id)
    }

    /// Run one system, turning errors and panics into a fault.
    fn run_system(&self, level: usize, planned: &PlannedSystem, delta_time: f32) -> Option<SystemFault> {
        let started = Instant::now();
        let outcome = {
            let mut system = planned.system.lock();
            panic::catch_unwind(AssertUnwindSafe(|| system.update(self, delta_time)))
        };
        let took = started.elapsed();

        if let Some(threshold) = self.config().slow_system_threshold() {
            if took > threshold {
                tracing::warn!(
                    "system {} took {:.2}ms (threshold {}ms)",
                    planned.name,
                    took.as_secs_f64() * 1000.0,
                    threshold.as_millis()
                );
            }
        }

        let (message, panicked) = match outcome {
            Ok(Ok(())) => return None,
            Ok(Err(err)) => (format!("{err:#}"), false),
            Err(payload) => {
                if !self.config().isolate_panics {
                    tracing::error!("system {} panicked: {}", planned.name, panic_message(&*payload));
                    panic::resume_unwind(payload);
                }
                (panic_message(&*payload), true)
            }
        };
        let fault = SystemFault {
            system: planned.id,
            name: planned.name.clone(),
            level,
            message,
            panicked,
        };
        tracing::error!("{}", fault);
        Some(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::FnSystem;
    use crate::Component;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder(name: &'static str, log: Log) -> impl System {
        FnSystem::new(name, move |_: &World, _| {
            log.lock().push(name);
            Ok(())
        })
    }

    #[derive(Debug, Clone)]
    struct Counter(u32);
    impl Component for Counter {}

    #[test]
    fn update_respects_dependencies() {
        let world = World::new();
        let log: Log = Arc::default();
        let s3 = world.add_system(recorder("third", log.clone()));
        let s1 = world.add_system(recorder("first", log.clone()));
        let s2 = world.add_system(recorder("second", log.clone()));
        world.add_system_dependency(s2, s1).unwrap();
        world.add_system_dependency(s3, s2).unwrap();

        let report = world.update(0.016);
        assert!(report.is_ok());
        assert_eq!(report.levels, 3);
        assert_eq!(report.systems_run, 3);
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn dependency_on_unregistered_system_fails() {
        let world = World::new();
        let log: Log = Arc::default();
        let s1 = world.add_system(recorder("first", log.clone()));
        let ghost = SystemId::from_raw(42);
        assert_eq!(
            world.add_system_dependency(s1, ghost),
            Err(EcsError::UnknownSystem(ghost))
        );
        assert_eq!(
            world.add_system_dependency(s1, s1),
            Err(EcsError::SelfDependency(s1))
        );
    }

    #[test]
    fn failing_system_does_not_stop_the_frame() {
        let world = World::new();
        let log: Log = Arc::default();
        let failing = world.add_system(FnSystem::new("failing", |_: &World, _| {
            anyhow::bail!("broken subsystem")
        }));
        world.add_system(recorder("sibling", log.clone()));
        let after = world.add_system(recorder("after", log.clone()));
        world.add_system_dependency(after, failing).unwrap();

        let report = world.update(0.016);
        assert_eq!(report.systems_run, 3);
        assert_eq!(report.faults.len(), 1);
        let fault = &report.faults[0];
        assert_eq!(fault.system, failing);
        assert_eq!(fault.name, "failing");
        assert!(!fault.panicked);
        assert!(fault.message.contains("broken subsystem"));
        assert_eq!(*log.lock(), vec!["sibling", "after"]);
    }

    #[test]
    fn panicking_system_is_isolated_and_retried_next_frame() {
        let world = World::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        world.add_system(FnSystem::new("panicky", move |_: &World, _| {
            counted.fetch_add(1, Ordering::SeqCst);
            panic!("kaboom");
        }));
        let log: Log = Arc::default();
        world.add_system(recorder("healthy", log.clone()));

        for _ in 0..2 {
            let report = world.update(0.016);
            assert_eq!(report.faults.len(), 1);
            assert!(report.faults[0].panicked);
            assert_eq!(report.faults[0].message, "kaboom");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn systems_mutate_components_through_the_world() {
        let world = World::new();
        let e = world.create_entity();
        world.add_component(e, Counter(0)).unwrap();
        world.add_system(|world: &World, _dt: f32| {
            world.for_each_mut::<Counter>(|_, c| c.0 += 1);
            Ok::<(), anyhow::Error>(())
        });
        world.update(0.016);
        world.update(0.016);
        assert_eq!(world.get_component_or_none::<Counter>(e).unwrap().0, 2);
    }

    #[test]
    fn removed_system_no_longer_runs() {
        let world = World::new();
        let log: Log = Arc::default();
        let s1 = world.add_system(recorder("first", log.clone()));
        let s2 = world.add_system(recorder("second", log.clone()));
        let s3 = world.add_system(recorder("third", log.clone()));
        world.add_system_dependency(s2, s1).unwrap();
        world.add_system_dependency(s3, s2).unwrap();

        assert!(world.remove_system(s2));
        assert_eq!(world.system_count(), 2);
        assert_eq!(&*world.execution_levels(), &[vec![s1], vec![s3]]);

        world.update(0.016);
        assert_eq!(*log.lock(), vec!["first", "third"]);
    }

    #[test]
    fn system_added_during_a_frame_runs_next_frame() {
        let world = World::new();
        let log: Log = Arc::default();
        let late = log.clone();
        let added = Arc::new(AtomicUsize::new(0));
        let flag = added.clone();
        world.add_system(FnSystem::new("spawner", move |world: &World, _| {
            if flag.fetch_add(1, Ordering::SeqCst) == 0 {
                world.add_system(recorder("late", late.clone()));
            }
            Ok(())
        }));

        assert_eq!(world.update(0.016).systems_run, 1);
        assert_eq!(world.update(0.016).systems_run, 2);
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn graph_info_names_registered_systems() {
        let world = World::new();
        let log: Log = Arc::default();
        let s1 = world.add_system(recorder("physics", log.clone()));
        let s2 = world.add_system(recorder("render", log.clone()));
        world.add_system_dependency(s2, s1).unwrap();
        let info = world.dependency_graph_info();
        assert!(info.contains("System: render"));
        assert!(info.contains("-> physics"));
        assert_eq!(world.system_name(s1).as_deref(), Some("physics"));
    }

    #[tokio::test]
    async fn update_async_respects_dependencies() {
        let world = Arc::new(World::new());
        let log: Log = Arc::default();
        let s1 = world.add_system(recorder("first", log.clone()));
        let s2 = world.add_system(recorder("second", log.clone()));
        let s3 = world.add_system(recorder("third", log.clone()));
        world.add_system_dependency(s2, s1).unwrap();
        world.add_system_dependency(s3, s2).unwrap();

        let report = world.update_async(0.1).await;
        assert!(report.is_ok());
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn update_async_isolates_faults() {
        let world = Arc::new(World::new());
        let log: Log = Arc::default();
        world.add_system(FnSystem::new("panicky", |_: &World, _| -> anyhow::Result<()> {
            panic!("async kaboom")
        }));
        world.add_system(recorder("sibling", log.clone()));

        let report = world.update_async(0.1).await;
        assert_eq!(report.systems_run, 2);
        assert_eq!(report.faults.len(), 1);
        assert!(report.faults[0].panicked);
        assert_eq!(*log.lock(), vec!["sibling"]);
    }
}
