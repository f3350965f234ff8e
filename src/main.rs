//! Atom - headless ECS demo host
//!
//! Spawns a field of bouncing bodies, wires a handful of dependent systems
//! and runs a fixed number of frames through the scheduler.

mod settings;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use atom_core::FrameClock;
use atom_ecs::{Component, Entity, FnSystem, World};
use glam::Vec2;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use settings::AtomSettings;

#[derive(Debug, Clone, Copy)]
struct Position(Vec2);
impl Component for Position {}

#[derive(Debug, Clone, Copy)]
struct Velocity(Vec2);
impl Component for Velocity {}

/// Keeps a body inside a square arena centered on the origin.
#[derive(Debug, Clone, Copy)]
struct Arena {
    half_extent: f32,
}
impl Component for Arena {}

#[derive(Debug, Clone, Copy)]
struct Lifetime {
    owner: Entity,
    remaining: f32,
}

impl Component for Lifetime {
    fn owner(&self) -> Option<Entity> {
        Some(self.owner)
    }
}

fn spawn_bodies(world: &World, count: usize) -> Result<()> {
    for i in 0..count {
        let angle = i as f32 * 0.618 * std::f32::consts::TAU;
        let entity = world.create_entity();
        world.add_component(entity, Position(Vec2::ZERO))?;
        world.add_component(entity, Velocity(Vec2::from_angle(angle) * (1.0 + i as f32 % 5.0)))?;
        world.add_component(entity, Arena { half_extent: 10.0 })?;
        if i % 4 == 0 {
            world.add_component(
                entity,
                Lifetime {
                    owner: entity,
                    remaining: 0.5 + i as f32 * 0.05,
                },
            )?;
        }
    }
    Ok(())
}

fn register_systems(world: &World) -> Result<()> {
    let integrate = world.add_system(FnSystem::new("integrate", |world: &World, dt| {
        for entity in world.entities_with::<(Position, Velocity)>() {
            let Some(Velocity(velocity)) = world.get_component_or_none::<Velocity>(entity) else {
                continue;
            };
            world.with_component_mut::<Position, _>(entity, |pos| pos.0 += velocity * dt);
        }
        Ok(())
    }));

    let bounce = world.add_system(FnSystem::new("bounce", |world: &World, _dt| {
        let mut query = world
            .create_entity_query()
            .with_all::<(Position, Velocity, Arena)>();
        for entity in query.build() {
            let (Some(pos), Some(arena)) = (
                world.get_component_or_none::<Position>(entity),
                world.get_component_or_none::<Arena>(entity),
            ) else {
                continue;
            };
            world.with_component_mut::<Velocity, _>(entity, |vel| {
                if pos.0.x.abs() > arena.half_extent {
                    vel.0.x = -vel.0.x.abs() * pos.0.x.signum();
                }
                if pos.0.y.abs() > arena.half_extent {
                    vel.0.y = -vel.0.y.abs() * pos.0.y.signum();
                }
            });
        }
        Ok(())
    }));

    let expire = world.add_system(FnSystem::new("expire", |world: &World, dt| {
        let mut expired = Vec::new();
        world.for_each_mut::<Lifetime>(|entity, lifetime| {
            lifetime.remaining -= dt;
            if lifetime.remaining <= 0.0 {
                expired.push(entity);
            }
        });
        // The Lifetime storage is unlocked again, so destruction is safe here.
        for entity in expired {
            world.destroy_entity(entity);
        }
        Ok(())
    }));

    let mut frame = 0u64;
    let report = world.add_system(FnSystem::new("report", move |world: &World, _dt| {
        frame += 1;
        if frame % 30 != 0 {
            return Ok(());
        }
        let fastest = world
            .create_entity_query()
            .with::<Velocity>()
            .order_by_descending(|e| {
                world
                    .get_component_or_none::<Velocity>(e)
                    .map_or(0, |v| (v.0.length() * 1000.0) as u32)
            })
            .limit(3)
            .build();
        let grouped = world
            .create_entity_query()
            .with::<Position>()
            .group_by(|e| world.has_component::<Lifetime>(e))
            .build_grouped();
        let mortal = grouped
            .iter()
            .find(|(mortal, _)| *mortal)
            .map_or(0, |(_, members)| members.len());
        info!(
            "frame {}: {} entities ({} mortal), fastest {:?}",
            frame,
            world.entity_count(),
            mortal,
            fastest
        );
        Ok(())
    }));

    world.add_system_dependency(bounce, integrate)?;
    world.add_system_dependency(report, bounce)?;
    world.add_system_dependency(report, expire)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = AtomSettings::load();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.demo.log_filter));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if std::env::args().any(|arg| arg == "--save-settings") {
        settings.save()?;
    }

    info!("Starting Atom demo...");

    let world = Arc::new(World::with_config(settings.world.clone()));
    let mut clock = FrameClock::new(settings.clock.clone())?;
    spawn_bodies(&world, settings.demo.bodies)?;
    register_systems(&world)?;
    info!("Execution plan:\n{}", world.dependency_graph_info());

    let started = Instant::now();
    let mut faults = 0;
    for _ in 0..settings.demo.frames {
        let dt = clock.tick(clock.config().fixed_timestep);
        let report = if settings.demo.parallel {
            world.update_async(dt).await
        } else {
            world.update(dt)
        };
        faults += report.faults.len();
    }

    if faults > 0 {
        warn!("{} system faults over {} frames", faults, clock.frame_count);
    }
    info!(
        "Simulated {:.2}s in {} frames ({:?} wall clock), {} entities left",
        clock.total_time,
        clock.frame_count,
        started.elapsed(),
        world.entity_count()
    );
    Ok(())
}
