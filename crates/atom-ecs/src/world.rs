use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::component::{
    short_type_name, Component, ComponentCell, ComponentId, ComponentInfo, ComponentMut,
    ComponentRef, ComponentRegistry, ComponentStore, ErasedStorage,
};
use crate::config::WorldConfig;
use crate::entity::{Entity, EntityAllocator};
use crate::error::{EcsError, EcsResult};
use crate::query::{ComponentSet, QueryEntity};
use crate::schedule::SystemTable;

/// The central ECS container and the single mutation authority for
/// entities and components.
///
/// Every method takes `&self`, so a World is shared (usually as
/// `Arc<World>`) between systems running concurrently in one execution
/// level.
///
/// # Borrows
///
/// [`ComponentRef`] and [`ComponentMut`] lock one component value, not its
/// storage. While one is alive the same thread may keep using the World
/// freely: read or write other components, add and remove components,
/// destroy entities (including the borrowed one; the borrow then points at
/// a detached value). The only refused case is a second borrow of a value
/// the thread already holds in a conflicting way: the `Option` accessors
/// return `None` and [`World::get_component`] returns
/// [`EcsError::BorrowConflict`]. Borrows of the same value from other
/// threads wait for each other.
pub struct World {
    config: WorldConfig,
    entities: RwLock<EntityAllocator>,
    components: RwLock<ComponentRegistry>,
    structure_version: AtomicU64,
    pub(crate) systems: Mutex<SystemTable>,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        Self {
            entities: RwLock::new(EntityAllocator::with_capacity(config.initial_entity_capacity)),
            components: RwLock::new(ComponentRegistry::default()),
            structure_version: AtomicU64::new(0),
            systems: Mutex::new(SystemTable::default()),
            config,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Counter bumped after every structural change (entity created or
    /// destroyed, component added or removed). Query caches compare against it.
    pub fn structure_version(&self) -> u64 {
        self.structure_version.load(Ordering::Acquire)
    }

    fn structure_changed(&self) {
        self.structure_version.fetch_add(1, Ordering::AcqRel);
    }

    // ---- Entity management ----

    /// Allocate a new entity, reusing a destroyed slot with a newer generation
    /// when one is free.
    pub fn create_entity(&self) -> Entity {
        let entity = self.entities.write().allocate();
        self.structure_changed();
        entity
    }

    /// Destroy an entity and every component attached to it. Returns `false`
    /// if the handle was already invalid.
    pub fn destroy_entity(&self, entity: Entity) -> bool {
        if !self.entities.write().retire(entity) {
            return false;
        }
        for storage in self.all_storages() {
            storage.remove(entity.index);
        }
        // Only now may the slot be handed out again.
        self.entities.write().recycle(entity.index);
        self.structure_changed();
        tracing::trace!("destroyed entity {}", entity);
        true
    }

    pub fn is_entity_valid(&self, entity: Entity) -> bool {
        self.entities.read().is_alive(entity)
    }

    /// Number of alive entities.
    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    /// Snapshot of all alive entities.
    pub fn entities(&self) -> Vec<Entity> {
        self.entities.read().alive_entities()
    }

    /// Destroy every entity and drop every component. Handles issued before
    /// stay invalid; registered component types are kept.
    pub fn clear(&self) {
        let retired: Vec<Entity> = {
            let mut entities = self.entities.write();
            let alive = entities.alive_entities();
            for entity in &alive {
                entities.retire(*entity);
            }
            alive
        };
        for storage in self.all_storages() {
            storage.clear();
        }
        {
            let mut entities = self.entities.write();
            for entity in &retired {
                entities.recycle(entity.index);
            }
        }
        self.structure_changed();
        tracing::debug!("cleared world ({} entities destroyed)", retired.len());
    }

    // ---- Component management ----

    fn storage<T: Component>(&self) -> Option<ComponentStore<T>> {
        self.components.read().storage::<T>()
    }

    fn storage_or_register<T: Component>(&self) -> ComponentStore<T> {
        if let Some(store) = self.storage::<T>() {
            return store;
        }
        self.components.write().storage_or_register::<T>()
    }

    fn all_storages(&self) -> Vec<Arc<dyn ErasedStorage>> {
        self.components.read().all_erased()
    }

    pub(crate) fn erased_storage(&self, id: ComponentId) -> Option<Arc<dyn ErasedStorage>> {
        self.components.read().erased(id)
    }

    pub(crate) fn entity_at(&self, index: u32) -> Option<Entity> {
        self.entities.read().entity_at(index)
    }

    /// The cell holding `entity`'s `T`, if the entity is alive and has one.
    fn cell<T: Component>(&self, entity: Entity) -> Option<ComponentCell<T>> {
        let store = self.storage::<T>()?;
        let cell = store.read().get(entity.index).cloned()?;
        // A slot is only reused after its storages were cleaned, so a live
        // handle here owns the cell fetched above.
        self.is_entity_valid(entity).then_some(cell)
    }

    /// Numeric id of a component type, registering it if needed.
    pub fn component_id<T: Component>(&self) -> ComponentId {
        if let Some(id) = self.components.read().id_of::<T>() {
            return id;
        }
        self.components.write().register::<T>()
    }

    /// All component types registered so far.
    pub fn component_types(&self) -> Vec<ComponentInfo> {
        self.components.read().infos()
    }

    /// Attach a component, replacing any existing value of the same type, and
    /// return a live borrow of the stored value.
    pub fn add_component<T: Component>(&self, entity: Entity, value: T) -> EcsResult<ComponentMut<T>> {
        if let Some(owner) = value.owner() {
            if owner != entity {
                tracing::warn!(
                    "component {} built for {} attached to {}",
                    std::any::type_name::<T>(),
                    owner,
                    entity
                );
            }
        }

        let cell: ComponentCell<T> = Arc::new(RwLock::new(value));
        let borrow = ComponentMut::acquire(cell.clone()).ok_or_else(|| conflict::<T>(entity))?;
        let store = self.storage_or_register::<T>();
        let replaced = {
            let mut set = store.write();
            // Checked under the storage lock: a concurrent destroy cannot clean
            // this storage until the insert below is done.
            if !self.is_entity_valid(entity) {
                return Err(EcsError::InvalidEntity(entity));
            }
            set.insert(entity.index, cell)
        };
        drop(replaced);
        self.structure_changed();
        Ok(borrow)
    }

    /// Shared borrow of a component, or `None` if the entity is invalid,
    /// lacks it, or this thread already borrows it mutably.
    pub fn component<T: Component>(&self, entity: Entity) -> Option<ComponentRef<T>> {
        ComponentRef::acquire(self.cell::<T>(entity)?)
    }

    /// Exclusive borrow of a component, or `None` if the entity is invalid,
    /// lacks it, or this thread already borrows it.
    pub fn component_mut<T: Component>(&self, entity: Entity) -> Option<ComponentMut<T>> {
        ComponentMut::acquire(self.cell::<T>(entity)?)
    }

    /// Exclusive borrow of a component, failing with `InvalidEntity`,
    /// `ComponentNotFound` or `BorrowConflict`.
    pub fn get_component<T: Component>(&self, entity: Entity) -> EcsResult<ComponentMut<T>> {
        let cell = self.cell::<T>(entity).ok_or_else(|| self.missing::<T>(entity))?;
        ComponentMut::acquire(cell).ok_or_else(|| conflict::<T>(entity))
    }

    /// Clone of a component, for optional-component logic. Components that
    /// are not `Clone` can be read through [`World::with_component`] or
    /// [`World::component`] instead.
    pub fn get_component_or_none<T: Component + Clone>(&self, entity: Entity) -> Option<T> {
        self.with_component(entity, T::clone)
    }

    /// Run `f` against a component without keeping a borrow around.
    pub fn with_component<T: Component, R>(&self, entity: Entity, f: impl FnOnce(&T) -> R) -> Option<R> {
        let value = self.component::<T>(entity)?;
        Some(f(&*value))
    }

    /// Run `f` against a mutable component without keeping a borrow around.
    pub fn with_component_mut<T: Component, R>(
        &self,
        entity: Entity,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut value = self.component_mut::<T>(entity)?;
        Some(f(&mut *value))
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        self.storage::<T>()
            .is_some_and(|store| store.read().contains(entity.index))
            && self.is_entity_valid(entity)
    }

    /// Detach a component. Returns `true` if it was present; absent
    /// components and invalid entities are a no-op.
    pub fn remove_component<T: Component>(&self, entity: Entity) -> bool {
        let Some(store) = self.storage::<T>() else {
            return false;
        };
        let removed = {
            let mut set = store.write();
            if !self.is_entity_valid(entity) {
                return false;
            }
            set.take(entity.index)
        };
        let found = removed.is_some();
        drop(removed);
        if found {
            self.structure_changed();
        }
        found
    }

    /// Number of entities carrying a `T`.
    pub fn component_count<T: Component>(&self) -> usize {
        self.storage::<T>().map_or(0, |store| store.read().len())
    }

    /// Visit every `T` in place, one value locked at a time. Values this
    /// thread already borrows are skipped, as are entities destroyed or
    /// stripped of `T` during the walk.
    pub fn for_each_mut<T: Component>(&self, mut f: impl FnMut(Entity, &mut T)) {
        let Some(store) = self.storage::<T>() else {
            return;
        };
        let snapshot: Vec<(u32, ComponentCell<T>)> = store
            .read()
            .iter()
            .map(|(index, cell)| (index, cell.clone()))
            .collect();
        for (index, cell) in snapshot {
            let Some(entity) = self.entity_at(index) else {
                continue;
            };
            let current = self.cell::<T>(entity);
            if !current.is_some_and(|c| Arc::ptr_eq(&c, &cell)) {
                continue;
            }
            match ComponentMut::acquire(cell) {
                Some(mut value) => f(entity, &mut *value),
                None => tracing::trace!("for_each_mut skipped borrowed {}", entity),
            }
        }
    }

    fn missing<T: Component>(&self, entity: Entity) -> EcsError {
        if self.is_entity_valid(entity) {
            EcsError::ComponentNotFound {
                entity,
                component: short_type_name(std::any::type_name::<T>()),
            }
        } else {
            EcsError::InvalidEntity(entity)
        }
    }

    // ---- Queries ----

    /// Start a query bound to this world.
    pub fn create_entity_query(&self) -> QueryEntity<'_> {
        QueryEntity::new(self)
    }

    /// Entities carrying every component of the tuple `S` (and possibly
    /// others).
    ///
    /// ```
    /// # use atom_ecs::{Component, World};
    /// # struct A; impl Component for A {}
    /// # struct B; impl Component for B {}
    /// let world = World::new();
    /// let e = world.create_entity();
    /// world.add_component(e, A).unwrap();
    /// world.add_component(e, B).unwrap();
    /// assert_eq!(world.entities_with::<(A, B)>(), vec![e]);
    /// ```
    pub fn entities_with<S: ComponentSet>(&self) -> Vec<Entity> {
        self.create_entity_query().with_all::<S>().build()
    }

    /// Entities whose component set is exactly `S`: every component of the
    /// tuple and no other.
    pub fn entities_with_exactly<S: ComponentSet>(&self) -> Vec<Entity> {
        self.create_entity_query().with_all::<S>().exact().build()
    }
}

fn conflict<T: Component>(entity: Entity) -> EcsError {
    EcsError::BorrowConflict {
        entity,
        component: short_type_name(std::any::type_name::<T>()),
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        tracing::debug!(
            "dropping world with {} entities and {} component types",
            self.entities.get_mut().len(),
            self.components.get_mut().infos().len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }
    impl Component for Position {}

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }
    impl Component for Velocity {}

    #[derive(Debug, Clone, PartialEq)]
    struct Tagged {
        owner: Entity,
    }
    impl Component for Tagged {
        fn owner(&self) -> Option<Entity> {
            Some(self.owner)
        }
    }

    #[test]
    fn create_and_destroy() {
        let world = World::new();
        let e = world.create_entity();
        assert!(world.is_entity_valid(e));
        assert_eq!(world.entity_count(), 1);
        assert!(world.destroy_entity(e));
        assert!(!world.is_entity_valid(e));
        assert!(!world.destroy_entity(e));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn add_get_remove_component() {
        let world = World::new();
        let e = world.create_entity();
        world.add_component(e, Position { x: 1.0, y: 2.0 }).unwrap();
        assert_eq!(
            world.get_component_or_none::<Position>(e),
            Some(Position { x: 1.0, y: 2.0 })
        );
        assert!(world.has_component::<Position>(e));
        assert!(world.remove_component::<Position>(e));
        assert!(!world.remove_component::<Position>(e));
        assert!(!world.has_component::<Position>(e));
    }

    #[test]
    fn mutation_through_returned_borrows_is_in_place() {
        let world = World::new();
        let e = world.create_entity();
        world.add_component(e, Position { x: 0.0, y: 0.0 }).unwrap().x = 3.0;
        world.get_component::<Position>(e).unwrap().y = 5.0;
        world.with_component_mut::<Position, _>(e, |p| p.x += 1.0);
        assert_eq!(
            *world.component::<Position>(e).unwrap(),
            Position { x: 4.0, y: 5.0 }
        );
    }

    #[test]
    fn add_component_replaces_existing() {
        let world = World::new();
        let e = world.create_entity();
        world.add_component(e, Velocity { dx: 1.0, dy: 0.0 }).unwrap();
        world.add_component(e, Velocity { dx: 2.0, dy: 0.0 }).unwrap();
        assert_eq!(world.component_count::<Velocity>(), 1);
        assert_eq!(world.get_component_or_none::<Velocity>(e).unwrap().dx, 2.0);
    }

    #[test]
    fn invalid_entity_is_rejected() {
        let world = World::new();
        let e = world.create_entity();
        world.destroy_entity(e);
        assert_eq!(
            world.add_component(e, Position { x: 0.0, y: 0.0 }).err(),
            Some(EcsError::InvalidEntity(e))
        );
        assert_eq!(
            world.get_component::<Position>(e).err(),
            Some(EcsError::InvalidEntity(e))
        );
    }

    #[test]
    fn missing_component_is_reported() {
        let world = World::new();
        let e = world.create_entity();
        let err = world.get_component::<Velocity>(e).err();
        assert_eq!(
            err,
            Some(EcsError::ComponentNotFound {
                entity: e,
                component: "Velocity"
            })
        );
        assert_eq!(world.get_component_or_none::<Velocity>(e), None);
    }

    #[test]
    fn destroy_removes_components_and_stale_handles_see_nothing() {
        let world = World::new();
        let old = world.create_entity();
        world.add_component(old, Position { x: 1.0, y: 0.0 }).unwrap();
        world.destroy_entity(old);
        assert_eq!(world.component_count::<Position>(), 0);

        let new = world.create_entity();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        world.add_component(new, Position { x: 9.0, y: 0.0 }).unwrap();

        assert!(world.component::<Position>(old).is_none());
        assert!(!world.has_component::<Position>(old));
        assert!(!world.remove_component::<Position>(old));
        assert!(world.has_component::<Position>(new));
    }

    #[test]
    fn structural_changes_bump_version() {
        let world = World::new();
        let v0 = world.structure_version();
        let e = world.create_entity();
        let v1 = world.structure_version();
        assert!(v1 > v0);

        world.add_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
        let v2 = world.structure_version();
        assert!(v2 > v1);

        // In-place writes are not structural.
        world.get_component::<Position>(e).unwrap().x = 1.0;
        assert_eq!(world.structure_version(), v2);

        world.remove_component::<Position>(e);
        assert!(world.structure_version() > v2);
    }

    #[test]
    fn for_each_mut_visits_alive_entities() {
        let world = World::new();
        for i in 0..4 {
            let e = world.create_entity();
            world.add_component(e, Velocity { dx: i as f32, dy: 0.0 }).unwrap();
        }
        world.for_each_mut::<Velocity>(|_, v| v.dy = v.dx * 2.0);
        let total: f32 = world
            .entities()
            .into_iter()
            .filter_map(|e| world.get_component_or_none::<Velocity>(e))
            .map(|v| v.dy)
            .sum();
        assert_eq!(total, 12.0);
    }

    #[test]
    fn owner_back_reference_is_kept() {
        let world = World::new();
        let e = world.create_entity();
        world.add_component(e, Tagged { owner: e }).unwrap();
        let tag = world.component::<Tagged>(e).unwrap();
        assert_eq!(tag.owner(), Some(e));
    }

    #[test]
    fn clear_invalidates_everything() {
        let world = World::new();
        let a = world.create_entity();
        let b = world.create_entity();
        world.add_component(a, Position { x: 0.0, y: 0.0 }).unwrap();
        world.clear();
        assert!(!world.is_entity_valid(a));
        assert!(!world.is_entity_valid(b));
        assert_eq!(world.component_count::<Position>(), 0);
        assert_eq!(world.component_types().len(), 1);
    }
}
