//! Declarative entity queries.
//!
//! A query is evaluated in stages: structural match (`with` / `without`),
//! predicates, ordering, limit. The structural candidate set is cached and
//! reused until the World reports a structural change; predicates and
//! ordering are re-applied on every [`QueryEntity::build`] because
//! component values can change in place.
//!
//! Each `build` takes an id snapshot first and then evaluates every
//! candidate against the current storages. A candidate that dies or loses a
//! required component before its turn is skipped. No World lock is held
//! while user closures run; a [`QueryEntity::where_component`] predicate
//! holds a shared borrow of the one value it inspects.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::component::{Component, ComponentId, ErasedStorage};
use crate::entity::Entity;
use crate::world::World;

/// A set of component types given as a tuple, e.g. `(Position, Velocity)`.
pub trait ComponentSet {
    fn component_ids(world: &World) -> Vec<ComponentId>;
}

macro_rules! impl_component_set_tuple {
    ($($name:ident),+) => {
        impl<$($name: Component),+> ComponentSet for ($($name,)+) {
            fn component_ids(world: &World) -> Vec<ComponentId> {
                vec![$(world.component_id::<$name>()),+]
            }
        }
    };
}

impl_component_set_tuple!(A);
impl_component_set_tuple!(A, B);
impl_component_set_tuple!(A, B, C);
impl_component_set_tuple!(A, B, C, D);
impl_component_set_tuple!(A, B, C, D, E);
impl_component_set_tuple!(A, B, C, D, E, F);
impl_component_set_tuple!(A, B, C, D, E, F, G);
impl_component_set_tuple!(A, B, C, D, E, F, G, H);

type Filter<'w> = Box<dyn Fn(Entity) -> bool + 'w>;
type Sorter<'w> = Box<dyn Fn(&mut Vec<Entity>) + 'w>;

struct CachedCandidates {
    version: u64,
    entities: Vec<Entity>,
}

/// Query builder bound to a [`World`], created by
/// [`World::create_entity_query`].
pub struct QueryEntity<'w> {
    world: &'w World,
    required: Vec<ComponentId>,
    excluded: Vec<ComponentId>,
    filters: Vec<Filter<'w>>,
    order: Option<Sorter<'w>>,
    limit: Option<usize>,
    exact: bool,
    cache: Option<CachedCandidates>,
}

impl<'w> QueryEntity<'w> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            required: Vec::new(),
            excluded: Vec::new(),
            filters: Vec::new(),
            order: None,
            limit: None,
            exact: false,
            cache: None,
        }
    }

    /// Require a component.
    pub fn with<T: Component>(mut self) -> Self {
        let id = self.world.component_id::<T>();
        self.require(id);
        self
    }

    /// Require every component of a tuple.
    pub fn with_all<S: ComponentSet>(mut self) -> Self {
        for id in S::component_ids(self.world) {
            self.require(id);
        }
        self
    }

    /// Exclude entities carrying a component.
    pub fn without<T: Component>(mut self) -> Self {
        let id = self.world.component_id::<T>();
        if !self.excluded.contains(&id) {
            self.excluded.push(id);
            self.cache = None;
        }
        self
    }

    /// Only match entities whose component set is exactly the required one:
    /// any other component disqualifies.
    pub fn exact(mut self) -> Self {
        if !self.exact {
            self.exact = true;
            self.cache = None;
        }
        self
    }

    /// Keep entities for which `predicate` holds.
    pub fn filter(mut self, predicate: impl Fn(Entity) -> bool + 'w) -> Self {
        self.filters.push(Box::new(predicate));
        self
    }

    /// Keep entities whose `T` satisfies `predicate`. Entities without a `T`
    /// are dropped.
    pub fn where_component<T: Component>(mut self, predicate: impl Fn(&T) -> bool + 'w) -> Self {
        let world = self.world;
        self.filters.push(Box::new(move |entity| {
            world
                .with_component::<T, _>(entity, |value| predicate(value))
                .unwrap_or(false)
        }));
        self
    }

    /// Stable ascending sort by key.
    pub fn order_by<K: Ord + 'w>(mut self, key: impl Fn(Entity) -> K + 'w) -> Self {
        self.order = Some(Box::new(move |entities: &mut Vec<Entity>| {
            sort_by_key_stable(entities, &key, |a, b| a.cmp(b))
        }));
        self
    }

    /// Stable descending sort by key.
    pub fn order_by_descending<K: Ord + 'w>(mut self, key: impl Fn(Entity) -> K + 'w) -> Self {
        self.order = Some(Box::new(move |entities: &mut Vec<Entity>| {
            sort_by_key_stable(entities, &key, |a, b| b.cmp(a))
        }));
        self
    }

    /// Keep at most `count` entities, applied after ordering.
    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    /// Partition the result by key; see [`GroupedQuery::build_grouped`].
    pub fn group_by<K: Eq + Hash + Clone>(self, key: impl Fn(Entity) -> K + 'w) -> GroupedQuery<'w, K> {
        GroupedQuery {
            query: self,
            key: Box::new(key),
        }
    }

    /// Evaluate the query against the current world state.
    ///
    /// A query without any `with` clause matches nothing.
    pub fn build(&mut self) -> Vec<Entity> {
        if self.required.is_empty() {
            return Vec::new();
        }
        let candidates = self.candidates();
        let required = self.storages(&self.required);
        let excluded = self.excluded_storages();

        let mut result = Vec::with_capacity(candidates.len());
        for entity in candidates {
            let matches = self.world.is_entity_valid(entity)
                && required.iter().all(|s| s.has(entity.index))
                && !excluded.iter().any(|s| s.has(entity.index))
                && self.filters.iter().all(|f| f(entity));
            if matches {
                result.push(entity);
            }
        }

        if let Some(order) = &self.order {
            order(&mut result);
        }
        if let Some(limit) = self.limit {
            result.truncate(limit);
        }
        result
    }

    fn require(&mut self, id: ComponentId) {
        if !self.required.contains(&id) {
            self.required.push(id);
            self.cache = None;
        }
    }

    fn excluded_storages(&self) -> Vec<Arc<dyn ErasedStorage>> {
        if !self.exact {
            return self.storages(&self.excluded);
        }
        let others: Vec<ComponentId> = self
            .world
            .component_types()
            .into_iter()
            .map(|info| info.id)
            .filter(|id| !self.required.contains(id))
            .collect();
        self.storages(&others)
    }

    fn storages(&self, ids: &[ComponentId]) -> Vec<Arc<dyn ErasedStorage>> {
        ids.iter()
            .filter_map(|id| self.world.erased_storage(*id))
            .collect()
    }

    /// Structural matches in slot order, served from the cache while the
    /// world's structure is unchanged.
    fn candidates(&mut self) -> Vec<Entity> {
        // Read before scanning: a change racing the scan leaves the cache stale.
        let version = self.world.structure_version();
        if let Some(cache) = &self.cache {
            if cache.version == version {
                return cache.entities.clone();
            }
        }

        let required = self.storages(&self.required);
        let excluded = self.excluded_storages();
        let Some(base) = required.iter().min_by_key(|s| s.len()) else {
            return Vec::new();
        };

        let mut indices = base.entity_indices();
        indices.sort_unstable();
        let entities: Vec<Entity> = indices
            .into_iter()
            .filter(|&index| {
                required.iter().all(|s| s.has(index)) && !excluded.iter().any(|s| s.has(index))
            })
            .filter_map(|index| self.world.entity_at(index))
            .collect();

        tracing::trace!(
            "query rebuilt at version {}: {} candidates",
            version,
            entities.len()
        );
        self.cache = Some(CachedCandidates {
            version,
            entities: entities.clone(),
        });
        entities
    }
}

/// A query whose result is partitioned by a key.
pub struct GroupedQuery<'w, K> {
    query: QueryEntity<'w>,
    key: Box<dyn Fn(Entity) -> K + 'w>,
}

impl<'w, K: Eq + Hash + Clone> GroupedQuery<'w, K> {
    /// Run the full pipeline and split the result into groups. Groups appear
    /// in the order their first member does; members keep the pipeline order.
    pub fn build_grouped(&mut self) -> Vec<(K, Vec<Entity>)> {
        let entities = self.query.build();
        let mut positions: HashMap<K, usize> = HashMap::new();
        let mut groups: Vec<(K, Vec<Entity>)> = Vec::new();
        for entity in entities {
            let key = (self.key)(entity);
            match positions.get(&key) {
                Some(&i) => groups[i].1.push(entity),
                None => {
                    positions.insert(key.clone(), groups.len());
                    groups.push((key, vec![entity]));
                }
            }
        }
        groups
    }
}

fn sort_by_key_stable<K>(
    entities: &mut Vec<Entity>,
    key: &impl Fn(Entity) -> K,
    cmp: impl Fn(&K, &K) -> Ordering,
) {
    let mut keyed: Vec<(K, Entity)> = entities.iter().map(|&e| (key(e), e)).collect();
    keyed.sort_by(|a, b| cmp(&a.0, &b.0));
    entities.clear();
    entities.extend(keyed.into_iter().map(|(_, e)| e));
}
