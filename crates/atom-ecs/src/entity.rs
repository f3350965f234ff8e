use std::collections::VecDeque;
use std::fmt;

/// A generational entity handle: a dense slot index plus the generation the
/// slot had when the handle was issued.
///
/// A handle is only valid while its generation matches the one recorded in
/// the World. Once the entity is destroyed the handle stays invalid forever,
/// even after the slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Entity {
    /// Create an entity from raw parts (mainly for testing).
    pub fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The slot index of this entity.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The generation of this entity (incremented each time the slot is freed).
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Allocates and recycles entity slots with generational tracking.
///
/// Freeing a slot happens in two steps. [`retire`](Self::retire) kills the
/// handle and bumps the generation; [`recycle`](Self::recycle) later makes the
/// slot available to [`allocate`](Self::allocate). The World cleans component
/// storages in between, so a reused index never observes stale components.
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free_list: VecDeque<u32>,
    len: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            generations: Vec::with_capacity(capacity),
            alive: Vec::with_capacity(capacity),
            free_list: VecDeque::new(),
            len: 0,
        }
    }

    /// Allocate a new entity, reusing the oldest recycled slot if available.
    pub fn allocate(&mut self) -> Entity {
        self.len += 1;
        if let Some(index) = self.free_list.pop_front() {
            self.alive[index as usize] = true;
            Entity {
                index,
                generation: self.generations[index as usize],
            }
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.alive.push(true);
            Entity {
                index,
                generation: 0,
            }
        }
    }

    /// Mark an entity dead and bump its slot generation. Returns `false` if the
    /// handle was already invalid. The slot is not reusable until
    /// [`recycle`](Self::recycle) is called.
    pub fn retire(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let idx = entity.index as usize;
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].saturating_add(1);
        self.len -= 1;
        true
    }

    /// Make a retired slot available for reuse. A slot whose generation
    /// reached `u32::MAX` is never reused, so no old handle can match it
    /// again.
    pub fn recycle(&mut self, index: u32) {
        let idx = index as usize;
        debug_assert!(!self.alive[idx], "recycling a live slot");
        if self.generations[idx] == u32::MAX {
            tracing::debug!("entity slot {} exhausted its generations", index);
            return;
        }
        self.free_list.push_back(index);
    }

    /// Check if an entity is currently alive.
    pub fn is_alive(&self, entity: Entity) -> bool {
        let idx = entity.index as usize;
        idx < self.alive.len() && self.alive[idx] && self.generations[idx] == entity.generation
    }

    /// The live handle currently occupying `index`, if any.
    pub fn entity_at(&self, index: u32) -> Option<Entity> {
        let idx = index as usize;
        if idx < self.alive.len() && self.alive[idx] {
            Some(Entity {
                index,
                generation: self.generations[idx],
            })
        } else {
            None
        }
    }

    /// All live entities in slot order.
    pub fn alive_entities(&self) -> Vec<Entity> {
        (0..self.generations.len() as u32)
            .filter_map(|i| self.entity_at(i))
            .collect()
    }

    /// Number of currently alive entities.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no alive entities.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever handed out (alive, retired or free).
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}
