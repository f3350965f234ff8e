use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::entity::Entity;

/// Capability trait for types that can be stored as ECS components.
///
/// Components are plain data. Implement the trait explicitly:
///
/// ```
/// use atom_ecs::{Component, Entity};
///
/// struct Health {
///     owner: Entity,
///     value: f32,
/// }
///
/// impl Component for Health {
///     fn owner(&self) -> Option<Entity> {
///         Some(self.owner)
///     }
/// }
/// ```
pub trait Component: Send + Sync + 'static {
    /// Back-reference to the entity this value was built for. The component
    /// does not own the entity; the World only uses this to flag values that
    /// get attached to a different entity.
    fn owner(&self) -> Option<Entity> {
        None
    }
}

/// Dense numeric id of a component type, assigned on first use in a World.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Registration record for a component type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub name: &'static str,
}

/// Strip the module path from a type name, keeping generic arguments.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

/// Sparse-set storage for a single component type. Provides O(1) insert/remove/lookup
/// and dense iteration.
pub struct SparseSet<T> {
    /// Maps entity index to dense index. `None` means the entity has no component.
    sparse: Vec<Option<usize>>,
    /// Packed component values.
    dense: Vec<T>,
    /// Entity indices corresponding to each dense slot.
    entities: Vec<u32>,
}

impl<T> SparseSet<T> {
    pub fn new() -> Self {
        Self {
            sparse: Vec::new(),
            dense: Vec::new(),
            entities: Vec::new(),
        }
    }

    /// Insert or replace a component for the given entity index. Returns the
    /// replaced value, if any.
    pub fn insert(&mut self, index: u32, value: T) -> Option<T> {
        let idx = index as usize;
        if idx >= self.sparse.len() {
            self.sparse.resize(idx + 1, None);
        }
        if let Some(slot) = self.sparse[idx] {
            Some(std::mem::replace(&mut self.dense[slot], value))
        } else {
            self.sparse[idx] = Some(self.dense.len());
            self.dense.push(value);
            self.entities.push(index);
            None
        }
    }

    fn slot_of(&self, index: u32) -> Option<usize> {
        self.sparse.get(index as usize).copied().flatten()
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        self.slot_of(index).map(|slot| &self.dense[slot])
    }

    /// Swap-remove the component of an entity index, returning the value.
    pub fn take(&mut self, index: u32) -> Option<T> {
        let slot = self.slot_of(index)?;
        self.sparse[index as usize] = None;

        let last = self.dense.len() - 1;
        if slot != last {
            self.entities.swap(slot, last);
            let moved = self.entities[slot];
            self.sparse[moved as usize] = Some(slot);
        }
        self.entities.pop();
        Some(self.dense.swap_remove(slot))
    }

    pub fn contains(&self, index: u32) -> bool {
        self.slot_of(index).is_some()
    }

    /// Iterate over all (entity_index, &component) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entities.iter().copied().zip(self.dense.iter())
    }

    /// The dense array of all entity indices that have this component.
    pub fn entity_indices(&self) -> &[u32] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }
}

impl<T> Default for SparseSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One component value behind its own lock. Borrows handed out by the World
/// lock the value, never the storage it lives in.
pub(crate) type ComponentCell<T> = Arc<RwLock<T>>;

/// Shared, independently locked storage for one component type. The storage
/// lock is only held inside World methods, never while caller code runs.
pub(crate) type ComponentStore<T> = Arc<RwLock<SparseSet<ComponentCell<T>>>>;

/// Type-erased view of a component storage, used for structural work that
/// does not need the concrete type (entity destruction, query filtering).
pub(crate) trait ErasedStorage: Send + Sync {
    fn remove(&self, index: u32) -> bool;
    fn has(&self, index: u32) -> bool;
    fn len(&self) -> usize;
    fn entity_indices(&self) -> Vec<u32>;
    fn clear(&self);
}

impl<T: Component> ErasedStorage for RwLock<SparseSet<ComponentCell<T>>> {
    fn remove(&self, index: u32) -> bool {
        // Drop the value after releasing the lock.
        let removed = self.write().take(index);
        removed.is_some()
    }

    fn has(&self, index: u32) -> bool {
        self.read().contains(index)
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn entity_indices(&self) -> Vec<u32> {
        self.read().entity_indices().to_vec()
    }

    fn clear(&self) {
        // Values are dropped after the write lock is released.
        let drained = std::mem::take(&mut *self.write());
        drop(drained);
    }
}

struct StorageEntry {
    info: ComponentInfo,
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn ErasedStorage>,
}

/// Maps component types to their numeric ids and storages.
#[derive(Default)]
pub(crate) struct ComponentRegistry {
    ids: HashMap<TypeId, ComponentId>,
    entries: Vec<StorageEntry>,
}

impl ComponentRegistry {
    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.ids.get(&TypeId::of::<T>()).copied()
    }

    /// Register `T` if needed and return its id.
    pub fn register<T: Component>(&mut self) -> ComponentId {
        self.storage_or_register::<T>();
        self.ids[&TypeId::of::<T>()]
    }

    /// The storage of `T`, created on first use.
    pub fn storage_or_register<T: Component>(&mut self) -> ComponentStore<T> {
        if let Some(store) = self.storage::<T>() {
            return store;
        }
        let id = ComponentId(self.entries.len() as u32);
        let store: ComponentStore<T> = Arc::new(RwLock::new(SparseSet::new()));
        let info = ComponentInfo {
            id,
            name: short_type_name(std::any::type_name::<T>()),
        };
        tracing::debug!("registered component {} as {}", info.name, id);
        self.entries.push(StorageEntry {
            info,
            typed: store.clone(),
            erased: store.clone(),
        });
        self.ids.insert(TypeId::of::<T>(), id);
        store
    }

    pub fn storage<T: Component>(&self) -> Option<ComponentStore<T>> {
        let id = self.id_of::<T>()?;
        self.entries[id.0 as usize]
            .typed
            .clone()
            .downcast::<RwLock<SparseSet<ComponentCell<T>>>>()
            .ok()
    }

    pub fn erased(&self, id: ComponentId) -> Option<Arc<dyn ErasedStorage>> {
        self.entries.get(id.0 as usize).map(|e| e.erased.clone())
    }

    pub fn all_erased(&self) -> Vec<Arc<dyn ErasedStorage>> {
        self.entries.iter().map(|e| e.erased.clone()).collect()
    }

    pub fn infos(&self) -> Vec<ComponentInfo> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Shared,
    Exclusive,
}

thread_local! {
    /// Component values borrowed by the current thread, keyed by cell address.
    static HELD: RefCell<HashMap<usize, (Access, usize)>> = RefCell::new(HashMap::new());
}

/// Entry in the current thread's borrow ledger, removed on drop.
///
/// Lock guards never leave the thread that took them, so the ledger knows
/// every value this thread holds. A borrow that would wait on the thread's
/// own lock is refused instead.
struct BorrowToken {
    key: usize,
}

impl BorrowToken {
    fn acquire<T>(cell: &ComponentCell<T>, access: Access) -> Option<Self> {
        let key = Arc::as_ptr(cell) as *const () as usize;
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            match held.get_mut(&key) {
                None => {
                    held.insert(key, (access, 1));
                }
                Some((Access::Shared, count)) if access == Access::Shared => *count += 1,
                Some(_) => return None,
            }
            Some(Self { key })
        })
    }
}

impl Drop for BorrowToken {
    fn drop(&mut self) {
        // The ledger may already be gone during thread teardown.
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some((_, count)) = held.get_mut(&self.key) {
                *count -= 1;
                if *count == 0 {
                    held.remove(&self.key);
                }
            }
        });
    }
}

/// Shared borrow of a component value.
///
/// Holds a read lock on this one value until dropped. Other components,
/// including other values of `T`, stay fully accessible.
pub struct ComponentRef<T: Component> {
    guard: ArcRwLockReadGuard<RawRwLock, T>,
    _token: BorrowToken,
}

impl<T: Component> ComponentRef<T> {
    /// `None` if this thread already borrows the value exclusively.
    pub(crate) fn acquire(cell: ComponentCell<T>) -> Option<Self> {
        let token = BorrowToken::acquire(&cell, Access::Shared)?;
        // Recursive: a queued writer on another thread must not block a
        // second shared borrow taken by this thread.
        let guard = cell.read_arc_recursive();
        Some(Self {
            guard,
            _token: token,
        })
    }
}

impl<T: Component> Deref for ComponentRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: Component + fmt::Debug> fmt::Debug for ComponentRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Exclusive borrow of a component value. Writes go straight to the stored
/// value.
///
/// Holds the write lock on this one value until dropped.
pub struct ComponentMut<T: Component> {
    guard: ArcRwLockWriteGuard<RawRwLock, T>,
    _token: BorrowToken,
}

impl<T: Component> ComponentMut<T> {
    /// `None` if this thread already borrows the value.
    pub(crate) fn acquire(cell: ComponentCell<T>) -> Option<Self> {
        let token = BorrowToken::acquire(&cell, Access::Exclusive)?;
        let guard = cell.write_arc();
        Some(Self {
            guard,
            _token: token,
        })
    }
}

impl<T: Component> Deref for ComponentMut<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: Component> DerefMut for ComponentMut<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: Component + fmt::Debug> fmt::Debug for ComponentMut<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u8);
    impl Component for Marker {}

    #[test]
    fn insert_and_get() {
        let mut set = SparseSet::new();
        set.insert(5, 42i32);
        assert_eq!(set.get(5), Some(&42));
        assert_eq!(set.get(0), None);
    }

    #[test]
    fn overwrite_keeps_single_slot() {
        let mut set = SparseSet::new();
        assert_eq!(set.insert(0, 1i32), None);
        assert_eq!(set.insert(0, 2), Some(1));
        assert_eq!(set.get(0), Some(&2));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn take_swaps_last_into_hole() {
        let mut set = SparseSet::new();
        set.insert(0, 'a');
        set.insert(1, 'b');
        set.insert(2, 'c');
        assert_eq!(set.take(0), Some('a'));
        assert_eq!(set.get(0), None);
        assert_eq!(set.get(1), Some(&'b'));
        assert_eq!(set.get(2), Some(&'c'));
        assert_eq!(set.entity_indices(), &[2, 1]);
        assert_eq!(set.take(0), None);
    }

    #[test]
    fn short_names() {
        assert_eq!(short_type_name("a::b::Position"), "Position");
        assert_eq!(short_type_name("Position"), "Position");
        assert_eq!(short_type_name("a::Wrapper<b::Inner>"), "Wrapper<b::Inner>");
    }

    #[test]
    fn registry_assigns_dense_ids() {
        let mut registry = ComponentRegistry::default();
        let a = registry.register::<Marker>();
        assert_eq!(registry.register::<Marker>(), a);
        assert_eq!(a.index(), 0);
        assert_eq!(registry.infos()[0].name, "Marker");
        assert!(registry.storage::<Marker>().is_some());
    }

    fn cell(value: Marker) -> ComponentCell<Marker> {
        Arc::new(RwLock::new(value))
    }

    #[test]
    fn guards_point_into_the_live_value() {
        let value = cell(Marker(1));
        {
            let mut borrow = ComponentMut::acquire(value.clone()).unwrap();
            borrow.0 = 9;
        }
        assert_eq!(*ComponentRef::acquire(value).unwrap(), Marker(9));
    }

    #[test]
    fn shared_borrows_nest_on_one_thread() {
        let value = cell(Marker(1));
        let first = ComponentRef::acquire(value.clone()).unwrap();
        let second = ComponentRef::acquire(value.clone()).unwrap();
        assert_eq!(first.0 + second.0, 2);
        assert!(ComponentMut::acquire(value.clone()).is_none());
        drop((first, second));
        assert!(ComponentMut::acquire(value).is_some());
    }

    #[test]
    fn exclusive_borrow_refuses_reentry() {
        let value = cell(Marker(1));
        let held = ComponentMut::acquire(value.clone()).unwrap();
        assert!(ComponentRef::acquire(value.clone()).is_none());
        assert!(ComponentMut::acquire(value.clone()).is_none());
        // Other values are unaffected.
        assert!(ComponentMut::acquire(cell(Marker(2))).is_some());
        drop(held);
        assert!(ComponentRef::acquire(value).is_some());
    }

    #[test]
    fn other_threads_wait_instead_of_failing() {
        let value = cell(Marker(0));
        let held = ComponentMut::acquire(value.clone()).unwrap();
        let reader = {
            let value = value.clone();
            std::thread::spawn(move || ComponentRef::acquire(value).map(|v| v.0))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(held);
        assert_eq!(reader.join().unwrap(), Some(0));
    }

    #[test]
    fn erased_remove_has_and_clear() {
        let store: ComponentStore<Marker> = Arc::new(RwLock::new(SparseSet::new()));
        store.write().insert(1, cell(Marker(0)));
        store.write().insert(4, cell(Marker(1)));
        let erased: Arc<dyn ErasedStorage> = store;
        assert!(erased.has(1));
        assert!(erased.remove(1));
        assert!(!erased.remove(1));
        assert_eq!(erased.entity_indices(), vec![4]);
        erased.clear();
        assert_eq!(erased.len(), 0);
        assert!(!erased.has(4));
    }
}
