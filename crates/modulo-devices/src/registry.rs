/*!
 * Device registry for Modulo.
 *
 * Live module handles are stored in an arena and addressed by a
 * [`HandleKey`]. A separate sequence keeps the registration order,
 * newest first, which is the order lookups and sweeps walk.
 */
use std::collections::VecDeque;

use tracing::{debug, trace};

use modulo_core::types::DeviceId;

use crate::device::ModuleHandle;

/// Opaque reference to a handle in a [`DeviceRegistry`]
///
/// Keys are never reused: once a handle is unregistered its key stops
/// resolving even if the arena slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKey {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    handle: Option<ModuleHandle>,
}

/// Ordered collection of live module handles
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: VecDeque<HandleKey>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle at the head of the sequence
    pub fn register(&mut self, handle: ModuleHandle) -> HandleKey {
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.handle = Some(handle);
                HandleKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    handle: Some(handle),
                });
                HandleKey {
                    index,
                    generation: 0,
                }
            }
        };

        self.order.push_front(key);
        trace!(?key, "Registered module handle");
        key
    }

    /// Remove a handle, keeping the relative order of the others
    ///
    /// Every key appears in the sequence at most once; a duplicate would be
    /// a registration bug, so it is asserted rather than tolerated.
    pub fn unregister(&mut self, key: HandleKey) -> Option<ModuleHandle> {
        let handle = self.slot_mut(key)?.handle.take()?;

        let before = self.order.len();
        self.order.retain(|k| *k != key);
        debug_assert_eq!(before - self.order.len(), 1, "handle key registered more than once");

        self.free.push(key.index);
        debug!(
            device_type = handle.device_type(),
            device_id = %handle.device_id(),
            "Unregistered module handle"
        );
        Some(handle)
    }

    /// First handle, in sequence order, bound to `device_id`
    pub fn find_by_device_id(&self, device_id: DeviceId) -> Option<HandleKey> {
        self.iter()
            .find(|(_, handle)| handle.device_id() == device_id)
            .map(|(key, _)| key)
    }

    /// Whether a handle other than `except` is bound to `device_id`
    pub fn is_claimed_by_other(&self, device_id: DeviceId, except: HandleKey) -> bool {
        self.iter()
            .any(|(key, handle)| key != except && handle.device_id() == device_id)
    }

    /// Get a handle by key
    pub fn get(&self, key: HandleKey) -> Option<&ModuleHandle> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.handle.as_ref())
    }

    /// Get a mutable handle by key
    pub fn get_mut(&mut self, key: HandleKey) -> Option<&mut ModuleHandle> {
        self.slot_mut(key)?.handle.as_mut()
    }

    /// Whether the key refers to a live handle
    pub fn contains(&self, key: HandleKey) -> bool {
        self.get(key).is_some()
    }

    /// Live handles in sequence order
    pub fn iter(&self) -> impl Iterator<Item = (HandleKey, &ModuleHandle)> + '_ {
        self.order
            .iter()
            .filter_map(move |key| self.get(*key).map(|handle| (*key, handle)))
    }

    /// Snapshot of the keys in sequence order
    ///
    /// The snapshot stays valid to walk while handles are added or removed;
    /// removed keys simply stop resolving.
    pub fn keys(&self) -> Vec<HandleKey> {
        self.order.iter().copied().collect()
    }

    /// Visit every live handle once, in sequence order
    pub fn for_each<F>(&mut self, mut visitor: F)
    where
        F: FnMut(HandleKey, &mut ModuleHandle),
    {
        for key in self.keys() {
            if let Some(handle) = self.get_mut(key) {
                visitor(key, handle);
            }
        }
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no handles are registered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn slot_mut(&mut self, key: HandleKey) -> Option<&mut Slot> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Driver;

    fn handle(device_type: &str, id: u16) -> ModuleHandle {
        ModuleHandle::with_device_id(device_type, DeviceId::new(id), Driver::Generic)
    }

    fn ids(registry: &DeviceRegistry) -> Vec<u16> {
        registry.iter().map(|(_, h)| h.device_id().raw()).collect()
    }

    #[test]
    fn test_register_is_newest_first() {
        let mut registry = DeviceRegistry::new();
        registry.register(handle("a", 1));
        registry.register(handle("b", 2));
        registry.register(handle("c", 3));

        assert_eq!(ids(&registry), vec![3, 2, 1]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_unregister_preserves_order() {
        let mut registry = DeviceRegistry::new();
        registry.register(handle("a", 1));
        let middle = registry.register(handle("b", 2));
        registry.register(handle("c", 3));

        let removed = registry.unregister(middle).unwrap();
        assert_eq!(removed.device_id(), DeviceId::new(2));
        assert_eq!(ids(&registry), vec![3, 1]);
        assert!(!registry.contains(middle));
        assert!(registry.unregister(middle).is_none());
    }

    #[test]
    fn test_stale_key_does_not_resolve_after_slot_reuse() {
        let mut registry = DeviceRegistry::new();
        let old = registry.register(handle("a", 1));
        registry.unregister(old);

        let new = registry.register(handle("b", 2));
        assert_ne!(old, new);
        assert!(registry.get(old).is_none());
        assert_eq!(registry.get(new).unwrap().device_type(), "b");
    }

    #[test]
    fn test_find_by_device_id_returns_first_in_order() {
        let mut registry = DeviceRegistry::new();
        registry.register(handle("old", 5));
        let newer = registry.register(handle("new", 5));
        registry.register(handle("other", 6));

        assert_eq!(registry.find_by_device_id(DeviceId::new(5)), Some(newer));
        assert_eq!(registry.find_by_device_id(DeviceId::new(9)), None);
    }

    #[test]
    fn test_is_claimed_by_other() {
        let mut registry = DeviceRegistry::new();
        let a = registry.register(handle("a", 2));
        let b = registry.register(ModuleHandle::new("a", Driver::Generic));

        assert!(!registry.is_claimed_by_other(DeviceId::new(2), a));
        assert!(registry.is_claimed_by_other(DeviceId::new(2), b));
        assert!(!registry.is_claimed_by_other(DeviceId::new(3), b));
    }

    #[test]
    fn test_for_each_survives_removal_of_visited_handles() {
        let mut registry = DeviceRegistry::new();
        let keys: Vec<_> = (0..4).map(|i| registry.register(handle("a", i))).collect();

        let mut visited = Vec::new();
        for key in registry.keys() {
            visited.push(key);
            registry.unregister(key);
        }

        assert_eq!(visited.len(), keys.len());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_for_each_visits_each_once() {
        let mut registry = DeviceRegistry::new();
        registry.register(handle("a", 1));
        registry.register(handle("b", 2));

        let mut seen = Vec::new();
        registry.for_each(|_, h| seen.push(h.device_type().to_string()));
        assert_eq!(seen, vec!["b", "a"]);
    }
}
