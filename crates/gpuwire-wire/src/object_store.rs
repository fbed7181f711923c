use gpuwire_types::{ObjectHandle, ObjectId, NULL_OBJECT_ID};

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Client-side table of wire objects of one type.
///
/// Ids are dense and start at 1. A freed id is handed out again with the next
/// generation; once a slot's generation is saturated the id is retired for good.
#[derive(Debug)]
pub struct ObjectStore<T> {
    // Index 0 is the null slot and never holds a value.
    slots: Vec<Slot<T>>,
    free: Vec<ObjectHandle>,
}

impl<T> Default for ObjectStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectStore<T> {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                value: None,
            }],
            free: Vec::new(),
        }
    }

    /// Stores `value` in a fresh slot and returns the handle naming it. `None`
    /// once the id space is exhausted.
    pub fn reserve(&mut self, value: T) -> Option<ObjectHandle> {
        if let Some(handle) = self.free.pop() {
            let slot = &mut self.slots[handle.id as usize];
            slot.generation = handle.generation;
            slot.value = Some(value);
            return Some(handle);
        }
        let id = ObjectId::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Some(ObjectHandle::new(id, 0))
    }

    /// Removes the object named by `handle`. A stale or unknown handle is left
    /// alone and yields `None`.
    pub fn free(&mut self, handle: ObjectHandle) -> Option<T> {
        if handle.id == NULL_OBJECT_ID {
            return None;
        }
        let slot = self.slots.get_mut(handle.id as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        if let Some(next) = handle.generation.checked_add(1) {
            self.free.push(ObjectHandle::new(handle.id, next));
        }
        Some(value)
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&T> {
        let slot = self.slots.get(handle.id as usize)?;
        if handle.id == NULL_OBJECT_ID || slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        if handle.id == NULL_OBJECT_ID {
            return None;
        }
        let slot = self.slots.get_mut(handle.id as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Current handle for `id`, if the slot is occupied.
    pub fn handle_of(&self, id: ObjectId) -> Option<ObjectHandle> {
        let slot = self.slots.get(id as usize)?;
        (id != NULL_OBJECT_ID && slot.value.is_some())
            .then_some(ObjectHandle::new(id, slot.generation))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            let value = slot.value.as_ref()?;
            Some((ObjectHandle::new(id as ObjectId, slot.generation), value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(id, slot)| {
            let generation = slot.generation;
            let value = slot.value.as_mut()?;
            Some((ObjectHandle::new(id as ObjectId, generation), value))
        })
    }

    #[cfg(test)]
    fn saturate(&mut self, id: ObjectId) {
        self.slots[id as usize].generation = u32::MAX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_reservation_is_id_one() {
        let mut store = ObjectStore::new();
        assert_eq!(store.reserve("a"), Some(ObjectHandle::new(1, 0)));
        assert_eq!(store.reserve("b"), Some(ObjectHandle::new(2, 0)));
        assert_eq!(store.get(ObjectHandle::NULL), None);
        assert_eq!(store.get(ObjectHandle::new(0, 0)), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn freed_ids_come_back_with_the_next_generation() {
        let mut store = ObjectStore::new();
        let a = store.reserve(1).unwrap();
        assert_eq!(store.free(a), Some(1));
        assert_eq!(store.free(a), None);

        let b = store.reserve(2).unwrap();
        assert_eq!(b, ObjectHandle::new(a.id, 1));
        assert_eq!(store.get(a), None);
        assert_eq!(store.get(b), Some(&2));
        assert_eq!(store.free(a), None);
        assert_eq!(store.handle_of(a.id), Some(b));
    }

    #[test]
    fn saturated_generation_retires_the_id() {
        let mut store = ObjectStore::new();
        let a = store.reserve(()).unwrap();
        store.saturate(a.id);
        let saturated = ObjectHandle::new(a.id, u32::MAX);
        assert!(store.free(saturated).is_some());
        assert_eq!(store.reserve(()), Some(ObjectHandle::new(2, 0)));
        assert_eq!(store.handle_of(a.id), None);
    }

    #[test]
    fn iteration_skips_empty_slots() {
        let mut store = ObjectStore::new();
        let a = store.reserve(10).unwrap();
        let b = store.reserve(20).unwrap();
        store.free(a);
        for (_, v) in store.iter_mut() {
            *v += 1;
        }
        assert_eq!(store.iter().collect::<Vec<_>>(), vec![(b, &21)]);
    }

    proptest! {
        #[test]
        fn stale_handles_never_resolve(ops in proptest::collection::vec(any::<(bool, u8)>(), 1..200)) {
            let mut store = ObjectStore::new();
            let mut live: Vec<(ObjectHandle, u32)> = Vec::new();
            let mut dead: Vec<ObjectHandle> = Vec::new();
            let mut next = 0u32;
            for (reserve, pick) in ops {
                if reserve || live.is_empty() {
                    let handle = store.reserve(next).unwrap();
                    prop_assert!(handle.id != 0);
                    live.push((handle, next));
                    next += 1;
                } else {
                    let (handle, value) = live.swap_remove(pick as usize % live.len());
                    prop_assert_eq!(store.free(handle), Some(value));
                    dead.push(handle);
                }
                for (handle, value) in &live {
                    prop_assert_eq!(store.get(*handle), Some(value));
                }
                for handle in &dead {
                    prop_assert_eq!(store.get(*handle), None);
                }
            }
        }
    }
}
