use std::collections::HashMap;
use std::hash::Hash;

use gpuwire_types::{ObjectHandle, ObjectId, ObjectType, NULL_OBJECT_ID};

use crate::WireError;

/// Server-side record of one client object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownEntry<H> {
    /// Native object, `None` for error objects the implementation never created.
    pub handle: Option<H>,
    pub generation: u32,
    /// `false` for objects whose creation failed on the wire side.
    pub valid: bool,
    /// Device the object was created from, `0` for devices themselves.
    pub device: ObjectId,
}

/// Outcome of looking up an object id carried by a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution<H> {
    /// The id names a usable object, or is `0` where an object is optional.
    Success(Option<H>),
    /// The id names an object whose creation failed. The command still runs its
    /// error path.
    ErrorObject,
    /// The id names nothing. The stream cannot be trusted any more.
    FatalError,
}

/// Server-side table of client objects of one type, indexed by the ids the
/// client chose.
#[derive(Debug)]
pub struct KnownObjects<H> {
    object_type: ObjectType,
    max_object_id: ObjectId,
    entries: Vec<Option<KnownEntry<H>>>,
}

impl<H: Copy + Eq> KnownObjects<H> {
    pub fn new(object_type: ObjectType, max_object_id: ObjectId) -> Self {
        Self {
            object_type,
            max_object_id,
            entries: Vec::new(),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Whether `handle` may be allocated: id `0`, ids above the limit and slots
    /// that are still occupied are refused.
    pub fn check_allocation(&self, handle: ObjectHandle) -> Result<(), WireError> {
        if handle.id == NULL_OBJECT_ID
            || handle.id > self.max_object_id
            || self.get(handle.id).is_some()
        {
            return Err(WireError::InvalidAllocation {
                object_type: self.object_type,
                handle,
            });
        }
        Ok(())
    }

    /// Claims the slot named by `handle`, see [`Self::check_allocation`].
    pub fn allocate(
        &mut self,
        handle: ObjectHandle,
        device: ObjectId,
    ) -> Result<&mut KnownEntry<H>, WireError> {
        self.check_allocation(handle)?;
        let index = handle.id as usize;
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }
        Ok(self.entries[index].insert(KnownEntry {
            handle: None,
            generation: handle.generation,
            valid: false,
            device,
        }))
    }

    pub fn get(&self, id: ObjectId) -> Option<&KnownEntry<H>> {
        self.entries.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut KnownEntry<H>> {
        self.entries.get_mut(id as usize)?.as_mut()
    }

    /// Full handle for `id`, as return commands address objects.
    pub fn handle_of(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.get(id).map(|e| ObjectHandle::new(id, e.generation))
    }

    /// Resolves an argument that may be `0`.
    pub fn resolve_optional(&self, id: ObjectId) -> Resolution<H> {
        if id == NULL_OBJECT_ID {
            return Resolution::Success(None);
        }
        match self.get(id) {
            None => Resolution::FatalError,
            Some(entry) if !entry.valid => Resolution::ErrorObject,
            Some(entry) => match entry.handle {
                Some(handle) => Resolution::Success(Some(handle)),
                None => Resolution::ErrorObject,
            },
        }
    }

    /// Resolves an argument that must name an object.
    pub fn resolve(&self, id: ObjectId) -> Resolution<H> {
        if id == NULL_OBJECT_ID {
            return Resolution::FatalError;
        }
        self.resolve_optional(id)
    }

    pub fn free(&mut self, id: ObjectId) -> Option<KnownEntry<H>> {
        self.entries.get_mut(id as usize)?.take()
    }

    /// Ids of every object created from `device`.
    pub fn ids_created_by(&self, device: ObjectId) -> Vec<ObjectId> {
        self.iter()
            .filter(|(_, e)| e.device == device)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &KnownEntry<H>)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(id, e)| Some((id as ObjectId, e.as_ref()?)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the table, returning every entry.
    pub fn drain(&mut self) -> Vec<KnownEntry<H>> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Maps native handles back to wire ids for objects the implementation reports
/// events about.
#[derive(Debug)]
pub struct ObjectIdTable<H> {
    ids: HashMap<H, ObjectId>,
}

impl<H> Default for ObjectIdTable<H> {
    fn default() -> Self {
        Self {
            ids: HashMap::new(),
        }
    }
}

impl<H: Copy + Eq + Hash> ObjectIdTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, handle: H, id: ObjectId) {
        self.ids.insert(handle, id);
    }

    pub fn remove(&mut self, handle: H) {
        self.ids.remove(&handle);
    }

    pub fn get(&self, handle: H) -> Option<ObjectId> {
        self.ids.get(&handle).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> KnownObjects<u64> {
        KnownObjects::new(ObjectType::Buffer, 16)
    }

    #[test]
    fn allocation_rules() {
        let mut known = table();
        assert!(known.allocate(ObjectHandle::new(0, 0), 1).is_err());
        assert!(known.allocate(ObjectHandle::new(17, 0), 1).is_err());
        let entry = known.allocate(ObjectHandle::new(5, 2), 1).unwrap();
        entry.handle = Some(50);
        entry.valid = true;
        assert_eq!(
            known.allocate(ObjectHandle::new(5, 3), 1),
            Err(WireError::InvalidAllocation {
                object_type: ObjectType::Buffer,
                handle: ObjectHandle::new(5, 3)
            })
        );
        assert_eq!(known.handle_of(5), Some(ObjectHandle::new(5, 2)));
        assert_eq!(known.len(), 1);
    }

    #[test]
    fn resolution_outcomes() {
        let mut known = table();
        let entry = known.allocate(ObjectHandle::new(1, 0), 1).unwrap();
        entry.handle = Some(10);
        entry.valid = true;
        known.allocate(ObjectHandle::new(2, 0), 1).unwrap();

        assert_eq!(known.resolve(1), Resolution::Success(Some(10)));
        assert_eq!(known.resolve(2), Resolution::ErrorObject);
        assert_eq!(known.resolve(3), Resolution::FatalError);
        assert_eq!(known.resolve(99), Resolution::FatalError);
        assert_eq!(known.resolve(0), Resolution::FatalError);
        assert_eq!(known.resolve_optional(0), Resolution::Success(None));
        assert_eq!(known.resolve_optional(3), Resolution::FatalError);
    }

    #[test]
    fn freed_slots_can_be_reallocated() {
        let mut known = table();
        known.allocate(ObjectHandle::new(1, 0), 1).unwrap();
        known.allocate(ObjectHandle::new(2, 0), 7).unwrap();
        assert_eq!(known.ids_created_by(7), vec![2]);
        assert!(known.free(1).is_some());
        assert!(known.free(1).is_none());
        assert_eq!(known.resolve(1), Resolution::FatalError);
        known.allocate(ObjectHandle::new(1, 1), 1).unwrap();
        assert_eq!(known.handle_of(1), Some(ObjectHandle::new(1, 1)));
        assert_eq!(known.drain().len(), 2);
        assert!(known.is_empty());
    }

    #[test]
    fn reverse_table() {
        let mut ids = ObjectIdTable::new();
        ids.store(40u64, 3);
        assert_eq!(ids.get(40), Some(3));
        ids.remove(40);
        assert_eq!(ids.get(40), None);
        assert!(ids.is_empty());
    }
}
