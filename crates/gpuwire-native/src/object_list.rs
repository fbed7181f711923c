//! Per-device registry of destroyable objects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use crate::sync::lock;

static NEXT_OBJECT_KEY: AtomicU64 = AtomicU64::new(1);

/// Bookkeeping every tracked object embeds.
#[derive(Debug)]
pub struct ApiObjectBase {
    key: u64,
    destroyed: AtomicBool,
}

impl ApiObjectBase {
    pub fn new() -> Self {
        Self {
            key: NEXT_OBJECT_KEY.fetch_add(1, Ordering::Relaxed),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Returns `true` for the one caller that moves the object to destroyed.
    fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }
}

impl Default for ApiObjectBase {
    fn default() -> Self {
        Self::new()
    }
}

pub trait ApiObject: Send + Sync {
    fn base(&self) -> &ApiObjectBase;

    /// Releases the object's resources. Called at most once.
    fn destroy_impl(&self);
}

#[derive(Default)]
pub struct ApiObjectList {
    objects: Mutex<HashMap<u64, Weak<dyn ApiObject>>>,
}

impl ApiObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, object: Weak<dyn ApiObject>) {
        if let Some(strong) = object.upgrade() {
            let key = strong.base().key;
            if !strong.base().is_destroyed() {
                lock(&self.objects).insert(key, object);
            }
        }
    }

    /// Returns `false` if the object was not tracked.
    pub fn untrack(&self, object: &dyn ApiObject) -> bool {
        lock(&self.objects).remove(&object.base().key).is_some()
    }

    /// Destroys `object` once; later calls, including nested ones from inside
    /// `destroy_impl`, are no-ops.
    pub fn destroy(&self, object: &dyn ApiObject) {
        if !object.base().mark_destroyed() {
            return;
        }
        self.untrack(object);
        object.destroy_impl();
    }

    /// Destroys every tracked object. The lock is not held while objects run
    /// their `destroy_impl`.
    pub fn destroy_all(&self) {
        let objects = std::mem::take(&mut *lock(&self.objects));
        for object in objects.into_values() {
            if let Some(object) = object.upgrade() {
                if object.base().mark_destroyed() {
                    object.destroy_impl();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.objects).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Tracked {
        base: ApiObjectBase,
        destroyed: AtomicUsize,
        list: Weak<ApiObjectList>,
        self_ref: Mutex<Weak<Tracked>>,
    }

    impl ApiObject for Tracked {
        fn base(&self) -> &ApiObjectBase {
            &self.base
        }

        fn destroy_impl(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            // Destroying again from inside destroy_impl must not recurse or deadlock.
            if let (Some(list), Some(me)) = (self.list.upgrade(), self.self_ref.lock().unwrap().upgrade()) {
                list.destroy(me.as_ref());
            }
        }
    }

    fn tracked(list: &Arc<ApiObjectList>) -> Arc<Tracked> {
        let p = Arc::new(Tracked {
            base: ApiObjectBase::new(),
            destroyed: AtomicUsize::new(0),
            list: Arc::downgrade(list),
            self_ref: Mutex::new(Weak::new()),
        });
        *p.self_ref.lock().unwrap() = Arc::downgrade(&p);
        let weak: Weak<dyn ApiObject> = Arc::downgrade(&p) as Weak<dyn ApiObject>;
        list.track(weak);
        p
    }

    #[test]
    fn destroy_is_idempotent_and_untracks() {
        let list = Arc::new(ApiObjectList::new());
        let p = tracked(&list);
        assert_eq!(list.len(), 1);
        list.destroy(p.as_ref());
        list.destroy(p.as_ref());
        assert_eq!(p.destroyed.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
        assert!(p.base().is_destroyed());
    }

    #[test]
    fn destroy_all_reaches_every_live_object_once() {
        let list = Arc::new(ApiObjectList::new());
        let a = tracked(&list);
        let b = tracked(&list);
        let dropped = tracked(&list);
        drop(dropped);
        list.destroy(b.as_ref());

        list.destroy_all();
        assert_eq!(a.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(b.destroyed.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn destroyed_objects_are_not_tracked_again() {
        let list = Arc::new(ApiObjectList::new());
        let p = tracked(&list);
        list.destroy(p.as_ref());
        list.track(Arc::downgrade(&p) as Weak<dyn ApiObject>);
        assert!(list.is_empty());
    }
}
