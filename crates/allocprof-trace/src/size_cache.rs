//! Bounded cache from allocated type to measured shallow size.
//!
//! Measuring an object can be expensive, and every instance of a
//! non-array type has the same shallow size, so the first measurement per
//! type is reused. The cache is soft-bounded: once the approximate entry
//! count reaches capacity, the next insert drops each entry with
//! probability [`EVICT_PROBABILITY`]. Dropping at random keeps hot types
//! from being evicted and re-inserted in lockstep.

use std::any::{Any, TypeId};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::event::ObjectRef;

/// Fraction of entries removed by one eviction pass.
pub const EVICT_PROBABILITY: f64 = 0.1;

/// Host primitive that reports an object's size in bytes.
pub trait SizeMeasurer: Send + Sync {
    fn object_size(&self, obj: &ObjectRef) -> u64;
}

/// `size_of_val` on the referent: the shallow size of the managed value.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShallowSizeMeasurer;

impl SizeMeasurer for ShallowSizeMeasurer {
    fn object_size(&self, obj: &ObjectRef) -> u64 {
        std::mem::size_of_val::<dyn Any + Send + Sync>(&**obj) as u64
    }
}

/// Type-keyed size cache.
///
/// Keys default to [`TypeId`], which owns nothing, so a cached entry never
/// keeps a type or any instance alive.
#[derive(Debug)]
pub struct ObjectSizeCache<K: Eq + Hash = TypeId> {
    sizes: DashMap<K, u64>,
    /// Updated with plain load/store, never read-modify-write: concurrent
    /// inserts may lose increments. The eviction pass resynchronizes it.
    approximate_len: AtomicUsize,
    capacity: usize,
}

impl<K: Eq + Hash> ObjectSizeCache<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            sizes: DashMap::new(),
            approximate_len: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<u64> {
        self.sizes.get(key).map(|entry| *entry)
    }

    pub fn insert(&self, key: K, size: u64) {
        if self.approximate_len.load(Ordering::Relaxed) >= self.capacity {
            self.evict();
        }
        let approx = self.approximate_len.load(Ordering::Relaxed);
        self.approximate_len.store(approx + 1, Ordering::Relaxed);
        self.sizes.insert(key, size);
    }

    /// Exact entry count. Walks every shard.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    fn evict(&self) {
        self.sizes.retain(|_, _| fastrand::f64() >= EVICT_PROBABILITY);
        self.approximate_len
            .store(self.sizes.len(), Ordering::Relaxed);
    }
}

impl ObjectSizeCache<TypeId> {
    /// Shallow size of `obj`, measured once per concrete type.
    pub fn size_of(&self, obj: &ObjectRef, measurer: &dyn SizeMeasurer) -> u64 {
        let key = Any::type_id(&**obj);
        if let Some(size) = self.get(&key) {
            return size;
        }
        let size = measurer.object_size(obj);
        self.insert(key, size);
        size
    }
}
