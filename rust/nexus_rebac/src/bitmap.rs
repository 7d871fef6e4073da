//! Roaring bitmap encoding and the object-id interner behind the Tiger cache.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use roaring::RoaringBitmap;

use crate::error::{RebacError, Result};
use crate::types::Entity;

/// Interns `(object_type, object_id)` pairs as dense `u32` ids.
///
/// Ids are never reused, so a bitmap built against this map stays meaningful
/// for the map's lifetime.
#[derive(Debug, Default)]
pub struct ResourceMap {
    ids: DashMap<Entity, u32>,
    reverse: RwLock<Vec<Entity>>,
    next: AtomicU32,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `object`, assigning one on first sight.
    pub fn intern(&self, object: &Entity) -> u32 {
        if let Some(id) = self.ids.get(object) {
            return *id;
        }
        *self.ids.entry(object.clone()).or_insert_with(|| {
            let mut reverse = self.reverse.write();
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            reverse.push(object.clone());
            id
        })
    }

    pub fn lookup(&self, object: &Entity) -> Option<u32> {
        self.ids.get(object).map(|id| *id)
    }

    pub fn resolve(&self, id: u32) -> Option<Entity> {
        self.reverse.read().get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Standard RoaringFormatSpec encoding.
pub fn serialize_bitmap(bitmap: &RoaringBitmap) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    bitmap
        .serialize_into(&mut bytes)
        .map_err(|e| RebacError::Storage(format!("bitmap encode: {e}")))?;
    Ok(bytes)
}

pub fn deserialize_bitmap(bytes: &[u8]) -> Result<RoaringBitmap> {
    RoaringBitmap::deserialize_from(bytes)
        .map_err(|e| RebacError::Storage(format!("bitmap decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bitmap(ids: &[u32]) -> RoaringBitmap {
        ids.iter().copied().collect()
    }

    #[test]
    fn encoding_matches_standard_format() {
        let bitmap = make_bitmap(&[1, 100, 1000, 10000]);
        let bytes = serialize_bitmap(&bitmap).unwrap();
        assert_eq!(deserialize_bitmap(&bytes).unwrap(), bitmap);
        assert!(deserialize_bitmap(&[0xde, 0xad]).is_err());
    }

    #[test]
    fn interning_is_stable() {
        let map = ResourceMap::new();
        let a = Entity::new("file", "/a");
        let b = Entity::new("file", "/b");
        let ia = map.intern(&a);
        let ib = map.intern(&b);
        assert_ne!(ia, ib);
        assert_eq!(map.intern(&a), ia);
        assert_eq!(map.lookup(&b), Some(ib));
        assert_eq!(map.resolve(ia), Some(a));
        assert_eq!(map.len(), 2);
        assert!(map.lookup(&Entity::new("file", "/c")).is_none());
    }

    #[test]
    fn concurrent_interning_assigns_unique_ids() {
        let map = std::sync::Arc::new(ResourceMap::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        map.intern(&Entity::new("file", format!("/{}", (i * 7 + t) % 300)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for id in 0..map.len() as u32 {
            let entity = map.resolve(id).unwrap();
            assert_eq!(map.lookup(&entity), Some(id));
        }
    }
}
