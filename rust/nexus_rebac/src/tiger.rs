//! Tiger: materialized per-subject permission bitmaps.
//!
//! An entry is keyed by (subject, permission, object type, zone) and holds two
//! bitmaps over interned object ids: the objects evaluated so far and the
//! subset that was allowed. An entry built over every candidate object of the
//! type is `complete` and can answer `list_objects` on its own until the next
//! write to its zone, which may add candidates. Single-object lookups only
//! ever answer for evaluated ids: an object outside the candidate set can
//! still be reachable through a `type:*` grant.
//!
//! Writes mark affected entries stale; the next miss replaces them. A result
//! computed before an invalidation of its zone is never recorded, so a stale
//! answer cannot be resurrected by a slow reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::bitmap::{deserialize_bitmap, serialize_bitmap, ResourceMap};
use crate::config::TigerConfig;
use crate::error::{RebacError, Result};
use crate::types::Entity;

const ENTRY_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TigerKey {
    pub subject: Entity,
    pub permission: String,
    pub object_type: String,
    pub zone_id: String,
}

impl TigerKey {
    pub fn new(subject: &Entity, permission: &str, object_type: &str, zone_id: &str) -> Self {
        Self {
            subject: subject.clone(),
            permission: permission.to_string(),
            object_type: object_type.to_string(),
            zone_id: zone_id.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TigerEntry {
    pub allowed: RoaringBitmap,
    pub evaluated: RoaringBitmap,
    /// Zone revision the newest bit was computed at.
    pub zone_revision: u64,
    pub complete: bool,
    stale: AtomicBool,
}

impl TigerEntry {
    fn single(id: u32, allowed: bool, revision: u64) -> Self {
        let mut entry = Self {
            zone_revision: revision,
            ..Default::default()
        };
        entry.evaluated.insert(id);
        if allowed {
            entry.allowed.insert(id);
        }
        entry
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Copy for copy-on-write growth. The copy is never stale.
    fn copy(&self) -> Self {
        Self {
            allowed: self.allowed.clone(),
            evaluated: self.evaluated.clone(),
            zone_revision: self.zone_revision,
            complete: self.complete,
            stale: AtomicBool::new(false),
        }
    }

    /// `[version][complete][revision u64 LE][allowed len u32 LE][allowed][evaluated]`,
    /// bitmaps in the standard Roaring format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let allowed = serialize_bitmap(&self.allowed)?;
        let evaluated = serialize_bitmap(&self.evaluated)?;
        let allowed_len = u32::try_from(allowed.len())
            .map_err(|_| RebacError::Storage("tiger entry too large".to_string()))?;

        let mut out = Vec::with_capacity(14 + allowed.len() + evaluated.len());
        out.push(ENTRY_FORMAT_VERSION);
        out.push(u8::from(self.complete));
        out.extend_from_slice(&self.zone_revision.to_le_bytes());
        out.extend_from_slice(&allowed_len.to_le_bytes());
        out.extend_from_slice(&allowed);
        out.extend_from_slice(&evaluated);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| RebacError::Storage(format!("tiger entry: {what}"));
        if bytes.len() < 14 {
            return Err(corrupt("truncated header"));
        }
        if bytes[0] != ENTRY_FORMAT_VERSION {
            return Err(corrupt("unknown format version"));
        }
        let complete = bytes[1] != 0;
        let mut revision = [0u8; 8];
        revision.copy_from_slice(&bytes[2..10]);
        let mut allowed_len = [0u8; 4];
        allowed_len.copy_from_slice(&bytes[10..14]);
        let allowed_end = 14 + u32::from_le_bytes(allowed_len) as usize;
        if bytes.len() < allowed_end {
            return Err(corrupt("truncated bitmap"));
        }
        Ok(Self {
            allowed: deserialize_bitmap(&bytes[14..allowed_end])?,
            evaluated: deserialize_bitmap(&bytes[allowed_end..])?,
            zone_revision: u64::from_le_bytes(revision),
            complete,
            stale: AtomicBool::new(false),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TigerStats {
    pub entries: usize,
    pub stale: usize,
    pub complete: usize,
    pub interned_objects: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Result cache consulted before graph evaluation.
pub trait PermissionCache: Send + Sync {
    /// Cached answer for `object`, if known.
    fn lookup(&self, key: &TigerKey, object: &Entity) -> Option<bool>;

    /// Record a result computed against zone `revision`.
    fn record(&self, key: &TigerKey, object: &Entity, allowed: bool, revision: u64);

    /// Mark entries of `zone_id` stale: one subject's, or all when `None`.
    fn invalidate(&self, zone_id: &str, subject: Option<&Entity>, revision: u64);

    fn clear(&self);
}

pub struct TigerCache {
    config: TigerConfig,
    resources: ResourceMap,
    entries: DashMap<TigerKey, Arc<TigerEntry>>,
    /// zone -> revision of the latest invalidating write
    invalidated_at: DashMap<String, u64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TigerCache {
    pub fn new(config: TigerConfig) -> Self {
        Self {
            config,
            resources: ResourceMap::new(),
            entries: DashMap::new(),
            invalidated_at: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn max_working_set(&self) -> usize {
        self.config.max_working_set
    }

    fn invalidated_since(&self, zone_id: &str, revision: u64) -> bool {
        self.invalidated_at
            .get(zone_id)
            .is_some_and(|watermark| *watermark > revision)
    }

    fn count(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Allowed objects of a complete entry built after the last write to its
    /// zone.
    pub fn permitted(&self, key: &TigerKey) -> Option<Vec<Entity>> {
        if !self.config.enabled {
            return None;
        }
        let entry = self.entries.get(key).map(|e| e.value().clone());
        let usable = |e: &Arc<TigerEntry>| {
            e.complete && !e.is_stale() && !self.invalidated_since(&key.zone_id, e.zone_revision)
        };
        let Some(entry) = entry.filter(usable) else {
            self.count(false);
            return None;
        };
        self.count(true);
        Some(
            entry
                .allowed
                .iter()
                .filter_map(|id| self.resources.resolve(id))
                .collect(),
        )
    }

    /// Store the full answer over `universe`. Skipped above the working-set cap
    /// or when the zone was invalidated after `revision`.
    pub fn materialize(
        &self,
        key: &TigerKey,
        universe: &[Entity],
        allowed: &[Entity],
        revision: u64,
    ) {
        if !self.config.enabled || universe.len() > self.config.max_working_set {
            return;
        }
        let mut entry = TigerEntry {
            zone_revision: revision,
            complete: true,
            ..Default::default()
        };
        for object in universe {
            entry.evaluated.insert(self.resources.intern(object));
        }
        for object in allowed {
            entry.allowed.insert(self.resources.intern(object));
        }

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if !self.invalidated_since(&key.zone_id, revision) {
                    occupied.insert(Arc::new(entry));
                }
            }
            Entry::Vacant(vacant) => {
                if !self.invalidated_since(&key.zone_id, revision) {
                    vacant.insert(Arc::new(entry));
                }
            }
        }
    }

    /// Load an entry produced by [`TigerEntry::to_bytes`]. Ids must come from
    /// this cache's interner.
    pub fn restore(&self, key: TigerKey, bytes: &[u8]) -> Result<()> {
        let entry = TigerEntry::from_bytes(bytes)?;
        self.entries.insert(key, Arc::new(entry));
        Ok(())
    }

    pub fn snapshot(&self, key: &TigerKey) -> Option<Arc<TigerEntry>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn stats(&self) -> TigerStats {
        let mut stats = TigerStats {
            interned_objects: self.resources.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.entries.iter() {
            stats.entries += 1;
            if entry.is_stale() {
                stats.stale += 1;
            }
            if entry.complete {
                stats.complete += 1;
            }
        }
        stats
    }
}

impl PermissionCache for TigerCache {
    fn lookup(&self, key: &TigerKey, object: &Entity) -> Option<bool> {
        if !self.config.enabled {
            return None;
        }
        let entry = self.entries.get(key).map(|e| e.value().clone());
        let answer = entry.filter(|e| !e.is_stale()).and_then(|entry| {
            let id = self.resources.lookup(object)?;
            entry
                .evaluated
                .contains(id)
                .then(|| entry.allowed.contains(id))
        });
        self.count(answer.is_some());
        answer
    }

    fn record(&self, key: &TigerKey, object: &Entity, allowed: bool, revision: u64) {
        if !self.config.enabled {
            return;
        }
        let id = self.resources.intern(object);
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if self.invalidated_since(&key.zone_id, revision) {
                    return;
                }
                let current = occupied.get();
                if current.is_stale() {
                    occupied.insert(Arc::new(TigerEntry::single(id, allowed, revision)));
                    return;
                }
                if current.evaluated.contains(id)
                    || current.evaluated.len() >= self.config.max_working_set as u64
                {
                    return;
                }
                let mut next = current.copy();
                next.evaluated.insert(id);
                if allowed {
                    next.allowed.insert(id);
                }
                // An object outside the universe means the universe is out of date
                next.complete = false;
                next.zone_revision = next.zone_revision.max(revision);
                occupied.insert(Arc::new(next));
            }
            Entry::Vacant(vacant) => {
                if !self.invalidated_since(&key.zone_id, revision) {
                    vacant.insert(Arc::new(TigerEntry::single(id, allowed, revision)));
                }
            }
        }
    }

    fn invalidate(&self, zone_id: &str, subject: Option<&Entity>, revision: u64) {
        if !self.config.enabled {
            return;
        }
        // Watermark first: a reader that recorded before the scan gets marked,
        // one that records after sees the watermark.
        self.invalidated_at
            .entry(zone_id.to_string())
            .and_modify(|w| *w = (*w).max(revision))
            .or_insert(revision);

        let mut marked = 0usize;
        for entry in self.entries.iter() {
            let key = entry.key();
            if key.zone_id != zone_id {
                continue;
            }
            if subject.map_or(true, |s| *s == key.subject) {
                entry.value().mark_stale();
                marked += 1;
            }
        }
        tracing::trace!(
            zone_id,
            zone_wide = subject.is_none(),
            marked,
            "tiger entries invalidated"
        );
    }

    fn clear(&self) {
        self.entries.clear();
    }
}
