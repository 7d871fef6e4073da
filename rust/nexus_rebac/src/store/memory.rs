use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{RebacError, Result};
use crate::types::{
    ChangeType, ChangelogEntry, RelationTuple, TupleFilter, TupleKey, TupleWrite,
};

use super::{Mutation, TupleStore};

/// Key for entity indexes: (zone_id, entity_type, entity_id).
type EntityKey = (String, String, String);

#[derive(Debug, Default)]
struct Inner {
    tuples: AHashMap<String, RelationTuple>,
    by_key: AHashMap<TupleKey, String>,
    by_object: AHashMap<EntityKey, AHashSet<String>>,
    by_subject: AHashMap<EntityKey, AHashSet<String>>,
    /// zone -> ids of all tuples owned by the zone
    by_zone: AHashMap<String, AHashSet<String>>,
    /// zone -> ids of allow-listed tuples owned elsewhere whose subject lives here
    shared_in: AHashMap<String, AHashSet<String>>,
    revisions: AHashMap<String, u64>,
    changelog: AHashMap<String, Vec<ChangelogEntry>>,
}

impl Inner {
    fn bump(&mut self, zone_id: &str) -> u64 {
        let rev = self.revisions.entry(zone_id.to_string()).or_insert(0);
        *rev += 1;
        *rev
    }

    fn log(
        &mut self,
        change_type: ChangeType,
        tuple: &RelationTuple,
        zone_id: &str,
        revision: u64,
    ) {
        self.changelog
            .entry(zone_id.to_string())
            .or_default()
            .push(ChangelogEntry {
                change_type,
                tuple: tuple.clone(),
                zone_id: zone_id.to_string(),
                revision,
                timestamp: Utc::now(),
            });
    }

    /// Bump revisions and append changelog entries for every zone that can
    /// see `tuple`.
    fn commit(&mut self, change_type: ChangeType, tuple: RelationTuple) -> Mutation {
        let zone_id = tuple.zone_id.clone();
        let revision = self.bump(&zone_id);
        self.log(change_type, &tuple, &zone_id, revision);

        let subject_zone_revision = match foreign_zone(&tuple) {
            Some(foreign) => {
                let rev = self.bump(&foreign);
                self.log(change_type, &tuple, &foreign, rev);
                Some((foreign, rev))
            }
            None => None,
        };

        Mutation {
            tuple,
            revision,
            subject_zone_revision,
        }
    }

    fn index(&mut self, tuple: &RelationTuple) {
        let id = tuple.tuple_id.clone();
        self.by_key.insert(tuple.key(), id.clone());
        self.by_object
            .entry(object_key(tuple))
            .or_default()
            .insert(id.clone());
        self.by_subject
            .entry(subject_key(tuple))
            .or_default()
            .insert(id.clone());
        self.by_zone
            .entry(tuple.zone_id.clone())
            .or_default()
            .insert(id.clone());
        if let Some(foreign) = foreign_zone(tuple) {
            self.shared_in.entry(foreign).or_default().insert(id);
        }
    }

    fn unindex(&mut self, tuple: &RelationTuple) {
        let id = &tuple.tuple_id;
        self.by_key.remove(&tuple.key());
        remove_from(&mut self.by_object, &object_key(tuple), id);
        remove_from(&mut self.by_subject, &subject_key(tuple), id);
        remove_from(&mut self.by_zone, &tuple.zone_id, id);
        if let Some(foreign) = foreign_zone(tuple) {
            remove_from(&mut self.shared_in, &foreign, id);
        }
    }

    fn remove(&mut self, tuple_id: &str) -> Option<Mutation> {
        let tuple = self.tuples.remove(tuple_id)?;
        self.unindex(&tuple);
        Some(self.commit(ChangeType::Delete, tuple))
    }

    /// Candidate ids for a filter, narrowed by the best available index.
    fn candidates(&self, filter: &TupleFilter) -> Vec<&String> {
        let zone = &filter.zone_id;
        let mut ids: Vec<&String> = Vec::new();
        let owned = match (
            &filter.object_type,
            &filter.object_id,
            &filter.subject_type,
            &filter.subject_id,
        ) {
            (Some(t), Some(i), _, _) => self.by_object.get(&(zone.clone(), t.clone(), i.clone())),
            (_, _, Some(t), Some(i)) => self.by_subject.get(&(zone.clone(), t.clone(), i.clone())),
            _ => self.by_zone.get(zone),
        };
        if let Some(set) = owned {
            ids.extend(set.iter());
        }
        if let Some(shared) = self.shared_in.get(zone) {
            ids.extend(shared.iter());
        }
        ids
    }
}

fn object_key(tuple: &RelationTuple) -> EntityKey {
    (
        tuple.zone_id.clone(),
        tuple.object_type.clone(),
        tuple.object_id.clone(),
    )
}

fn subject_key(tuple: &RelationTuple) -> EntityKey {
    (
        tuple.zone_id.clone(),
        tuple.subject_type.clone(),
        tuple.subject_id.clone(),
    )
}

fn foreign_zone(tuple: &RelationTuple) -> Option<String> {
    tuple
        .subject_zone_id
        .clone()
        .filter(|z| *z != tuple.zone_id)
}

fn remove_from<K: std::hash::Hash + Eq>(
    index: &mut AHashMap<K, AHashSet<String>>,
    key: &K,
    id: &str,
) {
    if let Some(set) = index.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

fn sort_tuples(tuples: &mut [RelationTuple]) {
    tuples.sort_by(|a, b| {
        (
            &a.object_type,
            &a.object_id,
            &a.relation,
            &a.subject_type,
            &a.subject_id,
            &a.subject_relation,
            &a.zone_id,
        )
            .cmp(&(
                &b.object_type,
                &b.object_id,
                &b.relation,
                &b.subject_type,
                &b.subject_id,
                &b.subject_relation,
                &b.zone_id,
            ))
    });
}

/// In-memory tuple repository.
///
/// All mutations happen under one write lock, so the tuple change, its
/// changelog entries and the revision bump are atomic.
#[derive(Debug, Default)]
pub struct MemoryTupleStore {
    inner: RwLock<Inner>,
}

impl MemoryTupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tuples, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.read().tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TupleStore for MemoryTupleStore {
    fn write_tuple(&self, write: &TupleWrite) -> Result<Mutation> {
        let zone_id = write.zone();
        let tuple = RelationTuple {
            tuple_id: uuid::Uuid::new_v4().to_string(),
            subject_type: write.subject.entity_type.clone(),
            subject_id: write.subject.entity_id.clone(),
            subject_relation: write.subject_relation.clone(),
            relation: write.relation.clone(),
            object_type: write.object.entity_type.clone(),
            object_id: write.object.entity_id.clone(),
            subject_zone_id: write.foreign_subject_zone(),
            zone_id,
            expires_at: write.expires_at,
            conditions: write.conditions.clone(),
            created_at: Utc::now(),
        };

        let mut inner = self.inner.write();
        if inner.by_key.contains_key(&tuple.key()) {
            return Err(RebacError::DuplicateTuple(format!(
                "{}{} {} {} in zone '{}'",
                tuple.subject(),
                tuple
                    .subject_relation
                    .as_ref()
                    .map(|r| format!("#{r}"))
                    .unwrap_or_default(),
                tuple.relation,
                tuple.object(),
                tuple.zone_id
            )));
        }
        inner.index(&tuple);
        inner.tuples.insert(tuple.tuple_id.clone(), tuple.clone());
        Ok(inner.commit(ChangeType::Insert, tuple))
    }

    fn delete_tuple(&self, tuple_id: &str) -> Result<Option<Mutation>> {
        Ok(self.inner.write().remove(tuple_id))
    }

    fn delete_by_key(&self, key: &TupleKey) -> Result<Option<Mutation>> {
        let mut inner = self.inner.write();
        let Some(id) = inner.by_key.get(key).cloned() else {
            return Ok(None);
        };
        Ok(inner.remove(&id))
    }

    fn get_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationTuple>> {
        let now = Utc::now();
        let inner = self.inner.read();
        let mut seen = AHashSet::new();
        let mut out: Vec<RelationTuple> = inner
            .candidates(filter)
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| inner.tuples.get(id))
            .filter(|t| {
                t.visible_in_zone(&filter.zone_id) && !t.is_expired(now) && filter.matches(t)
            })
            .cloned()
            .collect();
        sort_tuples(&mut out);
        Ok(out)
    }

    fn list_object_ids(&self, zone_id: &str, object_type: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let inner = self.inner.read();
        let filter = TupleFilter::zone(zone_id);
        let mut ids = AHashSet::new();
        for id in inner.candidates(&filter) {
            let Some(t) = inner.tuples.get(id) else {
                continue;
            };
            if !t.visible_in_zone(zone_id) || t.is_expired(now) {
                continue;
            }
            if t.object_type == object_type {
                ids.insert(t.object_id.clone());
            }
            if t.subject_type == object_type && t.subject_relation.is_none() {
                ids.insert(t.subject_id.clone());
            }
        }
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    fn changes_since(&self, zone_id: &str, revision: u64) -> Result<Vec<ChangelogEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .changelog
            .get(zone_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.revision > revision)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn current_revision(&self, zone_id: &str) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .revisions
            .get(zone_id)
            .copied()
            .unwrap_or(0))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Mutation>> {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .tuples
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.tuple_id.clone())
            .collect();
        Ok(expired
            .iter()
            .filter_map(|id| inner.remove(id))
            .collect())
    }
}
