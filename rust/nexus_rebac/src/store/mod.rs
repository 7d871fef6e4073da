//! Tuple repository contract.
//!
//! The engine only talks to storage through [`TupleStore`]. Implementations
//! must make a tuple mutation and its changelog append atomic, assign a new
//! strictly increasing revision per zone on every mutation, and keep lookups
//! zone-scoped (see [`RelationTuple::visible_in_zone`]).
//!
//! Expected indexes for a relational backend:
//! - unique `(subject_type, subject_id, subject_relation, relation,
//!   object_type, object_id, zone_id)`
//! - `(zone_id, object_type, object_id, relation)` for check lookups
//! - `(zone_id, subject_type, subject_id, relation)` for tupleToUserset and closure BFS
//! - `(zone_id, revision)` on the changelog

mod memory;

pub use memory::MemoryTupleStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ChangelogEntry, RelationTuple, TupleFilter, TupleKey, TupleWrite};

/// A committed mutation and the revisions it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub tuple: RelationTuple,
    /// New revision of the tuple's own zone.
    pub revision: u64,
    /// For cross-zone tuples, the subject zone is bumped too since the tuple
    /// is visible there.
    pub subject_zone_revision: Option<(String, u64)>,
}

impl Mutation {
    /// Every (zone, revision) pair this mutation advanced.
    pub fn zone_revisions(&self) -> Vec<(String, u64)> {
        let mut out = vec![(self.tuple.zone_id.clone(), self.revision)];
        if let Some(foreign) = &self.subject_zone_revision {
            out.push(foreign.clone());
        }
        out
    }
}

pub trait TupleStore: Send + Sync {
    /// Insert a tuple. Fails with `DuplicateTuple` if its key exists.
    fn write_tuple(&self, write: &TupleWrite) -> Result<Mutation>;

    /// Hard delete by id. `Ok(None)` when no such tuple exists.
    fn delete_tuple(&self, tuple_id: &str) -> Result<Option<Mutation>>;

    /// Hard delete by unique key. `Ok(None)` when no such tuple exists.
    fn delete_by_key(&self, key: &TupleKey) -> Result<Option<Mutation>>;

    /// Unexpired tuples visible in `filter.zone_id` matching the filter.
    fn get_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationTuple>>;

    /// Ids of objects of `object_type` that appear in any visible tuple of the
    /// zone, as object or as subject. Sorted.
    fn list_object_ids(&self, zone_id: &str, object_type: &str) -> Result<Vec<String>>;

    /// Changelog entries of `zone_id` with revision greater than `revision`.
    fn changes_since(&self, zone_id: &str, revision: u64) -> Result<Vec<ChangelogEntry>>;

    fn current_revision(&self, zone_id: &str) -> Result<u64>;

    /// Hard delete every tuple expired at `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Mutation>>;
}
