//! Leopard: transitive group-membership closure.
//!
//! For each zone and membership relation `R`, a row `(R, member, group)`
//! exists iff `member` reaches `group` through a chain of at most
//! `max_depth` hops: a direct tuple `member R g0` followed by userset edges
//! `g0#R R g1`, `g1#R R g2`, .... `depth` is the shortest such chain.
//!
//! Only unconditional, non-expiring tuples on group types whose namespace
//! treats `R` as a direct relation are indexed, so a row always agrees with
//! what the evaluator would conclude. A missing row proves nothing: callers
//! fall back to graph evaluation.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::LeopardConfig;
use crate::error::Result;
use crate::namespace::{is_cross_zone_relation, NamespaceRegistry, RelationRule, Resolved};
use crate::store::TupleStore;
use crate::types::{Entity, RelationTuple, TupleFilter, WILDCARD};

/// Shortcut consulted by the evaluator before recursing into memberships.
pub trait ClosureIndex: Send + Sync {
    /// Whether `relation` on `object_type` is maintained by this index.
    fn is_indexed(&self, object_type: &str, relation: &str) -> bool;

    /// Shortest known chain from `member` to `group`; `None` when unknown.
    fn membership_depth(
        &self,
        zone_id: &str,
        relation: &str,
        member: &Entity,
        group: &Entity,
    ) -> Option<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClosureRow {
    pub depth: u32,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a full zone rebuild. Non-zero drift means incremental
/// maintenance missed something.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub zone_id: String,
    pub rows: usize,
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

impl RebuildReport {
    pub fn drift(&self) -> usize {
        self.added + self.removed + self.changed
    }
}

type RowKey = (String, Entity, Entity);

#[derive(Debug, Default)]
struct ZoneClosure {
    rows: AHashMap<RowKey, ClosureRow>,
    /// (relation, group) -> members
    by_group: AHashMap<(String, Entity), AHashSet<Entity>>,
    /// (relation, member) -> groups
    by_member: AHashMap<(String, Entity), AHashSet<Entity>>,
}

impl ZoneClosure {
    fn upsert_min(
        &mut self,
        relation: &str,
        member: &Entity,
        group: &Entity,
        depth: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (relation.to_string(), member.clone(), group.clone());
        match self.rows.get_mut(&key) {
            Some(row) if row.depth <= depth => false,
            Some(row) => {
                row.depth = depth;
                row.updated_at = now;
                true
            }
            None => {
                self.rows.insert(key, ClosureRow { depth, updated_at: now });
                self.by_group
                    .entry((relation.to_string(), group.clone()))
                    .or_default()
                    .insert(member.clone());
                self.by_member
                    .entry((relation.to_string(), member.clone()))
                    .or_default()
                    .insert(group.clone());
                true
            }
        }
    }

    /// Replace every row of `member` with `groups`.
    fn replace_member(
        &mut self,
        relation: &str,
        member: &Entity,
        groups: &AHashMap<Entity, u32>,
        now: DateTime<Utc>,
    ) {
        let member_key = (relation.to_string(), member.clone());
        if let Some(old) = self.by_member.remove(&member_key) {
            for group in old {
                self.rows.remove(&(relation.to_string(), member.clone(), group.clone()));
                let group_key = (relation.to_string(), group);
                if let Some(members) = self.by_group.get_mut(&group_key) {
                    members.remove(member);
                    if members.is_empty() {
                        self.by_group.remove(&group_key);
                    }
                }
            }
        }
        for (group, depth) in groups {
            self.upsert_min(relation, member, group, *depth, now);
        }
    }

    fn members_of(&self, relation: &str, group: &Entity) -> Vec<(Entity, u32)> {
        let Some(members) = self.by_group.get(&(relation.to_string(), group.clone())) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|m| {
                self.rows
                    .get(&(relation.to_string(), m.clone(), group.clone()))
                    .map(|row| (m.clone(), row.depth))
            })
            .collect()
    }
}

/// Per-zone closure tables maintained alongside tuple writes.
///
/// Maintenance of one zone (incremental or full) runs under that zone's
/// maintenance lock from its first read to its last row write, so each step
/// sees the rows of every step before it. Lookups only take the table's read
/// lock.
pub struct LeopardIndex {
    config: LeopardConfig,
    max_depth: u32,
    namespaces: Arc<NamespaceRegistry>,
    zones: DashMap<String, Arc<RwLock<ZoneClosure>>>,
    maintenance: DashMap<String, Arc<Mutex<()>>>,
}

impl LeopardIndex {
    pub fn new(config: LeopardConfig, max_depth: u32, namespaces: Arc<NamespaceRegistry>) -> Self {
        Self {
            config,
            max_depth,
            namespaces,
            zones: DashMap::new(),
            maintenance: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn zone(&self, zone_id: &str) -> Arc<RwLock<ZoneClosure>> {
        self.zones
            .entry(zone_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn maintenance_lock(&self, zone_id: &str) -> Arc<Mutex<()>> {
        self.maintenance
            .entry(zone_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Tuples that may feed the closure. Mirrors the evaluator's zone gate
    /// and skips anything conditional, expiring, or wildcard.
    fn usable(&self, zone_id: &str, tuple: &RelationTuple) -> bool {
        tuple.is_unconditional()
            && (tuple.zone_id == zone_id || is_cross_zone_relation(&tuple.relation))
            && tuple.object_id != WILDCARD
            && tuple.subject_id != WILDCARD
            && self.is_indexed(&tuple.object_type, &tuple.relation)
    }

    fn is_edge(&self, tuple: &RelationTuple) -> bool {
        tuple.subject_relation.as_deref() == Some(tuple.relation.as_str())
            && self.is_indexed(&tuple.subject_type, &tuple.relation)
    }

    /// Groups reachable from `group` through userset edges, with hop counts
    /// (`group` itself at 0), bounded by `budget` hops.
    fn ancestors(
        &self,
        store: &dyn TupleStore,
        zone_id: &str,
        relation: &str,
        group: &Entity,
        budget: u32,
    ) -> Result<AHashMap<Entity, u32>> {
        let mut dist = AHashMap::new();
        dist.insert(group.clone(), 0);
        let mut frontier = VecDeque::from([group.clone()]);
        while let Some(current) = frontier.pop_front() {
            let d = dist.get(&current).copied().unwrap_or(0);
            if d >= budget {
                continue;
            }
            let filter = TupleFilter::zone(zone_id)
                .subject(&current)
                .relation(relation)
                .subject_relation(Some(relation.to_string()));
            for edge in store.get_tuples(&filter)? {
                if !self.usable(zone_id, &edge) || !self.is_edge(&edge) {
                    continue;
                }
                let next = edge.object();
                if !dist.contains_key(&next) {
                    dist.insert(next.clone(), d + 1);
                    frontier.push_back(next);
                }
            }
        }
        Ok(dist)
    }

    /// All groups `member` reaches, from scratch.
    fn closure_of(
        &self,
        store: &dyn TupleStore,
        zone_id: &str,
        relation: &str,
        member: &Entity,
    ) -> Result<AHashMap<Entity, u32>> {
        let filter = TupleFilter::zone(zone_id)
            .subject(member)
            .relation(relation)
            .subject_relation(None);
        let mut groups: AHashMap<Entity, u32> = AHashMap::new();
        for tuple in store.get_tuples(&filter)? {
            if !self.usable(zone_id, &tuple) {
                continue;
            }
            let direct = tuple.object();
            let budget = self.max_depth.saturating_sub(1);
            for (group, hops) in self.ancestors(store, zone_id, relation, &direct, budget)? {
                let depth = hops + 1;
                groups
                    .entry(group)
                    .and_modify(|d| *d = (*d).min(depth))
                    .or_insert(depth);
            }
        }
        Ok(groups)
    }

    /// Fold a newly written tuple into the closure.
    pub fn apply_write(&self, store: &dyn TupleStore, tuple: &RelationTuple) -> Result<()> {
        if !self.config.enabled || self.max_depth == 0 {
            return Ok(());
        }
        let zone_id = tuple.zone_id.as_str();
        if !self.usable(zone_id, tuple) {
            return Ok(());
        }
        let relation = tuple.relation.as_str();
        let target = tuple.object();
        let lock = self.maintenance_lock(zone_id);
        let _maintaining = lock.lock();
        let closure = self.zone(zone_id);

        let sources: Vec<(Entity, u32)> = match &tuple.subject_relation {
            None => vec![(tuple.subject(), 0)],
            Some(_) if self.is_edge(tuple) => closure.read().members_of(relation, &tuple.subject()),
            Some(_) => return Ok(()),
        };
        if sources.is_empty() {
            return Ok(());
        }

        let budget = self.max_depth.saturating_sub(1);
        let ancestors = self.ancestors(store, zone_id, relation, &target, budget)?;
        let now = Utc::now();
        let mut closure = closure.write();
        let mut added = 0usize;
        for (member, base) in &sources {
            for (group, hops) in &ancestors {
                let depth = base + 1 + hops;
                if depth <= self.max_depth
                    && closure.upsert_min(relation, member, group, depth, now)
                {
                    added += 1;
                }
            }
        }
        tracing::debug!(zone_id, relation, rows = added, "leopard closure extended");
        Ok(())
    }

    /// Recompute members whose chains may have used a deleted tuple.
    pub fn apply_delete(&self, store: &dyn TupleStore, tuple: &RelationTuple) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let zone_id = tuple.zone_id.as_str();
        if !self.usable(zone_id, tuple) {
            return Ok(());
        }
        let relation = tuple.relation.as_str();
        let lock = self.maintenance_lock(zone_id);
        let _maintaining = lock.lock();
        let closure = self.zone(zone_id);

        let affected: Vec<Entity> = match &tuple.subject_relation {
            None => vec![tuple.subject()],
            Some(_) if self.is_edge(tuple) => closure
                .read()
                .members_of(relation, &tuple.subject())
                .into_iter()
                .map(|(member, _)| member)
                .collect(),
            Some(_) => return Ok(()),
        };

        let mut recomputed = Vec::with_capacity(affected.len());
        for member in affected {
            let groups = self.closure_of(store, zone_id, relation, &member)?;
            recomputed.push((member, groups));
        }

        let now = Utc::now();
        let mut closure = closure.write();
        for (member, groups) in &recomputed {
            closure.replace_member(relation, member, groups, now);
        }
        tracing::debug!(
            zone_id,
            relation,
            members = recomputed.len(),
            "leopard closure recomputed"
        );
        Ok(())
    }

    /// Recompute a zone from stored tuples and swap it in.
    pub fn rebuild_zone(&self, store: &dyn TupleStore, zone_id: &str) -> Result<RebuildReport> {
        let lock = self.maintenance_lock(zone_id);
        let _maintaining = lock.lock();
        let now = Utc::now();
        let mut fresh = ZoneClosure::default();
        if self.config.enabled && self.max_depth > 0 {
            for relation in &self.config.membership_relations {
                let filter = TupleFilter::zone(zone_id)
                    .relation(relation.as_str())
                    .subject_relation(None);
                let mut members: Vec<Entity> = store
                    .get_tuples(&filter)?
                    .into_iter()
                    .filter(|t| self.usable(zone_id, t))
                    .map(|t| t.subject())
                    .collect();
                members.sort();
                members.dedup();
                for member in members {
                    let groups = self.closure_of(store, zone_id, relation, &member)?;
                    fresh.replace_member(relation, &member, &groups, now);
                }
            }
        }

        let closure = self.zone(zone_id);
        let mut current = closure.write();
        let mut report = RebuildReport {
            zone_id: zone_id.to_string(),
            rows: fresh.rows.len(),
            ..Default::default()
        };
        for (key, row) in &fresh.rows {
            match current.rows.get(key) {
                None => report.added += 1,
                Some(old) if old.depth != row.depth => report.changed += 1,
                Some(_) => {}
            }
        }
        report.removed = current
            .rows
            .keys()
            .filter(|key| !fresh.rows.contains_key(*key))
            .count();
        *current = fresh;

        if report.drift() > 0 {
            tracing::warn!(
                zone_id,
                added = report.added,
                removed = report.removed,
                changed = report.changed,
                "leopard rebuild corrected drift"
            );
        } else {
            tracing::info!(zone_id, rows = report.rows, "leopard zone rebuilt");
        }
        Ok(report)
    }

    /// Rebuild every zone that has closure state, plus `extra_zones`.
    pub fn rebuild_all(
        &self,
        store: &dyn TupleStore,
        extra_zones: &[String],
    ) -> Result<Vec<RebuildReport>> {
        let mut zones: Vec<String> = self.zones.iter().map(|e| e.key().clone()).collect();
        zones.extend(extra_zones.iter().cloned());
        zones.sort();
        zones.dedup();
        zones
            .iter()
            .map(|zone_id| self.rebuild_zone(store, zone_id))
            .collect()
    }

    /// Groups `member` belongs to, transitively, with depths. Sorted.
    pub fn groups_of(&self, zone_id: &str, relation: &str, member: &Entity) -> Vec<(Entity, u32)> {
        let Some(closure) = self.zones.get(zone_id).map(|c| c.value().clone()) else {
            return Vec::new();
        };
        let closure = closure.read();
        let mut groups: Vec<(Entity, u32)> = closure
            .by_member
            .get(&(relation.to_string(), member.clone()))
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| {
                        closure
                            .rows
                            .get(&(relation.to_string(), member.clone(), g.clone()))
                            .map(|row| (g.clone(), row.depth))
                    })
                    .collect()
            })
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Transitive members of `group`, with depths. Sorted.
    pub fn members_of(&self, zone_id: &str, relation: &str, group: &Entity) -> Vec<(Entity, u32)> {
        let Some(closure) = self.zones.get(zone_id).map(|c| c.value().clone()) else {
            return Vec::new();
        };
        let mut members = closure.read().members_of(relation, group);
        members.sort();
        members
    }

    /// Forget a zone's closure; lookups miss until the next rebuild.
    pub fn drop_zone(&self, zone_id: &str) {
        self.zones.remove(zone_id);
    }

    /// Drop all closure state, e.g. after a namespace change.
    pub fn clear(&self) {
        self.zones.clear();
    }
}

impl ClosureIndex for LeopardIndex {
    fn is_indexed(&self, object_type: &str, relation: &str) -> bool {
        if !self.config.enabled
            || !self.config.group_types.iter().any(|t| t == object_type)
            || !self.config.membership_relations.iter().any(|r| r == relation)
        {
            return false;
        }
        self.namespaces.get(object_type).map_or(true, |ns| {
            matches!(
                ns.resolve(relation),
                Resolved::Relation(RelationRule::Direct) | Resolved::Undeclared
            )
        })
    }

    fn membership_depth(
        &self,
        zone_id: &str,
        relation: &str,
        member: &Entity,
        group: &Entity,
    ) -> Option<u32> {
        let closure = self.zones.get(zone_id)?.value().clone();
        let closure = closure.read();
        closure
            .rows
            .get(&(relation.to_string(), member.clone(), group.clone()))
            .map(|row| row.depth)
            .filter(|depth| *depth <= self.max_depth)
    }
}
