//! `RebacEngine`: the public facade.
//!
//! Reads resolve their consistency requirement first, then try Tiger, then
//! run the evaluator (which consults Leopard). Writes go to the store, then
//! Leopard, then Tiger invalidation, and only then advance the zone revision,
//! so a reader that observes revision R also observes every derived-state
//! update for R.
//!
//! `check` is total: graph limits and cross-zone violations become denies with
//! a distinct [`Decision`]. `list_objects` and `expand` have no safe partial
//! answer and propagate both errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use chrono::Utc;
use globset::{Glob, GlobMatcher};
use rayon::prelude::*;
use serde::Serialize;

use crate::conditions::CheckContext;
use crate::config::{EngineConfig, GraphLimits};
use crate::error::{RebacError, Result};
use crate::evaluator::{Evaluation, Evaluator, ExpandTree};
use crate::leopard::{LeopardIndex, RebuildReport};
use crate::namespace::{is_cross_zone_relation, NamespaceConfig, NamespaceRegistry};
use crate::revision::{Consistency, RevisionManager};
use crate::store::{MemoryTupleStore, Mutation, TupleStore};
use crate::tiger::{PermissionCache, TigerCache, TigerKey, TigerStats};
use crate::types::{
    normalize_zone, ChangelogEntry, CheckResult, Decision, DecisionSource, DeleteOutcome, Entity,
    RelationTuple, TupleKey, TupleWrite, WriteResult, WILDCARD,
};

const RETRY_BASE_DELAY_MS: u64 = 5;

/// One entry of a bulk check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub subject: Entity,
    pub permission: String,
    pub object: Entity,
}

impl CheckRequest {
    pub fn new(subject: Entity, permission: impl Into<String>, object: Entity) -> Self {
        Self {
            subject,
            permission: permission.into(),
            object,
        }
    }
}

/// Filters and pagination for `list_objects`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Literal object-id prefix, e.g. `/workspace/`.
    pub prefix: Option<String>,
    /// Glob over object ids, e.g. `/workspace/**/*.md`.
    pub pattern: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ListOptions {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn is_filtered(&self) -> bool {
        self.prefix.is_some() || self.pattern.is_some()
    }
}

/// A page of permitted objects in ascending id order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectPage {
    pub objects: Vec<Entity>,
    /// Matches before pagination.
    pub total: usize,
    pub revision: u64,
}

/// Decision counters. Limit and cross-zone denies are counted apart from
/// authorization denies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub allowed: u64,
    pub denied: u64,
    pub limit_exceeded: u64,
    pub cross_zone_denied: u64,
    pub tiger_hits: u64,
    pub tiger_misses: u64,
    pub leopard_hits: u64,
    pub storage_retries: u64,
    pub consistency_timeouts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    limit_exceeded: AtomicU64,
    cross_zone_denied: AtomicU64,
    leopard_hits: AtomicU64,
    storage_retries: AtomicU64,
    consistency_timeouts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct RebacEngine {
    config: EngineConfig,
    store: Arc<dyn TupleStore>,
    namespaces: Arc<NamespaceRegistry>,
    leopard: LeopardIndex,
    tiger: TigerCache,
    revisions: RevisionManager,
    counters: Counters,
}

impl RebacEngine {
    pub fn new(
        store: Arc<dyn TupleStore>,
        namespaces: Arc<NamespaceRegistry>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let leopard = LeopardIndex::new(
            config.leopard.clone(),
            config.leopard_max_depth(),
            namespaces.clone(),
        );
        let tiger = TigerCache::new(config.tiger.clone());
        let revisions = RevisionManager::new(config.token_secret.as_deref());
        tracing::info!(
            leopard = config.leopard.enabled,
            tiger = config.tiger.enabled,
            max_depth = config.limits.max_depth,
            "rebac engine started"
        );
        Ok(Self {
            config,
            store,
            namespaces,
            leopard,
            tiger,
            revisions,
            counters: Counters::default(),
        })
    }

    /// Engine over an in-memory store with the default `file`/`group` namespaces.
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        let namespaces = Arc::new(NamespaceRegistry::with_defaults()?);
        Self::new(Arc::new(MemoryTupleStore::new()), namespaces, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TupleStore> {
        &self.store
    }

    pub fn namespaces(&self) -> &Arc<NamespaceRegistry> {
        &self.namespaces
    }

    pub fn leopard(&self) -> &LeopardIndex {
        &self.leopard
    }

    pub fn tiger(&self) -> &TigerCache {
        &self.tiger
    }

    pub fn revisions(&self) -> &RevisionManager {
        &self.revisions
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Can `subject` do `permission` on `object` in `zone_id`?
    pub fn check(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        consistency: &Consistency,
    ) -> Result<CheckResult> {
        let zone = normalize_zone(Some(zone_id));
        let revision = self.resolve_consistency(&zone, consistency)?;
        self.check_at(&zone, revision, consistency, subject, permission, object, None)
    }

    /// `check` with request attributes for conditional tuples.
    pub fn check_with_context(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        consistency: &Consistency,
        context: &CheckContext,
    ) -> Result<CheckResult> {
        let zone = normalize_zone(Some(zone_id));
        let revision = self.resolve_consistency(&zone, consistency)?;
        self.check_at(&zone, revision, consistency, subject, permission, object, Some(context))
    }

    /// Checks grouped by subject so each group shares its Tiger entries.
    /// Results come back in request order.
    pub fn check_bulk(
        &self,
        requests: &[CheckRequest],
        zone_id: &str,
        consistency: &Consistency,
    ) -> Result<Vec<CheckResult>> {
        let zone = normalize_zone(Some(zone_id));
        let revision = self.resolve_consistency(&zone, consistency)?;

        let mut groups: AHashMap<&Entity, Vec<usize>> = AHashMap::new();
        for (index, request) in requests.iter().enumerate() {
            groups.entry(&request.subject).or_default().push(index);
        }
        let groups: Vec<Vec<usize>> = groups.into_values().collect();

        let run_group = |indexes: &Vec<usize>| -> Result<Vec<(usize, CheckResult)>> {
            indexes
                .iter()
                .map(|&index| {
                    let request = &requests[index];
                    self.check_at(
                        &zone,
                        revision,
                        consistency,
                        &request.subject,
                        &request.permission,
                        &request.object,
                        None,
                    )
                    .map(|result| (index, result))
                })
                .collect()
        };

        let answered: Vec<Vec<(usize, CheckResult)>> =
            if requests.len() < self.config.bulk_parallel_threshold {
                groups.iter().map(run_group).collect::<Result<_>>()?
            } else {
                groups.par_iter().map(run_group).collect::<Result<_>>()?
            };

        let mut results: Vec<Option<CheckResult>> = vec![None; requests.len()];
        for (index, result) in answered.into_iter().flatten() {
            results[index] = Some(result);
        }
        Ok(results.into_iter().flatten().collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_at(
        &self,
        zone: &str,
        revision: u64,
        consistency: &Consistency,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        context: Option<&CheckContext>,
    ) -> Result<CheckResult> {
        let use_caches = !consistency.bypasses_caches();
        let use_tiger = use_caches && self.tiger.is_enabled();
        let key = TigerKey::new(subject, permission, &object.entity_type, zone);

        if use_tiger {
            if let Some(allowed) = self.tiger.lookup(&key, object) {
                self.count_decision(allowed);
                return Ok(CheckResult::new(allowed, DecisionSource::Tiger, revision));
            }
        }

        let limits = self.config.limits;
        let outcome = self.with_read_retry("check", || {
            self.evaluator(use_caches)
                .evaluate(subject, permission, object, zone, limits, context)
        });

        match outcome {
            Ok(evaluation) => {
                if use_tiger && !evaluation.volatile {
                    self.tiger.record(&key, object, evaluation.allowed, revision);
                }
                Ok(self.finish(evaluation, revision))
            }
            Err(RebacError::GraphLimitExceeded { limit, max }) => {
                bump(&self.counters.limit_exceeded);
                tracing::warn!(
                    kind = "graph_limit_exceeded",
                    %limit,
                    max,
                    subject = %subject,
                    permission,
                    object = %object,
                    zone_id = zone,
                    "check denied by graph limit"
                );
                Ok(CheckResult::denied_by(Decision::LimitExceeded, revision))
            }
            Err(RebacError::CrossZoneViolation {
                relation,
                from_zone,
                to_zone,
            }) => {
                bump(&self.counters.cross_zone_denied);
                tracing::warn!(
                    kind = "cross_zone_violation",
                    relation = %relation,
                    from_zone = %from_zone,
                    to_zone = %to_zone,
                    subject = %subject,
                    object = %object,
                    "check denied by zone isolation"
                );
                Ok(CheckResult::denied_by(Decision::CrossZoneDenied, revision))
            }
            Err(e) => Err(e),
        }
    }

    fn finish(&self, evaluation: Evaluation, revision: u64) -> CheckResult {
        self.count_decision(evaluation.allowed);
        let source = if evaluation.closure_hits > 0 {
            self.counters
                .leopard_hits
                .fetch_add(evaluation.closure_hits, Ordering::Relaxed);
            if evaluation.allowed {
                DecisionSource::Leopard
            } else {
                DecisionSource::Evaluator
            }
        } else {
            DecisionSource::Evaluator
        };
        CheckResult::new(evaluation.allowed, source, revision)
    }

    fn count_decision(&self, allowed: bool) {
        if allowed {
            bump(&self.counters.allowed);
        } else {
            bump(&self.counters.denied);
        }
    }

    fn evaluator(&self, use_caches: bool) -> Evaluator<'_> {
        let evaluator = Evaluator::new(self.store.as_ref(), &self.namespaces);
        if use_caches && self.leopard.is_enabled() {
            evaluator.with_closure(&self.leopard)
        } else {
            evaluator
        }
    }

    /// Objects of `object_type` that `subject` may `permission`, sorted by id.
    pub fn list_objects(
        &self,
        subject: &Entity,
        permission: &str,
        object_type: &str,
        zone_id: &str,
        options: &ListOptions,
        consistency: &Consistency,
    ) -> Result<ObjectPage> {
        let zone = normalize_zone(Some(zone_id));
        let revision = self.resolve_consistency(&zone, consistency)?;
        let matcher = options
            .pattern
            .as_deref()
            .map(compile_pattern)
            .transpose()?;
        let keep = |id: &str| {
            options.prefix.as_deref().map_or(true, |p| id.starts_with(p))
                && matcher.as_ref().map_or(true, |m| m.is_match(id))
        };

        let use_caches = !consistency.bypasses_caches();
        let key = TigerKey::new(subject, permission, object_type, &zone);

        let cached = if use_caches && self.tiger.is_enabled() {
            self.tiger.permitted(&key)
        } else {
            None
        };
        let mut permitted = match cached {
            Some(objects) => objects
                .into_iter()
                .filter(|o| keep(&o.entity_id))
                .collect(),
            None => {
                let ids = self.with_read_retry("list_object_ids", || {
                    self.store.list_object_ids(&zone, object_type)
                })?;
                let candidates: Vec<Entity> = ids
                    .into_iter()
                    .filter(|id| id != WILDCARD && keep(id))
                    .map(|id| Entity::new(object_type, id))
                    .collect();
                self.evaluate_candidates(
                    subject,
                    permission,
                    &zone,
                    revision,
                    &key,
                    candidates,
                    use_caches,
                    use_caches && !options.is_filtered(),
                )?
            }
        };

        permitted.sort();
        let total = permitted.len();
        let objects = permitted
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(ObjectPage {
            objects,
            total,
            revision,
        })
    }

    /// Evaluate every candidate, recording cacheable answers. With
    /// `materialize` the full answer becomes a complete Tiger entry.
    #[allow(clippy::too_many_arguments)]
    fn evaluate_candidates(
        &self,
        subject: &Entity,
        permission: &str,
        zone: &str,
        revision: u64,
        key: &TigerKey,
        candidates: Vec<Entity>,
        use_caches: bool,
        materialize: bool,
    ) -> Result<Vec<Entity>> {
        let limits = self.config.limits;
        let evaluate_one = |object: &Entity| -> Result<(bool, bool)> {
            if use_caches {
                if let Some(allowed) = self.tiger.lookup(key, object) {
                    return Ok((allowed, false));
                }
            }
            let evaluation = self.with_read_retry("list_objects", || {
                self.evaluator(use_caches)
                    .evaluate(subject, permission, object, zone, limits, None)
            })?;
            if evaluation.closure_hits > 0 {
                self.counters
                    .leopard_hits
                    .fetch_add(evaluation.closure_hits, Ordering::Relaxed);
            }
            Ok((evaluation.allowed, evaluation.volatile))
        };

        let answers: Vec<(bool, bool)> = if candidates.len() < self.config.bulk_parallel_threshold {
            candidates.iter().map(evaluate_one).collect::<Result<_>>()?
        } else {
            candidates.par_iter().map(evaluate_one).collect::<Result<_>>()?
        };

        let any_volatile = answers.iter().any(|(_, volatile)| *volatile);
        let permitted: Vec<Entity> = candidates
            .iter()
            .zip(&answers)
            .filter(|(_, (allowed, _))| *allowed)
            .map(|(object, _)| object.clone())
            .collect();

        let within_cap = candidates.len() <= self.tiger.max_working_set();
        if materialize && !any_volatile && within_cap {
            self.tiger.materialize(key, &candidates, &permitted, revision);
        } else if use_caches && within_cap {
            for (object, (allowed, volatile)) in candidates.iter().zip(&answers) {
                if !volatile {
                    self.tiger.record(key, object, *allowed, revision);
                }
            }
        }
        Ok(permitted)
    }

    /// Subject tree of `permission` on `object`. `limits` overrides the
    /// configured graph limits for this call.
    pub fn expand(
        &self,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        limits: Option<GraphLimits>,
    ) -> Result<ExpandTree> {
        let zone = normalize_zone(Some(zone_id));
        let limits = limits.unwrap_or(self.config.limits);
        self.with_read_retry("expand", || {
            Evaluator::new(self.store.as_ref(), &self.namespaces)
                .expand(permission, object, &zone, limits)
        })
    }

    pub fn changes_since(&self, zone_id: &str, revision: u64) -> Result<Vec<ChangelogEntry>> {
        let zone = normalize_zone(Some(zone_id));
        self.with_read_retry("changes_since", || self.store.changes_since(&zone, revision))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a tuple. Cross-zone subjects need an allow-listed relation.
    pub fn write(&self, write: TupleWrite) -> Result<WriteResult> {
        let zone = write.zone();
        if let Some(subject_zone) = write.foreign_subject_zone() {
            if !is_cross_zone_relation(&write.relation) {
                return Err(RebacError::CrossZoneViolation {
                    relation: write.relation.clone(),
                    from_zone: subject_zone,
                    to_zone: zone,
                });
            }
        }
        validate_write(&write)?;

        let mutation = self.store.write_tuple(&write)?;
        self.apply_mutation(&mutation, true);
        tracing::debug!(
            zone_id = %mutation.tuple.zone_id,
            relation = %mutation.tuple.relation,
            revision = mutation.revision,
            "tuple written"
        );
        Ok(self.write_result(&mutation))
    }

    /// Hard delete by id. Deleting a missing tuple is not an error.
    pub fn delete(&self, tuple_id: &str) -> Result<DeleteOutcome> {
        let deleted = self.store.delete_tuple(tuple_id)?;
        Ok(self.finish_delete(deleted))
    }

    /// Hard delete by unique key.
    pub fn delete_matching(&self, key: &TupleKey) -> Result<DeleteOutcome> {
        let deleted = self.store.delete_by_key(key)?;
        Ok(self.finish_delete(deleted))
    }

    fn finish_delete(&self, deleted: Option<Mutation>) -> DeleteOutcome {
        match deleted {
            Some(mutation) => {
                self.apply_mutation(&mutation, false);
                tracing::debug!(
                    zone_id = %mutation.tuple.zone_id,
                    relation = %mutation.tuple.relation,
                    revision = mutation.revision,
                    "tuple deleted"
                );
                DeleteOutcome::Deleted(self.write_result(&mutation))
            }
            None => DeleteOutcome::NotFound,
        }
    }

    /// Hard delete expired tuples. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let purged = self.store.purge_expired(Utc::now())?;
        for mutation in &purged {
            self.apply_mutation(mutation, false);
        }
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "expired tuples purged");
        }
        Ok(purged.len())
    }

    /// Propagate a committed mutation to Leopard, Tiger, then revisions.
    fn apply_mutation(&self, mutation: &Mutation, inserted: bool) {
        let tuple = &mutation.tuple;
        let maintained = if inserted {
            self.leopard.apply_write(self.store.as_ref(), tuple)
        } else {
            self.leopard.apply_delete(self.store.as_ref(), tuple)
        };
        if let Err(e) = maintained {
            // An unmaintained zone could keep a revoked membership; drop it
            // and let evaluation fall back to the graph until a rebuild.
            tracing::warn!(
                zone_id = %tuple.zone_id,
                error = %e,
                "leopard maintenance failed, zone closure dropped"
            );
            self.leopard.drop_zone(&tuple.zone_id);
        }

        let subject = tuple.subject();
        let scope = if self.invalidates_zone(tuple) {
            None
        } else {
            Some(&subject)
        };
        for (zone_id, revision) in mutation.zone_revisions() {
            self.tiger.invalidate(&zone_id, scope, revision);
        }
        for (zone_id, revision) in mutation.zone_revisions() {
            self.revisions.notify_revision(&zone_id, revision);
        }
    }

    /// Whether a tuple can change answers for subjects other than its own.
    fn invalidates_zone(&self, tuple: &RelationTuple) -> bool {
        tuple.subject_relation.is_some()
            || tuple.subject().is_wildcard()
            || self.namespaces.is_tupleset_relation(&tuple.relation)
    }

    fn write_result(&self, mutation: &Mutation) -> WriteResult {
        let zone_id = mutation.tuple.zone_id.clone();
        WriteResult {
            tuple_id: mutation.tuple.tuple_id.clone(),
            token: self.revisions.encode(&zone_id, mutation.revision),
            revision: mutation.revision,
            zone_id,
        }
    }

    // ========================================================================
    // Namespaces and maintenance
    // ========================================================================

    /// Register or replace a namespace. Derived state is rebuilt since rule
    /// changes can alter any answer.
    pub fn register_namespace(&self, config: NamespaceConfig) -> Result<()> {
        let object_type = config.object_type.clone();
        self.namespaces.register(config)?;
        self.after_schema_change(&object_type)
    }

    pub fn register_namespace_json(&self, object_type: &str, json: &str) -> Result<()> {
        self.namespaces.register_json(object_type, json)?;
        self.after_schema_change(object_type)
    }

    fn after_schema_change(&self, object_type: &str) -> Result<()> {
        self.tiger.clear();
        let reports = self.leopard.rebuild_all(self.store.as_ref(), &[])?;
        tracing::info!(object_type, zones = reports.len(), "namespace changed, caches rebuilt");
        Ok(())
    }

    pub fn get_namespace(&self, object_type: &str) -> Option<Arc<NamespaceConfig>> {
        self.namespaces.get(object_type)
    }

    /// Full Leopard rebuild of one zone.
    pub fn rebuild_leopard(&self, zone_id: &str) -> Result<RebuildReport> {
        let zone = normalize_zone(Some(zone_id));
        self.leopard.rebuild_zone(self.store.as_ref(), &zone)
    }

    pub fn current_revision(&self, zone_id: &str) -> Result<u64> {
        let zone = normalize_zone(Some(zone_id));
        self.sync_revision(&zone)
    }

    /// Block until `zone_id` reaches `min_revision` or `timeout` passes.
    pub fn wait_for_revision(&self, zone_id: &str, min_revision: u64, timeout: Duration) -> bool {
        let zone = normalize_zone(Some(zone_id));
        self.revisions.wait_for_revision(&zone, min_revision, timeout)
    }

    pub fn stats(&self) -> EngineStats {
        let tiger: TigerStats = self.tiger.stats();
        let c = &self.counters;
        EngineStats {
            allowed: c.allowed.load(Ordering::Relaxed),
            denied: c.denied.load(Ordering::Relaxed),
            limit_exceeded: c.limit_exceeded.load(Ordering::Relaxed),
            cross_zone_denied: c.cross_zone_denied.load(Ordering::Relaxed),
            tiger_hits: tiger.hits,
            tiger_misses: tiger.misses,
            leopard_hits: c.leopard_hits.load(Ordering::Relaxed),
            storage_retries: c.storage_retries.load(Ordering::Relaxed),
            consistency_timeouts: c.consistency_timeouts.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Consistency and retries
    // ========================================================================

    /// Seed an untracked zone from the store, then report the engine's view.
    fn sync_revision(&self, zone: &str) -> Result<u64> {
        if !self.revisions.is_tracked(zone) {
            let stored = self.with_read_retry("current_revision", || {
                self.store.current_revision(zone)
            })?;
            self.revisions.notify_revision(zone, stored);
        }
        Ok(self.revisions.current(zone))
    }

    /// Wait as `consistency` demands; returns the revision to read at.
    fn resolve_consistency(&self, zone: &str, consistency: &Consistency) -> Result<u64> {
        let current = self.sync_revision(zone)?;
        let Some(token) = consistency.required_token() else {
            return Ok(current);
        };
        let min_revision = self.revisions.decode_for_zone(token, zone)?;
        let timeout = self.config.consistency_timeout();
        if !self.revisions.wait_for_revision(zone, min_revision, timeout) {
            bump(&self.counters.consistency_timeouts);
            let current = self.revisions.current(zone);
            tracing::warn!(zone_id = zone, min_revision, current, "consistency wait timed out");
            return Err(RebacError::StaleConsistencyTimeout {
                zone_id: zone.to_string(),
                min_revision,
                current,
                timeout_ms: self.config.consistency_timeout_ms,
            });
        }
        Ok(self.revisions.current(zone))
    }

    /// Bounded retries for idempotent reads on storage errors.
    fn with_read_retry<T>(
        &self,
        operation: &str,
        mut read: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let attempts = self.config.read_retries + 1;
        let mut attempt = 1;
        loop {
            match read() {
                Err(e) if e.is_retryable_read() && attempt < attempts => {
                    bump(&self.counters.storage_retries);
                    let backoff = RETRY_BASE_DELAY_MS * 2u64.saturating_pow(attempt - 1);
                    let delay = Duration::from_millis(backoff);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "storage read failed, retrying in {:?}",
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| RebacError::InvalidRequest(format!("invalid pattern '{pattern}': {e}")))
}

fn validate_write(write: &TupleWrite) -> Result<()> {
    let fields = [
        ("subject type", write.subject.entity_type.as_str()),
        ("subject id", write.subject.entity_id.as_str()),
        ("relation", write.relation.as_str()),
        ("object type", write.object.entity_type.as_str()),
        ("object id", write.object.entity_id.as_str()),
    ];
    for (name, value) in fields {
        if value.is_empty() {
            return Err(RebacError::InvalidRequest(format!("{name} must not be empty")));
        }
    }
    if write.subject_relation.as_deref() == Some("") {
        return Err(RebacError::InvalidRequest("subject relation must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RebacEngine {
        RebacEngine::in_memory(EngineConfig::default()).unwrap()
    }

    fn user(id: &str) -> Entity {
        Entity::new("user", id)
    }

    fn file(id: &str) -> Entity {
        Entity::new("file", id)
    }

    fn group(id: &str) -> Entity {
        Entity::new("group", id)
    }

    fn read(engine: &RebacEngine, s: &Entity, o: &Entity) -> CheckResult {
        engine
            .check(s, "read", o, "default", &Consistency::default())
            .unwrap()
    }

    #[test]
    fn second_check_is_served_by_tiger() {
        let engine = engine();
        engine
            .write(TupleWrite::new(user("alice"), "direct_viewer", file("/a")))
            .unwrap();
        let first = read(&engine, &user("alice"), &file("/a"));
        assert!(first.allowed);
        assert_eq!(first.source, DecisionSource::Evaluator);
        let second = read(&engine, &user("alice"), &file("/a"));
        assert!(second.allowed);
        assert_eq!(second.source, DecisionSource::Tiger);
        assert_eq!(engine.stats().tiger_hits, 1);
    }

    #[test]
    fn delete_invalidates_cached_allow() {
        let engine = engine();
        let written = engine
            .write(TupleWrite::new(user("alice"), "direct_viewer", file("/a")))
            .unwrap();
        assert!(read(&engine, &user("alice"), &file("/a")).allowed);
        assert!(engine.delete(&written.tuple_id).unwrap().is_found());
        assert!(!read(&engine, &user("alice"), &file("/a")).allowed);
        assert_eq!(engine.delete(&written.tuple_id).unwrap(), DeleteOutcome::NotFound);
    }

    #[test]
    fn group_membership_answered_by_leopard() {
        let engine = engine();
        engine
            .write(TupleWrite::new(user("bob"), "member", group("eng")))
            .unwrap();
        engine
            .write(
                TupleWrite::new(group("eng"), "direct_viewer", file("/roadmap"))
                    .with_subject_relation("member"),
            )
            .unwrap();
        let result = read(&engine, &user("bob"), &file("/roadmap"));
        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::Leopard);
        assert!(engine.stats().leopard_hits >= 1);
    }

    #[test]
    fn fully_consistent_bypasses_caches() {
        let engine = engine();
        engine
            .write(TupleWrite::new(user("alice"), "direct_viewer", file("/a")))
            .unwrap();
        read(&engine, &user("alice"), &file("/a"));
        let result = engine
            .check(&user("alice"), "read", &file("/a"), "default", &Consistency::FullyConsistent)
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::Evaluator);
    }

    #[test]
    fn cross_zone_write_needs_allow_listed_relation() {
        let engine = engine();
        let err = engine
            .write(
                TupleWrite::new(user("guest"), "direct_viewer", file("/r"))
                    .in_zone("acme")
                    .with_subject_zone("partner"),
            )
            .unwrap_err();
        assert!(matches!(err, RebacError::CrossZoneViolation { .. }));
        assert_eq!(engine.current_revision("acme").unwrap(), 0);

        engine
            .write(
                TupleWrite::new(user("guest"), "shared-viewer", file("/r"))
                    .in_zone("acme")
                    .with_subject_zone("partner"),
            )
            .unwrap();
        assert!(engine
            .check(&user("guest"), "read", &file("/r"), "partner", &Consistency::default())
            .unwrap()
            .allowed);
    }

    #[test]
    fn empty_fields_are_rejected() {
        let engine = engine();
        let err = engine
            .write(TupleWrite::new(user(""), "direct_viewer", file("/a")))
            .unwrap_err();
        assert!(matches!(err, RebacError::InvalidRequest(_)));
    }

    #[test]
    fn duplicate_write_is_an_error() {
        let engine = engine();
        let w = TupleWrite::new(user("alice"), "direct_viewer", file("/a"));
        engine.write(w.clone()).unwrap();
        assert!(matches!(engine.write(w), Err(RebacError::DuplicateTuple(_))));
    }

    #[test]
    fn token_from_another_zone_is_rejected() {
        let engine = engine();
        let written = engine
            .write(TupleWrite::new(user("a"), "direct_viewer", file("/a")).in_zone("acme"))
            .unwrap();
        let err = engine
            .check(
                &user("a"),
                "read",
                &file("/a"),
                "globex",
                &Consistency::AtLeastAsFresh(written.token),
            )
            .unwrap_err();
        assert!(matches!(err, RebacError::CrossZoneViolation { .. }));
    }

    #[test]
    fn unreachable_revision_times_out() {
        let config = EngineConfig {
            consistency_timeout_ms: 20,
            ..Default::default()
        };
        let engine = RebacEngine::in_memory(config).unwrap();
        let token = engine.revisions().encode("default", 99);
        let err = engine
            .check(&user("a"), "read", &file("/a"), "default", &Consistency::AtLeastAsFresh(token))
            .unwrap_err();
        assert!(matches!(err, RebacError::StaleConsistencyTimeout { min_revision: 99, .. }));
        assert_eq!(engine.stats().consistency_timeouts, 1);
    }

    #[test]
    fn bad_pattern_is_invalid_request() {
        let engine = engine();
        let err = engine
            .list_objects(
                &user("a"),
                "read",
                "file",
                "default",
                &ListOptions::default().with_pattern("[unclosed"),
                &Consistency::default(),
            )
            .unwrap_err();
        assert!(matches!(err, RebacError::InvalidRequest(_)));
    }

    #[test]
    fn namespace_change_clears_tiger() {
        let engine = engine();
        engine
            .write(TupleWrite::new(user("alice"), "direct_viewer", file("/a")))
            .unwrap();
        assert!(read(&engine, &user("alice"), &file("/a")).allowed);
        engine
            .register_namespace_json(
                "file",
                r#"{
                    "relations": {"direct_viewer": "direct", "direct_owner": "direct"},
                    "permissions": {"read": ["direct_owner"]}
                }"#,
            )
            .unwrap();
        assert!(!read(&engine, &user("alice"), &file("/a")).allowed);
    }
}
