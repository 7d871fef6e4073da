//! Permission graph evaluator.
//!
//! Answers one check by walking namespace rules over stored tuples:
//! - permissions and unions short-circuit on the first granting child
//! - intersections short-circuit on the first denying child
//! - exclusions evaluate the excluded branch whenever the base grants
//! - tupleToUserset follows `tupleset` edges from the object (the object is
//!   the edge's subject) and resolves `computedUserset` on each target
//! - userset subjects (`group:eng#member`) recurse into that relation
//!
//! Cycle detection is per traversal: a (relation, object) node already on the
//! current path evaluates to false for that branch. Every node entry checks
//! [`GraphLimits`]. Node and time budgets fail at once. A branch that reaches
//! `max_depth` is cut, and the check fails with `GraphLimitExceeded` unless
//! some other branch grants, so the answer never depends on rule order.

use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use serde::Serialize;

use crate::conditions::CheckContext;
use crate::config::GraphLimits;
use crate::error::{GraphLimit, RebacError, Result};
use crate::leopard::ClosureIndex;
use crate::namespace::{is_cross_zone_relation, NamespaceRegistry, RelationRule, Resolved};
use crate::store::TupleStore;
use crate::types::{Entity, RelationTuple, TupleFilter, WILDCARD};

/// A node of the traversal: (relation or permission, object). The subject is
/// fixed for a whole traversal.
type NodeKey = (String, Entity);

/// Outcome of one evaluation with traversal statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub allowed: bool,
    pub visited_nodes: u64,
    pub closure_hits: u64,
    /// An expiring or conditional tuple was consulted, so the answer may
    /// change without a write and must not be cached.
    pub volatile: bool,
}

/// Per-call mutable state. Never shared across checks.
struct Traversal<'c> {
    zone_id: &'c str,
    subject: &'c Entity,
    context: Option<&'c CheckContext>,
    limits: GraphLimits,
    started: Instant,
    visited_nodes: u64,
    closure_hits: u64,
    /// Branches cut at `max_depth` under a node that is still false.
    truncated: u64,
    /// Lowest path position a cycle cut pointed back to, `usize::MAX` if none.
    lowest_cut: usize,
    volatile: bool,
    /// Nodes on the current path with their position on it.
    path: AHashMap<NodeKey, usize>,
    /// Nodes proven true, with the deepest depth each was proven at.
    proven: AHashMap<NodeKey, u32>,
    use_closure: bool,
}

impl<'c> Traversal<'c> {
    fn new(
        zone_id: &'c str,
        subject: &'c Entity,
        context: Option<&'c CheckContext>,
        limits: GraphLimits,
        use_closure: bool,
    ) -> Self {
        Self {
            zone_id,
            subject,
            context,
            limits,
            started: Instant::now(),
            visited_nodes: 0,
            closure_hits: 0,
            truncated: 0,
            lowest_cut: usize::MAX,
            volatile: false,
            path: AHashMap::new(),
            proven: AHashMap::new(),
            use_closure,
        }
    }

    fn depth_exceeded(&self) -> RebacError {
        RebacError::GraphLimitExceeded {
            limit: GraphLimit::Depth,
            max: u64::from(self.limits.max_depth),
        }
    }

    /// Strict entry for `expand`, which has no partial answer.
    fn enter(&mut self, depth: u32) -> Result<()> {
        if depth >= self.limits.max_depth {
            self.visited_nodes += 1;
            return Err(self.depth_exceeded());
        }
        self.charge()
    }

    /// Count one node against the node and time budgets.
    fn charge(&mut self) -> Result<()> {
        self.visited_nodes += 1;
        if self.visited_nodes > self.limits.max_visited_nodes {
            return Err(RebacError::GraphLimitExceeded {
                limit: GraphLimit::VisitedNodes,
                max: self.limits.max_visited_nodes,
            });
        }
        if self.started.elapsed() > self.limits.max_duration() {
            return Err(RebacError::GraphLimitExceeded {
                limit: GraphLimit::Duration,
                max: self.limits.max_duration_ms,
            });
        }
        Ok(())
    }
}

/// Recursive evaluator over a tuple store and namespace registry, with an
/// optional closure index shortcut.
pub struct Evaluator<'a> {
    store: &'a dyn TupleStore,
    namespaces: &'a NamespaceRegistry,
    closure: Option<&'a dyn ClosureIndex>,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a dyn TupleStore, namespaces: &'a NamespaceRegistry) -> Self {
        Self {
            store,
            namespaces,
            closure: None,
        }
    }

    /// Consult `closure` for group membership before recursing.
    pub fn with_closure(mut self, closure: &'a dyn ClosureIndex) -> Self {
        self.closure = Some(closure);
        self
    }

    /// Can `subject` do `permission` on `object` in `zone_id`?
    pub fn compute_permission(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        limits: GraphLimits,
    ) -> Result<bool> {
        self.evaluate(subject, permission, object, zone_id, limits, None)
            .map(|e| e.allowed)
    }

    /// Full evaluation with ABAC context and statistics.
    pub fn evaluate(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        limits: GraphLimits,
        context: Option<&CheckContext>,
    ) -> Result<Evaluation> {
        let use_closure = self.closure.is_some();
        let mut traversal = Traversal::new(zone_id, subject, context, limits, use_closure);
        let allowed = self.compute(&mut traversal, permission, object, 0)?;
        if !allowed && traversal.truncated > 0 {
            return Err(traversal.depth_exceeded());
        }
        Ok(Evaluation {
            allowed,
            visited_nodes: traversal.visited_nodes,
            closure_hits: traversal.closure_hits,
            volatile: traversal.volatile,
        })
    }

    fn compute(
        &self,
        t: &mut Traversal<'_>,
        name: &str,
        object: &Entity,
        depth: u32,
    ) -> Result<bool> {
        if depth >= t.limits.max_depth {
            t.truncated += 1;
            tracing::trace!(relation = name, object = %object, depth, "depth cut");
            return Ok(false);
        }
        t.charge()?;

        let key = (name.to_string(), object.clone());
        if t.proven.get(&key).is_some_and(|&at| depth <= at) {
            return Ok(true);
        }
        if let Some(&position) = t.path.get(&key) {
            t.lowest_cut = t.lowest_cut.min(position);
            tracing::trace!(relation = name, object = %object, "cycle cut");
            return Ok(false);
        }

        let (truncated, lowest_cut) = (t.truncated, t.lowest_cut);
        t.path.insert(key.clone(), t.path.len());
        let result = self.resolve(t, name, object, depth);
        t.path.remove(&key);

        let allowed = result?;
        if allowed {
            // Cuts below a granting node never change the answer
            t.truncated = truncated;
            t.lowest_cut = lowest_cut;
            let at = t.proven.entry(key).or_insert(depth);
            *at = (*at).max(depth);
        }
        Ok(allowed)
    }

    fn resolve(
        &self,
        t: &mut Traversal<'_>,
        name: &str,
        object: &Entity,
        depth: u32,
    ) -> Result<bool> {
        let Some(namespace) = self.namespaces.get(&object.entity_type) else {
            return self.check_direct(t, name, object, depth);
        };
        match namespace.resolve(name) {
            Resolved::Permission(relations) => {
                for relation in relations {
                    if self.compute(t, relation, object, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Resolved::Relation(rule) => self.eval_rule(t, rule, name, object, depth),
            Resolved::Undeclared => self.check_direct(t, name, object, depth),
        }
    }

    fn eval_rule(
        &self,
        t: &mut Traversal<'_>,
        rule: &RelationRule,
        name: &str,
        object: &Entity,
        depth: u32,
    ) -> Result<bool> {
        match rule {
            RelationRule::Direct => self.check_direct(t, name, object, depth),
            RelationRule::Union(children) => {
                for child in children {
                    if self.compute(t, child, object, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            RelationRule::Intersection(children) => {
                for child in children {
                    if !self.compute(t, child, object, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            RelationRule::Exclusion { base, excluded } => {
                if !self.compute(t, base, object, depth + 1)? {
                    return Ok(false);
                }
                let mark = t.path.len();
                let outer_cut = std::mem::replace(&mut t.lowest_cut, usize::MAX);
                let truncated = t.truncated;
                let is_excluded = self.compute(t, excluded, object, depth + 1)?;
                let undecided = t.lowest_cut < mark;
                t.lowest_cut = t.lowest_cut.min(outer_cut);
                if is_excluded {
                    return Ok(false);
                }
                if t.truncated > truncated {
                    // The excluded branch was cut short; a grant would be unsound
                    return Err(t.depth_exceeded());
                }
                if undecided {
                    // The excluded branch looped back above this exclusion.
                    tracing::debug!(
                        relation = name,
                        object = %object,
                        "exclusion undecided by cycle, denying"
                    );
                    // Enclosing exclusions must treat this deny as undecided too
                    t.lowest_cut = 0;
                    return Ok(false);
                }
                Ok(true)
            }
            RelationRule::TupleToUserset {
                tupleset,
                computed_userset,
            } => {
                for related in self.related_objects(t, object, tupleset)? {
                    if self.compute(t, computed_userset, &related, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Direct tuples, wildcard tuples, then userset subjects.
    fn check_direct(
        &self,
        t: &mut Traversal<'_>,
        relation: &str,
        object: &Entity,
        depth: u32,
    ) -> Result<bool> {
        if t.use_closure {
            if let Some(closure) = self.closure {
                // A row of chain length k stands for k - 1 more levels below this one
                let budget = t.limits.max_depth.saturating_sub(depth);
                if closure.is_indexed(&object.entity_type, relation)
                    && matches!(
                        closure.membership_depth(t.zone_id, relation, t.subject, object),
                        Some(chain) if chain <= budget
                    )
                {
                    t.closure_hits += 1;
                    return Ok(true);
                }
            }
        }

        let mut usersets: Vec<(Entity, String)> = Vec::new();
        for tuple in self.direct_tuples(t, relation, object)? {
            t.volatile |= !tuple.is_unconditional();
            if let Some(conditions) = &tuple.conditions {
                if !conditions.evaluate(t.context) {
                    continue;
                }
            }
            let subject = tuple.subject();
            match &tuple.subject_relation {
                None if subject == *t.subject || subject.is_wildcard() => return Ok(true),
                None => {}
                Some(subject_relation) => usersets.push((subject, subject_relation.clone())),
            }
        }

        for (userset, subject_relation) in usersets {
            if self.compute(t, &subject_relation, &userset, depth + 1)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Tuples granting `relation` on `object` or on the type wildcard `type:*`.
    fn direct_tuples(
        &self,
        t: &Traversal<'_>,
        relation: &str,
        object: &Entity,
    ) -> Result<Vec<RelationTuple>> {
        let filter = TupleFilter::zone(t.zone_id).object(object).relation(relation);
        let mut tuples = self.store.get_tuples(&filter)?;
        if object.entity_id != WILDCARD {
            let any = Entity::new(&object.entity_type, WILDCARD);
            let filter = TupleFilter::zone(t.zone_id).object(&any).relation(relation);
            tuples.extend(self.store.get_tuples(&filter)?);
        }
        for tuple in &tuples {
            zone_gate(t.zone_id, tuple)?;
        }
        Ok(tuples)
    }

    /// Objects `object` points to through `tupleset` edges.
    fn related_objects(
        &self,
        t: &mut Traversal<'_>,
        object: &Entity,
        tupleset: &str,
    ) -> Result<Vec<Entity>> {
        let filter = TupleFilter::zone(t.zone_id)
            .subject(object)
            .relation(tupleset)
            .subject_relation(None);
        let mut related = Vec::new();
        for tuple in self.store.get_tuples(&filter)? {
            zone_gate(t.zone_id, &tuple)?;
            t.volatile |= !tuple.is_unconditional();
            if let Some(conditions) = &tuple.conditions {
                if !conditions.evaluate(t.context) {
                    continue;
                }
            }
            related.push(tuple.object());
        }
        Ok(related)
    }

    // ========================================================================
    // Expand
    // ========================================================================

    /// Resolve the subject tree of `permission` on `object` for audit.
    pub fn expand(
        &self,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        limits: GraphLimits,
    ) -> Result<ExpandTree> {
        let subject = Entity::wildcard();
        let mut traversal = Traversal::new(zone_id, &subject, None, limits, false);
        self.expand_node(&mut traversal, permission, object, 0)
    }

    fn expand_node(
        &self,
        t: &mut Traversal<'_>,
        name: &str,
        object: &Entity,
        depth: u32,
    ) -> Result<ExpandTree> {
        t.enter(depth)?;
        let key = (name.to_string(), object.clone());
        if t.path.contains_key(&key) {
            return Ok(ExpandTree::new(name, object, ExpandKind::Cycle));
        }
        t.path.insert(key.clone(), t.path.len());
        let result = self.expand_resolved(t, name, object, depth);
        t.path.remove(&key);
        result
    }

    fn expand_resolved(
        &self,
        t: &mut Traversal<'_>,
        name: &str,
        object: &Entity,
        depth: u32,
    ) -> Result<ExpandTree> {
        let rule = match self.namespaces.get(&object.entity_type) {
            None => RelationRule::Direct,
            Some(namespace) => match namespace.resolve(name) {
                Resolved::Permission(relations) => RelationRule::Union(relations.to_vec()),
                Resolved::Relation(rule) => rule.clone(),
                Resolved::Undeclared => RelationRule::Direct,
            },
        };

        let kind = match rule {
            RelationRule::Direct => {
                let mut subjects = Vec::new();
                for tuple in self.direct_tuples(t, name, object)? {
                    let expanded = match &tuple.subject_relation {
                        Some(rel) => {
                            let userset = tuple.subject();
                            Some(Box::new(self.expand_node(t, rel, &userset, depth + 1)?))
                        }
                        None => None,
                    };
                    subjects.push(ExpandSubject {
                        subject: tuple.subject(),
                        relation: tuple.subject_relation.clone(),
                        conditional: !tuple.is_unconditional(),
                        expanded,
                    });
                }
                ExpandKind::Leaf { subjects }
            }
            RelationRule::Union(children) => ExpandKind::Union {
                children: self.expand_children(t, &children, object, depth)?,
            },
            RelationRule::Intersection(children) => ExpandKind::Intersection {
                children: self.expand_children(t, &children, object, depth)?,
            },
            RelationRule::Exclusion { base, excluded } => ExpandKind::Exclusion {
                base: Box::new(self.expand_node(t, &base, object, depth + 1)?),
                excluded: Box::new(self.expand_node(t, &excluded, object, depth + 1)?),
            },
            RelationRule::TupleToUserset {
                tupleset,
                computed_userset,
            } => {
                let mut children = Vec::new();
                for related in self.related_objects(t, object, &tupleset)? {
                    children.push(self.expand_node(t, &computed_userset, &related, depth + 1)?);
                }
                ExpandKind::TupleToUserset { tupleset, children }
            }
        };
        Ok(ExpandTree::new(name, object, kind))
    }

    fn expand_children(
        &self,
        t: &mut Traversal<'_>,
        children: &[String],
        object: &Entity,
        depth: u32,
    ) -> Result<Vec<ExpandTree>> {
        children
            .iter()
            .map(|child| self.expand_node(t, child, object, depth + 1))
            .collect()
    }
}

/// Fail closed when a store hands back a tuple the zone must not see.
fn zone_gate(zone_id: &str, tuple: &RelationTuple) -> Result<()> {
    if tuple.zone_id == zone_id {
        return Ok(());
    }
    if is_cross_zone_relation(&tuple.relation) && tuple.visible_in_zone(zone_id) {
        return Ok(());
    }
    Err(RebacError::CrossZoneViolation {
        relation: tuple.relation.clone(),
        from_zone: tuple.zone_id.clone(),
        to_zone: zone_id.to_string(),
    })
}

// ============================================================================
// Expand tree
// ============================================================================

/// Resolved subject tree for one (relation, object) node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpandTree {
    pub relation: String,
    pub object: Entity,
    pub kind: ExpandKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ExpandKind {
    Leaf { subjects: Vec<ExpandSubject> },
    Union { children: Vec<ExpandTree> },
    Intersection { children: Vec<ExpandTree> },
    Exclusion { base: Box<ExpandTree>, excluded: Box<ExpandTree> },
    TupleToUserset { tupleset: String, children: Vec<ExpandTree> },
    /// Node already on the path; contributes nothing.
    Cycle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpandSubject {
    pub subject: Entity,
    pub relation: Option<String>,
    /// Expiring or ABAC-conditioned grant.
    pub conditional: bool,
    pub expanded: Option<Box<ExpandTree>>,
}

impl ExpandTree {
    fn new(relation: &str, object: &Entity, kind: ExpandKind) -> Self {
        Self {
            relation: relation.to_string(),
            object: object.clone(),
            kind,
        }
    }

    /// Concrete subjects the tree grants, honoring intersection and exclusion.
    /// Conditional grants are included.
    pub fn subjects(&self) -> AHashSet<Entity> {
        match &self.kind {
            ExpandKind::Leaf { subjects } => {
                let mut out = AHashSet::new();
                for s in subjects {
                    match &s.expanded {
                        Some(tree) => out.extend(tree.subjects()),
                        None => {
                            out.insert(s.subject.clone());
                        }
                    }
                }
                out
            }
            ExpandKind::Union { children } | ExpandKind::TupleToUserset { children, .. } => {
                children.iter().flat_map(|c| c.subjects()).collect()
            }
            ExpandKind::Intersection { children } => {
                let mut iter = children.iter();
                let Some(first) = iter.next() else {
                    return AHashSet::new();
                };
                iter.fold(first.subjects(), |acc, c| {
                    let other = c.subjects();
                    acc.into_iter().filter(|s| other.contains(s)).collect()
                })
            }
            ExpandKind::Exclusion { base, excluded } => {
                let removed = excluded.subjects();
                base.subjects()
                    .into_iter()
                    .filter(|s| !removed.contains(s))
                    .collect()
            }
            ExpandKind::Cycle => AHashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Conditions;
    use crate::store::MemoryTupleStore;
    use crate::types::TupleWrite;

    fn user(id: &str) -> Entity {
        Entity::new("user", id)
    }

    fn file(id: &str) -> Entity {
        Entity::new("file", id)
    }

    fn group(id: &str) -> Entity {
        Entity::new("group", id)
    }

    fn fixture() -> (MemoryTupleStore, NamespaceRegistry) {
        (
            MemoryTupleStore::new(),
            NamespaceRegistry::with_defaults().unwrap(),
        )
    }

    fn write(store: &MemoryTupleStore, w: TupleWrite) {
        store.write_tuple(&w).unwrap();
    }

    /// `child#member member parent`
    fn nest(child: &str, parent: &str) -> TupleWrite {
        TupleWrite::new(group(child), "member", group(parent)).with_subject_relation("member")
    }

    fn check(
        store: &MemoryTupleStore,
        ns: &NamespaceRegistry,
        s: &Entity,
        p: &str,
        o: &Entity,
    ) -> bool {
        Evaluator::new(store, ns)
            .compute_permission(s, p, o, "default", GraphLimits::default())
            .unwrap()
    }

    #[test]
    fn direct_owner_can_write_and_read() {
        let (store, ns) = fixture();
        write(&store, TupleWrite::new(user("alice"), "direct_owner", file("/doc")));
        assert!(check(&store, &ns, &user("alice"), "write", &file("/doc")));
        assert!(check(&store, &ns, &user("alice"), "read", &file("/doc")));
        assert!(!check(&store, &ns, &user("bob"), "read", &file("/doc")));
    }

    #[test]
    fn parent_inheritance_follows_tupleset() {
        let (store, ns) = fixture();
        write(&store, TupleWrite::new(user("alice"), "direct_owner", file("/a")));
        write(&store, TupleWrite::new(file("/a/b"), "parent", file("/a")));
        write(&store, TupleWrite::new(file("/a/b/c"), "parent", file("/a/b")));
        assert!(check(&store, &ns, &user("alice"), "write", &file("/a/b/c")));
        assert!(!check(&store, &ns, &user("alice"), "write", &file("/elsewhere")));
    }

    #[test]
    fn group_userset_grants_members() {
        let (store, ns) = fixture();
        write(&store, TupleWrite::new(user("bob"), "member", group("eng")));
        write(
            &store,
            TupleWrite::new(group("eng"), "direct_viewer", file("/roadmap"))
                .with_subject_relation("member"),
        );
        assert!(check(&store, &ns, &user("bob"), "read", &file("/roadmap")));
        assert!(!check(&store, &ns, &user("bob"), "write", &file("/roadmap")));
        assert!(!check(&store, &ns, &user("carol"), "read", &file("/roadmap")));
    }

    #[test]
    fn wildcard_subject_and_object() {
        let (store, ns) = fixture();
        write(&store, TupleWrite::new(Entity::wildcard(), "direct_viewer", file("/public")));
        write(&store, TupleWrite::new(user("ops"), "direct_viewer", file("*")));
        assert!(check(&store, &ns, &user("anyone"), "read", &file("/public")));
        assert!(check(&store, &ns, &user("ops"), "read", &file("/any/thing")));
        assert!(!check(&store, &ns, &user("anyone"), "read", &file("/private")));
    }

    #[test]
    fn membership_cycle_terminates_denied() {
        let (store, ns) = fixture();
        write(&store, nest("a", "b"));
        write(&store, nest("b", "a"));
        assert!(!check(&store, &ns, &user("x"), "member", &group("a")));

        write(&store, TupleWrite::new(user("x"), "member", group("b")));
        assert!(check(&store, &ns, &user("x"), "member", &group("a")));
    }

    fn doc_namespace(ns: &NamespaceRegistry) {
        ns.register_json(
            "doc",
            r#"{"relations":{
                "viewer":"direct","banned":"direct","signed":"direct",
                "can_view":{"exclusion":{"base":"viewer","excluded":"banned"}},
                "can_sign":{"intersection":["viewer","signed"]}
            }}"#,
        )
        .unwrap();
    }

    #[test]
    fn exclusion_removes_banned_subjects() {
        let (store, ns) = fixture();
        doc_namespace(&ns);
        let doc = Entity::new("doc", "1");
        write(&store, TupleWrite::new(user("u"), "viewer", doc.clone()));
        write(&store, TupleWrite::new(user("v"), "viewer", doc.clone()));
        write(&store, TupleWrite::new(user("v"), "banned", doc.clone()));
        assert!(check(&store, &ns, &user("u"), "can_view", &doc));
        assert!(!check(&store, &ns, &user("v"), "can_view", &doc));
    }

    #[test]
    fn intersection_requires_every_branch() {
        let (store, ns) = fixture();
        doc_namespace(&ns);
        let doc = Entity::new("doc", "1");
        write(&store, TupleWrite::new(user("u"), "viewer", doc.clone()));
        assert!(!check(&store, &ns, &user("u"), "can_sign", &doc));
        write(&store, TupleWrite::new(user("u"), "signed", doc.clone()));
        assert!(check(&store, &ns, &user("u"), "can_sign", &doc));
    }

    #[test]
    fn membership_loop_inside_excluded_branch_does_not_block() {
        let (store, ns) = fixture();
        ns.register_json(
            "doc",
            r#"{"relations":{
                "viewer":"direct","blocked":"direct",
                "can_view":{"exclusion":{"base":"viewer","excluded":"blocked"}}
            }}"#,
        )
        .unwrap();
        let doc = Entity::new("doc", "1");
        write(&store, TupleWrite::new(user("u"), "viewer", doc.clone()));
        // blocked through a membership loop that never reaches `u`
        write(
            &store,
            TupleWrite::new(group("a"), "blocked", doc.clone()).with_subject_relation("member"),
        );
        write(&store, nest("b", "a"));
        write(&store, nest("a", "b"));
        assert!(check(&store, &ns, &user("u"), "can_view", &doc));

        write(&store, TupleWrite::new(user("u"), "member", group("b")));
        assert!(!check(&store, &ns, &user("u"), "can_view", &doc));
    }

    #[test]
    fn exclusion_depending_on_itself_denies() {
        let (store, ns) = fixture();
        ns.register_json(
            "doc",
            r#"{"relations":{
                "viewer":"direct","blocked":"direct",
                "can_view":{"exclusion":{"base":"viewer","excluded":"blocked"}}
            }}"#,
        )
        .unwrap();
        let doc = Entity::new("doc", "1");
        write(&store, TupleWrite::new(user("u"), "viewer", doc.clone()));
        // blocked for whoever can view: undecidable, so closed
        write(
            &store,
            TupleWrite::new(doc.clone(), "blocked", doc.clone()).with_subject_relation("can_view"),
        );
        assert!(!check(&store, &ns, &user("u"), "can_view", &doc));
    }

    #[test]
    fn depth_limit_boundary() {
        let (store, ns) = fixture();
        // user -> g0 -> g1 -> ... -> g4: five hops
        write(&store, TupleWrite::new(user("deep"), "member", group("g0")));
        for i in 0..4 {
            write(
                &store,
                TupleWrite::new(group(&format!("g{i}")), "member", group(&format!("g{}", i + 1)))
                    .with_subject_relation("member"),
            );
        }
        let eval = Evaluator::new(&store, &ns);
        let limits = |max_depth| GraphLimits {
            max_depth,
            ..GraphLimits::default()
        };
        assert!(eval
            .compute_permission(&user("deep"), "member", &group("g4"), "default", limits(5))
            .unwrap());
        let err = eval
            .compute_permission(&user("deep"), "member", &group("g4"), "default", limits(4))
            .unwrap_err();
        assert!(matches!(
            err,
            RebacError::GraphLimitExceeded {
                limit: GraphLimit::Depth,
                max: 4
            }
        ));
    }

    #[test]
    fn grant_within_depth_wins_over_a_cut_branch() {
        let (store, ns) = fixture();
        // a long chain of nested groups under `top`, and `u` one group down
        for i in 0..6 {
            write(&store, nest(&format!("c{}", i + 1), &format!("c{i}")));
        }
        write(&store, nest("c0", "top"));
        write(&store, nest("near", "top"));
        write(&store, TupleWrite::new(user("u"), "member", group("near")));

        let limits = GraphLimits {
            max_depth: 3,
            ..GraphLimits::default()
        };
        let eval = Evaluator::new(&store, &ns);
        assert!(eval
            .compute_permission(&user("u"), "member", &group("top"), "default", limits)
            .unwrap());
        let err = eval
            .compute_permission(&user("v"), "member", &group("top"), "default", limits)
            .unwrap_err();
        assert_eq!(err.kind(), "graph_limit_exceeded");
    }

    #[test]
    fn cut_excluded_branch_is_a_limit_not_a_grant() {
        let (store, ns) = fixture();
        doc_namespace(&ns);
        let doc = Entity::new("doc", "1");
        write(&store, TupleWrite::new(user("u"), "viewer", doc.clone()));
        write(
            &store,
            TupleWrite::new(group("g0"), "banned", doc.clone()).with_subject_relation("member"),
        );
        for i in 0..4 {
            write(&store, nest(&format!("g{}", i + 1), &format!("g{i}")));
        }
        let limits = GraphLimits {
            max_depth: 4,
            ..GraphLimits::default()
        };
        let err = Evaluator::new(&store, &ns)
            .compute_permission(&user("u"), "can_view", &doc, "default", limits)
            .unwrap_err();
        assert_eq!(err.kind(), "graph_limit_exceeded");
    }

    /// Reports every membership with a fixed chain length.
    struct FixedClosure(u32);

    impl ClosureIndex for FixedClosure {
        fn is_indexed(&self, object_type: &str, relation: &str) -> bool {
            object_type == "group" && relation == "member"
        }

        fn membership_depth(
            &self,
            _zone_id: &str,
            _relation: &str,
            _member: &Entity,
            _group: &Entity,
        ) -> Option<u32> {
            Some(self.0)
        }
    }

    #[test]
    fn closure_rows_must_fit_the_remaining_depth() {
        let (store, ns) = fixture();
        write(
            &store,
            TupleWrite::new(group("g4"), "direct_viewer", file("/deep"))
                .with_subject_relation("member"),
        );
        let limits = GraphLimits {
            max_depth: 5,
            ..GraphLimits::default()
        };
        // read -> viewer -> direct_viewer -> g4#member sits at depth 3
        let fits = FixedClosure(2);
        let evaluation = Evaluator::new(&store, &ns)
            .with_closure(&fits)
            .evaluate(&user("u"), "read", &file("/deep"), "default", limits, None)
            .unwrap();
        assert!(evaluation.allowed);
        assert_eq!(evaluation.closure_hits, 1);

        let too_long = FixedClosure(3);
        let err = Evaluator::new(&store, &ns)
            .with_closure(&too_long)
            .evaluate(&user("u"), "read", &file("/deep"), "default", limits, None)
            .unwrap_err();
        assert_eq!(err.kind(), "graph_limit_exceeded");
    }

    #[test]
    fn visited_node_budget_is_enforced() {
        let (store, ns) = fixture();
        for i in 0..20 {
            write(
                &store,
                TupleWrite::new(group(&format!("g{i}")), "direct_viewer", file("/wide"))
                    .with_subject_relation("member"),
            );
        }
        let limits = GraphLimits {
            max_visited_nodes: 10,
            ..GraphLimits::default()
        };
        let err = Evaluator::new(&store, &ns)
            .compute_permission(&user("nobody"), "read", &file("/wide"), "default", limits)
            .unwrap_err();
        assert!(matches!(
            err,
            RebacError::GraphLimitExceeded {
                limit: GraphLimit::VisitedNodes,
                ..
            }
        ));
    }

    #[test]
    fn conditional_tuple_needs_context() {
        let (store, ns) = fixture();
        let conditions = Conditions {
            allowed_ips: vec!["10.0.".into()],
            ..Default::default()
        };
        write(
            &store,
            TupleWrite::new(user("u"), "direct_viewer", file("/vpn")).with_conditions(conditions),
        );
        let eval = Evaluator::new(&store, &ns);
        let run = |ctx: Option<&CheckContext>| {
            eval.evaluate(&user("u"), "read", &file("/vpn"), "default", GraphLimits::default(), ctx)
                .unwrap()
                .allowed
        };
        assert!(!run(None));
        assert!(run(Some(&CheckContext::default().with_ip("10.0.0.9"))));
        assert!(!run(Some(&CheckContext::default().with_ip("172.16.0.1"))));
    }

    #[test]
    fn other_zone_tuples_are_invisible() {
        let (store, ns) = fixture();
        write(&store, TupleWrite::new(user("u"), "direct_owner", file("/x")).in_zone("acme"));
        assert!(!check(&store, &ns, &user("u"), "read", &file("/x")));
        assert!(Evaluator::new(&store, &ns)
            .compute_permission(&user("u"), "read", &file("/x"), "acme", GraphLimits::default())
            .unwrap());
    }

    #[test]
    fn shared_relation_crosses_zones() {
        let (store, ns) = fixture();
        write(
            &store,
            TupleWrite::new(user("guest"), "shared-viewer", file("/report"))
                .in_zone("acme")
                .with_subject_zone("partner"),
        );
        assert!(Evaluator::new(&store, &ns)
            .compute_permission(
                &user("guest"),
                "read",
                &file("/report"),
                "partner",
                GraphLimits::default(),
            )
            .unwrap());
    }

    #[test]
    fn expand_lists_effective_subjects() {
        let (store, ns) = fixture();
        doc_namespace(&ns);
        let doc = Entity::new("doc", "1");
        write(&store, TupleWrite::new(user("a"), "viewer", doc.clone()));
        write(&store, TupleWrite::new(user("b"), "member", group("eng")));
        write(
            &store,
            TupleWrite::new(group("eng"), "viewer", doc.clone()).with_subject_relation("member"),
        );
        write(&store, TupleWrite::new(user("a"), "banned", doc.clone()));

        let tree = Evaluator::new(&store, &ns)
            .expand("can_view", &doc, "default", GraphLimits::default())
            .unwrap();
        assert!(matches!(tree.kind, ExpandKind::Exclusion { .. }));
        let subjects = tree.subjects();
        assert!(subjects.contains(&user("b")));
        assert!(!subjects.contains(&user("a")));
    }

    #[test]
    fn expand_marks_cycles() {
        let (store, ns) = fixture();
        write(&store, nest("a", "b"));
        write(&store, nest("b", "a"));
        let tree = Evaluator::new(&store, &ns)
            .expand("member", &group("a"), "default", GraphLimits::default())
            .unwrap();
        assert!(tree.subjects().is_empty());
        let json = serde_json::to_string(&tree).unwrap();
        assert!(json.contains("\"cycle\""));
    }
}
