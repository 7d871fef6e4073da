//! Domain types shared across nexus_rebac modules.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::Conditions;
use crate::namespace::is_cross_zone_relation;

/// Zone used whenever a caller passes no zone.
pub const DEFAULT_ZONE: &str = "default";

/// Wildcard type/id. `*:*` as a subject matches every subject; `type:*` as an
/// object matches every object of that type.
pub const WILDCARD: &str = "*";

/// Normalize an optional zone id to the zone every API agrees on.
pub fn normalize_zone(zone_id: Option<&str>) -> String {
    match zone_id {
        Some(z) if !z.is_empty() => z.to_string(),
        _ => DEFAULT_ZONE.to_string(),
    }
}

/// Entity represents a subject or object in ReBAC.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub entity_id: String,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// The `*:*` subject.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.entity_type == WILDCARD && self.entity_id == WILDCARD
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Unique key of a stored tuple: (subject, relation, object, zone).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TupleKey {
    pub subject: Entity,
    pub subject_relation: Option<String>,
    pub relation: String,
    pub object: Entity,
    pub zone_id: String,
}

/// A stored relation edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationTuple {
    pub tuple_id: String,
    pub subject_type: String,
    pub subject_id: String,
    /// When set, this is a userset-as-subject tuple:
    /// "members of subject_type:subject_id#subject_relation have this relation on the object"
    pub subject_relation: Option<String>,
    pub relation: String,
    pub object_type: String,
    pub object_id: String,
    /// Zone that owns the tuple (the object's zone).
    pub zone_id: String,
    /// Zone of the subject when it differs from `zone_id`. Only allow-listed
    /// relations may carry one.
    pub subject_zone_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions: Option<Conditions>,
    pub created_at: DateTime<Utc>,
}

impl RelationTuple {
    pub fn subject(&self) -> Entity {
        Entity::new(&self.subject_type, &self.subject_id)
    }

    pub fn object(&self) -> Entity {
        Entity::new(&self.object_type, &self.object_id)
    }

    pub fn key(&self) -> TupleKey {
        TupleKey {
            subject: self.subject(),
            subject_relation: self.subject_relation.clone(),
            relation: self.relation.clone(),
            object: self.object(),
            zone_id: self.zone_id.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    /// Whether a lookup scoped to `zone_id` may see this tuple.
    ///
    /// Tuples are visible in their own zone. Allow-listed relations are also
    /// visible in the subject's zone.
    pub fn visible_in_zone(&self, zone_id: &str) -> bool {
        if self.zone_id == zone_id {
            return true;
        }
        is_cross_zone_relation(&self.relation) && self.subject_zone_id.as_deref() == Some(zone_id)
    }

    /// Expiring or conditional edges are never safe to precompute.
    pub fn is_unconditional(&self) -> bool {
        self.expires_at.is_none() && self.conditions.is_none()
    }
}

/// Request to create a tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleWrite {
    pub subject: Entity,
    pub subject_relation: Option<String>,
    pub relation: String,
    pub object: Entity,
    pub zone_id: Option<String>,
    pub subject_zone_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions: Option<Conditions>,
}

impl TupleWrite {
    pub fn new(subject: Entity, relation: impl Into<String>, object: Entity) -> Self {
        Self {
            subject,
            subject_relation: None,
            relation: relation.into(),
            object,
            zone_id: None,
            subject_zone_id: None,
            expires_at: None,
            conditions: None,
        }
    }

    /// Userset-as-subject: `subject#subject_relation`.
    pub fn with_subject_relation(mut self, relation: impl Into<String>) -> Self {
        self.subject_relation = Some(relation.into());
        self
    }

    pub fn in_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    pub fn with_subject_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.subject_zone_id = Some(zone_id.into());
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Zone after normalization.
    pub fn zone(&self) -> String {
        normalize_zone(self.zone_id.as_deref())
    }

    /// Subject zone, `None` when it is the tuple's own zone.
    pub fn foreign_subject_zone(&self) -> Option<String> {
        let zone = self.zone();
        self.subject_zone_id
            .as_deref()
            .map(|z| normalize_zone(Some(z)))
            .filter(|z| *z != zone)
    }

    pub fn key(&self) -> TupleKey {
        TupleKey {
            subject: self.subject.clone(),
            subject_relation: self.subject_relation.clone(),
            relation: self.relation.clone(),
            object: self.object.clone(),
            zone_id: self.zone(),
        }
    }
}

/// Tuple lookup filter. Every lookup is zone-scoped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TupleFilter {
    pub zone_id: String,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    /// `Some(None)` restricts to concrete subjects, `Some(Some(r))` to `#r` usersets.
    pub subject_relation: Option<Option<String>>,
    pub relation: Option<String>,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
}

impl TupleFilter {
    pub fn zone(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            ..Default::default()
        }
    }

    pub fn object(mut self, object: &Entity) -> Self {
        self.object_type = Some(object.entity_type.clone());
        self.object_id = Some(object.entity_id.clone());
        self
    }

    pub fn object_type(mut self, object_type: impl Into<String>) -> Self {
        self.object_type = Some(object_type.into());
        self
    }

    pub fn subject(mut self, subject: &Entity) -> Self {
        self.subject_type = Some(subject.entity_type.clone());
        self.subject_id = Some(subject.entity_id.clone());
        self
    }

    pub fn relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn subject_relation(mut self, subject_relation: Option<String>) -> Self {
        self.subject_relation = Some(subject_relation);
        self
    }

    /// Match every field except the zone (zone visibility is the store's job).
    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        field(&self.subject_type, &tuple.subject_type)
            && field(&self.subject_id, &tuple.subject_id)
            && field(&self.relation, &tuple.relation)
            && field(&self.object_type, &tuple.object_type)
            && field(&self.object_id, &tuple.object_id)
            && self
                .subject_relation
                .as_ref()
                .map_or(true, |want| *want == tuple.subject_relation)
    }
}

/// Kind of a changelog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Delete,
}

/// Audit record appended atomically with every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub change_type: ChangeType,
    pub tuple: RelationTuple,
    pub zone_id: String,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a single check as seen by observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied,
    /// Denied because evaluation hit a graph limit; a capacity signal.
    LimitExceeded,
    /// Denied because a relation tried to resolve across zones.
    CrossZoneDenied,
}

/// Which layer answered a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Tiger,
    Leopard,
    Evaluator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub decision: Decision,
    pub source: DecisionSource,
    /// Zone revision the answer was computed against.
    pub revision: u64,
}

impl CheckResult {
    pub(crate) fn new(allowed: bool, source: DecisionSource, revision: u64) -> Self {
        Self {
            allowed,
            decision: if allowed {
                Decision::Allowed
            } else {
                Decision::Denied
            },
            source,
            revision,
        }
    }

    pub(crate) fn denied_by(decision: Decision, revision: u64) -> Self {
        Self {
            allowed: false,
            decision,
            source: DecisionSource::Evaluator,
            revision,
        }
    }
}

/// Returned by every mutating operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub tuple_id: String,
    pub zone_id: String,
    pub revision: u64,
    /// Zookie for read-your-writes checks.
    pub token: String,
}

/// Result of an idempotent delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(WriteResult),
    NotFound,
}

impl DeleteOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted(_))
    }
}
