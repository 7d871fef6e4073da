//! Zanzibar-style relationship-based access control for Nexus.
//!
//! Answers "can subject S do permission P on object O in zone Z?" over a
//! store of relation tuples, with two cooperating caches in front of the
//! graph evaluator. Every cache is disposable: an engine with both disabled
//! returns the same answers, only slower.
//!
//! Modules:
//! - `types`: entities, tuples, filters, changelog, check/write results
//! - `error`: `RebacError` and the crate `Result`
//! - `config`: `EngineConfig`, `GraphLimits`, cache settings
//! - `namespace`: namespace rules, JSON format, registry, cross-zone allow-list
//! - `conditions`: ABAC predicates on tuples
//! - `store`: `TupleStore` contract and the in-memory store
//! - `evaluator`: recursive check and expand with cycle and limit protection
//! - `leopard`: transitive group-membership closure index
//! - `bitmap`: Roaring bitmap helpers and object-id interning
//! - `tiger`: per-subject permission bitmap cache
//! - `revision`: per-zone revisions, consistency levels, zookies
//! - `engine`: `RebacEngine` facade

pub mod bitmap;
pub mod conditions;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod leopard;
pub mod namespace;
pub mod revision;
pub mod store;
pub mod tiger;
pub mod types;

pub use conditions::{CheckContext, Conditions, TimeWindow};
pub use config::{EngineConfig, GraphLimits, LeopardConfig, TigerConfig};
pub use engine::{CheckRequest, EngineStats, ListOptions, ObjectPage, RebacEngine};
pub use error::{GraphLimit, RebacError, Result};
pub use evaluator::{ExpandKind, ExpandTree};
pub use namespace::{NamespaceConfig, NamespaceRegistry};
pub use revision::Consistency;
pub use store::{MemoryTupleStore, TupleStore};
pub use types::{
    CheckResult, Decision, DecisionSource, DeleteOutcome, Entity, RelationTuple, TupleKey,
    TupleWrite, WriteResult, DEFAULT_ZONE,
};
