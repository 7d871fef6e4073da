//! Namespace configuration and registry.
//!
//! A namespace is the schema of one object type: named relation rules plus
//! permissions (each a union of relation names). Configs are exchanged as
//! JSON:
//!
//! ```json
//! {
//!   "relations": {
//!     "direct_owner": "direct",
//!     "parent": {},
//!     "parent_owner": {"tupleToUserset": {"tupleset": "parent", "computedUserset": "owner"}},
//!     "owner": {"union": ["direct_owner", "parent_owner"]},
//!     "can_access": {"exclusion": {"base": "base", "excluded": "blocked"}},
//!     "both": {"intersection": ["a", "b"]}
//!   },
//!   "permissions": {"write": ["owner"]}
//! }
//! ```

use std::collections::HashMap as StdHashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use ahash::AHashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{RebacError, Result};

/// Relations with this prefix may resolve across zone boundaries.
pub const CROSS_ZONE_RELATION_PREFIX: &str = "shared-";

/// The fixed cross-zone allow-list. Not configurable per request.
pub fn is_cross_zone_relation(relation: &str) -> bool {
    relation.starts_with(CROSS_ZONE_RELATION_PREFIX)
}

// Parsed-config cache keyed by BLAKE3 of the JSON text, so re-registering an
// unchanged document skips parsing and validation.
const NAMESPACE_CACHE_CAPACITY: usize = 256;

// ============================================================================
// Wire format
// ============================================================================

/// Namespace configuration as exchanged in JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfigJson {
    #[serde(default)]
    pub relations: StdHashMap<String, RelationConfig>,
    #[serde(default)]
    pub permissions: StdHashMap<String, Vec<String>>,
}

/// Configuration for a single relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationConfig {
    /// Matches the string `"direct"`.
    Direct(String),
    Union {
        union: Vec<String>,
    },
    Intersection {
        intersection: Vec<String>,
    },
    Exclusion {
        exclusion: ExclusionConfig,
    },
    TupleToUserset {
        #[serde(rename = "tupleToUserset")]
        tuple_to_userset: TupleToUsersetConfig,
    },
    /// `{}` means direct.
    EmptyDict(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionConfig {
    pub base: String,
    pub excluded: String,
}

/// TupleToUserset expansion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleToUsersetConfig {
    pub tupleset: String,
    #[serde(rename = "computedUserset")]
    pub computed_userset: String,
}

// ============================================================================
// Validated form
// ============================================================================

/// A relation rule after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationRule {
    /// Leaf, matched against stored tuples.
    Direct,
    Union(Vec<String>),
    Intersection(Vec<String>),
    Exclusion { base: String, excluded: String },
    /// Follow `tupleset` from the object, then resolve `computed_userset` there.
    TupleToUserset {
        tupleset: String,
        computed_userset: String,
    },
}

/// Validated namespace for one object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub object_type: String,
    pub relations: AHashMap<String, RelationRule>,
    pub permissions: AHashMap<String, Vec<String>>,
}

/// What a name resolves to inside a namespace.
#[derive(Debug, Clone, Copy)]
pub enum Resolved<'a> {
    Permission(&'a [String]),
    Relation(&'a RelationRule),
    /// Not declared: treated as a direct relation so tuples written before a
    /// schema change keep their meaning.
    Undeclared,
}

impl NamespaceConfig {
    /// Validate a wire config for `object_type`.
    pub fn from_json_config(object_type: &str, raw: NamespaceConfigJson) -> Result<Self> {
        let mut relations = AHashMap::with_capacity(raw.relations.len());
        for (name, config) in raw.relations {
            let rule = match config {
                RelationConfig::Direct(s) if s == "direct" => RelationRule::Direct,
                RelationConfig::Direct(s) => {
                    return Err(RebacError::schema(
                        object_type,
                        format!("relation '{name}': unknown rule string '{s}'"),
                    ))
                }
                RelationConfig::EmptyDict(map) if map.is_empty() => RelationRule::Direct,
                RelationConfig::EmptyDict(map) => {
                    let keys: Vec<&String> = map.keys().collect();
                    return Err(RebacError::schema(
                        object_type,
                        format!("relation '{name}': unknown rule keys {keys:?}"),
                    ));
                }
                RelationConfig::Union { union } => RelationRule::Union(union),
                RelationConfig::Intersection { intersection } => {
                    RelationRule::Intersection(intersection)
                }
                RelationConfig::Exclusion { exclusion } => RelationRule::Exclusion {
                    base: exclusion.base,
                    excluded: exclusion.excluded,
                },
                RelationConfig::TupleToUserset { tuple_to_userset } => {
                    RelationRule::TupleToUserset {
                        tupleset: tuple_to_userset.tupleset,
                        computed_userset: tuple_to_userset.computed_userset,
                    }
                }
            };
            relations.insert(name, rule);
        }

        let config = NamespaceConfig {
            object_type: object_type.to_string(),
            relations,
            permissions: raw.permissions.into_iter().collect(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(object_type: &str, json: &str) -> Result<Self> {
        let raw: NamespaceConfigJson = serde_json::from_str(json)?;
        Self::from_json_config(object_type, raw)
    }

    /// Every name a rule or permission references must be declared here.
    ///
    /// `computedUserset` is resolved on another object type and cannot be
    /// checked locally; cycles are caught at evaluation time.
    fn validate(&self) -> Result<()> {
        let declared = |name: &str| {
            self.relations.contains_key(name) || self.permissions.contains_key(name)
        };
        let require = |owner: &str, name: &str| -> Result<()> {
            if declared(name) {
                Ok(())
            } else {
                Err(RebacError::schema(
                    &self.object_type,
                    format!("'{owner}' references undefined relation '{name}'"),
                ))
            }
        };

        for (name, rule) in &self.relations {
            if self.permissions.contains_key(name) {
                return Err(RebacError::schema(
                    &self.object_type,
                    format!("'{name}' is declared as both relation and permission"),
                ));
            }
            match rule {
                RelationRule::Direct => {}
                RelationRule::Union(children) | RelationRule::Intersection(children) => {
                    if children.is_empty() {
                        return Err(RebacError::schema(
                            &self.object_type,
                            format!("'{name}' has an empty operand list"),
                        ));
                    }
                    for child in children {
                        require(name, child)?;
                    }
                }
                RelationRule::Exclusion { base, excluded } => {
                    require(name, base)?;
                    require(name, excluded)?;
                }
                RelationRule::TupleToUserset { tupleset, .. } => {
                    require(name, tupleset)?;
                }
            }
        }

        for (name, relations) in &self.permissions {
            for relation in relations {
                require(name, relation)?;
            }
        }
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Resolved<'_> {
        if let Some(relations) = self.permissions.get(name) {
            Resolved::Permission(relations)
        } else if let Some(rule) = self.relations.get(name) {
            Resolved::Relation(rule)
        } else {
            Resolved::Undeclared
        }
    }

    /// Convert back to the wire format.
    pub fn to_json_config(&self) -> NamespaceConfigJson {
        let relations = self
            .relations
            .iter()
            .map(|(name, rule)| {
                let config = match rule {
                    RelationRule::Direct => RelationConfig::Direct("direct".to_string()),
                    RelationRule::Union(u) => RelationConfig::Union { union: u.clone() },
                    RelationRule::Intersection(i) => RelationConfig::Intersection {
                        intersection: i.clone(),
                    },
                    RelationRule::Exclusion { base, excluded } => RelationConfig::Exclusion {
                        exclusion: ExclusionConfig {
                            base: base.clone(),
                            excluded: excluded.clone(),
                        },
                    },
                    RelationRule::TupleToUserset {
                        tupleset,
                        computed_userset,
                    } => RelationConfig::TupleToUserset {
                        tuple_to_userset: TupleToUsersetConfig {
                            tupleset: tupleset.clone(),
                            computed_userset: computed_userset.clone(),
                        },
                    },
                };
                (name.clone(), config)
            })
            .collect();
        NamespaceConfigJson {
            relations,
            permissions: self
                .permissions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Thread-safe registry of namespaces keyed by object type.
pub struct NamespaceRegistry {
    namespaces: RwLock<AHashMap<String, Arc<NamespaceConfig>>>,
    parsed: Mutex<LruCache<(String, [u8; 32]), Arc<NamespaceConfig>>>,
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(NAMESPACE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            namespaces: RwLock::new(AHashMap::new()),
            parsed: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Registry preloaded with the VFS namespaces (`file`, `group`).
    pub fn with_defaults() -> Result<Self> {
        let registry = Self::new();
        for (object_type, json) in DEFAULT_NAMESPACES {
            registry.register_json(object_type, json)?;
        }
        Ok(registry)
    }

    /// Register (or replace) a validated namespace.
    pub fn register(&self, config: NamespaceConfig) -> Result<()> {
        config.validate()?;
        tracing::debug!(object_type = %config.object_type, "namespace registered");
        self.namespaces
            .write()
            .insert(config.object_type.clone(), Arc::new(config));
        Ok(())
    }

    /// Parse, validate and register a JSON namespace config.
    pub fn register_json(&self, object_type: &str, json: &str) -> Result<()> {
        let key = (object_type.to_string(), *blake3::hash(json.as_bytes()).as_bytes());
        let cached = self.parsed.lock().get(&key).cloned();
        let config = match cached {
            Some(config) => config,
            None => {
                let config = Arc::new(NamespaceConfig::parse(object_type, json)?);
                self.parsed.lock().put(key, config.clone());
                config
            }
        };
        tracing::debug!(object_type, "namespace registered");
        self.namespaces
            .write()
            .insert(object_type.to_string(), config);
        Ok(())
    }

    pub fn get(&self, object_type: &str) -> Option<Arc<NamespaceConfig>> {
        self.namespaces.read().get(object_type).cloned()
    }

    /// Whether `relation` is used as a tupleset anywhere. Such edges make
    /// their subject act as an object, so changes to them can affect any
    /// subject's permissions.
    pub fn is_tupleset_relation(&self, relation: &str) -> bool {
        self.namespaces.read().values().any(|ns| {
            ns.relations.values().any(|rule| {
                matches!(
                    rule,
                    RelationRule::TupleToUserset { tupleset, .. } if tupleset == relation
                )
            })
        })
    }
}

/// Namespaces shipped with the VFS.
pub const DEFAULT_NAMESPACES: [(&str, &str); 2] = [
    (
        "file",
        r#"{
            "relations": {
                "direct_owner": "direct",
                "direct_editor": "direct",
                "direct_viewer": "direct",
                "shared-editor": "direct",
                "shared-viewer": "direct",
                "parent": "direct",
                "parent_owner": {
                    "tupleToUserset": {"tupleset": "parent", "computedUserset": "owner"}
                },
                "parent_editor": {
                    "tupleToUserset": {"tupleset": "parent", "computedUserset": "editor"}
                },
                "parent_viewer": {
                    "tupleToUserset": {"tupleset": "parent", "computedUserset": "viewer"}
                },
                "owner": {"union": ["direct_owner", "parent_owner"]},
                "editor": {"union": ["direct_editor", "parent_editor", "shared-editor", "owner"]},
                "viewer": {"union": ["direct_viewer", "parent_viewer", "shared-viewer", "editor"]}
            },
            "permissions": {
                "read": ["viewer"],
                "write": ["editor"],
                "execute": ["owner"]
            }
        }"#,
    ),
    (
        "group",
        r#"{
            "relations": {
                "member": "direct",
                "admin": "direct"
            },
            "permissions": {
                "read": ["member", "admin"],
                "manage": ["admin"]
            }
        }"#,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_direct_relation() {
        let json = r#"{"relations":{"owner":"direct"},"permissions":{"read":["owner"]}}"#;
        let config = NamespaceConfig::parse("file", json).unwrap();
        assert_eq!(config.relations.get("owner"), Some(&RelationRule::Direct));
        assert_eq!(config.permissions.get("read").unwrap(), &vec!["owner"]);
    }

    #[test]
    fn parse_empty_dict_relation() {
        let json = r#"{"relations":{"viewer":{}},"permissions":{"read":["viewer"]}}"#;
        let config = NamespaceConfig::parse("file", json).unwrap();
        assert_eq!(config.relations.get("viewer"), Some(&RelationRule::Direct));
    }

    #[test]
    fn parse_all_rule_kinds() {
        let json = r#"{
            "relations":{
                "a":"direct","b":"direct","parent":"direct",
                "u":{"union":["a","b"]},
                "i":{"intersection":["a","b"]},
                "x":{"exclusion":{"base":"a","excluded":"b"}},
                "t":{"tupleToUserset":{"tupleset":"parent","computedUserset":"viewer"}}
            }
        }"#;
        let config = NamespaceConfig::parse("doc", json).unwrap();
        assert_eq!(
            config.relations.get("u"),
            Some(&RelationRule::Union(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            config.relations.get("i"),
            Some(&RelationRule::Intersection(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            config.relations.get("x"),
            Some(&RelationRule::Exclusion {
                base: "a".into(),
                excluded: "b".into()
            })
        );
        assert_eq!(
            config.relations.get("t"),
            Some(&RelationRule::TupleToUserset {
                tupleset: "parent".into(),
                computed_userset: "viewer".into()
            })
        );
        assert!(config.permissions.is_empty());
    }

    #[test]
    fn undefined_reference_is_schema_error() {
        let json = r#"{"relations":{"editor":{"union":["owner","ghost"]},"owner":"direct"}}"#;
        let err = NamespaceConfig::parse("file", json).unwrap_err();
        assert!(matches!(err, RebacError::Schema { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn permission_with_undefined_relation_is_schema_error() {
        let json = r#"{"relations":{"owner":"direct"},"permissions":{"read":["viewer"]}}"#;
        assert!(matches!(
            NamespaceConfig::parse("file", json),
            Err(RebacError::Schema { .. })
        ));
    }

    #[test]
    fn misspelled_rule_is_rejected_not_treated_as_direct() {
        let json = r#"{"relations":{"a":"direct","u":{"unoin":["a"]}}}"#;
        assert!(matches!(
            NamespaceConfig::parse("file", json),
            Err(RebacError::Schema { .. })
        ));
        let json = r#"{"relations":{"a":"indirect"}}"#;
        assert!(matches!(
            NamespaceConfig::parse("file", json),
            Err(RebacError::Schema { .. })
        ));
    }

    #[test]
    fn self_referencing_union_is_accepted() {
        // cycles are legal structurally; the evaluator cuts them
        let json = r#"{"relations":{"a":{"union":["b"]},"b":{"union":["a"]}}}"#;
        assert!(NamespaceConfig::parse("loop", json).is_ok());
    }

    #[test]
    fn wire_roundtrip_preserves_meaning() {
        let registry = NamespaceRegistry::with_defaults().unwrap();
        let file = registry.get("file").unwrap();
        let json = serde_json::to_string(&file.to_json_config()).unwrap();
        let reparsed = NamespaceConfig::parse("file", &json).unwrap();
        assert_eq!(*file, reparsed);
    }

    #[test]
    fn registry_replaces_namespaces() {
        let registry = NamespaceRegistry::with_defaults().unwrap();
        assert!(registry.get("file").unwrap().relations.len() > 1);
        registry
            .register_json("file", r#"{"relations":{"owner":"direct"}}"#)
            .unwrap();
        let file = registry.get("file").unwrap();
        assert_eq!(file.relations.len(), 1);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn tupleset_relations_are_detected() {
        let registry = NamespaceRegistry::with_defaults().unwrap();
        assert!(registry.is_tupleset_relation("parent"));
        assert!(!registry.is_tupleset_relation("direct_viewer"));
    }

    #[test]
    fn cross_zone_allow_list() {
        assert!(is_cross_zone_relation("shared-viewer"));
        assert!(!is_cross_zone_relation("viewer"));
        assert!(!is_cross_zone_relation("sharedviewer"));
    }
}
