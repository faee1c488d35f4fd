//! 📦 Records: the things we carry.
//!
//! 🎬 COLD OPEN. A caller hands us a blob of properties, a collection name and a
//! vague promise that the referenced objects exist. We give it a UUID, a place in
//! line and a number it will carry to its grave (the results map).
//!
//! Two flavours of cargo:
//! - [`PendingObject`]: a document with properties, maybe vectors, maybe a tenant.
//! - [`PendingReference`]: a cross-reference `from -> to`. One per target, always.
//!
//! Validation happens here, synchronously, before anything touches a queue. A record
//! that fails validation never gets an insertion index and is never retried. 🦆

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::BatchError;

/// 🔢 Monotonic, engine-assigned, never reused. The key of both result maps.
pub type InsertionIndex = u64;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[_A-Za-z][_0-9A-Za-z]*$").unwrap_or_else(|err| panic!("💀 bad name pattern: {err}"))
});

const RESERVED_PROPERTIES: &[&str] = &["id", "_id", "_additional"];

/// 🧭 Vectors come alone or in named packs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Vectors {
    Single(Vec<f32>),
    Named(BTreeMap<String, Vec<f32>>),
}

/// 🗂️ The unit of server-side storage we tracked writes to. Readiness polling walks these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Shard {
    pub collection: String,
    pub tenant: Option<String>,
}

/// ✍️ An object as the caller describes it. The engine turns it into a [`PendingObject`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewObject {
    pub collection: String,
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// 🔗 `property -> targets`, expanded into pending references queued after the object.
    #[serde(default)]
    pub references: BTreeMap<String, Vec<Uuid>>,
    #[serde(default, alias = "vector")]
    pub vectors: Option<Vectors>,
    #[serde(default)]
    pub tenant: Option<String>,
}

impl NewObject {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vectors = Some(Vectors::Single(vector));
        self
    }

    pub fn with_named_vector(mut self, name: impl Into<String>, vector: Vec<f32>) -> Self {
        let mut named = match self.vectors.take() {
            Some(Vectors::Named(named)) => named,
            _ => BTreeMap::new(),
        };
        named.insert(name.into(), vector);
        self.vectors = Some(Vectors::Named(named));
        self
    }

    pub fn with_reference(mut self, property: impl Into<String>, target: Uuid) -> Self {
        self.references.entry(property.into()).or_default().push(target);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// 🚫 Everything we can reject without asking the server.
    pub fn validate(&self) -> Result<(), BatchError> {
        validate_name("collection", &self.collection)?;
        for name in self.properties.keys() {
            validate_property(name)?;
        }
        for (property, targets) in &self.references {
            validate_property(property)?;
            if targets.is_empty() {
                return Err(BatchError::Validation(format!(
                    "reference property '{property}' has no targets"
                )));
            }
        }
        if let Some(vectors) = &self.vectors {
            validate_vectors(vectors)?;
        }
        validate_tenant(self.tenant.as_deref())
    }

    /// 🆔 Stamp it with an index and (if the caller was shy) a fresh v4 UUID.
    pub(crate) fn into_pending(self, index: InsertionIndex) -> PendingObject {
        PendingObject {
            index,
            collection: self.collection,
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            properties: self.properties,
            references: self.references,
            vectors: self.vectors,
            tenant: self.tenant,
            retries: 0,
        }
    }
}

/// ✍️ A reference as the caller describes it: one source, one or more targets.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewReference {
    pub from_collection: String,
    pub from_uuid: Uuid,
    pub from_property: String,
    pub to: Vec<Uuid>,
    #[serde(default)]
    pub to_collection: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
}

impl NewReference {
    pub fn new(
        from_collection: impl Into<String>,
        from_uuid: Uuid,
        from_property: impl Into<String>,
        to: Uuid,
    ) -> Self {
        Self {
            from_collection: from_collection.into(),
            from_uuid,
            from_property: from_property.into(),
            to: vec![to],
            to_collection: None,
            tenant: None,
        }
    }

    pub fn with_target(mut self, to: Uuid) -> Self {
        self.to.push(to);
        self
    }

    pub fn with_to_collection(mut self, collection: impl Into<String>) -> Self {
        self.to_collection = Some(collection.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        validate_name("collection", &self.from_collection)?;
        validate_property(&self.from_property)?;
        if let Some(to_collection) = &self.to_collection {
            validate_name("target collection", to_collection)?;
        }
        if self.to.is_empty() {
            return Err(BatchError::Validation("reference has no targets".into()));
        }
        validate_tenant(self.tenant.as_deref())
    }
}

/// 📦 An object with a place in line.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingObject {
    pub index: InsertionIndex,
    pub collection: String,
    pub uuid: Uuid,
    pub properties: Map<String, Value>,
    pub references: BTreeMap<String, Vec<Uuid>>,
    pub vectors: Option<Vectors>,
    pub tenant: Option<String>,
    pub retries: u32,
}

impl PendingObject {
    pub fn shard(&self) -> Shard {
        Shard {
            collection: self.collection.clone(),
            tenant: self.tenant.clone(),
        }
    }

    /// 🧬 Turn the object back into something `add_object` accepts. Used by retries.
    pub fn to_new_object(&self) -> NewObject {
        NewObject {
            collection: self.collection.clone(),
            uuid: Some(self.uuid),
            properties: self.properties.clone(),
            // -- references were already queued as their own records the first time around
            references: BTreeMap::new(),
            vectors: self.vectors.clone(),
            tenant: self.tenant.clone(),
        }
    }
}

/// 🔗 One edge. Multi-target references are fanned out into several of these.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReference {
    pub index: InsertionIndex,
    pub from_collection: String,
    pub from_uuid: Uuid,
    pub from_property: String,
    pub to_collection: Option<String>,
    pub to_uuid: Uuid,
    pub tenant: Option<String>,
    pub retries: u32,
}

impl PendingReference {
    /// 🏷️ The correlation key the server echoes back in acks and results.
    pub fn beacon(&self) -> String {
        match &self.to_collection {
            Some(to_collection) => format!(
                "{}/{}/{}/{}/{}",
                self.from_collection, self.from_uuid, self.from_property, to_collection, self.to_uuid
            ),
            None => format!(
                "{}/{}/{}/{}",
                self.from_collection, self.from_uuid, self.from_property, self.to_uuid
            ),
        }
    }

    pub fn shard(&self) -> Shard {
        Shard {
            collection: self.from_collection.clone(),
            tenant: self.tenant.clone(),
        }
    }

    pub fn to_new_reference(&self) -> NewReference {
        NewReference {
            from_collection: self.from_collection.clone(),
            from_uuid: self.from_uuid,
            from_property: self.from_property.clone(),
            to: vec![self.to_uuid],
            to_collection: self.to_collection.clone(),
            tenant: self.tenant.clone(),
        }
    }
}

/// 🔀 Fan a reference out into one pending record per target, indices handed out in order.
pub(crate) fn fan_out(
    reference: NewReference,
    mut next_index: impl FnMut() -> InsertionIndex,
) -> Vec<PendingReference> {
    let NewReference {
        from_collection,
        from_uuid,
        from_property,
        to,
        to_collection,
        tenant,
    } = reference;
    to.into_iter()
        .map(|to_uuid| PendingReference {
            index: next_index(),
            from_collection: from_collection.clone(),
            from_uuid,
            from_property: from_property.clone(),
            to_collection: to_collection.clone(),
            to_uuid,
            tenant: tenant.clone(),
            retries: 0,
        })
        .collect()
}

/// 🎒 Whatever is sitting in the queue or the in-flight cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Object(PendingObject),
    Reference(PendingReference),
}

impl Record {
    pub fn index(&self) -> InsertionIndex {
        match self {
            Record::Object(object) => object.index,
            Record::Reference(reference) => reference.index,
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            Record::Object(object) => object.retries,
            Record::Reference(reference) => reference.retries,
        }
    }

    pub(crate) fn bump_retries(&mut self) -> u32 {
        let retries = match self {
            Record::Object(object) => &mut object.retries,
            Record::Reference(reference) => &mut reference.retries,
        };
        *retries += 1;
        *retries
    }

    /// 🚧 A reference is held back while either end is an object the server hasn't acked.
    pub fn is_blocked_by(&self, exclusion: &HashSet<Uuid>) -> bool {
        match self {
            Record::Object(_) => false,
            Record::Reference(reference) => {
                exclusion.contains(&reference.from_uuid) || exclusion.contains(&reference.to_uuid)
            }
        }
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), BatchError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(BatchError::Validation(format!(
            "{kind} name '{name}' must match {}",
            NAME_PATTERN.as_str()
        )))
    }
}

fn validate_property(name: &str) -> Result<(), BatchError> {
    if RESERVED_PROPERTIES.contains(&name) {
        return Err(BatchError::Validation(format!(
            "property name '{name}' is reserved"
        )));
    }
    validate_name("property", name)
}

fn validate_vectors(vectors: &Vectors) -> Result<(), BatchError> {
    match vectors {
        Vectors::Single(vector) if vector.is_empty() => {
            Err(BatchError::Validation("vector must not be empty".into()))
        }
        Vectors::Single(_) => Ok(()),
        Vectors::Named(named) => {
            for (name, vector) in named {
                if name.is_empty() {
                    return Err(BatchError::Validation("named vector has an empty name".into()));
                }
                if vector.is_empty() {
                    return Err(BatchError::Validation(format!(
                        "named vector '{name}' must not be empty"
                    )));
                }
            }
            Ok(())
        }
    }
}

fn validate_tenant(tenant: Option<&str>) -> Result<(), BatchError> {
    match tenant {
        Some(tenant) if tenant.trim().is_empty() => {
            Err(BatchError::Validation("tenant must not be empty".into()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_a_shy_object_gets_a_uuid() {
        let pending = NewObject::new("Article")
            .with_property("title", "hello")
            .into_pending(7);
        assert_eq!(pending.index, 7);
        assert_eq!(pending.uuid.get_version_num(), 4);
        assert_eq!(pending.retries, 0);
    }

    #[test]
    fn the_one_where_a_caller_uuid_is_kept() {
        let uuid = Uuid::new_v4();
        let pending = NewObject::new("Article").with_uuid(uuid).into_pending(0);
        assert_eq!(pending.uuid, uuid);
    }

    #[test]
    fn the_one_where_bad_names_are_turned_away_at_the_door() {
        assert!(NewObject::new("123 Main St").validate().is_err());
        assert!(NewObject::new("Article").validate().is_ok());
        assert!(NewObject::new("_private").validate().is_ok());
        let err = NewObject::new("Article")
            .with_property("id", 1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, BatchError::Validation(msg) if msg.contains("reserved")));
        assert!(
            NewObject::new("Article")
                .with_property("has space", 1)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn the_one_where_empty_vectors_and_tenants_are_rejected() {
        assert!(NewObject::new("A").with_vector(vec![]).validate().is_err());
        assert!(
            NewObject::new("A")
                .with_named_vector("", vec![1.0])
                .validate()
                .is_err()
        );
        assert!(NewObject::new("A").with_tenant("  ").validate().is_err());
        assert!(
            NewObject::new("A")
                .with_named_vector("title", vec![1.0])
                .with_named_vector("body", vec![2.0])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn the_one_where_a_reference_with_three_targets_becomes_three_references() {
        let from = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let reference = NewReference::new("Article", from, "cites", a)
            .with_target(b)
            .with_target(c);
        assert!(reference.validate().is_ok());
        let mut next = 10;
        let pending = fan_out(reference, || {
            next += 1;
            next - 1
        });
        let indices: Vec<_> = pending.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![10, 11, 12]);
        let targets: Vec<_> = pending.iter().map(|r| r.to_uuid).collect();
        assert_eq!(targets, vec![a, b, c]);
    }

    #[test]
    fn the_one_where_beacons_spell_out_both_ends() {
        let from = Uuid::nil();
        let to = Uuid::max();
        let reference = PendingReference {
            index: 0,
            from_collection: "Article".into(),
            from_uuid: from,
            from_property: "author".into(),
            to_collection: Some("Person".into()),
            to_uuid: to,
            tenant: None,
            retries: 0,
        };
        assert_eq!(
            reference.beacon(),
            format!("Article/{from}/author/Person/{to}")
        );
    }

    #[test]
    fn the_one_where_references_wait_for_their_objects() {
        let (from, to) = (Uuid::new_v4(), Uuid::new_v4());
        let mut next = 0;
        let reference = fan_out(NewReference::new("A", from, "p", to), || {
            next += 1;
            next
        })
        .remove(0);
        let record = Record::Reference(reference);
        let mut exclusion = HashSet::new();
        assert!(!record.is_blocked_by(&exclusion));
        exclusion.insert(to);
        assert!(record.is_blocked_by(&exclusion));
        let object = Record::Object(NewObject::new("A").with_uuid(to).into_pending(5));
        assert!(!object.is_blocked_by(&exclusion), "objects are never held back");
    }

    #[test]
    fn the_one_where_objects_deserialize_from_a_json_line() {
        let line = json!({
            "collection": "Article",
            "properties": {"title": "hi"},
            "vector": [0.1, 0.2],
            "tenant": "acme"
        });
        let object: NewObject = serde_json::from_value(line).expect("object line should parse");
        assert_eq!(object.vectors, Some(Vectors::Single(vec![0.1, 0.2])));
        assert_eq!(object.tenant.as_deref(), Some("acme"));
        assert!(object.validate().is_ok());
    }
}
