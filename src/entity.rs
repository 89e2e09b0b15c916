//! Entity types - the unit of persistence
//!
//! Every stored thing is an entity: a uid, bookkeeping metadata, and a map
//! of kind-specific properties. `Record` is the untyped form both backends
//! read and write; application types implement `Entity` to convert to and
//! from it and to hook into the write lifecycle.

use crate::storage::schema::{FieldDefault, TableDefinition};
use crate::uid::{self, Kinded, Uid};
use crate::value::{Properties, PropertyType, Value};
use crate::{Error, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Which backing store holds a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hierarchical, eventually consistent document store
    Document,
    /// SQLite tables
    Relational,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Document => "document",
            BackendKind::Relational => "relational",
        }
    }

    /// Random local id length for new uids.
    pub fn default_id_length(&self) -> usize {
        match self {
            BackendKind::Document => uid::DOCUMENT_ID_LENGTH,
            BackendKind::Relational => uid::RELATIONAL_ID_LENGTH,
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "document" | "datastore" | "doc" => Ok(BackendKind::Document),
            "relational" | "sql" | "sqlite" => Ok(BackendKind::Relational),
            _ => Err(Error::Validation(format!("Unknown backend: {}", s))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bookkeeping every entity carries, whatever its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub uid: Uid,
    pub short_uid: String,
    /// Soft-delete flag. Only the document store uses it.
    pub deleted: bool,
    /// Set by the store on first write
    pub created: Option<NaiveDateTime>,
    /// Set by the store on every write
    pub modified: Option<NaiveDateTime>,
    /// Properties as they were when the entity was created or last loaded.
    /// Handed to the write hooks so they can tell what changed.
    #[serde(skip)]
    pub snapshot: Properties,
}

impl EntityMeta {
    pub fn new(uid: Uid) -> Self {
        Self {
            short_uid: uid.short(),
            uid,
            deleted: false,
            created: None,
            modified: None,
            snapshot: Properties::new(),
        }
    }
}

/// Names handled by `EntityMeta` rather than the property map.
pub const META_FIELDS: &[&str] = &["uid", "short_uid", "deleted", "created", "modified"];

/// An untyped entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub meta: EntityMeta,
    pub properties: Properties,
}

impl Record {
    /// A fresh record whose snapshot is its initial properties.
    pub fn new(uid: Uid, properties: Properties) -> Self {
        let mut meta = EntityMeta::new(uid);
        meta.snapshot = properties.clone();
        Self { meta, properties }
    }

    pub fn uid(&self) -> &Uid {
        &self.meta.uid
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Value of a property or metadata field as filters and orderings see it.
    /// Missing properties read as null.
    pub fn field(&self, name: &str) -> Value {
        match name {
            "uid" => Value::Text(self.meta.uid.to_string()),
            "short_uid" => Value::Text(self.meta.short_uid.clone()),
            "deleted" => Value::Bool(self.meta.deleted),
            "created" => self.meta.created.map_or(Value::Null, Value::Timestamp),
            "modified" => self.meta.modified.map_or(Value::Null, Value::Timestamp),
            _ => self.properties.get(name).cloned().unwrap_or(Value::Null),
        }
    }

    /// Client representation: metadata and properties in one JSON object,
    /// keys sorted.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for name in META_FIELDS {
            map.insert(name.to_string(), self.field(name).to_json());
        }
        for (name, value) in &self.properties {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

impl Kinded for Record {
    fn type_name(&self) -> &str {
        self.meta.uid.type_name()
    }
}

/// Anything the repositories can persist.
///
/// Implementors convert to and from `Record` and may override the write
/// hooks. `before_put` runs before the native write and can abort it by
/// returning an error; `after_put` runs once the write succeeded.
pub trait Entity: Sized {
    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn to_record(&self) -> Record;

    fn from_record(record: Record) -> Result<Self>;

    fn uid(&self) -> &Uid {
        &self.meta().uid
    }

    fn before_put(&mut self, _snapshot: &Properties) -> Result<()> {
        Ok(())
    }

    fn after_put(&self, _snapshot: &Properties) -> Result<()> {
        Ok(())
    }
}

impl Entity for Record {
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn to_record(&self) -> Record {
        self.clone()
    }

    fn from_record(record: Record) -> Result<Self> {
        Ok(record)
    }
}

/// Everything the store needs to know about a kind, declared up front.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub type_name: String,
    /// Types of the ancestors in uid order, parent first. Needed to expand
    /// short uids of child entities.
    pub ancestor_types: Vec<String>,
    pub backend: BackendKind,
    pub id_length: usize,
    /// Declared properties of document kinds. Relational kinds derive theirs
    /// from `table`.
    pub properties: BTreeMap<String, PropertyType>,
    pub defaults: Properties,
    pub table: Option<TableDefinition>,
}

impl EntitySchema {
    /// A document-store kind.
    pub fn document(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ancestor_types: Vec::new(),
            backend: BackendKind::Document,
            id_length: uid::DOCUMENT_ID_LENGTH,
            properties: BTreeMap::new(),
            defaults: Properties::new(),
            table: None,
        }
    }

    /// A relational kind backed by `table`.
    pub fn relational(table: TableDefinition) -> Self {
        Self {
            type_name: table.type_name.clone(),
            ancestor_types: Vec::new(),
            backend: BackendKind::Relational,
            id_length: uid::RELATIONAL_ID_LENGTH,
            properties: BTreeMap::new(),
            defaults: Properties::new(),
            table: Some(table),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.properties.insert(name.into(), ty);
        self
    }

    pub fn with_default(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(name.into(), value.into());
        self
    }

    pub fn with_ancestors(mut self, types: &[&str]) -> Self {
        self.ancestor_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_id_length(mut self, id_length: usize) -> Self {
        self.id_length = id_length;
        self
    }

    /// Entity type first, then its ancestors.
    pub fn type_chain(&self) -> Vec<&str> {
        std::iter::once(self.type_name.as_str())
            .chain(self.ancestor_types.iter().map(String::as_str))
            .collect()
    }

    /// Expand a short or long id of this kind. `None` when the id can't be
    /// decoded or belongs to another kind. A short id with fewer segments
    /// than the type chain names an entity without the outer ancestors.
    pub fn long_uid(&self, id: &str) -> Option<Uid> {
        let chain = self.type_chain();
        let segments = id.split('.').count();
        let chain = &chain[..segments.min(chain.len())];
        let long = uid::to_long_form(id, Some(chain))?;
        (long.type_name() == self.type_name).then_some(long)
    }

    /// Properties a caller may filter on or write, with their types.
    pub fn property_types(&self) -> BTreeMap<String, PropertyType> {
        let mut types = match &self.table {
            Some(table) => table
                .fields
                .iter()
                .filter(|f| !matches!(f.name.as_str(), "uid" | "short_uid" | "created" | "modified"))
                .map(|f| (f.name.clone(), f.property_type()))
                .collect(),
            None => self.properties.clone(),
        };
        if self.backend == BackendKind::Document {
            types.insert("deleted".to_string(), PropertyType::Bool);
        }
        types
    }

    /// Starting properties for `create`. Relational defaults come from the
    /// field definitions: bool defaults written as 0/1 become booleans, JSON
    /// defaults are parsed, and timestamp-defaulted fields are left to the
    /// database.
    pub fn defaults(&self) -> Result<Properties> {
        let mut props = Properties::new();
        if let Some(table) = &self.table {
            for field in &table.fields {
                if matches!(field.name.as_str(), "uid" | "short_uid") {
                    continue;
                }
                let value = match &field.default {
                    FieldDefault::CurrentTimestamp => continue,
                    FieldDefault::None | FieldDefault::Null => Value::Null,
                    default if field.is_bool() => Value::Bool(default.as_i64() == Some(1)),
                    FieldDefault::Text(text) if field.json => {
                        Value::Json(serde_json::from_str(text)?)
                    }
                    FieldDefault::Text(text) => Value::Text(text.clone()),
                    FieldDefault::Int(i) => Value::Int(*i),
                    FieldDefault::Float(f) => Value::Float(*f),
                };
                props.insert(field.name.clone(), value);
            }
        }
        props.extend(self.defaults.clone());
        Ok(props)
    }
}
