//! Registry and typed repositories
//!
//! The `Registry` binds each kind to its schema and to the one backend that
//! stores it. A `Repository<T>` is the typed handle callers work through:
//! it creates entities with unique uids and runs every write through the
//! entity's hooks.
//!
//! Write lifecycle: `before_put(snapshot)`, native write, `after_put(snapshot)`.
//! The snapshot is the property map as it was when the entity was created or
//! last loaded. An error from `before_put` aborts the write.

use crate::entity::{Entity, EntitySchema, Record};
use crate::pagination::CursorResult;
use crate::query::{Access, Query, QueryOutcome, QueryParams};
use crate::storage::StorageBackend;
use crate::uid::{self, Kinded, Uid, MAX_GENERATION_ATTEMPTS};
use crate::value::Properties;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Clone)]
struct Registration {
    schema: Arc<EntitySchema>,
    backend: Arc<dyn StorageBackend>,
}

/// Kinds known to the application and where each one lives.
#[derive(Clone, Default)]
pub struct Registry {
    kinds: BTreeMap<String, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a kind to a backend. Each kind is registered once, with a
    /// backend of the kind its schema declares.
    pub fn register(&mut self, schema: EntitySchema, backend: Arc<dyn StorageBackend>) -> Result<()> {
        if !uid::is_type_name(&schema.type_name) {
            return Err(Error::Validation(format!(
                "Invalid type name: {}",
                schema.type_name
            )));
        }
        if backend.backend_kind() != schema.backend {
            return Err(Error::Validation(format!(
                "{} is a {} kind but was given a {} backend",
                schema.type_name,
                schema.backend,
                backend.backend_kind()
            )));
        }
        if self.kinds.contains_key(&schema.type_name) {
            return Err(Error::Conflict(format!(
                "{} is already registered",
                schema.type_name
            )));
        }
        tracing::debug!("Registered {} ({})", schema.type_name, schema.backend);
        self.kinds.insert(
            schema.type_name.clone(),
            Registration {
                schema: Arc::new(schema),
                backend,
            },
        );
        Ok(())
    }

    pub fn schema(&self, type_name: &str) -> Option<&EntitySchema> {
        self.kinds.get(type_name).map(|r| r.schema.as_ref())
    }

    pub fn schemas(&self) -> impl Iterator<Item = &EntitySchema> {
        self.kinds.values().map(|r| r.schema.as_ref())
    }

    /// Typed repository for a registered kind.
    pub fn repository<T: Entity + Send + 'static>(&self, type_name: &str) -> Result<Repository<T>> {
        let registration = self
            .kinds
            .get(type_name)
            .ok_or_else(|| Error::Validation(format!("Unknown kind: {}", type_name)))?;
        Ok(Repository::new(
            Arc::clone(&registration.schema),
            Arc::clone(&registration.backend),
        ))
    }

    /// Fetch any entity by its long uid, whatever its kind. Undecodable
    /// uids and unregistered kinds read as absent.
    pub fn get_by_uid(&self, id: &str) -> Result<Option<Record>> {
        let Some(uid) = Uid::parse(id) else {
            tracing::warn!("Can't look up {}: not a long uid", id);
            return Ok(None);
        };
        let Some(registration) = self.kinds.get(uid.type_name()) else {
            tracing::warn!("Can't look up {}: kind not registered", id);
            return Ok(None);
        };
        let mut found = registration
            .backend
            .get_by_ids(&registration.schema, std::slice::from_ref(&uid))?;
        Ok(found.pop())
    }

    /// Live entity counts per kind.
    pub fn stats(&self) -> Result<Vec<(String, u64)>> {
        self.kinds
            .iter()
            .map(|(name, r)| Ok((name.clone(), r.backend.count(&r.schema, &Query::new())?)))
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.kinds.iter().map(|(k, r)| (k, r.schema.backend)))
            .finish()
    }
}

/// Typed access to one kind.
pub struct Repository<T> {
    schema: Arc<EntitySchema>,
    backend: Arc<dyn StorageBackend>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            backend: Arc::clone(&self.backend),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity + Send + 'static> Repository<T> {
    pub fn new(schema: Arc<EntitySchema>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            schema,
            backend,
            _entity: PhantomData,
        }
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    // ========== Creation ==========

    /// A new, unsaved entity with schema defaults overlaid by `properties`.
    ///
    /// A caller-supplied identifier must be free. Otherwise random ids are
    /// tried until one is free, giving up after `MAX_GENERATION_ATTEMPTS`.
    pub fn create(
        &self,
        identifier: Option<&str>,
        parent: Option<&Uid>,
        properties: Properties,
    ) -> Result<T> {
        if let Some(parent) = parent {
            let expected = self.schema.ancestor_types.first();
            if expected.map(String::as_str) != Some(parent.type_name()) {
                return Err(Error::Validation(format!(
                    "{} can't be a parent of {}",
                    parent, self.schema.type_name
                )));
            }
        }

        let uid = match identifier {
            Some(id) => {
                let uid = Uid::generate(&self.schema.type_name, parent, Some(id), self.schema.id_length)?;
                if self.backend.exists(&self.schema, &uid)? {
                    return Err(Error::Conflict(format!("{} already exists", uid)));
                }
                uid
            }
            None => self.unused_uid(parent)?,
        };

        let mut props = self.schema.defaults()?;
        props.extend(properties);
        T::from_record(Record::new(uid, props))
    }

    fn unused_uid(&self, parent: Option<&Uid>) -> Result<Uid> {
        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let uid = Uid::generate(&self.schema.type_name, parent, None, self.schema.id_length)?;
            if !self.backend.exists(&self.schema, &uid)? {
                return Ok(uid);
            }
            tracing::warn!("Generated uid {} is taken (attempt {})", uid, attempt);
        }
        Err(Error::Conflict(format!(
            "No unused {} uid after {} attempts",
            self.schema.type_name, MAX_GENERATION_ATTEMPTS
        )))
    }

    // ========== Writes ==========

    /// Save an entity and refresh it with what the store recorded.
    pub fn put(&self, entity: &mut T) -> Result<()> {
        let snapshot = entity.meta().snapshot.clone();
        entity.before_put(&snapshot)?;
        let stored = self.backend.put(&self.schema, &entity.to_record())?;
        *entity = T::from_record(stored)?;
        entity.after_put(&snapshot)
    }

    /// Save several entities in one batch. Hooks run for each on staged
    /// copies; if any `before_put` fails nothing is written and the caller's
    /// entities are left as they were.
    pub fn put_multi(&self, entities: &mut [T]) -> Result<usize>
    where
        T: Clone,
    {
        let mut staged = entities.to_vec();
        let mut snapshots = Vec::with_capacity(staged.len());
        for entity in staged.iter_mut() {
            let snapshot = entity.meta().snapshot.clone();
            entity.before_put(&snapshot)?;
            snapshots.push(snapshot);
        }

        let records: Vec<Record> = staged.iter().map(Entity::to_record).collect();
        let affected = self.backend.put_multi(&self.schema, &records)?;

        for (((entity, prepared), record), snapshot) in
            entities.iter_mut().zip(staged).zip(records).zip(&snapshots)
        {
            *entity = prepared;
            entity.meta_mut().snapshot = record.properties;
            entity.after_put(snapshot)?;
        }
        Ok(affected)
    }

    /// Save an entity, or merge it into the row already holding its values
    /// for the named unique index. The returned entity is the stored row,
    /// which may have a different uid than the one passed in.
    pub fn put_for_index(&self, mut entity: T, index_name: &str) -> Result<T> {
        let snapshot = entity.meta().snapshot.clone();
        entity.before_put(&snapshot)?;
        let (stored, outcome) = self
            .backend
            .put_for_index(&self.schema, &entity.to_record(), index_name)?;
        if stored.uid() != entity.uid() {
            tracing::info!(
                "{} resolved to existing {} on index {} ({:?})",
                entity.uid(),
                stored.uid(),
                index_name,
                outcome
            );
        }
        let stored = T::from_record(stored)?;
        stored.after_put(&snapshot)?;
        Ok(stored)
    }

    /// Delete by short or long id. Undecodable ids are skipped.
    pub fn delete(&self, ids: &[&str]) -> Result<usize> {
        let uids = self.resolve(ids);
        if uids.is_empty() {
            return Ok(0);
        }
        self.backend.delete(&self.schema, &uids)
    }

    // ========== Reads ==========

    /// By short or long id. `None` when the id can't be decoded, belongs to
    /// another kind, or isn't stored.
    pub fn get_by_id(&self, id: &str) -> Result<Option<T>> {
        let Some(uid) = self.schema.long_uid(id) else {
            return Ok(None);
        };
        let mut found = self.backend.get_by_ids(&self.schema, &[uid])?;
        found.pop().map(T::from_record).transpose()
    }

    pub fn get_by_ids(&self, ids: &[&str]) -> Result<Vec<T>> {
        let uids = self.resolve(ids);
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        self.backend
            .get_by_ids(&self.schema, &uids)?
            .into_iter()
            .map(T::from_record)
            .collect()
    }

    pub fn query(&self, query: &Query) -> Result<QueryOutcome<T>> {
        self.backend.query(&self.schema, query)?.try_map(T::from_record)
    }

    /// Run a request given as `key=value` pairs.
    pub fn query_params(&self, pairs: &[(String, String)], access: Access) -> Result<QueryOutcome<T>> {
        match QueryParams::parse(pairs, &self.schema, access)? {
            QueryParams::ByUid(ids) => {
                let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
                Ok(QueryOutcome::Page(CursorResult::new(self.get_by_ids(&ids)?)))
            }
            QueryParams::Search(query) => self.query(&query),
        }
    }

    pub fn count(&self, query: &Query) -> Result<u64> {
        self.backend.count(&self.schema, query)
    }

    fn resolve(&self, ids: &[&str]) -> Vec<Uid> {
        ids.iter().filter_map(|id| self.schema.long_uid(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityMeta;
    use crate::storage::connection::{RetryPolicy, SqlConfig};
    use crate::storage::schema::{FieldDef, FieldDefault, IndexDef, SqlType, TableDefinition};
    use crate::storage::{Consistency, DatastoreBackend, DocumentStore, SqliteStore};
    use crate::value::{PropertyType, Value};
    use std::cell::RefCell;
    use std::time::Duration;
    use tempfile::TempDir;

    thread_local! {
        static AFTER_PUTS: RefCell<Vec<Properties>> = const { RefCell::new(Vec::new()) };
    }

    #[derive(Debug, Clone)]
    struct Note {
        meta: EntityMeta,
        title: String,
        slug: Option<String>,
    }

    impl Entity for Note {
        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }

        fn to_record(&self) -> Record {
            let mut properties = Properties::new();
            properties.insert("title".into(), Value::Text(self.title.clone()));
            if let Some(slug) = &self.slug {
                properties.insert("slug".into(), Value::Text(slug.clone()));
            }
            Record {
                meta: self.meta.clone(),
                properties,
            }
        }

        fn from_record(record: Record) -> Result<Self> {
            let title = record
                .get("title")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("Note needs a title".into()))?
                .to_string();
            let slug = record.get("slug").and_then(Value::as_str).map(String::from);
            Ok(Note {
                meta: record.meta,
                title,
                slug,
            })
        }

        fn before_put(&mut self, _snapshot: &Properties) -> Result<()> {
            if self.title.trim().is_empty() {
                return Err(Error::Hook("title can't be blank".into()));
            }
            self.slug = Some(self.title.to_lowercase().replace(' ', "-"));
            Ok(())
        }

        fn after_put(&self, snapshot: &Properties) -> Result<()> {
            AFTER_PUTS.with(|log| log.borrow_mut().push(snapshot.clone()));
            Ok(())
        }
    }

    fn note_schema() -> EntitySchema {
        EntitySchema::document("Note")
            .with_property("title", PropertyType::Text)
            .with_property("slug", PropertyType::Text)
            .with_ancestors(&["User"])
    }

    fn widget_schema() -> EntitySchema {
        EntitySchema::relational(
            TableDefinition::standard("Widget")
                .field(FieldDef::new("name", SqlType::Varchar).length(50).not_null())
                .field(FieldDef::new("active", SqlType::Bool).default_value(FieldDefault::Int(1)))
                .index(IndexDef::unique("name", &["name"])),
        )
    }

    fn registry(dir: &TempDir) -> Registry {
        let mut config = SqlConfig::file(dir.path().join("repo.db"));
        config.retry = RetryPolicy {
            base_interval: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let sqlite = SqliteStore::new(&config);
        let widgets = widget_schema();
        sqlite.create_tables(&[widgets.table.as_ref().unwrap()]).unwrap();

        let documents = DatastoreBackend::new(Arc::new(DocumentStore::new(Consistency::Strong)));
        let mut registry = Registry::new();
        registry.register(note_schema(), Arc::new(documents)).unwrap();
        registry.register(widgets, Arc::new(sqlite)).unwrap();
        registry
    }

    fn titled(title: &str) -> Properties {
        let mut props = Properties::new();
        props.insert("title".into(), Value::Text(title.into()));
        props
    }

    #[test]
    fn test_create_generates_unused_uid_without_writing() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let widgets = registry.repository::<Record>("Widget").unwrap();

        let widget = widgets.create(None, None, Properties::new()).unwrap();
        assert_eq!(widget.uid().local_id().len(), uid::RELATIONAL_ID_LENGTH);
        assert_eq!(widget.get("active"), Some(&Value::Bool(true)));
        assert!(widgets.get_by_id(widget.uid().as_str()).unwrap().is_none());

        let notes = registry.repository::<Note>("Note").unwrap();
        let note = notes.create(None, None, titled("Hi")).unwrap();
        assert_eq!(note.uid().local_id().len(), uid::DOCUMENT_ID_LENGTH);
    }

    #[test]
    fn test_create_with_taken_identifier_conflicts() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let notes = registry.repository::<Note>("Note").unwrap();

        let mut note = notes.create(Some("abc123"), None, titled("First")).unwrap();
        notes.put(&mut note).unwrap();
        let err = notes.create(Some("abc123"), None, titled("Second")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        assert!(notes.create(Some("bad id"), None, titled("x")).is_err());
    }

    #[test]
    fn test_create_checks_parent_kind() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let notes = registry.repository::<Note>("Note").unwrap();

        let user = Uid::parse("User_u1").unwrap();
        let note = notes.create(Some("n1"), Some(&user), titled("Child")).unwrap();
        assert_eq!(note.uid().as_str(), "Note_n1.User_u1");
        assert_eq!(notes.get_by_id("n1.u1").unwrap().map(|n| n.title), None);

        let widget = Uid::parse("Widget_w1").unwrap();
        assert!(matches!(
            notes.create(None, Some(&widget), titled("x")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_put_runs_hooks_in_order() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let notes = registry.repository::<Note>("Note").unwrap();
        AFTER_PUTS.with(|log| log.borrow_mut().clear());

        let mut note = notes.create(Some("n1"), None, titled("Hello World")).unwrap();
        notes.put(&mut note).unwrap();
        assert_eq!(note.slug.as_deref(), Some("hello-world"));
        assert!(note.meta.created.is_some());

        note.title = "Changed".into();
        notes.put(&mut note).unwrap();

        let snapshots = AFTER_PUTS.with(|log| log.borrow().clone());
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0], titled("Hello World"));
        assert_eq!(snapshots[1].get("title"), Some(&Value::Text("Hello World".into())));
        assert_eq!(snapshots[1].get("slug"), Some(&Value::Text("hello-world".into())));

        let stored = notes.get_by_id("n1").unwrap().unwrap();
        assert_eq!(stored.slug.as_deref(), Some("changed"));
    }

    #[test]
    fn test_before_put_failure_aborts_write() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let notes = registry.repository::<Note>("Note").unwrap();
        AFTER_PUTS.with(|log| log.borrow_mut().clear());

        let mut blank = notes.create(Some("n1"), None, titled("  ")).unwrap();
        let err = notes.put(&mut blank).unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
        assert!(notes.get_by_id("n1").unwrap().is_none());
        assert!(AFTER_PUTS.with(|log| log.borrow().is_empty()));

        let mut batch = vec![
            notes.create(Some("n2"), None, titled("ok")).unwrap(),
            notes.create(Some("n3"), None, titled("")).unwrap(),
        ];
        assert!(notes.put_multi(&mut batch).is_err());
        assert!(notes.get_by_ids(&["n2", "n3"]).unwrap().is_empty());
        // The hook that succeeded on n2 left no trace on the caller's copy.
        assert_eq!(batch[0].slug, None);
        assert_eq!(batch[1].slug, None);

        batch[1].title = "fixed".into();
        assert_eq!(notes.put_multi(&mut batch).unwrap(), 2);
        assert_eq!(batch[0].slug.as_deref(), Some("ok"));
        assert_eq!(batch[1].slug.as_deref(), Some("fixed"));
    }

    #[test]
    fn test_put_for_index_returns_existing_row() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let widgets = registry.repository::<Record>("Widget").unwrap();

        let mut props = Properties::new();
        props.insert("name".into(), Value::Text("gear".into()));
        let first = widgets.create(Some("first"), None, props.clone()).unwrap();
        let first = widgets.put_for_index(first, "name").unwrap();

        let second = widgets.create(Some("second"), None, props).unwrap();
        let resolved = widgets.put_for_index(second, "name").unwrap();
        assert_eq!(resolved.uid(), first.uid());
        assert_eq!(widgets.count(&Query::new()).unwrap(), 1);

        let notes = registry.repository::<Note>("Note").unwrap();
        let note = notes.create(None, None, titled("x")).unwrap();
        assert!(matches!(
            notes.put_for_index(note, "title"),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_lookups_and_registry_dispatch() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let notes = registry.repository::<Note>("Note").unwrap();
        let widgets = registry.repository::<Record>("Widget").unwrap();

        let mut note = notes.create(Some("abc123"), None, titled("x")).unwrap();
        notes.put(&mut note).unwrap();
        let mut widget = widgets.create(Some("w1"), None, Properties::new()).unwrap();
        widget.set("name", "bolt");
        widgets.put(&mut widget).unwrap();

        assert!(notes.get_by_id("abc123").unwrap().is_some());
        assert!(notes.get_by_id("Note_abc123").unwrap().is_some());
        assert!(notes.get_by_id("Widget_w1").unwrap().is_none());
        assert!(notes.get_by_id("not valid!").unwrap().is_none());

        let found = registry.get_by_uid("Widget_w1").unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&Value::Text("bolt".into())));
        assert!(registry.get_by_uid("Note_abc123").unwrap().is_some());
        assert!(registry.get_by_uid("Gadget_g1").unwrap().is_none());
        assert!(registry.get_by_uid("abc123").unwrap().is_none());

        assert_eq!(
            registry.stats().unwrap(),
            vec![("Note".to_string(), 1), ("Widget".to_string(), 1)]
        );

        assert_eq!(notes.delete(&["abc123", "garbage!"]).unwrap(), 1);
        assert!(notes.get_by_id("abc123").unwrap().is_none());
    }

    #[test]
    fn test_query_params_dispatch() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let notes = registry.repository::<Note>("Note").unwrap();
        for (id, title) in [("a", "one"), ("b", "two"), ("c", "one")] {
            let mut note = notes.create(Some(id), None, titled(title)).unwrap();
            notes.put(&mut note).unwrap();
        }

        let pairs = |items: &[(&str, &str)]| -> Vec<(String, String)> {
            items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        let found = notes
            .query_params(&pairs(&[("title", "one")]), Access::Public)
            .unwrap()
            .into_vec()
            .unwrap();
        assert_eq!(found.len(), 2);

        let by_uid = notes
            .query_params(&pairs(&[("uid", "Note_b"), ("uid", "Note_b")]), Access::Public)
            .unwrap()
            .into_vec()
            .unwrap();
        assert_eq!(by_uid.len(), 1);
        assert_eq!(by_uid[0].title, "two");
    }

    #[test]
    fn test_register_rejects_mismatched_backend() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);
        let documents = DatastoreBackend::new(Arc::new(DocumentStore::default()));
        let err = registry
            .register(EntitySchema::relational(TableDefinition::standard("Gadget")), Arc::new(documents))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(registry.register(note_schema(), Arc::new(DatastoreBackend::new(Arc::default()))).is_err());
    }
}
