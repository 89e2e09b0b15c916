//! Storage Layer - two backends behind one interface
//!
//! - `sqlite`: relational tables, offset paging, upserts on unique indices
//! - `document` + `datastore`: hierarchical keys, opaque cursors, soft
//!   deletes, eventually consistent global queries
//!
//! Each kind is bound to exactly one backend when it is registered.

pub mod connection;
pub mod datastore;
pub mod document;
pub mod schema;
pub mod sqlite;

pub use connection::{ConnectionManager, RetryPolicy, SqlConfig};
pub use datastore::DatastoreBackend;
pub use document::{Consistency, DocumentStore};
pub use schema::{FieldDef, IndexDef, SqlType, TableDefinition};
pub use sqlite::{SqliteStore, UpsertOutcome};

use crate::entity::{BackendKind, EntitySchema, Record};
use crate::query::{Query, QueryOutcome};
use crate::uid::Uid;
use crate::{Error, Result};

/// What every backend can do for a kind it holds.
///
/// Lookups never fail for missing entities: they are simply absent from
/// the result.
pub trait StorageBackend: Send + Sync {
    fn backend_kind(&self) -> BackendKind;

    /// Live records for `uids`, all of the schema's kind. Missing and
    /// deleted entities are left out.
    fn get_by_ids(&self, schema: &EntitySchema, uids: &[Uid]) -> Result<Vec<Record>>;

    /// Is the uid taken, by a live or a deleted entity?
    fn exists(&self, schema: &EntitySchema, uid: &Uid) -> Result<bool>;

    fn query(&self, schema: &EntitySchema, query: &Query) -> Result<QueryOutcome<Record>>;

    fn count(&self, schema: &EntitySchema, query: &Query) -> Result<u64>;

    /// Insert or overwrite one record, returning it as stored.
    fn put(&self, schema: &EntitySchema, record: &Record) -> Result<Record>;

    /// Write many records, returning the number of affected rows.
    fn put_multi(&self, schema: &EntitySchema, records: &[Record]) -> Result<usize>;

    /// Write a record, merging into whatever row already holds its values
    /// for the named unique index.
    fn put_for_index(
        &self,
        schema: &EntitySchema,
        _record: &Record,
        _index_name: &str,
    ) -> Result<(Record, UpsertOutcome)> {
        Err(Error::Unsupported(format!(
            "{} kinds have no unique indices",
            schema.backend
        )))
    }

    /// Remove records, returning how many were affected.
    fn delete(&self, schema: &EntitySchema, uids: &[Uid]) -> Result<usize>;
}
