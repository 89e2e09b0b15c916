//! Document Query Adapter
//!
//! Maps generic queries onto the document store: splits filters that would
//! need too many subqueries, pages in both directions from one cursor, and
//! treats deletes as soft.

use super::document::{DocumentStore, NativeQuery};
use super::StorageBackend;
use crate::entity::{BackendKind, EntitySchema, Record};
use crate::pagination::{Cursor, CursorResult};
use crate::query::params::DEFAULT_PAGE_SIZE;
use crate::query::{
    limit_subqueries, post_filter, Filter, FilterOp, Limit, Query, QueryOutcome, ResultStream,
};
use crate::uid::{Kinded, Uid};
use crate::value::Value;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;

/// Records fetched per round trip when streaming an unbounded query.
pub const STREAM_BATCH_SIZE: usize = 100;

/// Storage backend for document kinds.
#[derive(Debug, Clone)]
pub struct DatastoreBackend {
    store: Arc<DocumentStore>,
}

impl DatastoreBackend {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Native query plus the filters left for post-processing.
    fn plan(&self, schema: &EntitySchema, query: &Query) -> (NativeQuery, Vec<Filter>) {
        let mut filters: Vec<Filter> = query.filters.iter().cloned().map(dedupe_uids).collect();
        filters.push(Filter::eq("deleted", false));
        let split = limit_subqueries(filters);
        let native = NativeQuery {
            kind: schema.type_name.clone(),
            ancestor: query.ancestor.clone(),
            filters: split.native,
            order: query.order.clone().unwrap_or_default(),
        };
        (native, split.post)
    }

    fn page(
        &self,
        native: &NativeQuery,
        post: &[Filter],
        cursor: Option<&str>,
        n: usize,
    ) -> Result<CursorResult<Record>> {
        let forward = self.store.fetch_page(native, cursor, n)?;
        let reverse = self.store.fetch_page(&native.reversed(), cursor, n)?;

        let mut results = CursorResult::new(post_filter(forward.records, post));
        results.next_cursor = forward.end_cursor.map(Cursor::Token);
        results.previous_cursor = reverse.end_cursor.map(Cursor::Token);
        results.more = forward.more;
        Ok(results)
    }
}

fn dedupe_uids(mut filter: Filter) -> Filter {
    if filter.property == "uid" {
        if let FilterOp::In(values) = &mut filter.op {
            let mut seen = Vec::with_capacity(values.len());
            values.retain(|v| {
                if seen.contains(v) {
                    false
                } else {
                    seen.push(v.clone());
                    true
                }
            });
        }
    }
    filter
}

/// A `deleted` flag written as a property belongs in the metadata.
fn normalize(record: &Record) -> Record {
    let mut record = record.clone();
    if let Some(Value::Bool(deleted)) = record.properties.remove("deleted") {
        record.meta.deleted = deleted;
    }
    record
}

fn check_kind(schema: &EntitySchema, uid: &Uid) -> Result<()> {
    if uid.type_name() != schema.type_name {
        return Err(Error::Validation(format!(
            "{} is not a {}",
            uid, schema.type_name
        )));
    }
    Ok(())
}

impl StorageBackend for DatastoreBackend {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn get_by_ids(&self, schema: &EntitySchema, uids: &[Uid]) -> Result<Vec<Record>> {
        let mut unique: Vec<Uid> = Vec::with_capacity(uids.len());
        for uid in uids {
            check_kind(schema, uid)?;
            if !unique.contains(uid) {
                unique.push(uid.clone());
            }
        }
        Ok(self
            .store
            .get_multi(&unique)
            .into_iter()
            .filter(|r| !r.meta.deleted)
            .collect())
    }

    fn exists(&self, _schema: &EntitySchema, uid: &Uid) -> Result<bool> {
        Ok(self.store.contains(uid))
    }

    fn query(&self, schema: &EntitySchema, query: &Query) -> Result<QueryOutcome<Record>> {
        let (native, post) = self.plan(schema, query);
        let cursor = query.cursor.as_ref().map(Cursor::as_token).transpose()?;
        tracing::info!(
            "{}.query(n={:?}, ancestor={:?}, order={}, filters=[{}])",
            schema.type_name,
            query.limit.map(|l| l.to_string()),
            query.ancestor.as_ref().map(|a| a.to_string()),
            native.order,
            native.filters.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
        );

        match query.limit.unwrap_or(Limit::Finite(DEFAULT_PAGE_SIZE)) {
            Limit::Unbounded => {
                let stream = PagedStream {
                    store: Arc::clone(&self.store),
                    native,
                    post,
                    cursor: cursor.map(str::to_string),
                    buffer: VecDeque::new(),
                    exhausted: false,
                };
                Ok(QueryOutcome::Stream(Box::new(stream) as ResultStream<Record>))
            }
            Limit::Finite(n) => self.page(&native, &post, cursor, n).map(QueryOutcome::Page),
        }
    }

    fn count(&self, schema: &EntitySchema, query: &Query) -> Result<u64> {
        let (native, post) = self.plan(schema, query);
        if !post.is_empty() {
            return Err(Error::Validation(format!(
                "Can't count {}: filters need more subqueries than the store allows",
                schema.type_name
            )));
        }
        self.store.count(&native)
    }

    fn put(&self, schema: &EntitySchema, record: &Record) -> Result<Record> {
        check_kind(schema, record.uid())?;
        Ok(self.store.put(&normalize(record)))
    }

    fn put_multi(&self, schema: &EntitySchema, records: &[Record]) -> Result<usize> {
        for record in records {
            check_kind(schema, record.uid())?;
        }
        for record in records {
            self.store.put(&normalize(record));
        }
        Ok(records.len())
    }

    /// Soft delete: the entities stay in the store, flagged.
    fn delete(&self, schema: &EntitySchema, uids: &[Uid]) -> Result<usize> {
        let mut deleted = 0;
        for record in self.get_by_ids(schema, uids)? {
            let mut record = record;
            record.meta.deleted = true;
            self.store.put(&record);
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Forward run over an unbounded query, fetched in batches as it is
/// consumed.
struct PagedStream {
    store: Arc<DocumentStore>,
    native: NativeQuery,
    post: Vec<Filter>,
    cursor: Option<String>,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl PagedStream {
    fn refill(&mut self) -> Result<()> {
        let page = self
            .store
            .fetch_page(&self.native, self.cursor.as_deref(), STREAM_BATCH_SIZE)?;
        self.exhausted = !page.more;
        self.cursor = page.end_cursor;
        self.buffer.extend(page.records);
        Ok(())
    }
}

impl Iterator for PagedStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                if self.post.iter().all(|f| f.matches(&record)) {
                    return Some(Ok(record));
                }
                continue;
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}
