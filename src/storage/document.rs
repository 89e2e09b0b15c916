//! In-process hierarchical document store
//!
//! Entities live under keys that spell out their ancestry, root first. The
//! store keeps two views of them:
//!
//! - the entity table, always current, read by ancestor queries and lookups
//! - the global index, read by every other query, which trails the entity
//!   table by the configured `Consistency`
//!
//! Queries support equality, inequality and membership filters, one sort
//! property with the key as tie-breaker, and opaque cursors. Membership
//! filters multiply into subqueries and the store refuses more than
//! `SUBQUERY_CEILING` of them.

use crate::entity::Record;
use crate::query::{subquery, Filter, FilterOp, Order, SUBQUERY_CEILING};
use crate::uid::Uid;
use crate::value::Value;
use crate::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// When writes become visible to queries without an ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Immediately
    #[default]
    Strong,
    /// After the given delay, or on `settle()`
    Eventual { visible_after: Duration },
}

/// Canonical key: `(kind, uid)` pairs from the root down to the entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<(String, String)>);

impl Key {
    pub fn from_uid(uid: &Uid) -> Self {
        Key(uid.key_path())
    }

    pub fn kind(&self) -> &str {
        self.0.last().map(|(kind, _)| kind.as_str()).unwrap_or_default()
    }

    pub fn uid(&self) -> Option<Uid> {
        self.0.last().and_then(|(_, uid)| Uid::parse(uid))
    }

    /// Does this key sit at or below `ancestor`?
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        self.0.starts_with(&ancestor.0)
    }
}

/// A query in the store's own terms.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    pub kind: String,
    pub ancestor: Option<Uid>,
    pub filters: Vec<Filter>,
    pub order: Order,
}

impl NativeQuery {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ancestor: None,
            filters: Vec::new(),
            order: Order::default(),
        }
    }

    /// Same filters, exactly reversed order.
    pub fn reversed(&self) -> Self {
        Self {
            order: self.order.reversed(),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        for filter in &self.filters {
            if let FilterOp::In(values) = &filter.op {
                if values.is_empty() {
                    return Err(Error::Validation(format!(
                        "Empty IN list for {}",
                        filter.property
                    )));
                }
            }
        }
        let subqueries = subquery::fan_out(&self.filters);
        if subqueries > SUBQUERY_CEILING {
            return Err(Error::Validation(format!(
                "Query on {} needs {} subqueries; the limit is {}",
                self.kind, subqueries, SUBQUERY_CEILING
            )));
        }
        Ok(())
    }
}

/// One page of a native query.
#[derive(Debug, Clone)]
pub struct NativePage {
    pub records: Vec<Record>,
    /// Position after the last record; `None` for an empty page
    pub end_cursor: Option<String>,
    pub more: bool,
}

/// Boundary between two entities in an ordering. Independent of
/// direction, so the same position can start a forward and a reverse run.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Position {
    order: Option<String>,
    value: Value,
    key: Key,
    /// Boundary sits just after `key` in ascending order, else just before
    after: bool,
}

impl Position {
    fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| Error::Validation(format!("Invalid cursor: {}", token)))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| Error::Validation(format!("Invalid cursor: {}", token)))
    }

    /// Is `(value, key)` past this boundary when reading ascending or
    /// descending?
    fn admits(&self, value: &Value, key: &Key, descending: bool) -> bool {
        let cmp = value.sort_cmp(&self.value).then_with(|| key.cmp(&self.key));
        match (descending, self.after) {
            (false, true) => cmp == Ordering::Greater,
            (false, false) => cmp != Ordering::Less,
            (true, true) => cmp != Ordering::Greater,
            (true, false) => cmp == Ordering::Less,
        }
    }
}

#[derive(Default)]
struct Tables {
    entities: BTreeMap<Key, Record>,
    index: BTreeMap<Key, Record>,
    pending: VecDeque<(Instant, Key, Record)>,
}

impl Tables {
    fn catch_up(&mut self, now: Instant) {
        while let Some((due, _, _)) = self.pending.front() {
            if *due > now {
                break;
            }
            if let Some((_, key, record)) = self.pending.pop_front() {
                self.index.insert(key, record);
            }
        }
    }
}

/// The store. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct DocumentStore {
    consistency: Consistency,
    tables: RwLock<Tables>,
}

impl DocumentStore {
    pub fn new(consistency: Consistency) -> Self {
        Self {
            consistency,
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    // ========== Write Operations ==========

    /// Store a record under its key. `created` is kept from the first write
    /// and `modified` is stamped on every write.
    pub fn put(&self, record: &Record) -> Record {
        let key = Key::from_uid(record.uid());
        let now = Utc::now().naive_utc();
        let mut stored = record.clone();

        let mut tables = self.tables.write();
        stored.meta.created = tables
            .entities
            .get(&key)
            .and_then(|existing| existing.meta.created)
            .or(Some(now));
        stored.meta.modified = Some(now);
        stored.meta.snapshot = stored.properties.clone();

        tables.entities.insert(key.clone(), stored.clone());
        match self.consistency {
            Consistency::Strong => {
                tables.index.insert(key, stored.clone());
            }
            Consistency::Eventual { visible_after } => {
                tables
                    .pending
                    .push_back((Instant::now() + visible_after, key, stored.clone()));
            }
        }
        stored
    }

    /// Make every pending write visible to global queries.
    pub fn settle(&self) {
        let mut tables = self.tables.write();
        while let Some((_, key, record)) = tables.pending.pop_front() {
            tables.index.insert(key, record);
        }
    }

    // ========== Read Operations ==========

    /// Authoritative lookup, deleted entities included.
    pub fn get(&self, uid: &Uid) -> Option<Record> {
        self.tables.read().entities.get(&Key::from_uid(uid)).cloned()
    }

    /// Authoritative lookups in request order, missing entities skipped.
    pub fn get_multi(&self, uids: &[Uid]) -> Vec<Record> {
        let tables = self.tables.read();
        uids.iter()
            .filter_map(|uid| tables.entities.get(&Key::from_uid(uid)).cloned())
            .collect()
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.tables.read().entities.contains_key(&Key::from_uid(uid))
    }

    /// Up to `limit` matches starting at `start_cursor`, in query order.
    pub fn fetch_page(
        &self,
        query: &NativeQuery,
        start_cursor: Option<&str>,
        limit: usize,
    ) -> Result<NativePage> {
        query.validate()?;
        let start = start_cursor.map(Position::decode).transpose()?;
        if let Some(start) = &start {
            if start.order != query.order.property {
                return Err(Error::Validation(format!(
                    "Cursor belongs to a query ordered by {}",
                    start.order.as_deref().unwrap_or("key")
                )));
            }
        }

        let mut matches = self.matching(query);
        if let Some(start) = &start {
            matches.retain(|(value, key, _)| start.admits(value, key, query.order.descending));
        }
        let more = matches.len() > limit;
        matches.truncate(limit);

        let end_cursor = match matches.last() {
            Some((value, key, _)) => Some(
                Position {
                    order: query.order.property.clone(),
                    value: value.clone(),
                    key: key.clone(),
                    after: !query.order.descending,
                }
                .encode()?,
            ),
            None => None,
        };

        Ok(NativePage {
            records: matches.into_iter().map(|(_, _, r)| r).collect(),
            end_cursor,
            more,
        })
    }

    pub fn count(&self, query: &NativeQuery) -> Result<u64> {
        query.validate()?;
        Ok(self.matching(query).len() as u64)
    }

    /// Every match with its sort value and key, sorted in query order.
    fn matching(&self, query: &NativeQuery) -> Vec<(Value, Key, Record)> {
        let select = |records: &BTreeMap<Key, Record>, ancestor: Option<&Key>| {
            records
                .iter()
                .filter(|(key, _)| key.kind() == query.kind)
                .filter(|(key, _)| ancestor.is_none_or(|a| key.has_ancestor(a)))
                .filter(|(_, record)| query.filters.iter().all(|f| f.matches(record)))
                .map(|(key, record)| {
                    let value = query
                        .order
                        .property
                        .as_deref()
                        .map_or(Value::Null, |p| record.field(p));
                    (value, key.clone(), record.clone())
                })
                .collect::<Vec<_>>()
        };

        let mut matches = match &query.ancestor {
            Some(ancestor) => {
                let tables = self.tables.read();
                select(&tables.entities, Some(&Key::from_uid(ancestor)))
            }
            None => {
                let mut tables = self.tables.write();
                tables.catch_up(Instant::now());
                select(&tables.index, None)
            }
        };

        matches.sort_by(|(av, ak, _), (bv, bk, _)| {
            let cmp = av.sort_cmp(bv).then_with(|| ak.cmp(bk));
            if query.order.descending {
                cmp.reverse()
            } else {
                cmp
            }
        });
        matches
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("DocumentStore")
            .field("consistency", &self.consistency)
            .field("entities", &tables.entities.len())
            .field("pending", &tables.pending.len())
            .finish()
    }
}
