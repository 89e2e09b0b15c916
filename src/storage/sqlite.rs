//! SQLite storage implementation
//!
//! One table per relational kind, described by a `TableDefinition`. Every
//! public operation runs in its own `with_connection` scope.

use super::connection::{ConnectionManager, SqlConfig, SqlSession};
use super::schema::{quote, TableDefinition};
use super::StorageBackend;
use crate::entity::{BackendKind, EntitySchema, Record};
use crate::pagination::{offset_cursors, Cursor, CursorResult};
use crate::query::{Filter, FilterOp, Limit, Order, Query, QueryOutcome};
use crate::uid::{Kinded, Uid};
use crate::value::{Properties, Value};
use crate::{Error, Result};
use rusqlite::{Row, ToSql};
use std::collections::BTreeMap;

/// Rows returned when a query doesn't say how many it wants.
pub const DEFAULT_SELECT_LIMIT: usize = 100;

/// How `put_for_index` resolved, in MySQL affected-rows terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// 0: an existing row already held exactly these values
    Unchanged,
    /// 1: written under the record's own uid
    Written,
    /// 2: merged into an existing row with a different uid
    Merged,
}

impl UpsertOutcome {
    pub fn affected_rows(&self) -> usize {
        match self {
            UpsertOutcome::Unchanged => 0,
            UpsertOutcome::Written => 1,
            UpsertOutcome::Merged => 2,
        }
    }
}

fn params_of(values: &[Value]) -> Vec<&dyn ToSql> {
    values.iter().map(|v| v as &dyn ToSql).collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Relational adapter over SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    manager: ConnectionManager,
}

impl SqliteStore {
    pub fn new(config: &SqlConfig) -> Self {
        Self {
            manager: ConnectionManager::new(config),
        }
    }

    pub fn with_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    fn table(schema: &EntitySchema) -> Result<&TableDefinition> {
        schema
            .table
            .as_ref()
            .ok_or_else(|| Error::Validation(format!("{} has no table definition", schema.type_name)))
    }

    // ========== Schema Operations ==========

    /// Create any missing tables, indices and triggers.
    pub fn create_tables(&self, tables: &[&TableDefinition]) -> Result<()> {
        let mut stmts = Vec::new();
        for table in tables {
            stmts.extend(table.create_statements()?);
        }
        self.manager.with_connection(|s| {
            for stmt in &stmts {
                s.execute(stmt, &[])?;
            }
            Ok(())
        })
    }

    /// Drop and recreate tables. Only allowed where the configuration says
    /// so.
    pub fn reset_tables(&self, tables: &[&TableDefinition]) -> Result<()> {
        if !self.manager.allow_reset() {
            return Err(Error::PermissionDenied(
                "Resetting tables is disabled in this environment".to_string(),
            ));
        }
        self.manager.with_connection(|s| {
            for table in tables {
                tracing::info!("Resetting table {}", table.table_name);
                s.execute(&table.drop_statement(), &[])?;
                for stmt in table.create_statements()? {
                    s.execute(&stmt, &[])?;
                }
            }
            Ok(())
        })
    }

    /// Row count per table.
    pub fn table_stats(&self, tables: &[&TableDefinition]) -> Result<Vec<(String, u64)>> {
        self.manager.with_connection(|s| {
            tables
                .iter()
                .map(|t| {
                    let sql = format!("SELECT COUNT(*) FROM {}", quote(&t.table_name));
                    let n: i64 = s.query_scalar(&sql, &[])?;
                    Ok((t.table_name.clone(), n as u64))
                })
                .collect()
        })
    }

    // ========== Read Operations ==========

    /// Rows matching `filters`. `limit: None` reads every row.
    pub fn select(
        &self,
        table: &TableDefinition,
        filters: &[Filter],
        order: Option<&Order>,
        limit: Option<usize>,
        offset: Option<u64>,
    ) -> Result<Vec<Record>> {
        let (sql, values) = select_sql(table, filters, order, limit, offset)?;
        self.manager
            .with_connection(|s| s.query_rows(&sql, &params_of(&values), |row| row_to_record(table, row)))
    }

    /// Run a query and attach offset cursors when its size is finite.
    pub fn get(&self, table: &TableDefinition, query: &Query) -> Result<CursorResult<Record>> {
        if query.ancestor.is_some() {
            return Err(Error::Validation(format!(
                "{} rows have no ancestors to query by",
                table.type_name
            )));
        }
        let offset = query.cursor.as_ref().map(Cursor::as_offset).transpose()?;
        tracing::info!(
            "{}.get(n={:?}, order={:?}, offset={:?}, filters=[{}])",
            table.type_name,
            query.limit.map(|l| l.to_string()),
            query.order.as_ref().map(|o| o.to_string()),
            offset,
            query.filters.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
        );

        let limit = match query.limit {
            None => Some(DEFAULT_SELECT_LIMIT),
            Some(Limit::Finite(n)) => Some(n),
            Some(Limit::Unbounded) => None,
        };
        let rows = self.select(table, &query.filters, query.order.as_ref(), limit, offset)?;
        let mut results = CursorResult::new(rows);

        if let Some(Limit::Finite(n)) = query.limit {
            if n > 0 {
                let total = self.count_where(table, &query.filters)?;
                let offset = offset.unwrap_or(0);
                let cursors = offset_cursors(offset, n as u64, total);
                results.previous_cursor = Some(Cursor::Offset(cursors.previous));
                results.next_cursor = Some(Cursor::Offset(cursors.next));
                results.last_cursor = Some(Cursor::Offset(cursors.last));
                results.more = offset.saturating_add(n as u64) < total;
            }
        }
        Ok(results)
    }

    pub fn count_where(&self, table: &TableDefinition, filters: &[Filter]) -> Result<u64> {
        let (clause, values) = where_clause(table, filters)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote(&table.table_name),
            clause
        );
        let n: i64 = self
            .manager
            .with_connection(|s| s.query_scalar(&sql, &params_of(&values)))?;
        Ok(n as u64)
    }

    /// Rows with the given uids. Every uid must be of the table's kind.
    pub fn get_by_ids(&self, table: &TableDefinition, uids: &[Uid]) -> Result<Vec<Record>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(other) = uids.iter().find(|u| u.type_name() != table.type_name) {
            return Err(Error::Validation(format!(
                "Can't get mixed kinds from {}: {}",
                table.table_name, other
            )));
        }
        let mut unique: Vec<&Uid> = uids.iter().collect();
        unique.sort();
        unique.dedup();
        let filter = Filter::is_in("uid", unique.iter().map(|u| u.as_str()));
        self.select(table, &[filter], None, None, None)
    }

    // ========== Write Operations ==========

    /// Insert the record if its uid is new, otherwise overwrite the row.
    /// Returns the row as stored, with database-set timestamps.
    pub fn put(&self, table: &TableDefinition, record: &Record) -> Result<Record> {
        let row = row_values(table, record)?;
        self.manager.with_connection(|s| {
            if uid_exists(s, table, record.uid())? {
                update_row(s, table, record.uid(), &row)?;
            } else {
                insert_rows(s, table, &[row], None)?;
            }
            fetch_one(s, table, record.uid())?
                .ok_or_else(|| Error::Validation(format!("{} vanished after write", record.uid())))
        })
    }

    /// Write a record, resolving collisions on the table's one unique index
    /// by updating the colliding row. The returned row may carry a different
    /// uid than `record`.
    pub fn put_for_index(
        &self,
        table: &TableDefinition,
        record: &Record,
        index_name: &str,
    ) -> Result<(Record, UpsertOutcome)> {
        let unique = table.unique_indices();
        let [index] = unique.as_slice() else {
            return Err(Error::Validation(format!(
                "put_for_index requires exactly one unique index; {} has {}",
                table.table_name,
                unique.len()
            )));
        };
        if index.name != index_name {
            return Err(Error::Validation(format!(
                "Index name {} doesn't match table {}",
                index_name, table.table_name
            )));
        }

        let row = row_values(table, record)?;
        let index_filters: Vec<Filter> = index
            .fields
            .iter()
            .map(|f| Filter::eq(f.as_str(), row.get(f).cloned().unwrap_or(Value::Null)))
            .collect();

        self.manager.with_connection(|s| {
            let outcome = if uid_exists(s, table, record.uid())? {
                update_row(s, table, record.uid(), &row)?;
                UpsertOutcome::Written
            } else {
                let colliding = find_first(s, table, &index_filters)?;
                let changed = insert_rows(s, table, &[row.clone()], Some(index.fields.as_slice()))?;
                match (colliding, changed) {
                    (None, _) => UpsertOutcome::Written,
                    (Some(_), 0) => UpsertOutcome::Unchanged,
                    (Some(_), _) => UpsertOutcome::Merged,
                }
            };

            let stored = match outcome {
                UpsertOutcome::Written => fetch_one(s, table, record.uid())?,
                _ => find_first(s, table, &index_filters)?,
            };
            let stored = stored.ok_or_else(|| {
                Error::Validation(format!("No row matches index {} after write", index.name))
            })?;
            tracing::debug!(
                "put_for_index({}) on {}: {:?} -> {}",
                record.uid(),
                index.name,
                outcome,
                stored.uid()
            );
            Ok((stored, outcome))
        })
    }

    /// Insert new records in one statement and update existing ones row by
    /// row. Every inserted record must set the same columns.
    pub fn put_multi(&self, table: &TableDefinition, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows = records
            .iter()
            .map(|r| row_values(table, r))
            .collect::<Result<Vec<_>>>()?;
        let uids: Vec<Uid> = records.iter().map(|r| r.uid().clone()).collect();

        self.manager.with_connection(|s| {
            let existing = existing_uids(s, table, &uids)?;
            let (updates, inserts): (Vec<_>, Vec<_>) = records
                .iter()
                .zip(rows)
                .partition(|(r, _)| existing.contains(r.uid().as_str()));

            let mut affected = 0;
            if !inserts.is_empty() {
                let rows: Vec<_> = inserts.into_iter().map(|(_, row)| row).collect();
                affected += insert_rows(s, table, &rows, None)?;
            }
            for (record, row) in updates {
                affected += update_row(s, table, record.uid(), &row)?;
            }
            Ok(affected)
        })
    }

    /// Hard delete by uid.
    pub fn delete_multi(&self, table: &TableDefinition, uids: &[Uid]) -> Result<usize> {
        if uids.is_empty() {
            return Ok(0);
        }
        let values: Vec<Value> = uids.iter().map(|u| Value::Text(u.to_string())).collect();
        let sql = format!(
            "DELETE FROM {} WHERE \"uid\" IN ({})",
            quote(&table.table_name),
            placeholders(values.len())
        );
        self.manager
            .with_connection(|s| s.execute(&sql, &params_of(&values)))
    }
}

impl StorageBackend for SqliteStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn get_by_ids(&self, schema: &EntitySchema, uids: &[Uid]) -> Result<Vec<Record>> {
        SqliteStore::get_by_ids(self, Self::table(schema)?, uids)
    }

    fn exists(&self, schema: &EntitySchema, uid: &Uid) -> Result<bool> {
        let table = Self::table(schema)?;
        self.manager.with_connection(|s| uid_exists(s, table, uid))
    }

    fn query(&self, schema: &EntitySchema, query: &Query) -> Result<QueryOutcome<Record>> {
        self.get(Self::table(schema)?, query).map(QueryOutcome::Page)
    }

    fn count(&self, schema: &EntitySchema, query: &Query) -> Result<u64> {
        self.count_where(Self::table(schema)?, &query.filters)
    }

    fn put(&self, schema: &EntitySchema, record: &Record) -> Result<Record> {
        SqliteStore::put(self, Self::table(schema)?, record)
    }

    fn put_multi(&self, schema: &EntitySchema, records: &[Record]) -> Result<usize> {
        SqliteStore::put_multi(self, Self::table(schema)?, records)
    }

    fn put_for_index(
        &self,
        schema: &EntitySchema,
        record: &Record,
        index_name: &str,
    ) -> Result<(Record, UpsertOutcome)> {
        SqliteStore::put_for_index(self, Self::table(schema)?, record, index_name)
    }

    fn delete(&self, schema: &EntitySchema, uids: &[Uid]) -> Result<usize> {
        self.delete_multi(Self::table(schema)?, uids)
    }
}

// ========== SQL Building ==========

fn column_list(table: &TableDefinition) -> String {
    table
        .fields
        .iter()
        .map(|f| quote(&f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `WHERE` body and its parameters. Empty filters select everything.
fn where_clause(table: &TableDefinition, filters: &[Filter]) -> Result<(String, Vec<Value>)> {
    if filters.is_empty() {
        return Ok(("1".to_string(), Vec::new()));
    }
    let mut parts = Vec::with_capacity(filters.len());
    let mut values = Vec::new();
    for filter in filters {
        let field = table.get_field(&filter.property).ok_or_else(|| {
            Error::Validation(format!(
                "{} has no column {}",
                table.table_name, filter.property
            ))
        })?;
        let col = quote(&field.name);
        match &filter.op {
            FilterOp::Eq(Value::Null) => parts.push(format!("{} IS NULL", col)),
            FilterOp::NotEq(Value::Null) => parts.push(format!("{} IS NOT NULL", col)),
            FilterOp::Eq(v) => {
                parts.push(format!("{} = ?", col));
                values.push(field.write_value(v)?);
            }
            FilterOp::NotEq(v) => {
                parts.push(format!("{} != ?", col));
                values.push(field.write_value(v)?);
            }
            FilterOp::In(list) if list.is_empty() => parts.push("0".to_string()),
            FilterOp::In(list) => {
                parts.push(format!("{} IN ({})", col, placeholders(list.len())));
                for v in list {
                    values.push(field.write_value(v)?);
                }
            }
        }
    }
    Ok((parts.join(" AND "), values))
}

fn order_clause(table: &TableDefinition, order: Option<&Order>) -> Result<String> {
    let (property, descending) = match order {
        Some(Order { property: Some(p), descending }) => (p.as_str(), *descending),
        Some(Order { property: None, descending }) => ("uid", *descending),
        None => ("uid", false),
    };
    if !table.has_column(property) {
        return Err(Error::Validation(format!(
            "{} has no column {} to order by",
            table.table_name, property
        )));
    }
    let dir = if descending { " DESC" } else { "" };
    if property == "uid" {
        Ok(format!("ORDER BY \"uid\"{}", dir))
    } else {
        Ok(format!("ORDER BY {}{}, \"uid\"{}", quote(property), dir, dir))
    }
}

fn select_sql(
    table: &TableDefinition,
    filters: &[Filter],
    order: Option<&Order>,
    limit: Option<usize>,
    offset: Option<u64>,
) -> Result<(String, Vec<Value>)> {
    let (clause, mut values) = where_clause(table, filters)?;
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} {}",
        column_list(table),
        quote(&table.table_name),
        clause,
        order_clause(table, order)?
    );
    match (limit, offset) {
        (Some(limit), offset) => {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Int(sql_int("limit", limit as u64)?));
            values.push(Value::Int(sql_int("offset", offset.unwrap_or(0))?));
        }
        (None, Some(offset)) if offset > 0 => {
            sql.push_str(" LIMIT -1 OFFSET ?");
            values.push(Value::Int(sql_int("offset", offset)?));
        }
        _ => {}
    }
    Ok((sql, values))
}

/// A limit or offset as a SQL integer; values past `i64::MAX` are refused
/// rather than wrapped.
fn sql_int(what: &str, n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| Error::Validation(format!("{} out of range: {}", what, n)))
}

/// Column values to write for a record. Timestamps are left to the
/// database; properties the table doesn't have are rejected.
fn row_values(table: &TableDefinition, record: &Record) -> Result<BTreeMap<String, Value>> {
    if record.type_name() != table.type_name {
        return Err(Error::Validation(format!(
            "Can't write {} to table {}",
            record.uid(),
            table.table_name
        )));
    }
    let mut row = BTreeMap::new();
    row.insert("uid".to_string(), Value::Text(record.uid().to_string()));
    row.insert("short_uid".to_string(), Value::Text(record.meta.short_uid.clone()));
    for (name, value) in &record.properties {
        if matches!(name.as_str(), "uid" | "short_uid" | "created" | "modified") {
            continue;
        }
        let field = table.get_field(name).ok_or_else(|| {
            Error::Validation(format!("{} has no column {}", table.table_name, name))
        })?;
        row.insert(name.clone(), field.write_value(value)?);
    }
    Ok(row)
}

fn row_to_record(table: &TableDefinition, row: &Row<'_>) -> Result<Record> {
    let mut uid = None;
    let mut short_uid = None;
    let mut created = None;
    let mut modified = None;
    let mut properties = Properties::new();

    for (i, field) in table.fields.iter().enumerate() {
        let value = field.read_value(row.get_ref(i)?)?;
        match (field.name.as_str(), value) {
            ("uid", Value::Text(s)) => uid = Uid::parse(&s),
            ("short_uid", Value::Text(s)) => short_uid = Some(s),
            ("created", Value::Timestamp(t)) => created = Some(t),
            ("modified", Value::Timestamp(t)) => modified = Some(t),
            ("uid" | "short_uid" | "created" | "modified", _) => {}
            (name, value) => {
                properties.insert(name.to_string(), value);
            }
        }
    }

    let uid = uid.ok_or_else(|| {
        Error::Validation(format!("Row in {} has an invalid uid", table.table_name))
    })?;
    let mut record = Record::new(uid, properties);
    if let Some(short_uid) = short_uid {
        record.meta.short_uid = short_uid;
    }
    record.meta.created = created;
    record.meta.modified = modified;
    Ok(record)
}

// ========== Session Helpers ==========

fn uid_exists(s: &mut SqlSession, table: &TableDefinition, uid: &Uid) -> Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE \"uid\" = ?",
        quote(&table.table_name)
    );
    let n: i64 = s.query_scalar(&sql, &[&uid.as_str()])?;
    Ok(n > 0)
}

fn existing_uids(
    s: &mut SqlSession,
    table: &TableDefinition,
    uids: &[Uid],
) -> Result<std::collections::HashSet<String>> {
    let values: Vec<Value> = uids.iter().map(|u| Value::Text(u.to_string())).collect();
    let sql = format!(
        "SELECT \"uid\" FROM {} WHERE \"uid\" IN ({})",
        quote(&table.table_name),
        placeholders(values.len())
    );
    let found = s.query_rows(&sql, &params_of(&values), |row| Ok(row.get::<_, String>(0)?))?;
    Ok(found.into_iter().collect())
}

fn fetch_one(s: &mut SqlSession, table: &TableDefinition, uid: &Uid) -> Result<Option<Record>> {
    find_first(s, table, &[Filter::eq("uid", uid.as_str())])
}

fn find_first(s: &mut SqlSession, table: &TableDefinition, filters: &[Filter]) -> Result<Option<Record>> {
    let (sql, values) = select_sql(table, filters, None, Some(1), None)?;
    let mut rows = s.query_rows(&sql, &params_of(&values), |row| row_to_record(table, row))?;
    Ok(rows.pop())
}

/// Multi-row `INSERT`. With `on_conflict`, rows colliding on those columns
/// update the existing row instead, but only when some value differs, so an
/// identical row reports zero changes.
fn insert_rows(
    s: &mut SqlSession,
    table: &TableDefinition,
    rows: &[BTreeMap<String, Value>],
    on_conflict: Option<&[String]>,
) -> Result<usize> {
    let columns: Vec<&String> = rows[0].keys().collect();
    if rows.iter().any(|r| !r.keys().eq(columns.iter().copied())) {
        return Err(Error::Validation(format!(
            "Inconsistent fields in insert into {}",
            table.table_name
        )));
    }

    let row_placeholder = format!("({})", placeholders(columns.len()));
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote(&table.table_name),
        columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
        vec![row_placeholder.as_str(); rows.len()].join(", ")
    );

    if let Some(target) = on_conflict {
        let updatable: Vec<&&String> = columns
            .iter()
            .filter(|c| !matches!(c.as_str(), "uid" | "short_uid"))
            .collect();
        if updatable.is_empty() {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO NOTHING",
                target.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
            ));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {} WHERE {}",
                target.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
                updatable
                    .iter()
                    .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
                    .collect::<Vec<_>>()
                    .join(", "),
                updatable
                    .iter()
                    .map(|c| format!("{col} IS NOT excluded.{col}", col = quote(c)))
                    .collect::<Vec<_>>()
                    .join(" OR ")
            ));
        }
    }

    let values: Vec<Value> = rows.iter().flat_map(|r| r.values().cloned()).collect();
    s.execute(&sql, &params_of(&values))
}

fn update_row(
    s: &mut SqlSession,
    table: &TableDefinition,
    uid: &Uid,
    row: &BTreeMap<String, Value>,
) -> Result<usize> {
    let assignments: Vec<(&String, &Value)> = row.iter().filter(|(k, _)| k.as_str() != "uid").collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE \"uid\" = ?",
        quote(&table.table_name),
        assignments
            .iter()
            .map(|(k, _)| format!("{} = ?", quote(k)))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut values: Vec<Value> = assignments.into_iter().map(|(_, v)| v.clone()).collect();
    values.push(Value::Text(uid.to_string()));
    s.execute(&sql, &params_of(&values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagination::MAX_OFFSET;
    use crate::storage::connection::RetryPolicy;
    use crate::storage::schema::{FieldDef, FieldDefault, IndexDef, SqlType};
    use crate::uid::RELATIONAL_ID_LENGTH;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    fn widget_table() -> TableDefinition {
        TableDefinition::standard("Widget")
            .field(FieldDef::new("name", SqlType::Varchar).length(50).not_null())
            .field(FieldDef::new("size", SqlType::Int))
            .field(FieldDef::new("active", SqlType::Bool).default_value(FieldDefault::Int(1)))
            .field(FieldDef::new("meta", SqlType::Text).json())
            .index(IndexDef::unique("name", &["name"]))
    }

    fn store(dir: &TempDir) -> SqliteStore {
        let mut config = SqlConfig::file(dir.path().join("test.db"));
        config.retry = RetryPolicy {
            base_interval: Duration::ZERO,
            ..RetryPolicy::default()
        };
        config.allow_reset = true;
        let store = SqliteStore::new(&config);
        store.create_tables(&[&widget_table()]).unwrap();
        store
    }

    fn widget(id: &str, name: &str, size: i64) -> Record {
        let uid = Uid::generate("Widget", None, Some(id), RELATIONAL_ID_LENGTH).unwrap();
        let mut record = Record::new(uid, Properties::new());
        record.set("name", name);
        record.set("size", size);
        record
    }

    #[test]
    fn test_put_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();

        let mut w = widget("abc123", "first", 3);
        w.set("active", false);
        w.set("meta", Value::Json(json!({"tags": ["a"]})));
        let stored = store.put(&table, &w).unwrap();

        assert_eq!(stored.uid().as_str(), "Widget_abc123");
        assert_eq!(stored.meta.short_uid, "abc123");
        assert!(stored.meta.created.is_some());
        assert!(stored.meta.modified.is_some());
        assert_eq!(stored.get("active"), Some(&Value::Bool(false)));
        assert_eq!(stored.get("meta"), Some(&Value::Json(json!({"tags": ["a"]}))));

        let fetched = store.get_by_ids(&table, &[w.uid().clone()]).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].get("size"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_put_existing_uid_updates() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();

        let mut w = widget("a", "first", 1);
        store.put(&table, &w).unwrap();
        w.set("size", 9i64);
        let stored = store.put(&table, &w).unwrap();
        assert_eq!(stored.get("size"), Some(&Value::Int(9)));
        assert_eq!(store.count_where(&table, &[]).unwrap(), 1);
    }

    #[test]
    fn test_put_unique_collision_is_conflict() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();

        store.put(&table, &widget("a", "same", 1)).unwrap();
        let err = store.put(&table, &widget("b", "same", 2)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
    }

    #[test]
    fn test_put_for_index_resolves_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();

        let (first, outcome) = store.put_for_index(&table, &widget("a", "shared", 1), "name").unwrap();
        assert_eq!(outcome, UpsertOutcome::Written);
        assert_eq!(first.uid().as_str(), "Widget_a");

        // A different uid with the same index value merges into the first row.
        let (merged, outcome) = store.put_for_index(&table, &widget("b", "shared", 5), "name").unwrap();
        assert_eq!(outcome, UpsertOutcome::Merged);
        assert_eq!(outcome.affected_rows(), 2);
        assert_eq!(merged.uid().as_str(), "Widget_a");
        assert_eq!(merged.get("size"), Some(&Value::Int(5)));

        // Writing the same values again changes nothing.
        let (again, outcome) = store.put_for_index(&table, &widget("c", "shared", 5), "name").unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(again.uid(), merged.uid());
        assert_eq!(again.properties, merged.properties);

        assert_eq!(store.count_where(&table, &[]).unwrap(), 1);
    }

    #[test]
    fn test_put_for_index_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();

        let w = widget("a", "once", 7);
        let (one, _) = store.put_for_index(&table, &w, "name").unwrap();
        let (two, _) = store.put_for_index(&table, &w, "name").unwrap();
        assert_eq!(one.uid(), two.uid());
        assert_eq!(one.properties, two.properties);
        assert_eq!(store.count_where(&table, &[]).unwrap(), 1);
    }

    #[test]
    fn test_put_for_index_checks_index() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();
        assert!(matches!(
            store.put_for_index(&table, &widget("a", "x", 1), "other"),
            Err(Error::Validation(_))
        ));

        let no_unique = TableDefinition::standard("Widget").field(FieldDef::new("name", SqlType::Varchar));
        assert!(matches!(
            store.put_for_index(&no_unique, &widget("a", "x", 1), "name"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_put_multi_inserts_and_updates() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();

        let mut existing = widget("a", "a", 1);
        store.put(&table, &existing).unwrap();
        existing.set("size", 2i64);

        let batch = vec![existing, widget("b", "b", 1), widget("c", "c", 1), widget("d", "d", 1)];
        assert_eq!(store.put_multi(&table, &batch).unwrap(), 4);
        assert_eq!(store.count_where(&table, &[]).unwrap(), 4);
        let a = store.get_by_ids(&table, &[Uid::parse("Widget_a").unwrap()]).unwrap();
        assert_eq!(a[0].get("size"), Some(&Value::Int(2)));

        let mut odd = widget("e", "e", 1);
        odd.set("active", true);
        let err = store.put_multi(&table, &[widget("f", "f", 1), odd]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_limit_two_offset_two() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();
        for i in 0..5 {
            store.put(&table, &widget(&format!("w{}", i), &format!("n{}", i), i)).unwrap();
        }

        let page = store
            .get(&table, &Query::new().n(2).cursor(Cursor::Offset(2)))
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.previous_cursor, Some(Cursor::Offset(0)));
        assert_eq!(page.next_cursor, Some(Cursor::Offset(4)));
        assert_eq!(page.last_cursor, Some(Cursor::Offset(4)));
        assert_eq!(page[0].uid().as_str(), "Widget_w2");
    }

    #[test]
    fn test_full_pagination_walk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();
        for i in 0..7 {
            store.put(&table, &widget(&format!("w{}", i), &format!("n{}", i), i % 3)).unwrap();
        }

        let mut seen = Vec::new();
        let mut query = Query::new().n(3).order("-size");
        loop {
            let page = store.get(&table, &query).unwrap();
            seen.extend(page.iter().map(|r| r.uid().to_string()));
            let next = page.next_cursor.clone().unwrap();
            if query.cursor.as_ref() == page.last_cursor.as_ref() {
                break;
            }
            query.cursor = Some(next);
        }
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 7);
        assert_eq!(unique.len(), 7);

        // Descending by size, uid breaking ties.
        let first_page = store.get(&table, &Query::new().n(3).order("-size")).unwrap();
        let ids: Vec<&str> = first_page.iter().map(|r| r.uid().local_id()).collect();
        assert_eq!(ids, vec!["w5", "w2", "w4"]);
    }

    #[test]
    fn test_offsets_at_and_past_the_end() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();
        for i in 0..5 {
            store.put(&table, &widget(&format!("w{}", i), &format!("n{}", i), i)).unwrap();
        }

        let mut query = Query::new().n(2).order("size");
        query.cursor = Some(Cursor::Offset(5));
        let page = store.get(&table, &query).unwrap();
        assert!(page.is_empty());
        assert!(!page.more);
        assert_eq!(page.next_cursor, Some(Cursor::Offset(4)));

        query.cursor = Some(Cursor::Offset(MAX_OFFSET));
        let page = store.get(&table, &query).unwrap();
        assert!(page.is_empty());
        assert!(!page.more);
        assert_eq!(page.last_cursor, Some(Cursor::Offset(4)));
    }

    #[test]
    fn test_offsets_beyond_sql_range_are_refused() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();
        for i in 0..3 {
            store.put(&table, &widget(&format!("w{}", i), &format!("n{}", i), i)).unwrap();
        }

        for offset in [u64::MAX, 1u64 << 63] {
            for limit in [Limit::Finite(2), Limit::Unbounded] {
                let mut query = Query::new();
                query.limit = Some(limit);
                query.cursor = Some(Cursor::Offset(offset));
                assert!(matches!(store.get(&table, &query), Err(Error::Validation(_))));
            }
            assert!(matches!(
                select_sql(&table, &[], None, None, Some(offset)),
                Err(Error::Validation(_))
            ));
            assert!(matches!(
                select_sql(&table, &[], None, Some(2), Some(offset)),
                Err(Error::Validation(_))
            ));
        }
    }

    #[test]
    fn test_filters() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();
        for i in 0..4 {
            store.put(&table, &widget(&format!("w{}", i), &format!("n{}", i), i)).unwrap();
        }
        let mut with_null = widget("x", "nx", 0);
        with_null.set("size", Value::Null);
        store.put(&table, &with_null).unwrap();

        let count = |filters: Vec<Filter>| store.count_where(&table, &filters).unwrap();
        assert_eq!(count(vec![Filter::is_in("size", [1i64, 3])]), 2);
        assert_eq!(count(vec![Filter::eq("size", Value::Null)]), 1);
        assert_eq!(count(vec![Filter::not_eq("size", Value::Null)]), 4);
        assert_eq!(count(vec![Filter::eq("active", true)]), 5);
        assert_eq!(count(vec![Filter::is_in("size", Vec::<Value>::new())]), 0);
        assert!(store.count_where(&table, &[Filter::eq("color", "red")]).is_err());
    }

    #[test]
    fn test_unbounded_and_default_limits_have_no_cursors() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();
        store.put(&table, &widget("a", "a", 1)).unwrap();

        let all = store.get(&table, &Query::new().limit(Limit::Unbounded)).unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all.has_cursors());
        assert!(!store.get(&table, &Query::new()).unwrap().has_cursors());
        assert!(store
            .get(&table, &Query::new().n(2).cursor(Cursor::Token("abc".into())))
            .is_err());
    }

    #[test]
    fn test_get_by_ids_rejects_mixed_kinds() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let uids = vec![Uid::parse("Widget_a").unwrap(), Uid::parse("Gadget_b").unwrap()];
        assert!(matches!(
            store.get_by_ids(&widget_table(), &uids),
            Err(Error::Validation(_))
        ));
        assert!(store.get_by_ids(&widget_table(), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_delete_multi_and_reset() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let table = widget_table();
        store.put(&table, &widget("a", "a", 1)).unwrap();
        store.put(&table, &widget("b", "b", 1)).unwrap();

        let deleted = store.delete_multi(&table, &[Uid::parse("Widget_a").unwrap()]).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.table_stats(&[&table]).unwrap(), vec![("widget".to_string(), 1)]);

        store.reset_tables(&[&table]).unwrap();
        assert_eq!(store.count_where(&table, &[]).unwrap(), 0);

        let locked = SqliteStore::new(&SqlConfig::file(dir.path().join("test.db")));
        assert!(matches!(locked.reset_tables(&[&table]), Err(Error::PermissionDenied(_))));
    }
}
