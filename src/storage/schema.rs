//! Table definitions for relational kinds
//!
//! A `TableDefinition` is declared once per kind and drives everything the
//! relational adapter does with it: the DDL (MySQL dialect for humans and
//! migrations, SQLite dialect for the live tables), which columns exist,
//! and how values are coerced on the way in and out.

use crate::entity::Record;
use crate::uid::{self, Uid};
use crate::value::{
    self, Properties, PropertyType, Value, DATE_FORMAT, SQL_DATETIME_FORMAT,
};
use crate::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime, Timelike, Utc};
use rand::Rng;
use regex::Regex;
use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Column types, named as MySQL names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    Varchar,
    Char,
    Text,
    MediumText,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Bool,
    Date,
    Datetime,
    Timestamp,
}

impl SqlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Varchar => "varchar",
            SqlType::Char => "char",
            SqlType::Text => "text",
            SqlType::MediumText => "mediumtext",
            SqlType::TinyInt => "tinyint",
            SqlType::SmallInt => "smallint",
            SqlType::Int => "int",
            SqlType::BigInt => "bigint",
            SqlType::Float => "float",
            SqlType::Double => "double",
            SqlType::Bool => "bool",
            SqlType::Date => "date",
            SqlType::Datetime => "datetime",
            SqlType::Timestamp => "timestamp",
        }
    }

    /// SQLite column affinity.
    pub fn sqlite_affinity(&self) -> &'static str {
        match self {
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Int | SqlType::BigInt | SqlType::Bool => {
                "INTEGER"
            }
            SqlType::Float | SqlType::Double => "REAL",
            _ => "TEXT",
        }
    }

    fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Int | SqlType::BigInt
        )
    }
}

impl std::str::FromStr for SqlType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "varchar" => Ok(SqlType::Varchar),
            "char" => Ok(SqlType::Char),
            "text" => Ok(SqlType::Text),
            "mediumtext" => Ok(SqlType::MediumText),
            "tinyint" => Ok(SqlType::TinyInt),
            "smallint" => Ok(SqlType::SmallInt),
            "int" | "integer" => Ok(SqlType::Int),
            "bigint" => Ok(SqlType::BigInt),
            "float" => Ok(SqlType::Float),
            "double" => Ok(SqlType::Double),
            "bool" | "boolean" => Ok(SqlType::Bool),
            "date" => Ok(SqlType::Date),
            "datetime" => Ok(SqlType::Datetime),
            "timestamp" => Ok(SqlType::Timestamp),
            _ => Err(Error::Validation(format!("Unknown column type: {}", s))),
        }
    }
}

/// Column default as written in DDL.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    /// No DEFAULT clause
    None,
    /// DEFAULT NULL
    Null,
    /// DEFAULT CURRENT_TIMESTAMP
    CurrentTimestamp,
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldDefault {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldDefault::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn sql(&self) -> Result<Option<String>> {
        Ok(match self {
            FieldDefault::None => None,
            FieldDefault::Null => Some("NULL".to_string()),
            FieldDefault::CurrentTimestamp => Some("CURRENT_TIMESTAMP".to_string()),
            FieldDefault::Int(i) => Some(i.to_string()),
            FieldDefault::Float(f) => Some(f.to_string()),
            FieldDefault::Text(text) => {
                if text.contains('\'') || text.contains('\\') {
                    return Err(Error::Validation(format!(
                        "Can't escape special chars in field's default value: {}",
                        text
                    )));
                }
                Some(format!("'{}'", text))
            }
        })
    }
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("identifier pattern is valid"))
}

/// Quote an identifier for SQLite.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

fn check_identifier(name: &str) -> Result<()> {
    if identifier_regex().is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Invalid column or table name: {:?}. Lowercase letters, digits and underscores only.",
            name
        )))
    }
}

/// One column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub sql_type: SqlType,
    pub length: Option<u32>,
    pub unsigned: bool,
    pub nullable: bool,
    pub default: FieldDefault,
    pub on_update_current_timestamp: bool,
    /// Stored as JSON text, read back parsed
    pub json: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            length: None,
            unsigned: false,
            nullable: true,
            default: FieldDefault::None,
            on_update_current_timestamp: false,
            json: false,
        }
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, default: FieldDefault) -> Self {
        self.default = default;
        self
    }

    pub fn on_update_current_timestamp(mut self) -> Self {
        self.on_update_current_timestamp = true;
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn is_bool(&self) -> bool {
        self.sql_type == SqlType::Bool
    }

    /// Type callers see for this column.
    pub fn property_type(&self) -> PropertyType {
        if self.json {
            return PropertyType::Json;
        }
        match self.sql_type {
            SqlType::Varchar | SqlType::Char | SqlType::Text | SqlType::MediumText => {
                PropertyType::Text
            }
            SqlType::Bool => PropertyType::Bool,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Int | SqlType::BigInt => {
                PropertyType::Int
            }
            SqlType::Float | SqlType::Double => PropertyType::Float,
            SqlType::Date => PropertyType::Date,
            SqlType::Datetime | SqlType::Timestamp => PropertyType::Datetime,
        }
    }

    /// Convert a stored column value into a property value.
    pub fn read_value(&self, raw: ValueRef<'_>) -> Result<Value> {
        let bad = |what: &str| {
            Error::Validation(format!("Column {} holds an invalid {}", self.name, what))
        };
        Ok(match raw {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) if self.is_bool() => Value::Bool(i == 1),
            ValueRef::Integer(i) => match self.sql_type {
                SqlType::Float | SqlType::Double => Value::Float(i as f64),
                _ => Value::Int(i),
            },
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| bad("utf-8 string"))?;
                if self.json {
                    Value::Json(serde_json::from_str(text)?)
                } else {
                    match self.property_type() {
                        PropertyType::Date => Value::Date(
                            NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|_| bad("date"))?,
                        ),
                        PropertyType::Datetime => Value::Timestamp(
                            NaiveDateTime::parse_from_str(text, SQL_DATETIME_FORMAT)
                                .map_err(|_| bad("datetime"))?,
                        ),
                        _ => Value::Text(text.to_string()),
                    }
                }
            }
            ValueRef::Blob(_) => return Err(bad("blob")),
        })
    }

    /// Prepare a property value for writing. JSON columns are size-checked.
    pub fn write_value(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        if self.json {
            let json = value.to_json();
            value::check_json_limits(&self.name, &json)?;
            return Ok(Value::Json(json));
        }
        Ok(match (self.sql_type, value) {
            (SqlType::Bool, Value::Int(i)) => Value::Bool(*i == 1),
            _ => value.clone(),
        })
    }

    fn mysql(&self) -> Result<String> {
        let mut parts = vec![format!(
            "`{}` {}{}",
            self.name,
            self.sql_type.as_str(),
            self.length.map(|l| format!("({})", l)).unwrap_or_default()
        )];
        if self.unsigned {
            parts.push("unsigned".to_string());
        }
        if !self.nullable {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = self.default.sql()? {
            parts.push(format!("DEFAULT {}", default));
        }
        if self.on_update_current_timestamp {
            parts.push("ON UPDATE CURRENT_TIMESTAMP".to_string());
        }
        Ok(parts.join(" "))
    }

    fn sqlite(&self) -> Result<String> {
        let mut parts = vec![quote(&self.name), self.sql_type.sqlite_affinity().to_string()];
        if !self.nullable {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = self.default.sql()? {
            parts.push(format!("DEFAULT {}", default));
        }
        Ok(parts.join(" "))
    }

    fn random_value<R: Rng>(&self, rng: &mut R) -> Value {
        if self.json {
            return Value::Json(serde_json::json!({}));
        }
        match self.sql_type {
            SqlType::Varchar | SqlType::Char => {
                Value::Text(random_letters(rng, self.length.unwrap_or(10) as usize))
            }
            SqlType::Text | SqlType::MediumText => Value::Text(random_letters(rng, 100)),
            SqlType::Bool => Value::Bool(rng.r#gen()),
            t if t.is_integer() => {
                let bits = self.length.unwrap_or(8).min(62);
                let x: i64 = rng.gen_range(0..(1i64 << bits));
                Value::Int(if self.unsigned { x } else { x - (1i64 << bits) / 2 })
            }
            SqlType::Float | SqlType::Double => Value::Float(rng.r#gen()),
            SqlType::Date => Value::Date(Utc::now().date_naive()),
            _ => Utc::now()
                .naive_utc()
                .with_nanosecond(0)
                .map_or(Value::Null, Value::Timestamp),
        }
    }
}

fn random_letters<R: Rng>(rng: &mut R, n: usize) -> String {
    (0..n).map(|_| char::from(b'a' + rng.gen_range(0..26u8))).collect()
}

/// A named index over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            unique: true,
            ..Self::new(name, fields)
        }
    }
}

/// SQL dialect of generated DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl std::str::FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mysql" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            _ => Err(Error::Validation(format!("Unknown dialect: {}", s))),
        }
    }
}

/// Table name for a kind: `TaskReminder` lives in `task_reminder`.
pub fn table_name_for(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len() + 4);
    for (i, c) in type_name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Everything needed to create and use one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub table_name: String,
    pub type_name: String,
    pub fields: Vec<FieldDef>,
    pub primary_key: Vec<String>,
    pub indices: Vec<IndexDef>,
    pub engine: String,
    pub charset: Option<String>,
    pub collate: Option<String>,
}

impl TableDefinition {
    /// A table with the columns every relational kind has: `uid`,
    /// `short_uid`, and the database-maintained `created` and `modified`.
    pub fn standard(type_name: &str) -> Self {
        Self {
            table_name: table_name_for(type_name),
            type_name: type_name.to_string(),
            fields: vec![
                FieldDef::new("uid", SqlType::Varchar).length(50).not_null(),
                FieldDef::new("short_uid", SqlType::Varchar).length(50).not_null(),
                FieldDef::new("created", SqlType::Datetime)
                    .default_value(FieldDefault::CurrentTimestamp),
                FieldDef::new("modified", SqlType::Datetime)
                    .default_value(FieldDefault::CurrentTimestamp)
                    .on_update_current_timestamp(),
            ],
            primary_key: vec!["uid".to_string()],
            indices: Vec::new(),
            engine: "InnoDB".to_string(),
            charset: Some("utf8mb4".to_string()),
            collate: Some("utf8mb4_unicode_ci".to_string()),
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indices.push(index);
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get_field(name).is_some()
    }

    pub fn unique_indices(&self) -> Vec<&IndexDef> {
        self.indices.iter().filter(|i| i.unique).collect()
    }

    /// Check every name that will be interpolated into SQL.
    pub fn validate(&self) -> Result<()> {
        check_identifier(&self.table_name)?;
        if !uid::is_type_name(&self.type_name) {
            return Err(Error::Validation(format!("Invalid type name: {}", self.type_name)));
        }
        for field in &self.fields {
            check_identifier(&field.name)?;
        }
        for index in &self.indices {
            check_identifier(&index.name)?;
        }
        let indexed = self.indices.iter().flat_map(|i| &i.fields);
        for name in indexed.chain(&self.primary_key) {
            if !self.has_column(name) {
                return Err(Error::Validation(format!(
                    "Table {} has no column {}",
                    self.table_name, name
                )));
            }
        }
        if !self.has_column("uid") {
            return Err(Error::Validation(format!("Table {} has no uid column", self.table_name)));
        }
        Ok(())
    }

    /// `CREATE TABLE` in MySQL dialect.
    pub fn create_table_sql(&self) -> Result<String> {
        self.validate()?;
        let fields = self
            .fields
            .iter()
            .map(|f| f.mysql().map(|s| format!("  {}", s)))
            .collect::<Result<Vec<_>>>()?;
        let mut body = fields;
        body.push(format!("  PRIMARY KEY (`{}`)", self.primary_key.join("`, `")));
        for index in &self.indices {
            body.push(format!(
                "  {}INDEX `{}` (`{}`)",
                if index.unique { "UNIQUE " } else { "" },
                index.name,
                index.fields.join("`, `")
            ));
        }

        let mut tail = vec![format!("ENGINE={}", self.engine)];
        if let Some(charset) = &self.charset {
            tail.push(format!("DEFAULT CHARSET={}", charset));
        }
        if let Some(collate) = &self.collate {
            tail.push(format!("DEFAULT COLLATE={}", collate));
        }

        Ok(format!(
            "CREATE TABLE `{}` (\n{}\n) {};",
            self.table_name,
            body.join(",\n"),
            tail.join(" ")
        ))
    }

    /// Statements that create the table, its indices, and the trigger that
    /// keeps `modified` current, in SQLite dialect.
    pub fn create_statements(&self) -> Result<Vec<String>> {
        self.validate()?;
        let mut columns = self
            .fields
            .iter()
            .map(|f| f.sqlite().map(|s| format!("    {}", s)))
            .collect::<Result<Vec<_>>>()?;
        let quoted = |names: &[String]| names.iter().map(|n| quote(n)).collect::<Vec<_>>().join(", ");
        columns.push(format!("    PRIMARY KEY ({})", quoted(&self.primary_key)));

        let table = quote(&self.table_name);
        let mut stmts = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            table,
            columns.join(",\n")
        )];

        for index in &self.indices {
            stmts.push(format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                quote(&format!("{}_{}", self.table_name, index.name)),
                table,
                quoted(&index.fields)
            ));
        }

        for field in self.fields.iter().filter(|f| f.on_update_current_timestamp) {
            stmts.push(format!(
                "CREATE TRIGGER IF NOT EXISTS {trigger} AFTER UPDATE ON {table} \
                 FOR EACH ROW WHEN NEW.{col} IS OLD.{col} \
                 BEGIN UPDATE {table} SET {col} = CURRENT_TIMESTAMP WHERE \"uid\" = NEW.\"uid\"; END",
                trigger = quote(&format!("{}_{}_on_update", self.table_name, field.name)),
                table = table,
                col = quote(&field.name)
            ));
        }

        Ok(stmts)
    }

    pub fn drop_statement(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", quote(&self.table_name))
    }

    /// Random rows shaped like this table, for load tests and fixtures.
    pub fn generate_test_rows(&self, n: usize) -> Result<Vec<Record>> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| {
                let uid = Uid::generate(&self.type_name, None, None, uid::RELATIONAL_ID_LENGTH)?;
                let properties: Properties = self
                    .fields
                    .iter()
                    .filter(|f| !matches!(f.name.as_str(), "uid" | "short_uid" | "created" | "modified"))
                    .map(|f| (f.name.clone(), f.random_value(&mut rng)))
                    .collect();
                Ok(Record::new(uid, properties))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn widget_table() -> TableDefinition {
        TableDefinition::standard("Widget")
            .field(FieldDef::new("name", SqlType::Varchar).length(50).not_null())
            .field(FieldDef::new("size", SqlType::Int).length(11).unsigned())
            .field(FieldDef::new("active", SqlType::Bool).default_value(FieldDefault::Int(1)))
            .field(FieldDef::new("meta", SqlType::Text).json())
            .field(FieldDef::new("label", SqlType::Varchar).length(20).default_value(FieldDefault::Text("none".into())))
            .index(IndexDef::unique("name", &["name"]))
            .index(IndexDef::new("size", &["size"]))
    }

    #[test]
    fn test_table_name_for() {
        assert_eq!(table_name_for("Widget"), "widget");
        assert_eq!(table_name_for("TaskReminder"), "task_reminder");
    }

    #[test]
    fn test_mysql_ddl() {
        let sql = widget_table().create_table_sql().unwrap();
        assert!(sql.starts_with("CREATE TABLE `widget` ("));
        assert!(sql.contains("`uid` varchar(50) NOT NULL"));
        assert!(sql.contains("`size` int(11) unsigned"));
        assert!(sql.contains("`active` bool DEFAULT 1"));
        assert!(sql.contains("`label` varchar(20) DEFAULT 'none'"));
        assert!(sql.contains("`modified` datetime DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP"));
        assert!(sql.contains("PRIMARY KEY (`uid`)"));
        assert!(sql.contains("UNIQUE INDEX `name` (`name`)"));
        assert!(sql.contains("INDEX `size` (`size`)"));
        assert!(sql.ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 DEFAULT COLLATE=utf8mb4_unicode_ci;"));
    }

    #[test]
    fn test_default_with_quote_rejected() {
        let table = TableDefinition::standard("Widget").field(
            FieldDef::new("label", SqlType::Varchar).default_value(FieldDefault::Text("it's".into())),
        );
        assert!(table.create_table_sql().is_err());
        assert!(table.create_statements().is_err());
    }

    #[test]
    fn test_invalid_column_name_rejected() {
        let table = TableDefinition::standard("Widget")
            .field(FieldDef::new("name; DROP TABLE x", SqlType::Varchar));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_sqlite_statements_execute() {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in widget_table().create_statements().unwrap() {
            conn.execute(&stmt, []).unwrap();
        }
        conn.execute(
            "INSERT INTO widget (uid, short_uid, name) VALUES ('Widget_a', 'a', 'first')",
            [],
        )
        .unwrap();
        let (created, active): (String, i64) = conn
            .query_row("SELECT created, active FROM widget", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(created.len(), 19);
        assert_eq!(active, 1);

        // Unique index is live.
        assert!(conn
            .execute("INSERT INTO widget (uid, short_uid, name) VALUES ('Widget_b', 'b', 'first')", [])
            .is_err());
    }

    #[test]
    fn test_read_and_write_values() {
        let table = widget_table();
        let active = table.get_field("active").unwrap();
        assert_eq!(active.read_value(ValueRef::Integer(1)).unwrap(), Value::Bool(true));
        assert_eq!(active.read_value(ValueRef::Integer(0)).unwrap(), Value::Bool(false));

        let meta = table.get_field("meta").unwrap();
        assert_eq!(
            meta.read_value(ValueRef::Text(b"{\"k\":2}")).unwrap(),
            Value::Json(serde_json::json!({"k": 2}))
        );
        let too_big = Value::Text("x".repeat(16_001));
        assert!(meta.write_value(&too_big).is_err());

        let created = table.get_field("created").unwrap();
        assert!(matches!(
            created.read_value(ValueRef::Text(b"2024-01-02 03:04:05")).unwrap(),
            Value::Timestamp(_)
        ));
    }

    #[test]
    fn test_generate_test_rows() {
        let rows = widget_table().generate_test_rows(5).unwrap();
        assert_eq!(rows.len(), 5);
        for row in &rows {
            assert_eq!(row.meta.uid.local_id().len(), uid::RELATIONAL_ID_LENGTH);
            assert!(matches!(row.get("name"), Some(Value::Text(s)) if s.len() == 50));
            assert!(matches!(row.get("size"), Some(Value::Int(i)) if *i >= 0));
            assert!(!row.properties.contains_key("created"));
        }
    }
}
