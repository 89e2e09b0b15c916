//! `entity-store.toml`: database target, retry policy, and the kinds to
//! register.

use crate::entity::{BackendKind, EntitySchema};
use crate::storage::connection::{
    DatabaseTarget, RetryPolicy, SqlConfig, DEFAULT_DB_PATH, DEFAULT_SOCKET_DIR,
    DEFAULT_TEST_DB_PATH,
};
use crate::storage::document::Consistency;
use crate::storage::schema::{FieldDef, FieldDefault, IndexDef, SqlType, TableDefinition};
use crate::value::PropertyType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EntityStoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub document: DocumentConfig,
    #[serde(default)]
    pub kinds: Vec<KindConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DatabaseConfig {
    /// `development` (default), `test` or `production`
    pub environment: Option<String>,
    pub path: Option<String>,
    pub test_path: Option<String>,
    /// Managed instance name, production only
    pub instance: Option<String>,
    pub socket_dir: Option<String>,
    #[serde(default)]
    pub busy_timeout_ms: u64,
    /// Defaults to true outside production
    pub allow_reset: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_interval_ms: u64,
    pub retry_on_error: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            base_interval_ms: policy.base_interval.as_millis() as u64,
            retry_on_error: policy.retry_on_error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DocumentConfig {
    /// Delay before writes show up in global queries; 0 is strongly
    /// consistent
    #[serde(default)]
    pub visible_after_ms: u64,
}

/// One kind to register.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KindConfig {
    pub name: String,
    pub backend: BackendKind,
    pub id_length: Option<usize>,
    /// Ancestor types, parent first
    #[serde(default)]
    pub ancestors: Vec<String>,
    /// Declared properties of document kinds
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyType>,
    /// Columns of relational kinds, besides the standard ones
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub indices: Vec<IndexConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: SqlType,
    pub length: Option<u32>,
    #[serde(default)]
    pub unsigned: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
    pub default: Option<DefaultConfig>,
    #[serde(default)]
    pub on_update_current_timestamp: bool,
    #[serde(default)]
    pub json: bool,
}

/// A column default as written in TOML. The strings `NULL` and
/// `CURRENT_TIMESTAMP` are keywords.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DefaultConfig {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexConfig {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

fn default_true() -> bool {
    true
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("entity-store.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<EntityStoreConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: EntityStoreConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &EntityStoreConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

impl EntityStoreConfig {
    /// A config with one kind of each backend, written by `init`.
    pub fn starter() -> Self {
        Self {
            kinds: vec![
                KindConfig {
                    name: "Theme".to_string(),
                    backend: BackendKind::Document,
                    id_length: None,
                    ancestors: vec![],
                    properties: BTreeMap::from([
                        ("name".to_string(), PropertyType::Text),
                        ("public".to_string(), PropertyType::Bool),
                    ]),
                    fields: vec![],
                    indices: vec![],
                },
                KindConfig {
                    name: "Widget".to_string(),
                    backend: BackendKind::Relational,
                    id_length: None,
                    ancestors: vec![],
                    properties: BTreeMap::new(),
                    fields: vec![
                        FieldConfig {
                            name: "name".to_string(),
                            sql_type: SqlType::Varchar,
                            length: Some(100),
                            unsigned: false,
                            nullable: false,
                            default: None,
                            on_update_current_timestamp: false,
                            json: false,
                        },
                        FieldConfig {
                            name: "active".to_string(),
                            sql_type: SqlType::Bool,
                            length: None,
                            unsigned: false,
                            nullable: true,
                            default: Some(DefaultConfig::Bool(true)),
                            on_update_current_timestamp: false,
                            json: false,
                        },
                    ],
                    indices: vec![IndexConfig {
                        name: "name".to_string(),
                        fields: vec!["name".to_string()],
                        unique: true,
                    }],
                },
            ],
            ..Self::default()
        }
    }

    /// Connection parameters. Environment variables set for the process win
    /// over the file.
    pub fn sql_config(&self) -> SqlConfig {
        let db = &self.database;
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let environment = env("ENTITY_STORE_ENV")
            .or_else(|| db.environment.clone())
            .unwrap_or_else(|| "development".to_string());

        let instance = env("ENTITY_STORE_INSTANCE").or_else(|| db.instance.clone());
        let target = match (environment.as_str(), instance) {
            ("production", Some(instance)) => DatabaseTarget::Managed {
                instance,
                socket_dir: env("ENTITY_STORE_SOCKET_DIR")
                    .or_else(|| db.socket_dir.clone())
                    .unwrap_or_else(|| DEFAULT_SOCKET_DIR.to_string())
                    .into(),
            },
            ("test", _) => DatabaseTarget::File(
                env("ENTITY_STORE_TEST_DB_PATH")
                    .or_else(|| db.test_path.clone())
                    .unwrap_or_else(|| DEFAULT_TEST_DB_PATH.to_string())
                    .into(),
            ),
            _ => DatabaseTarget::File(
                env("ENTITY_STORE_DB_PATH")
                    .or_else(|| db.path.clone())
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
                    .into(),
            ),
        };

        SqlConfig {
            target,
            busy_timeout: Duration::from_millis(db.busy_timeout_ms),
            retry: RetryPolicy {
                attempts: self.retry.attempts.max(1),
                base_interval: Duration::from_millis(self.retry.base_interval_ms),
                retry_on_error: self.retry.retry_on_error,
            },
            allow_reset: db.allow_reset.unwrap_or(environment != "production"),
        }
    }

    pub fn consistency(&self) -> Consistency {
        match self.document.visible_after_ms {
            0 => Consistency::Strong,
            ms => Consistency::Eventual {
                visible_after: Duration::from_millis(ms),
            },
        }
    }

    pub fn schemas(&self) -> Result<Vec<EntitySchema>> {
        self.kinds.iter().map(KindConfig::schema).collect()
    }
}

impl KindConfig {
    pub fn schema(&self) -> Result<EntitySchema> {
        let ancestors: Vec<&str> = self.ancestors.iter().map(String::as_str).collect();
        let mut schema = match self.backend {
            BackendKind::Document => {
                if !self.fields.is_empty() || !self.indices.is_empty() {
                    return Err(Error::Validation(format!(
                        "{} is a document kind; declare properties, not fields",
                        self.name
                    )));
                }
                self.properties
                    .iter()
                    .fold(EntitySchema::document(&self.name), |schema, (name, ty)| {
                        schema.with_property(name, *ty)
                    })
            }
            BackendKind::Relational => {
                if !ancestors.is_empty() {
                    return Err(Error::Validation(format!(
                        "{} is a relational kind and can't have ancestors",
                        self.name
                    )));
                }
                let mut table = TableDefinition::standard(&self.name);
                for field in &self.fields {
                    table = table.field(field.definition());
                }
                for index in &self.indices {
                    let fields: Vec<&str> = index.fields.iter().map(String::as_str).collect();
                    table = table.index(if index.unique {
                        IndexDef::unique(&index.name, &fields)
                    } else {
                        IndexDef::new(&index.name, &fields)
                    });
                }
                table.validate()?;
                EntitySchema::relational(table)
            }
        };
        schema = schema.with_ancestors(&ancestors);
        if let Some(id_length) = self.id_length {
            schema = schema.with_id_length(id_length);
        }
        Ok(schema)
    }
}

impl FieldConfig {
    pub fn definition(&self) -> FieldDef {
        let mut field = FieldDef::new(&self.name, self.sql_type);
        if let Some(length) = self.length {
            field = field.length(length);
        }
        if self.unsigned {
            field = field.unsigned();
        }
        if !self.nullable {
            field = field.not_null();
        }
        if let Some(default) = &self.default {
            field = field.default_value(match default {
                DefaultConfig::Bool(b) => FieldDefault::Int(i64::from(*b)),
                DefaultConfig::Int(i) => FieldDefault::Int(*i),
                DefaultConfig::Float(f) => FieldDefault::Float(*f),
                DefaultConfig::Text(t) if t.eq_ignore_ascii_case("null") => FieldDefault::Null,
                DefaultConfig::Text(t) if t.eq_ignore_ascii_case("current_timestamp") => {
                    FieldDefault::CurrentTimestamp
                }
                DefaultConfig::Text(t) => FieldDefault::Text(t.clone()),
            });
        }
        if self.on_update_current_timestamp {
            field = field.on_update_current_timestamp();
        }
        if self.json {
            field = field.json();
        }
        field
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entity-store.toml");
        let config = EntityStoreConfig::starter();
        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());

        let loaded = load_config(Some(path.as_path())).unwrap().unwrap();
        assert_eq!(loaded, config);
        assert!(load_config(Some(dir.path().join("missing.toml").as_path())).unwrap().is_none());
    }

    #[test]
    fn test_parse_kinds() {
        let config: EntityStoreConfig = toml::from_str(
            r#"
            [database]
            path = "data/app.db"
            allow_reset = false

            [retry]
            attempts = 2
            base_interval_ms = 10
            retry_on_error = false

            [document]
            visible_after_ms = 250

            [[kinds]]
            name = "Comment"
            backend = "document"
            ancestors = ["User"]
            properties = { body = "text", score = "int" }

            [[kinds]]
            name = "TaskReminder"
            backend = "relational"
            fields = [
                { name = "title", type = "varchar", length = 200, nullable = false },
                { name = "done", type = "bool", default = false },
                { name = "extra", type = "text", json = true, default = "{}" },
                { name = "due", type = "datetime", default = "NULL" },
            ]
            indices = [{ name = "title", fields = ["title"], unique = true }]
            "#,
        )
        .unwrap();

        let sql = config.sql_config();
        assert_eq!(sql.retry.attempts, 2);
        assert!(!sql.retry.retry_on_error);
        assert!(!sql.allow_reset);
        assert_eq!(
            config.consistency(),
            Consistency::Eventual {
                visible_after: Duration::from_millis(250)
            }
        );

        let schemas = config.schemas().unwrap();
        let comment = &schemas[0];
        assert_eq!(comment.type_chain(), vec!["Comment", "User"]);
        assert_eq!(comment.property_types().get("score"), Some(&PropertyType::Int));

        let reminder = &schemas[1];
        let table = reminder.table.as_ref().unwrap();
        assert_eq!(table.table_name, "task_reminder");
        assert_eq!(table.unique_indices().len(), 1);
        let defaults = reminder.defaults().unwrap();
        assert_eq!(defaults.get("done"), Some(&crate::Value::Bool(false)));
        assert_eq!(defaults.get("extra"), Some(&crate::Value::Json(serde_json::json!({}))));
        assert_eq!(defaults.get("due"), Some(&crate::Value::Null));
    }

    #[test]
    fn test_rejects_mismatched_kind_shapes() {
        let mut kind = EntityStoreConfig::starter().kinds.remove(1);
        kind.ancestors = vec!["User".to_string()];
        assert!(kind.schema().is_err());

        let mut kind = EntityStoreConfig::starter().kinds.remove(0);
        kind.indices = vec![IndexConfig {
            name: "name".into(),
            fields: vec!["name".into()],
            unique: true,
        }];
        assert!(kind.schema().is_err());
    }
}
