//! Entity Store CLI - manage relational kinds, uids and queries from the shell

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use entity_store::config::{self, EntityStoreConfig};
use entity_store::entity::META_FIELDS;
use entity_store::pagination::link_header;
use entity_store::query::Access;
use entity_store::storage::schema::{Dialect, TableDefinition};
use entity_store::ui;
use entity_store::uid::{self, Uid};
use entity_store::{
    BackendKind, EntitySchema, Properties, QueryOutcome, Record, Registry, Repository, SqliteStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "entity-store")]
#[command(version)]
#[command(about = "Unified entity persistence - uids, queries and pagination over SQLite")]
#[command(long_about = r#"
Entity Store keeps typed entities behind one identity and query contract:
  • Self-describing uids (Widget_abc123, Comment_p4.User_80)
  • Filtered, ordered, paged queries with Link headers
  • Upserts that resolve duplicates on a unique index

Example usage:
  entity-store init
  entity-store create-tables
  entity-store put --kind Widget --data '{"name": "gear"}' --index name
  entity-store query --kind Widget --filter active=true -n 10
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = "entity-store.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DialectArg {
    Mysql,
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Print the DDL of every relational kind
    Schema {
        #[arg(long, value_enum, default_value = "mysql")]
        dialect: DialectArg,
    },

    /// Create missing tables
    CreateTables,

    /// Drop and recreate every table (not allowed in production)
    Reset,

    /// Generate or convert uids
    Uid {
        #[command(subcommand)]
        command: UidCommands,
    },

    /// Create or update an entity from a JSON object
    Put {
        #[arg(short, long)]
        kind: String,

        /// Properties as a JSON object. A "uid" key updates that entity.
        #[arg(short, long)]
        data: String,

        /// Resolve duplicates on this unique index
        #[arg(short, long)]
        index: Option<String>,
    },

    /// Fetch entities by uid
    Get {
        uids: Vec<String>,
    },

    /// Run a filtered, ordered, paged query
    Query {
        #[arg(short, long)]
        kind: String,

        /// property=value; repeat for more, `property!=value` to negate
        #[arg(short, long)]
        filter: Vec<String>,

        /// Property to order by, `-` prefix for descending
        #[arg(short, long)]
        order: Option<String>,

        /// Page size, or `inf`
        #[arg(short = 'n', long)]
        n: Option<String>,

        #[arg(long)]
        cursor: Option<String>,

        /// Request path used to build the Link header
        #[arg(long)]
        path: Option<String>,
    },

    /// Delete entities by uid
    Delete {
        uids: Vec<String>,
    },

    /// Row counts per kind
    Stats,
}

#[derive(Subcommand)]
enum UidCommands {
    /// Generate a new uid
    Generate {
        #[arg(short, long)]
        kind: String,

        #[arg(short, long)]
        parent: Option<String>,

        /// Use this local id instead of a random one
        #[arg(long)]
        id: Option<String>,

        #[arg(short, long)]
        length: Option<usize>,
    },

    /// Long uids become short; short uids become long given their kinds
    Convert {
        value: String,

        /// Type chain, entity first, comma separated
        #[arg(short, long, value_delimiter = ',')]
        kinds: Vec<String>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    fn is_human(self) -> bool {
        self == OutputMode::Human
    }
}

fn emit_success(mode: OutputMode, command: &str, data: serde_json::Value) -> anyhow::Result<()> {
    if mode == OutputMode::Json {
        let envelope = serde_json::json!({ "ok": true, "command": command, "data": data });
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    }
    Ok(())
}

/// Everything a data command needs, built from the config.
struct App {
    config: EntityStoreConfig,
    schemas: Vec<EntitySchema>,
    store: SqliteStore,
    registry: Registry,
}

impl App {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let config = config::load_config(Some(path))?
            .with_context(|| format!("no config at {} (run `entity-store init`)", path.display()))?;
        let sql = config.sql_config();
        config::ensure_db_dir(&sql.target.path())?;
        let store = SqliteStore::new(&sql);

        let schemas = config.schemas()?;
        let mut registry = Registry::new();
        for schema in &schemas {
            if schema.backend == BackendKind::Relational {
                registry.register(schema.clone(), Arc::new(store.clone()))?;
            }
        }
        Ok(Self {
            config,
            schemas,
            store,
            registry,
        })
    }

    fn store_label(&self) -> String {
        self.config.sql_config().target.path().display().to_string()
    }

    fn tables(&self) -> Vec<&TableDefinition> {
        self.schemas.iter().filter_map(|s| s.table.as_ref()).collect()
    }

    fn schema(&self, kind: &str) -> anyhow::Result<&EntitySchema> {
        self.schemas
            .iter()
            .find(|s| s.type_name == kind)
            .with_context(|| format!("unknown kind {}", kind))
    }

    /// Repository for a kind the CLI can reach. Document kinds live in the
    /// memory of the process that owns them.
    fn repository(&self, kind: &str) -> anyhow::Result<Repository<Record>> {
        let schema = self.schema(kind)?;
        if schema.backend == BackendKind::Document {
            anyhow::bail!("{} is a document kind; only relational kinds are reachable from the CLI", kind);
        }
        Ok(self.registry.repository(kind)?)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mode = if cli.json { OutputMode::Json } else { OutputMode::Human };

    if let Err(e) = run(cli, mode) {
        if mode.is_human() {
            ui::failure(&format!("{:#}", e));
        } else {
            let envelope = serde_json::json!({ "ok": false, "error": format!("{:#}", e) });
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run(cli: Cli, mode: OutputMode) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init { force } => {
            config::write_config(&cli.config, &EntityStoreConfig::starter(), force)?;
            if mode.is_human() {
                ui::saved(&format!("Wrote {}", cli.config.display()));
            }
            emit_success(mode, "init", serde_json::json!({ "path": cli.config }))?;
        }

        Commands::Schema { dialect } => {
            let app = App::open(&cli.config)?;
            let dialect = match dialect {
                DialectArg::Mysql => Dialect::MySql,
                DialectArg::Sqlite => Dialect::Sqlite,
            };
            let mut statements = Vec::new();
            for table in app.tables() {
                match dialect {
                    Dialect::MySql => statements.push(table.create_table_sql()?),
                    Dialect::Sqlite => statements.extend(table.create_statements()?),
                }
            }
            if mode.is_human() {
                for stmt in &statements {
                    println!("{};\n", stmt.trim_end_matches(';'));
                }
            }
            emit_success(mode, "schema", serde_json::json!(statements))?;
        }

        Commands::CreateTables => {
            let app = App::open(&cli.config)?;
            let tables = app.tables();
            app.store.create_tables(&tables)?;
            if mode.is_human() {
                ui::saved(&format!("Created {} tables", tables.len()));
            }
            emit_success(mode, "create-tables", serde_json::json!({ "tables": tables.len() }))?;
        }

        Commands::Reset => {
            let app = App::open(&cli.config)?;
            let tables = app.tables();
            app.store.reset_tables(&tables)?;
            if mode.is_human() {
                ui::saved(&format!("Reset {} tables", tables.len()));
            }
            emit_success(mode, "reset", serde_json::json!({ "tables": tables.len() }))?;
        }

        Commands::Uid { command } => run_uid(command, &cli.config, mode)?,

        Commands::Put { kind, data, index } => {
            let app = App::open(&cli.config)?;
            let repo = app.repository(&kind)?;
            let json: serde_json::Value = serde_json::from_str(&data).context("--data must be JSON")?;
            let serde_json::Value::Object(object) = json else {
                anyhow::bail!("--data must be a JSON object");
            };

            let types = repo.schema().property_types();
            let mut identifier = None;
            let mut props = Properties::new();
            for (name, value) in object {
                if name == "uid" {
                    identifier = value.as_str().map(str::to_string);
                    continue;
                }
                if META_FIELDS.contains(&name.as_str()) {
                    continue;
                }
                let ty = types
                    .get(&name)
                    .with_context(|| format!("{} has no property {}", kind, name))?;
                props.insert(name, ty.coerce_json(value)?);
            }

            let existing = match &identifier {
                Some(id) => repo.get_by_id(id)?,
                None => None,
            };
            let mut record = match existing {
                Some(mut record) => {
                    record.properties.extend(props);
                    record
                }
                None => {
                    let local = identifier
                        .as_deref()
                        .map(|id| {
                            repo.schema()
                                .long_uid(id)
                                .map(|uid| uid.local_id().to_string())
                                .with_context(|| format!("invalid uid {}", id))
                        })
                        .transpose()?;
                    repo.create(local.as_deref(), None, props)?
                }
            };

            let stored = match index {
                Some(index) => repo.put_for_index(record, &index)?,
                None => {
                    repo.put(&mut record)?;
                    record
                }
            };

            if mode.is_human() {
                ui::saved(&format!("Saved {}", stored.uid()));
                println!("{}", ui::records_table(std::slice::from_ref(&stored)));
            }
            emit_success(mode, "put", stored.to_json())?;
        }

        Commands::Get { uids } => {
            let app = App::open(&cli.config)?;
            let mut found = Vec::new();
            for id in &uids {
                match app.registry.get_by_uid(id)? {
                    Some(record) => found.push(record),
                    None if mode.is_human() => ui::caution(&format!("{} not found", id)),
                    None => {}
                }
            }
            if mode.is_human() {
                println!("{}", ui::records_table(&found));
            }
            emit_success(
                mode,
                "get",
                serde_json::Value::Array(found.iter().map(Record::to_json).collect()),
            )?;
        }

        Commands::Query { kind, filter, order, n, cursor, path } => {
            let app = App::open(&cli.config)?;
            let repo = app.repository(&kind)?;

            let mut pairs = Vec::new();
            for f in &filter {
                let (key, value) = f
                    .split_once('=')
                    .with_context(|| format!("filter {} is not property=value", f))?;
                pairs.push((key.to_string(), value.to_string()));
            }
            let optional = [("order", &order), ("n", &n), ("cursor", &cursor)];
            for (key, value) in optional {
                if let Some(value) = value {
                    pairs.push((key.to_string(), value.clone()));
                }
            }

            let (records, page) = match repo.query_params(&pairs, Access::Privileged)? {
                QueryOutcome::Page(page) => {
                    let records = page.items().to_vec();
                    (records, Some(page))
                }
                QueryOutcome::Stream(stream) => (stream.collect::<entity_store::Result<Vec<_>>>()?, None),
            };

            let path_and_query = path.unwrap_or_else(|| {
                let query = pairs
                    .iter()
                    .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                    .collect::<Vec<_>>()
                    .join("&");
                format!("/api/{}?{}", kind, query)
            });
            let link = page
                .as_ref()
                .and_then(|p| link_header(&path_and_query, p, order.as_deref().unwrap_or("")));

            if mode.is_human() {
                ui::heading(&format!("{} results for {}", records.len(), kind));
                println!("{}", ui::records_table(&records));
                if let Some(page) = &page {
                    ui::cursors(page);
                }
                if let Some(link) = &link {
                    ui::link(link);
                }
            }
            emit_success(
                mode,
                "query",
                serde_json::json!({
                    "results": records.iter().map(Record::to_json).collect::<Vec<_>>(),
                    "next_cursor": page.as_ref().and_then(|p| p.next_cursor.as_ref().map(|c| c.urlsafe())),
                    "previous_cursor": page.as_ref().and_then(|p| p.previous_cursor.as_ref().map(|c| c.urlsafe())),
                    "last_cursor": page.as_ref().and_then(|p| p.last_cursor.as_ref().map(|c| c.urlsafe())),
                    "more": page.as_ref().is_some_and(|p| p.more),
                    "link": link,
                }),
            )?;
        }

        Commands::Delete { uids } => {
            let app = App::open(&cli.config)?;
            let mut deleted = 0;
            for id in &uids {
                let Some(kind) = uid::type_of(id) else {
                    ui::caution(&format!("{} is not a long uid", id));
                    continue;
                };
                deleted += app.repository(kind)?.delete(&[id.as_str()])?;
            }
            if mode.is_human() {
                ui::deleted(deleted);
            }
            emit_success(mode, "delete", serde_json::json!({ "deleted": deleted }))?;
        }

        Commands::Stats => {
            let app = App::open(&cli.config)?;
            let counts = app.registry.stats()?;
            if mode.is_human() {
                ui::heading(&format!("Entity Store Statistics ({})", app.store_label()));
                println!("{}", ui::counts_table(&counts));
            }
            emit_success(mode, "stats", serde_json::json!(counts.into_iter().collect::<std::collections::BTreeMap<_, _>>()))?;
        }
    }

    Ok(())
}

fn run_uid(command: UidCommands, config_path: &Path, mode: OutputMode) -> anyhow::Result<()> {
    match command {
        UidCommands::Generate { kind, parent, id, length } => {
            let parent = parent
                .map(|p| p.parse::<Uid>())
                .transpose()?;
            let length = match length {
                Some(length) => length,
                None => config::load_config(Some(config_path))?
                    .and_then(|c| c.schemas().ok())
                    .and_then(|schemas| schemas.into_iter().find(|s| s.type_name == kind))
                    .map_or(uid::DOCUMENT_ID_LENGTH, |s| s.id_length),
            };
            let uid = Uid::generate(&kind, parent.as_ref(), id.as_deref(), length)?;
            if mode.is_human() {
                ui::uid_line("uid", uid.as_str());
                ui::uid_line("short", &uid.short());
            }
            emit_success(mode, "uid generate", serde_json::json!({ "uid": uid, "short_uid": uid.short() }))?;
        }

        UidCommands::Convert { value, kinds } => {
            let chain: Vec<&str> = kinds.iter().map(String::as_str).collect();
            let converted = uid::convert(&value, (!chain.is_empty()).then_some(chain.as_slice()))
                .with_context(|| format!("can't convert {}", value))?;
            if mode.is_human() {
                println!("{}", converted);
            }
            emit_success(mode, "uid convert", serde_json::json!({ "input": value, "output": converted }))?;
        }
    }
    Ok(())
}
