//! Connection manager for the relational store
//!
//! Every unit of relational work runs inside `with_connection`: one fresh
//! connection, one transaction, committed when the closure succeeds and
//! rolled back when it fails. Connections are never pooled.
//!
//! Transient SQLite failures (busy, locked, can't open, I/O, misuse,
//! locking protocol) are retried with exponential backoff, both when
//! connecting and for every statement. A retried statement runs on a brand
//! new connection, so earlier statements of the same scope are lost with
//! the old one.

use crate::{Error, Result};
use rusqlite::types::FromSql;
use rusqlite::{Connection, ErrorCode, Row, ToSql};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Database file used when nothing else is configured.
pub const DEFAULT_DB_PATH: &str = "entity-store.db";
/// Database file used by the test environment.
pub const DEFAULT_TEST_DB_PATH: &str = "entity-store-test.db";
/// Directory holding managed instance databases.
pub const DEFAULT_SOCKET_DIR: &str = "/cloudsql";

/// How hard to try before giving up on the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_interval: Duration,
    /// When false, statements fail on the first error. Connecting still
    /// retries.
    pub retry_on_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_interval: Duration::from_millis(500),
            retry_on_error: true,
        }
    }
}

impl RetryPolicy {
    /// Sleep after the given failed attempt (1-based): 500, 1000, 2000 ms.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_interval * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Is this an error worth retrying on a fresh connection?
pub fn is_transient(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::ApiMisuse
                | ErrorCode::FileLockingProtocolFailed
        ),
        _ => false,
    }
}

/// Numeric SQLite code, safe to log. Messages may contain row data.
fn sqlite_code(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code),
        _ => None,
    }
}

fn error_code(err: &Error) -> Option<i32> {
    match err {
        Error::Storage(e) | Error::Transient { source: e, .. } => sqlite_code(e),
        _ => None,
    }
}

/// Run `op` until it succeeds, fails for a non-transient reason, or the
/// policy's attempts are used up. `op` receives the 1-based attempt number.
pub fn retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Err(Error::Storage(e)) if is_transient(&e) => {
                if attempt >= policy.attempts {
                    tracing::error!("Recurrent exception on {}, gave up after {} attempts", what, attempt);
                    return Err(Error::Transient {
                        attempts: attempt,
                        source: e,
                    });
                }
                tracing::warn!(
                    "Transient SQLite error on {} (code {:?}); will retry",
                    what,
                    sqlite_code(&e)
                );
                std::thread::sleep(policy.backoff(attempt));
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    /// A local database file
    File(PathBuf),
    /// A named instance inside a managed socket directory
    Managed { instance: String, socket_dir: PathBuf },
}

impl DatabaseTarget {
    pub fn path(&self) -> PathBuf {
        match self {
            DatabaseTarget::File(path) => path.clone(),
            DatabaseTarget::Managed {
                instance,
                socket_dir,
            } => socket_dir.join(format!("{}.db", instance)),
        }
    }
}

/// Explicit connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlConfig {
    pub target: DatabaseTarget,
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
    /// Whether tables may be dropped and recreated
    pub allow_reset: bool,
}

impl SqlConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            target: DatabaseTarget::File(path.into()),
            busy_timeout: Duration::from_millis(0),
            retry: RetryPolicy::default(),
            allow_reset: false,
        }
    }
}

/// Opens raw connections. Swappable so tests can inject failures.
pub trait Connector: Send + Sync {
    fn connect(&self) -> rusqlite::Result<Connection>;
}

/// Opens the configured SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(config: &SqlConfig) -> Self {
        Self {
            path: config.target.path(),
            busy_timeout: config.busy_timeout,
        }
    }
}

impl Connector for SqliteConnector {
    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

/// Hands out one transactional session per scope.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    allow_reset: bool,
}

impl ConnectionManager {
    pub fn new(config: &SqlConfig) -> Self {
        Self {
            connector: Arc::new(SqliteConnector::new(config)),
            policy: config.retry.clone(),
            allow_reset: config.allow_reset,
        }
    }

    pub fn with_connector(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            allow_reset: false,
        }
    }

    pub fn allow_reset(&self) -> bool {
        self.allow_reset
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open a session with its transaction already begun.
    pub fn open(&self) -> Result<SqlSession> {
        SqlSession::open(Arc::clone(&self.connector), self.policy.clone())
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`. The
    /// connection is closed either way, also when `f` panics.
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut SqlSession) -> Result<T>) -> Result<T> {
        let mut session = self.open()?;
        match f(&mut session) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(
                    "Exiting connection with {:?} error (code {:?}); rolling back",
                    e.kind(),
                    error_code(&e)
                );
                session.rollback();
                Err(e)
            }
        }
    }
}

/// A connection with an open transaction.
pub struct SqlSession {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    conn: Option<Connection>,
}

impl SqlSession {
    fn open(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Result<Self> {
        let conn = Self::connect(connector.as_ref(), &policy)?;
        Ok(Self {
            connector,
            policy,
            conn: Some(conn),
        })
    }

    fn connect(connector: &dyn Connector, policy: &RetryPolicy) -> Result<Connection> {
        retry(policy, "connect", |_| Self::connect_once(connector))
    }

    fn connect_once(connector: &dyn Connector) -> Result<Connection> {
        let conn = connector.connect()?;
        conn.execute_batch("BEGIN")?;
        Ok(conn)
    }

    /// Throw away the current connection and start over on a new one. A
    /// single attempt: the caller's retry loop owns the budget.
    fn reconnect(&mut self) -> Result<()> {
        if let Some(old) = self.conn.take() {
            let _ = old.close();
        }
        self.conn = Some(Self::connect_once(self.connector.as_ref())?);
        Ok(())
    }

    fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Unsupported("connection scope already closed".to_string()))
    }

    /// Run one statement under the retry policy.
    fn run<T>(&mut self, what: &str, mut op: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        if !self.policy.retry_on_error {
            return op(self.connection()?);
        }
        let policy = self.policy.clone();
        retry(&policy, what, |attempt| {
            if attempt > 1 {
                self.reconnect()?;
            }
            op(self.connection()?)
        })
    }

    /// Execute a statement, returning the number of changed rows.
    pub fn execute(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        tracing::debug!("SQL: {}", sql);
        self.run("execute", |conn| Ok(conn.execute(sql, params)?))
    }

    /// Run a query and map every row.
    pub fn query_rows<T>(
        &mut self,
        sql: &str,
        params: &[&dyn ToSql],
        mut map: impl FnMut(&Row<'_>) -> Result<T>,
    ) -> Result<Vec<T>> {
        tracing::debug!("SQL: {}", sql);
        self.run("query", |conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(map(row)?);
            }
            Ok(out)
        })
    }

    /// Run a query expected to return exactly one value.
    pub fn query_scalar<T: FromSql>(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<T> {
        tracing::debug!("SQL: {}", sql);
        self.run("query", |conn| Ok(conn.query_row(sql, params, |row| row.get(0))?))
    }

    pub fn commit(mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback failed: {}", e);
            }
        }
    }
}

impl Drop for SqlSession {
    fn drop(&mut self) {
        // Only reached with a live connection when the scope unwound early.
        if let Some(conn) = self.conn.take() {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
}
