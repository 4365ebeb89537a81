use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{Connection, OpenFlags, Transaction};
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::ProjectConfig;
use crate::errors::{ProjectError, Result};

/// Tables of a project database. Created on every connection init, so opening an older
/// file adds whatever is missing.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS project_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS layer_index (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        visible INTEGER NOT NULL,
        zindex INTEGER NOT NULL,
        opacity REAL NOT NULL
    );
    CREATE TABLE IF NOT EXISTS feature (
        feature_id INTEGER PRIMARY KEY AUTOINCREMENT,
        layer_id TEXT NOT NULL,
        geometry TEXT NOT NULL,
        foreground TEXT NOT NULL,
        background TEXT NOT NULL,
        thickness INTEGER NOT NULL,
        minx REAL NOT NULL,
        miny REAL NOT NULL,
        maxx REAL NOT NULL,
        maxy REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS feature_layer_idx ON feature(layer_id);
    CREATE TABLE IF NOT EXISTS tile_coverage (
        coverage_id TEXT PRIMARY KEY,
        crs TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS tile (
        tile_id INTEGER PRIMARY KEY AUTOINCREMENT,
        coverage_id TEXT NOT NULL REFERENCES tile_coverage(coverage_id) ON DELETE CASCADE,
        image BLOB NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        minx REAL NOT NULL,
        miny REAL NOT NULL,
        maxx REAL NOT NULL,
        maxy REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS tile_coverage_idx ON tile(coverage_id);
    CREATE TABLE IF NOT EXISTS partial (
        partial_id TEXT PRIMARY KEY,
        layer_id TEXT NOT NULL,
        image BLOB NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        minx REAL NOT NULL,
        miny REAL NOT NULL,
        maxx REAL NOT NULL,
        maxy REAL NOT NULL,
        crs TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS partial_layer_idx ON partial(layer_id);
    CREATE TABLE IF NOT EXISTS partial_outline (
        partial_id TEXT PRIMARY KEY REFERENCES partial(partial_id) ON DELETE CASCADE,
        layer_id TEXT NOT NULL,
        minx REAL NOT NULL,
        miny REAL NOT NULL,
        maxx REAL NOT NULL,
        maxy REAL NOT NULL,
        footprint TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS partial_outline_layer_idx ON partial_outline(layer_id);
    CREATE TABLE IF NOT EXISTS layout_sheet (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL
    );
";

/// SQLite database backing one project.
///
/// The handle is cheap to clone; all clones share one pool holding a single connection,
/// which serializes every reader and writer of the project. Closing through any clone
/// closes it for all of them, and closing twice is a no-op.
#[derive(Clone)]
pub struct ProjectDatabase {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// `None` for in-memory databases
    path: Option<PathBuf>,
    pool: RwLock<Option<Pool<SqliteConnectionManager>>>,
}

impl std::fmt::Debug for ProjectDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectDatabase")
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ProjectDatabase {
    /// Opens (or creates) the database file at `path` and ensures the schema exists.
    pub fn open(path: impl AsRef<Path>, config: &ProjectConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let manager = SqliteConnectionManager::file(&path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        );
        Self::build(manager, Some(path), config)
    }

    /// Opens a private in-memory database. Contents vanish when the database is closed.
    pub fn open_in_memory(config: &ProjectConfig) -> Result<Self> {
        Self::build(SqliteConnectionManager::memory(), None, config)
    }

    fn build(
        manager: SqliteConnectionManager,
        path: Option<PathBuf>,
        config: &ProjectConfig,
    ) -> Result<Self> {
        let busy_timeout = config.busy_timeout;
        let file_backed = path.is_some();

        let manager = manager.with_init(move |c| {
            c.busy_timeout(busy_timeout)?;
            if file_backed {
                c.pragma_update(None, "journal_mode", "WAL")?;
            }
            c.pragma_update(None, "foreign_keys", "ON")?;
            c.execute_batch(SCHEMA)?;
            Ok(())
        });

        // A single long-lived connection: one writer per project, and an in-memory
        // database only lives as long as its connection.
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(config.connection_timeout)
            .build(manager)?;

        log::debug!("opened project database {:?}", path);

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                path,
                pool: RwLock::new(Some(pool)),
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.read().map(|p| p.is_none()).unwrap_or(true)
    }

    /// Borrows the pooled connection.
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        let pool = self
            .inner
            .pool
            .read()?
            .as_ref()
            .cloned()
            .ok_or_else(|| ProjectError::Storage("project database is closed".into()))?;
        Ok(pool.get()?)
    }

    /// Runs `f` with the project connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        f(&conn)
    }

    /// Runs `f` inside a transaction. The transaction commits when `f` succeeds and rolls
    /// back otherwise, so either every statement of `f` lands or none does.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Releases the connection pool. Returns `true` if this call closed the database and
    /// `false` if it was already closed.
    pub fn close(&self) -> bool {
        let pool = match self.inner.pool.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match pool {
            Some(pool) => {
                log::info!("closing project database {:?}", self.inner.path);
                drop(pool);
                true
            }
            None => false,
        }
    }
}
