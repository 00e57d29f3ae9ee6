//! Ordered key-value persistence for serving records.
//!
//! Stores hold `table tag || ticket` keys (see [`crate::model::Table`]) plus
//! a leading format marker. Writers are single-owner and append-only;
//! readers are shared and read-only.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{COLUMNAR_TABLE_MARKER, Table};
use blake3::Hasher;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod memory;
mod migrations;

pub use memory::{MemoryStore, MemoryWriter};

pub type Entry = (Vec<u8>, Vec<u8>);

/// Read side of a store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Up to `limit` entries under `prefix`, in key order, strictly after
    /// `after` when given.
    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<Entry>>;

    /// Lazy, ordered scan of every entry under `prefix`. Calling again
    /// restarts from the beginning.
    fn scan_prefix(&self, prefix: &[u8]) -> PrefixScan<'_, Self>
    where
        Self: Sized,
    {
        PrefixScan::new(self, prefix, Config::get().scan_page_size)
    }
}

/// Write side of a store. One writer per store; writes must not interleave.
pub trait KeyValueWriter {
    /// Append a record. A later write to the same key replaces the earlier one.
    fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Finalize the store and make it readable.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

pub struct PrefixScan<'a, S: ?Sized> {
    store: &'a S,
    prefix: Vec<u8>,
    last: Option<Vec<u8>>,
    page: std::vec::IntoIter<Entry>,
    page_size: usize,
    exhausted: bool,
}

impl<'a, S: KeyValueStore + ?Sized> PrefixScan<'a, S> {
    pub fn new(store: &'a S, prefix: &[u8], page_size: usize) -> Self {
        PrefixScan {
            store,
            prefix: prefix.to_vec(),
            last: None,
            page: Vec::new().into_iter(),
            page_size: page_size.max(1),
            exhausted: false,
        }
    }
}

impl<S: KeyValueStore + ?Sized> Iterator for PrefixScan<'_, S> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.page.next() {
                self.last = Some(entry.0.clone());
                return Some(Ok(entry));
            }
            if self.exhausted {
                return None;
            }
            match self
                .store
                .scan_page(&self.prefix, self.last.as_deref(), self.page_size)
            {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if page.is_empty() {
                        return None;
                    }
                    self.page = page.into_iter();
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Layout of a store, decided once when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    /// Marker present: `decor:`/`xrefs:` tables of bincode records.
    Columnar,
}

impl StoreFormat {
    pub fn detect<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self> {
        match store.get(COLUMNAR_TABLE_MARKER)? {
            Some(value) if value.is_empty() => Ok(StoreFormat::Columnar),
            Some(value) => Err(Error::Format(format!(
                "unreadable table marker ({} byte value)",
                value.len()
            ))),
            None => Err(Error::Format(
                "store lacks the columnar table marker".to_string(),
            )),
        }
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDigest {
    pub rows: usize,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreDigest {
    pub decorations: TableDigest,
    pub cross_references: TableDigest,
}

pub fn digest<S: KeyValueStore>(store: &S) -> Result<StoreDigest> {
    Ok(StoreDigest {
        decorations: digest_table(store, Table::Decorations)?,
        cross_references: digest_table(store, Table::CrossReferences)?,
    })
}

fn digest_table<S: KeyValueStore>(store: &S, table: Table) -> Result<TableDigest> {
    let mut hasher = Hasher::new();
    let mut rows = 0;
    for entry in store.scan_prefix(table.tag()) {
        let (key, value) = entry?;
        for part in [&key, &value] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        rows += 1;
    }
    Ok(TableDigest {
        rows,
        hash: hasher.finalize().to_hex().to_string(),
    })
}

#[derive(Debug)]
struct ConnectionCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(())
    }

    fn on_release(&self, _conn: Connection) {}
}

/// Read-only view of a finalized SQLite store.
pub struct SqliteStore {
    db_path: PathBuf,
    read_pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("store {} does not exist", db_path.display()),
            )));
        }

        let config = Config::get();
        let max_size = config.pool_size.max(1);
        let min_idle = config.pool_min_idle.min(max_size);
        tracing::info!(
            path = %db_path.display(),
            pool_size = max_size,
            min_idle,
            "opening store read pool"
        );

        let manager = SqliteConnectionManager::file(db_path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );
        let read_pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(min_idle))
            .connection_timeout(Duration::from_secs(30))
            .connection_customizer(Box::new(ConnectionCustomizer))
            .build(manager)?;

        {
            let conn = read_pool.get()?;
            match migrations::schema_version(&conn)? {
                Some(version) if version <= migrations::SCHEMA_VERSION => {}
                Some(version) => {
                    return Err(Error::Format(format!(
                        "store schema version {version} is newer than supported version {}",
                        migrations::SCHEMA_VERSION
                    )));
                }
                None => {
                    return Err(Error::Format(format!(
                        "{} is not a serving store",
                        db_path.display()
                    )));
                }
            }
        }

        Ok(Self {
            db_path: db_path.to_path_buf(),
            read_pool,
        })
    }

    /// Start a fresh store at `db_path`, replacing any previous one.
    pub fn create(db_path: &Path) -> Result<SqliteWriter> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        for suffix in ["", "-wal", "-shm"] {
            let mut path = db_path.as_os_str().to_owned();
            path.push(suffix);
            let path = PathBuf::from(path);
            if path.exists() {
                tracing::info!(path = %path.display(), "removing previous store file");
                std::fs::remove_file(&path)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        migrations::migrate(&conn)?;

        Ok(SqliteWriter {
            db_path: db_path.to_path_buf(),
            conn,
            batch_size: Config::get().write_batch_size.max(1),
            pending: 0,
            written: 0,
        })
    }

    /// Get the database file path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn read_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.read_pool.get()?)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_conn()?
            .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(Into::into)
    }

    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<Entry>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key, value
             FROM kv
             WHERE key >= ?1
               AND (?2 IS NULL OR key < ?2)
               AND (?3 IS NULL OR key > ?3)
             ORDER BY key
             LIMIT ?4",
        )?;
        let upper = prefix_successor(prefix);
        let rows = stmt.query_map(params![prefix, upper, after, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

pub struct SqliteWriter {
    db_path: PathBuf,
    conn: Connection,
    batch_size: usize,
    pending: usize,
    written: u64,
}

impl KeyValueWriter for SqliteWriter {
    fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.pending == 0 {
            self.conn.execute_batch("BEGIN")?;
        }
        self.conn
            .prepare_cached(
                "INSERT INTO kv (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )?
            .execute(params![key, value])?;
        self.pending += 1;
        self.written += 1;
        if self.pending >= self.batch_size {
            self.conn.execute_batch("COMMIT")?;
            self.pending = 0;
        }
        Ok(())
    }

    fn close(self) -> Result<()> {
        if self.pending > 0 {
            self.conn.execute_batch("COMMIT")?;
        }
        // Fold the WAL back so the finished store is a single read-only file.
        self.conn.execute_batch(
            "
            PRAGMA wal_checkpoint(TRUNCATE);
            PRAGMA journal_mode = DELETE;
            ",
        )?;
        tracing::info!(
            path = %self.db_path.display(),
            records = self.written,
            "store finalized"
        );
        Ok(())
    }
}
