//! Run-scoped "seen" sets for deduplicating authority identifiers.
//!
//! The name-authority dump holds more identifiers than fit comfortably in
//! memory, so the default catalog tracks them in a throwaway SQLite file with
//! durability switched off. Small inputs can use [`MemoryCatalog`] behind the
//! same [`Catalog`] trait.
use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempPath;

use crate::{IngestError, IngestResult};

/// Set membership over string keys, shared between concurrent workers.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Whether `key` has been recorded.
    async fn exists(&self, key: &str) -> IngestResult<bool>;

    /// Record `key`. Fails with [`IngestError::DuplicateKey`] if it is present.
    async fn store(&self, key: &str) -> IngestResult<()>;

    /// Record `key` unless present; returns whether it was already present.
    ///
    /// Atomic: of any number of concurrent calls for one key, exactly one
    /// returns `false`.
    async fn exists_or_store(&self, key: &str) -> IngestResult<bool>;

    /// Release the backing storage. Every later call fails with
    /// [`IngestError::CatalogClosed`].
    async fn close(&self) -> IngestResult<()>;
}

/// Open a catalog from a URI: `tmp://` or `sqlite://` for [`SqliteCatalog`],
/// `memory://` for [`MemoryCatalog`].
pub async fn open_catalog(uri: &str) -> IngestResult<Arc<dyn Catalog>> {
    let scheme = uri
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| IngestError::UnsupportedScheme(uri.to_string()))?;

    match scheme.as_str() {
        "tmp" | "sqlite" => Ok(Arc::new(SqliteCatalog::open().await?)),
        "memory" | "mem" => Ok(Arc::new(MemoryCatalog::new())),
        _ => Err(IngestError::UnsupportedScheme(scheme)),
    }
}

const PRAGMAS: &[(&str, &str)] = &[
    ("journal_mode", "OFF"),
    ("synchronous", "OFF"),
    ("locking_mode", "EXCLUSIVE"),
    ("page_size", "4096"),
    ("cache_size", "1000000"),
];

struct Store {
    conn: Connection,
    // Removes the file when dropped, so error paths that never reach
    // `close` still clean up.
    file: TempPath,
}

struct Shared {
    path: PathBuf,
    store: Mutex<Option<Store>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<Store>> {
        // A panic mid-statement leaves nothing half-written we care about.
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// SQLite-backed catalog in a private temporary file.
#[derive(Clone)]
pub struct SqliteCatalog {
    shared: Arc<Shared>,
}

impl SqliteCatalog {
    /// Create a fresh catalog file in the system temp directory.
    pub async fn open() -> IngestResult<Self> {
        tokio::task::spawn_blocking(|| {
            let file = tempfile::Builder::new()
                .prefix("catalog")
                .suffix(".db")
                .tempfile()?
                .into_temp_path();

            let conn = Connection::open(&file)?;
            for (name, value) in PRAGMAS {
                // journal_mode answers with a row, so read it back rather than execute.
                conn.pragma_update_and_check(None, name, value, |_| Ok(()))
                    .optional()?;
            }
            conn.execute_batch("CREATE TABLE seen(id TEXT PRIMARY KEY);")?;

            let path = file.to_path_buf();
            tracing::debug!(path = %path.display(), "created catalog");

            Ok::<_, IngestError>(Self {
                shared: Arc::new(Shared {
                    path,
                    store: Mutex::new(Some(Store { conn, file })),
                }),
            })
        })
        .await?
    }

    /// Location of the backing file. It no longer exists once closed.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    async fn with_store<T, F>(&self, f: F) -> IngestResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> IngestResult<T> + Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let guard = shared.lock();
            let store = guard.as_ref().ok_or(IngestError::CatalogClosed)?;
            f(&store.conn)
        })
        .await?
    }
}

fn exists_in(conn: &Connection, key: &str) -> IngestResult<bool> {
    let found = conn
        .prepare_cached("SELECT 1 FROM seen WHERE id = ?1")?
        .query_row([key], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn insert_into(conn: &Connection, key: &str) -> IngestResult<()> {
    match conn
        .prepare_cached("INSERT INTO seen(id) VALUES(?1)")?
        .execute([key])
    {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(IngestError::DuplicateKey(key.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn exists(&self, key: &str) -> IngestResult<bool> {
        let key = key.to_string();
        self.with_store(move |conn| exists_in(conn, &key)).await
    }

    async fn store(&self, key: &str) -> IngestResult<()> {
        let key = key.to_string();
        self.with_store(move |conn| insert_into(conn, &key)).await
    }

    async fn exists_or_store(&self, key: &str) -> IngestResult<bool> {
        let key = key.to_string();
        // The store mutex is held across both statements.
        self.with_store(move |conn| {
            if exists_in(conn, &key)? {
                return Ok(true);
            }
            insert_into(conn, &key)?;
            Ok(false)
        })
        .await
    }

    async fn close(&self) -> IngestResult<()> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let Store { conn, file } = shared.lock().take().ok_or(IngestError::CatalogClosed)?;
            conn.close().map_err(|(_, e)| e)?;
            file.close()?;
            tracing::debug!(path = %shared.path.display(), "removed catalog");
            Ok::<_, IngestError>(())
        })
        .await?
    }
}

/// In-memory catalog for inputs small enough to keep every key resident.
#[derive(Debug)]
pub struct MemoryCatalog {
    seen: Mutex<Option<HashSet<String>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Some(HashSet::new())),
        }
    }

    fn with_seen<T>(&self, f: impl FnOnce(&mut HashSet<String>) -> T) -> IngestResult<T> {
        let mut guard = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let seen = guard.as_mut().ok_or(IngestError::CatalogClosed)?;
        Ok(f(seen))
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn exists(&self, key: &str) -> IngestResult<bool> {
        self.with_seen(|seen| seen.contains(key))
    }

    async fn store(&self, key: &str) -> IngestResult<()> {
        if self.with_seen(|seen| seen.insert(key.to_string()))? {
            Ok(())
        } else {
            Err(IngestError::DuplicateKey(key.to_string()))
        }
    }

    async fn exists_or_store(&self, key: &str) -> IngestResult<bool> {
        self.with_seen(|seen| !seen.insert(key.to_string()))
    }

    async fn close(&self) -> IngestResult<()> {
        let mut guard = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take().map(drop).ok_or(IngestError::CatalogClosed)
    }
}
