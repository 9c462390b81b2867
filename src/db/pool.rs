// src/db/pool.rs
// Async connection pool using deadpool-sqlite.
//
// Preferred pattern is `pool.interact()`, which returns `anyhow::Result`; internal
// helpers and migrations use it directly. `pool.run()` is the call-site-friendly
// wrapper that converts errors into `MemoryError`.

use crate::error::MemoryError;
use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::Once;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Registers the sqlite-vec extension globally (once per process). Must be called
/// before any SQLite connections are opened.
static SQLITE_VEC_INIT: Once = Once::new();

#[allow(clippy::missing_transmute_annotations)]
pub(crate) fn ensure_sqlite_vec_registered() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init matches the signature sqlite3_auto_extension expects
        // (fn(*mut sqlite3, *mut *const c_char, *const sqlite3_api_routines) -> c_int).
        // The function pointer is statically linked and valid for the process lifetime.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec extension registered globally");
    });
}

/// True if the error is SQLITE_BUSY or SQLITE_LOCKED (write contention, not a real failure).
pub(crate) fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn is_memory_contention(err: &MemoryError) -> bool {
    match err {
        MemoryError::Db(e) => is_rusqlite_contention(e),
        _ => false,
    }
}

/// Retry delays for SQLite contention backoff (100ms, 500ms, 2s).
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

async fn retry_with_backoff<F, Fut, R, E>(mut op: F, is_retryable: impl Fn(&E) -> bool) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
    E: std::fmt::Display,
{
    for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if is_retryable(&e) {
                    tracing::warn!(
                        "SQLite contention on attempt {}/{}, retrying in {:?}",
                        attempt + 1,
                        RETRY_DELAYS.len(),
                        delay
                    );
                    tokio::time::sleep(*delay).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
    op().await
}

/// Per-connection pragma configuration (derived from `StoreConfig`).
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub cache_size_kb: i64,
    pub mmap_size: i64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            cache_size_kb: 64 * 1024,
            mmap_size: 1024 * 1024 * 1024,
        }
    }
}

/// Database pool wrapper with sqlite-vec support and per-connection setup.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    memory_uri: Option<String>,
}

impl DatabasePool {
    /// Open a pooled database at the given path, applying migrations.
    pub async fn open(path: &Path, opts: PoolOptions) -> Result<Self> {
        ensure_sqlite_vec_registered();
        ensure_parent_directory(path)?;

        let conn_str = path.to_string_lossy().to_string();
        let hook = make_file_post_create_hook(path.to_path_buf(), opts);

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("failed to build connection pool")?;

        let db_pool = Self {
            pool,
            path: Some(path.to_path_buf()),
            memory_uri: None,
        };

        db_pool.run_migrations().await?;
        Ok(db_pool)
    }

    /// Open a pooled database at the given path without running migrations (read-only
    /// cross-project search path, per spec §4.10). Fails if the file does not exist.
    pub async fn open_read_only(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("database file does not exist: {}", path.display());
        }
        ensure_sqlite_vec_registered();
        let conn_str = format!("file:{}?mode=ro", path.to_string_lossy());
        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("failed to create pool builder")?
            .max_size(4)
            .build()
            .context("failed to build read-only pool")?;

        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
            memory_uri: None,
        })
    }

    /// Open a pooled in-memory database, using a shared-cache URI so all pooled
    /// connections see the same state. Used for tests.
    pub async fn open_in_memory() -> Result<Self> {
        ensure_sqlite_vec_registered();
        let uri = format!("file:memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        let hook = make_memory_post_create_hook();

        let cfg = Config::new(&uri);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("failed to build connection pool")?;

        let db_pool = Self {
            pool,
            path: None,
            memory_uri: Some(uri),
        };
        db_pool.run_migrations().await?;
        Ok(db_pool)
    }

    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure with a pooled connection. Returns `anyhow::Result`; prefer this
    /// for internal helpers and migrations.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.pool.get().await.context("failed to get connection from pool")?;
        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Run a closure returning `rusqlite::Result`, converting to `MemoryError` at the boundary.
    pub async fn run<F, R, E>(&self, f: F) -> Result<R, MemoryError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<MemoryError> + Send + 'static,
    {
        self.pool
            .get()
            .await
            .map_err(|e| MemoryError::Other(format!("failed to get connection: {e}")))?
            .interact(move |conn| f(conn).map_err(Into::into))
            .await
            .map_err(|e| MemoryError::Other(format!("database error: {e}")))?
    }

    /// Like [`run`](Self::run) but retries on SQLite write contention with backoff.
    pub async fn run_with_retry<F, R, E>(&self, f: F) -> Result<R, MemoryError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + Clone + 'static,
        R: Send + 'static,
        E: Into<MemoryError> + Send + 'static,
    {
        retry_with_backoff(
            || {
                let f_clone = f.clone();
                self.run(f_clone)
            },
            is_memory_contention,
        )
        .await
    }

    async fn run_migrations(&self) -> Result<()> {
        self.interact(|conn| {
            super::schema::run_all_migrations(conn)?;
            if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                tracing::debug!("PRAGMA optimize skipped: {}", e);
            }
            Ok(())
        })
        .await
    }

    pub async fn checkpoint(&self) -> Result<()> {
        self.interact(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
            Ok(())
        })
        .await
    }

    pub async fn vacuum(&self) -> Result<()> {
        self.interact(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
        .await
    }

    pub async fn analyze(&self) -> Result<()> {
        self.interact(|conn| {
            conn.execute_batch("ANALYZE")?;
            Ok(())
        })
        .await
    }
}

fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(parent, perms)?;
        }
    }
    Ok(())
}

fn setup_connection(conn: &Connection, opts: PoolOptions) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL; \
         PRAGMA journal_size_limit=32768; \
         PRAGMA cache_size=-{}; \
         PRAGMA mmap_size={}; \
         PRAGMA temp_store=MEMORY;",
        opts.cache_size_kb, opts.mmap_size
    ))
}

fn make_file_post_create_hook(path: PathBuf, opts: PoolOptions) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn, opts)?;

                #[cfg(unix)]
                if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600);
                    if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                        tracing::warn!("failed to set database file permissions to 0600: {}", e);
                    }
                }
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_in_memory_roundtrip() {
        let pool = DatabasePool::open_in_memory().await.expect("open");
        let id = pool
            .interact(|conn| {
                conn.execute(
                    "INSERT INTO projects (canonical_path, source_kind) VALUES (?, ?)",
                    rusqlite::params!["/test/path", "assistant-a"],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .expect("insert");
        assert!(id > 0);
    }

    #[tokio::test]
    async fn test_run_with_retry_succeeds_first_try() {
        let pool = DatabasePool::open_in_memory().await.expect("open");
        let result = pool
            .run_with_retry(|conn| {
                conn.execute(
                    "INSERT INTO projects (canonical_path, source_kind) VALUES (?, ?)",
                    rusqlite::params!["/retry/test", "assistant-a"],
                )?;
                Ok::<_, rusqlite::Error>(conn.last_insert_rowid())
            })
            .await
            .expect("should succeed");
        assert!(result > 0);
    }

    #[test]
    fn test_is_rusqlite_contention_busy() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        );
        assert!(is_rusqlite_contention(&err));
    }

    #[test]
    fn test_is_rusqlite_contention_other_error() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                extended_code: 19,
            },
            Some("UNIQUE constraint failed".to_string()),
        );
        assert!(!is_rusqlite_contention(&err));
    }
}
