// src/db/pool.rs
// Async connection pool using deadpool-sqlite
//
// # Async Database Access Patterns
//
// All SQLite work runs inside `pool.interact()` closures on the blocking
// thread pool, so the async runtime is never blocked by a query. Closures
// receive `&Connection` and should call the `*_sync` functions defined by
// each store module.
//
// Use `interact_with_retry()` for critical writes: it retries on
// SQLITE_BUSY/SQLITE_LOCKED with bounded backoff (100ms, 500ms, 2s). Reads
// use plain `interact()` and surface contention immediately.
//
// In-memory pools use a shared-cache URI so every pooled connection sees
// the same database; without it each connection would get its own empty
// in-memory store.

use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Which store schema to install on a fresh pool.
#[derive(Debug, Clone, Copy)]
pub enum StoreKind {
    Working,
    Knowledge,
}

/// Whether to use a file path or shared in-memory URI.
enum DbStorage {
    File(PathBuf),
    InMemory { label: &'static str },
}

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
///
/// SQLITE_BUSY ("database is locked") occurs with file-based databases under
/// write contention. SQLITE_LOCKED ("database table is locked") occurs with
/// shared-cache in-memory databases when another connection holds a write
/// lock on the same table.
fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
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

/// Check if an anyhow::Error chain contains a SQLite contention error.
fn is_sqlite_contention(err: &anyhow::Error) -> bool {
    if let Some(rusqlite_err) = err.downcast_ref::<rusqlite::Error>() {
        return is_rusqlite_contention(rusqlite_err);
    }
    false
}

/// Retry delays for SQLite contention backoff (100ms, 500ms, 2s).
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

/// Generic retry-with-backoff for async operations that may encounter
/// SQLite contention. Calls `op` up to `RETRY_DELAYS.len() + 1` times,
/// sleeping between retries when `is_retryable` returns true.
async fn retry_with_backoff<F, Fut, R, E>(
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
) -> std::result::Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<R, E>>,
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

    // Final attempt (no retry after this)
    op().await
}

/// Database pool wrapper with per-connection setup and per-store schema.
///
/// One pool per store: the working store and the knowledge store open
/// separate databases, so a write transaction on one never blocks the other.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
}

impl DatabasePool {
    /// Open a pooled database at the given path and run its store's
    /// migrations.
    pub async fn open(path: &Path, kind: StoreKind) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf()), kind).await
    }

    /// Open a pooled in-memory database (for tests).
    ///
    /// Uses a shared cache URI so all pooled connections access the same
    /// in-memory database.
    pub async fn open_in_memory(kind: StoreKind) -> Result<Self> {
        let label = match kind {
            StoreKind::Working => "memdb_working",
            StoreKind::Knowledge => "memdb_knowledge",
        };
        Self::open_internal(DbStorage::InMemory { label }, kind).await
    }

    /// Internal constructor shared by both open variants.
    ///
    /// 1. Creates the pool with appropriate hooks (file permissions or
    ///    in-memory setup)
    /// 2. Runs the store's schema migrations on a dedicated connection
    async fn open_internal(storage: DbStorage, kind: StoreKind) -> Result<Self> {
        let (conn_str, path, hook) = match storage {
            DbStorage::File(p) => {
                ensure_parent_directory(&p)?;
                let s = p.to_string_lossy().into_owned();
                let hook = make_file_post_create_hook(p.clone());
                (s, Some(p), hook)
            }
            DbStorage::InMemory { label } => {
                let uri = format!(
                    "file:{}_{:?}?mode=memory&cache=shared",
                    label,
                    uuid::Uuid::new_v4()
                );
                (uri, None, make_memory_post_create_hook())
            }
        };

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("Failed to build connection pool")?;

        let db_pool = Self { pool, path };

        // Backup before migrations (file-based DBs only)
        if let Some(ref db_path) = db_pool.path {
            if let Err(e) = Self::backup_before_migration(db_path) {
                tracing::warn!("Pre-migration backup failed (continuing anyway): {}", e);
            }
        }

        db_pool
            .interact(move |conn| {
                match kind {
                    StoreKind::Working => super::schema::run_working_migrations(conn)?,
                    StoreKind::Knowledge => super::schema::run_knowledge_migrations(conn)?,
                }
                if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                    tracing::debug!("PRAGMA optimize skipped: {}", e);
                }
                Ok(())
            })
            .await?;

        Ok(db_pool)
    }

    /// Run a closure with a connection from the pool.
    ///
    /// This is the primary API for database access. The closure runs on a
    /// blocking thread pool, so it won't block the async runtime.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;

        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Run a closure that may return a rusqlite::Error.
    pub async fn interact_raw<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.interact(move |conn| f(conn).map_err(Into::into)).await
    }

    /// Run a closure with retry on SQLite contention errors.
    ///
    /// Uses bounded backoff (100ms, 500ms, 2000ms) for up to 3 retries.
    /// Use this for critical writes that must not be lost (turn capture,
    /// pattern upserts, housekeeping runs). The closure must be `Clone` to
    /// support retries.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        retry_with_backoff(
            || {
                let f_clone = f.clone();
                self.interact(f_clone)
            },
            |e: &anyhow::Error| is_sqlite_contention(e),
        )
        .await
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Create a backup of the database before running migrations.
    /// Uses SQLite's VACUUM INTO for an atomic, consistent backup.
    /// Keeps at most one backup per database (overwrites previous).
    fn backup_before_migration(path: &Path) -> Result<()> {
        use std::fs;

        let backup_path = path.with_extension("db.pre-migration");

        // Only backup if the source DB file exists (not first run)
        if !path.exists() {
            return Ok(());
        }

        // Open a direct connection for the backup (pool isn't ready yet)
        let conn = rusqlite::Connection::open(path).context("Failed to open DB for backup")?;

        // Remove old backup if it exists (VACUUM INTO fails if target exists)
        let _ = fs::remove_file(&backup_path);

        conn.execute("VACUUM INTO ?1", [backup_path.to_string_lossy().as_ref()])
            .context("Failed to create pre-migration backup")?;

        tracing::info!("Created pre-migration backup: {}", backup_path.display());
        Ok(())
    }
}

/// Ensure parent directory exists with secure permissions (0o700 on Unix).
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700); // rwx------
            std::fs::set_permissions(parent, perms)?;
        }
        #[cfg(not(unix))]
        tracing::debug!(
            "Skipping directory permission restriction on non-Unix platform: {}",
            parent.display()
        );
    }
    Ok(())
}

/// Create a post_create hook for file-based databases.
///
/// Sets up PRAGMAs via `setup_connection` and restricts file permissions to
/// 0o600.
fn make_file_post_create_hook(path: PathBuf) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn)?;

                #[cfg(unix)]
                if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600); // rw-------
                    if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                        tracing::warn!("Failed to set database file permissions to 0600: {}", e);
                    }
                }
                #[cfg(not(unix))]
                tracing::debug!(
                    "Skipping DB file permission restriction on non-Unix platform: {}",
                    path_for_perms.display()
                );

                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Create a post_create hook for in-memory databases.
///
/// Enables foreign keys and busy_timeout (WAL mode is not applicable to
/// in-memory DBs).
fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys=ON; \
                     PRAGMA busy_timeout=5000;",
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Configure a connection after it's created.
/// Called from the post_create hook.
fn setup_connection(conn: &Connection) -> rusqlite::Result<()> {
    // WAL for concurrent readers, foreign key enforcement, busy timeout for
    // write contention (5s retry window), NORMAL synchronous (safe with WAL).
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL; \
         PRAGMA journal_size_limit=32768;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_in_memory() {
        let pool = DatabasePool::open_in_memory(StoreKind::Working)
            .await
            .expect("Failed to open in-memory pool");

        pool.interact(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, status) VALUES (?, 'open')",
                rusqlite::params!["c-1"],
            )?;
            Ok(())
        })
        .await
        .expect("Failed to insert");

        // Verify from another connection in the pool (tests shared cache)
        let status: String = pool
            .interact(|conn| {
                conn.query_row(
                    "SELECT status FROM conversations WHERE id = 'c-1'",
                    [],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .await
            .expect("Failed to query");

        assert_eq!(status, "open");
    }

    #[tokio::test]
    async fn test_concurrent_writes_with_retry() {
        let pool = std::sync::Arc::new(
            DatabasePool::open_in_memory(StoreKind::Knowledge)
                .await
                .expect("Failed to open pool"),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.interact_with_retry(move |conn| {
                    conn.execute(
                        "INSERT INTO patterns (id, signature, category) VALUES (?, ?, 'test')",
                        rusqlite::params![format!("p-{i}"), format!("signature {i}")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().expect("Concurrent write failed");
        }

        let count: i64 = pool
            .interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM patterns", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .expect("Count failed");

        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_retry_non_busy_error_fails_fast() {
        let pool = DatabasePool::open_in_memory(StoreKind::Working)
            .await
            .expect("Failed to open pool");

        let result = pool
            .interact_with_retry(|conn| {
                conn.execute("INSERT INTO nonexistent_table VALUES (1)", [])?;
                Ok(())
            })
            .await;

        assert!(result.is_err());
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

    #[test]
    fn test_backup_before_migration() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = dir.path().join("test.db");

        {
            let conn = rusqlite::Connection::open(&db_path).expect("Failed to create test DB");
            conn.execute_batch(
                "CREATE TABLE test_table (id INTEGER PRIMARY KEY, value TEXT);
                 INSERT INTO test_table (value) VALUES ('hello');",
            )
            .expect("Failed to populate test DB");
        }

        DatabasePool::backup_before_migration(&db_path).expect("Backup should succeed");

        let backup_path = db_path.with_extension("db.pre-migration");
        assert!(backup_path.exists(), "Backup file should exist");

        let conn =
            rusqlite::Connection::open(&backup_path).expect("Backup should be a valid SQLite DB");
        let value: String = conn
            .query_row("SELECT value FROM test_table WHERE id = 1", [], |row| {
                row.get(0)
            })
            .expect("Should be able to read from backup");
        assert_eq!(value, "hello");
    }
}
