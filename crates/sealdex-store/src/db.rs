//! SQLite connection wrapper with schema setup and bounded retry

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use sealdex_core::SearchError;
use tracing::{debug, info, warn};

/// Connection-level retry budget: attempts and initial backoff
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Thread-safe database handle (Arc<Mutex<Connection>>); blocking work is
/// pushed onto the tokio blocking pool via [`SearchDb::call`].
#[derive(Clone)]
pub struct SearchDb {
    conn: Arc<Mutex<Connection>>,
}

impl SearchDb {
    /// Open (or create) the database and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SearchError> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        info!("Opening search database at {:?}", path.as_ref());
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, SearchError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, SearchError> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                api_key_hash TEXT NOT NULL UNIQUE,
                scheme TEXT NOT NULL,
                poly_modulus_degree INTEGER NOT NULL,
                scale INTEGER NOT NULL,
                public_key BLOB NOT NULL,
                embedding_dim INTEGER NOT NULL,
                num_tables INTEGER NOT NULL,
                hash_size INTEGER NOT NULL,
                num_candidates INTEGER NOT NULL,
                planes BLOB NOT NULL,
                max_embeddings INTEGER NOT NULL,
                total_embeddings INTEGER NOT NULL DEFAULT 0,
                total_searches INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES clients(id),
                external_id TEXT,
                ciphertext BLOB NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                accessed_at TEXT,
                access_count INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT,
                UNIQUE(client_id, external_id)
            );

            CREATE TABLE IF NOT EXISTS embedding_metadata (
                embedding_id TEXT PRIMARY KEY REFERENCES embeddings(id) ON DELETE CASCADE,
                metadata TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lsh_postings (
                client_id TEXT NOT NULL,
                table_index INTEGER NOT NULL,
                hash_value INTEGER NOT NULL,
                embedding_id TEXT NOT NULL REFERENCES embeddings(id) ON DELETE CASCADE,
                PRIMARY KEY (client_id, table_index, hash_value, embedding_id)
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_client ON embeddings(client_id, is_deleted);
            CREATE INDEX IF NOT EXISTS idx_postings_embedding ON lsh_postings(embedding_id);",
        )
        .map_err(db_err)?;

        debug!("Database schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(conn: &Arc<Mutex<Connection>>) -> MutexGuard<'_, Connection> {
        conn.lock().unwrap_or_else(|poisoned| {
            warn!("Database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run a closure against the connection on the blocking pool.
    ///
    /// Connection-level failures (busy/locked) are retried up to
    /// [`MAX_ATTEMPTS`] times with exponential backoff; logical errors are
    /// returned as-is on the first attempt.
    pub async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, SearchError>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T, SearchError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_ATTEMPTS {
            let conn = Arc::clone(&self.conn);
            let f = Arc::clone(&f);
            let result = tokio::task::spawn_blocking(move || {
                let conn = Self::lock(&conn);
                f(&conn)
            })
            .await
            .map_err(|e| SearchError::Internal(format!("{op}: blocking task panicked: {e}")))?;

            match result {
                Err(SearchError::Transient(msg)) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        "{op}: transient database error (attempt {attempt}/{MAX_ATTEMPTS}): {msg}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(SearchError::Transient(msg)) => {
                    return Err(SearchError::Internal(format!(
                        "{op}: database busy after {MAX_ATTEMPTS} attempts: {msg}"
                    )));
                }
                other => return other,
            }
        }
        unreachable!("retry loop always returns")
    }

    /// Liveness probe for /health.
    pub async fn ping(&self) -> Result<(), SearchError> {
        self.call("ping", |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(())).map_err(db_err)
        })
        .await
    }
}

/// Classify a rusqlite error: busy/locked are transient (retried by
/// [`SearchDb::call`]), everything else is internal.
pub(crate) fn db_err(e: rusqlite::Error) -> SearchError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
            return SearchError::Transient(e.to_string());
        }
    }
    SearchError::Internal(e.to_string())
}

/// RFC 3339 timestamp, the storage format for all datetime columns.
pub(crate) fn now_str() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_ping() {
        let db = SearchDb::open_in_memory().unwrap();
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = SearchDb::open(dir.path().join("search.db")).unwrap();
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_logical_errors_not_retried() {
        let db = SearchDb::open_in_memory().unwrap();
        let err = db
            .call("boom", |_conn| {
                Err::<(), _>(SearchError::NotFound("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transient_surfaces_as_internal_after_retries() {
        let db = SearchDb::open_in_memory().unwrap();
        let err = db
            .call("busy", |_conn| {
                Err::<(), _>(SearchError::Transient("database is locked".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Internal(_)));
        assert_eq!(err.code(), "internal");
    }
}
