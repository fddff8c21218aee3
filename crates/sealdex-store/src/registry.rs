//! Client registry: provisioning, authentication, counters, plane cache

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rusqlite::{Connection, OptionalExtension, params};
use sealdex_core::types::{HeContext, LshConfig};
use sealdex_core::{ClientRecord, LshPlanes, SearchError};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{SearchDb, db_err, now_str};

/// SHA-256 hex digest of a bearer key; the only form a key is stored in.
pub fn hash_api_key(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Parameters for `initialize`
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: Option<String>,
    pub api_key: String,
    pub he: HeContext,
    pub embedding_dim: usize,
    pub lsh: LshConfig,
}

/// Outcome of `initialize`: the record, its plane bytes, and whether a new
/// client row was created.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub record: ClientRecord,
    pub planes: Vec<u8>,
    pub created: bool,
}

const CLIENT_COLS: &str = "id, name, api_key_hash, scheme, poly_modulus_degree, scale, \
     public_key, embedding_dim, num_tables, hash_size, num_candidates, max_embeddings, \
     total_embeddings, total_searches, created_at, last_active_at, is_active";

fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<ClientRecord> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ClientRecord {
        id,
        name: row.get(1)?,
        api_key_hash: row.get(2)?,
        he: HeContext {
            scheme: row.get(3)?,
            poly_modulus_degree: row.get::<_, i64>(4)? as u32,
            scale: row.get(5)?,
            public_key: row.get(6)?,
        },
        embedding_dim: row.get::<_, i64>(7)? as usize,
        lsh: LshConfig {
            num_tables: row.get::<_, i64>(8)? as u32,
            hash_size: row.get::<_, i64>(9)? as u32,
            num_candidates: row.get::<_, i64>(10)? as u32,
        },
        max_embeddings: row.get::<_, i64>(11)? as u64,
        total_embeddings: row.get::<_, i64>(12)? as u64,
        total_searches: row.get::<_, i64>(13)? as u64,
        created_at: row
            .get::<_, String>(14)?
            .parse()
            .unwrap_or_else(|_| chrono::Utc::now()),
        last_active_at: row
            .get::<_, String>(15)?
            .parse()
            .unwrap_or_else(|_| chrono::Utc::now()),
        is_active: row.get::<_, i64>(16)? != 0,
    })
}

fn client_by_key_hash(
    conn: &Connection,
    key_hash: &str,
) -> Result<Option<ClientRecord>, SearchError> {
    conn.query_row(
        &format!("SELECT {CLIENT_COLS} FROM clients WHERE api_key_hash = ?1"),
        params![key_hash],
        row_to_client,
    )
    .optional()
    .map_err(db_err)
}

fn client_by_id(conn: &Connection, id: Uuid) -> Result<Option<ClientRecord>, SearchError> {
    conn.query_row(
        &format!("SELECT {CLIENT_COLS} FROM clients WHERE id = ?1"),
        params![id.to_string()],
        row_to_client,
    )
    .optional()
    .map_err(db_err)
}

impl SearchDb {
    /// Provision a client for a bearer key, idempotently.
    ///
    /// Re-initialization with identical parameters returns the existing
    /// record and plane bytes. Changing the embedding dimension, LSH
    /// shape, or HE context fails with `ConfigConflict` once embeddings
    /// exist; with none stored the client is re-provisioned in place.
    pub async fn register_client(
        &self,
        req: ProvisionRequest,
        server_secret: String,
        default_max_embeddings: u64,
    ) -> Result<Provisioned, SearchError> {
        req.lsh.validate()?;
        req.he.validate()?;
        if req.embedding_dim == 0 {
            return Err(SearchError::InvalidRequest(
                "embedding_dim must be positive".into(),
            ));
        }

        self.call("register_client", move |conn| {
            let key_hash = hash_api_key(&req.api_key);

            if let Some(existing) = client_by_key_hash(conn, &key_hash)? {
                if !existing.is_active {
                    return Err(SearchError::Unauthenticated);
                }
                let unchanged = existing.embedding_dim == req.embedding_dim
                    && existing.lsh == req.lsh
                    && existing.he.same_shape(&req.he);
                if unchanged {
                    let planes: Vec<u8> = conn
                        .query_row(
                            "SELECT planes FROM clients WHERE id = ?1",
                            params![existing.id.to_string()],
                            |row| row.get(0),
                        )
                        .map_err(db_err)?;
                    debug!("Client {} re-initialized with identical parameters", existing.id);
                    return Ok(Provisioned {
                        record: existing,
                        planes,
                        created: false,
                    });
                }
                if existing.total_embeddings > 0 {
                    return Err(SearchError::ConfigConflict(format!(
                        "client {} already stores {} embeddings; embedding_dim, lsh_config, \
                         and HE context are immutable",
                        existing.id, existing.total_embeddings
                    )));
                }

                // No embeddings yet: nothing stored can go stale, re-provision in place
                let seed = LshPlanes::seed_for(existing.id, &server_secret);
                let planes = LshPlanes::generate(seed, &req.lsh, req.embedding_dim).to_bytes();
                conn.execute(
                    "UPDATE clients SET scheme = ?1, poly_modulus_degree = ?2, scale = ?3,
                        public_key = ?4, embedding_dim = ?5, num_tables = ?6, hash_size = ?7,
                        num_candidates = ?8, planes = ?9, last_active_at = ?10
                     WHERE id = ?11",
                    params![
                        req.he.scheme,
                        req.he.poly_modulus_degree as i64,
                        req.he.scale,
                        req.he.public_key,
                        req.embedding_dim as i64,
                        req.lsh.num_tables as i64,
                        req.lsh.hash_size as i64,
                        req.lsh.num_candidates as i64,
                        planes,
                        now_str(),
                        existing.id.to_string(),
                    ],
                )
                .map_err(db_err)?;
                info!("Client {} re-provisioned with new shape", existing.id);
                let record = client_by_id(conn, existing.id)?
                    .ok_or_else(|| SearchError::Internal("client vanished mid-update".into()))?;
                return Ok(Provisioned {
                    record,
                    planes,
                    created: false,
                });
            }

            let id = Uuid::new_v4();
            let seed = LshPlanes::seed_for(id, &server_secret);
            let planes = LshPlanes::generate(seed, &req.lsh, req.embedding_dim).to_bytes();
            let now = now_str();
            let name = req.name.clone().unwrap_or_else(|| format!("client-{id}"));

            conn.execute(
                "INSERT INTO clients (id, name, api_key_hash, scheme, poly_modulus_degree,
                    scale, public_key, embedding_dim, num_tables, hash_size, num_candidates,
                    planes, max_embeddings, total_embeddings, total_searches, created_at,
                    last_active_at, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, 0, ?14, ?15, 1)",
                params![
                    id.to_string(),
                    name,
                    key_hash,
                    req.he.scheme,
                    req.he.poly_modulus_degree as i64,
                    req.he.scale,
                    req.he.public_key,
                    req.embedding_dim as i64,
                    req.lsh.num_tables as i64,
                    req.lsh.hash_size as i64,
                    req.lsh.num_candidates as i64,
                    planes,
                    default_max_embeddings as i64,
                    now,
                    now,
                ],
            )
            .map_err(db_err)?;

            info!("Registered client {} (dim {})", id, req.embedding_dim);
            let record = client_by_id(conn, id)?
                .ok_or_else(|| SearchError::Internal("client vanished mid-insert".into()))?;
            Ok(Provisioned {
                record,
                planes,
                created: true,
            })
        })
        .await
    }

    /// Resolve a bearer key to its active client record.
    pub async fn authenticate(&self, api_key: &str) -> Result<ClientRecord, SearchError> {
        let key_hash = hash_api_key(api_key);
        self.call("authenticate", move |conn| {
            let record = client_by_key_hash(conn, &key_hash)?.ok_or(SearchError::Unauthenticated)?;
            if !record.is_active {
                return Err(SearchError::Unauthenticated);
            }
            Ok(record)
        })
        .await
    }

    pub async fn get_client(&self, id: Uuid) -> Result<ClientRecord, SearchError> {
        self.call("get_client", move |conn| {
            client_by_id(conn, id)?.ok_or_else(|| SearchError::NotFound(format!("client {id}")))
        })
        .await
    }

    /// Bump the search counter and last-active timestamp.
    pub async fn record_search(&self, id: Uuid) -> Result<(), SearchError> {
        self.call("record_search", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE clients SET total_searches = total_searches + 1,
                        last_active_at = ?1 WHERE id = ?2",
                    params![now_str(), id.to_string()],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(SearchError::NotFound(format!("client {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Deactivate a client. Searches and uploads start failing
    /// `Unauthenticated`; stored rows are untouched.
    pub async fn deactivate_client(&self, id: Uuid) -> Result<(), SearchError> {
        self.call("deactivate_client", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE clients SET is_active = 0, last_active_at = ?1 WHERE id = ?2",
                    params![now_str(), id.to_string()],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(SearchError::NotFound(format!("client {id}")));
            }
            info!("Deactivated client {}", id);
            Ok(())
        })
        .await
    }
}

/// In-process LRU over deserialized planes, keyed by client id.
/// Planes are immutable after initialize; the only invalidation path is
/// explicit deactivation.
pub struct PlaneCache {
    inner: Mutex<LruCache<Uuid, Arc<LshPlanes>>>,
}

impl PlaneCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<LshPlanes>> {
        let mut cache = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(&id).cloned()
    }

    pub fn put(&self, id: Uuid, planes: Arc<LshPlanes>) {
        let mut cache = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        cache.put(id, planes);
    }

    pub fn invalidate(&self, id: Uuid) {
        let mut cache = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        cache.pop(&id);
    }
}
