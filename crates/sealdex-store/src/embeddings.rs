//! Ciphertext storage: transactional insert, ordered bulk fetch, soft
//! delete, and retention purge

use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, params};
use sealdex_core::SearchError;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{SearchDb, db_err, now_str};

/// SQLITE_CONSTRAINT_UNIQUE
const CONSTRAINT_UNIQUE: i32 = 2067;

/// One stored ciphertext with its metadata, as returned by `fetch_embeddings`
#[derive(Debug, Clone)]
pub struct FetchedEmbedding {
    pub id: Uuid,
    pub ciphertext: Vec<u8>,
    pub metadata: Option<Value>,
}

impl SearchDb {
    /// Store an encrypted embedding.
    ///
    /// The embedding row, its metadata, and exactly `num_tables` posting
    /// rows commit in one transaction; a failure at any point leaves no
    /// partial write. Fails with `DuplicateExternalId` on a
    /// `(client_id, external_id)` collision and `QuotaExceeded` once the
    /// client's embedding budget is spent.
    pub async fn insert_embedding(
        &self,
        client_id: Uuid,
        ciphertext: Vec<u8>,
        hashes: Vec<u32>,
        metadata: Option<Value>,
        external_id: Option<String>,
    ) -> Result<Uuid, SearchError> {
        self.call("insert_embedding", move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;

            let client: Option<(i64, i64, i64, i64)> = tx
                .query_row(
                    "SELECT num_tables, total_embeddings, max_embeddings, is_active
                     FROM clients WHERE id = ?1",
                    params![client_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(db_err)?;
            let (num_tables, total, max, active) =
                client.ok_or_else(|| SearchError::NotFound(format!("client {client_id}")))?;

            if active == 0 {
                return Err(SearchError::Unauthenticated);
            }
            if hashes.len() != num_tables as usize {
                return Err(SearchError::InvalidRequest(format!(
                    "expected {num_tables} lsh hashes, got {}",
                    hashes.len()
                )));
            }
            if total >= max {
                return Err(SearchError::QuotaExceeded(max as u64));
            }

            let id = Uuid::new_v4();
            let now = now_str();
            tx.execute(
                "INSERT INTO embeddings (id, client_id, external_id, ciphertext, size_bytes,
                    created_at, access_count, is_deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)",
                params![
                    id.to_string(),
                    client_id.to_string(),
                    external_id,
                    ciphertext,
                    ciphertext.len() as i64,
                    now,
                ],
            )
            .map_err(|e| match (&e, &external_id) {
                (rusqlite::Error::SqliteFailure(err, _), Some(ext))
                    if err.extended_code == CONSTRAINT_UNIQUE =>
                {
                    SearchError::DuplicateExternalId(ext.clone())
                }
                _ => db_err(e),
            })?;

            if let Some(meta) = &metadata {
                let meta_json = serde_json::to_string(meta)
                    .map_err(|e| SearchError::InvalidRequest(format!("bad metadata: {e}")))?;
                tx.execute(
                    "INSERT INTO embedding_metadata (embedding_id, metadata) VALUES (?1, ?2)",
                    params![id.to_string(), meta_json],
                )
                .map_err(db_err)?;
            }

            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO lsh_postings (client_id, table_index, hash_value, embedding_id)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(db_err)?;
                for (table_index, hash) in hashes.iter().enumerate() {
                    stmt.execute(params![
                        client_id.to_string(),
                        table_index as i64,
                        *hash as i64,
                        id.to_string(),
                    ])
                    .map_err(db_err)?;
                }
            }

            tx.execute(
                "UPDATE clients SET total_embeddings = total_embeddings + 1,
                    last_active_at = ?1 WHERE id = ?2",
                params![now, client_id.to_string()],
            )
            .map_err(db_err)?;

            tx.commit().map_err(db_err)?;
            debug!("Stored embedding {} for client {}", id, client_id);
            Ok(id)
        })
        .await
    }

    /// Fetch ciphertexts and metadata for the given ids, in request order.
    /// Soft-deleted and foreign rows are silently skipped; access counters
    /// are bumped for every row returned.
    pub async fn fetch_embeddings(
        &self,
        client_id: Uuid,
        ids: Vec<Uuid>,
    ) -> Result<Vec<FetchedEmbedding>, SearchError> {
        self.call("fetch_embeddings", move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let mut out = Vec::with_capacity(ids.len());
            {
                let mut select = tx
                    .prepare(
                        "SELECT e.ciphertext, m.metadata
                         FROM embeddings e
                         LEFT JOIN embedding_metadata m ON m.embedding_id = e.id
                         WHERE e.id = ?1 AND e.client_id = ?2 AND e.is_deleted = 0",
                    )
                    .map_err(db_err)?;
                let mut touch = tx
                    .prepare(
                        "UPDATE embeddings SET access_count = access_count + 1,
                            accessed_at = ?1 WHERE id = ?2",
                    )
                    .map_err(db_err)?;
                let now = now_str();

                for id in &ids {
                    let row: Option<(Vec<u8>, Option<String>)> = select
                        .query_row(params![id.to_string(), client_id.to_string()], |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })
                        .optional()
                        .map_err(db_err)?;
                    let Some((ciphertext, meta_json)) = row else {
                        continue;
                    };
                    let metadata = match meta_json {
                        Some(s) => Some(serde_json::from_str(&s).map_err(|e| {
                            SearchError::Internal(format!("stored metadata unparsable: {e}"))
                        })?),
                        None => None,
                    };
                    touch
                        .execute(params![now, id.to_string()])
                        .map_err(db_err)?;
                    out.push(FetchedEmbedding {
                        id: *id,
                        ciphertext,
                        metadata,
                    });
                }
            }
            tx.commit().map_err(db_err)?;
            Ok(out)
        })
        .await
    }

    /// Hide an embedding from every future candidate pool.
    pub async fn soft_delete(&self, client_id: Uuid, id: Uuid) -> Result<(), SearchError> {
        self.call("soft_delete", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE embeddings SET is_deleted = 1, deleted_at = ?1
                     WHERE id = ?2 AND client_id = ?3 AND is_deleted = 0",
                    params![now_str(), id.to_string(), client_id.to_string()],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(SearchError::NotFound(format!("embedding {id}")));
            }
            debug!("Soft-deleted embedding {} for client {}", id, client_id);
            Ok(())
        })
        .await
    }

    /// Physically remove soft-deleted embeddings past the retention
    /// horizon. Postings and metadata cascade. Returns the number purged.
    pub async fn purge_deleted(&self, retention_days: u32) -> Result<usize, SearchError> {
        self.call("purge_deleted", move |conn| {
            let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
            let purged = conn
                .execute(
                    "DELETE FROM embeddings WHERE is_deleted = 1 AND deleted_at < ?1",
                    params![cutoff],
                )
                .map_err(db_err)?;
            if purged > 0 {
                info!("Purged {} soft-deleted embeddings", purged);
            }
            Ok(purged)
        })
        .await
    }

    /// Posting rows for a client; test and maintenance visibility.
    pub async fn posting_count(&self, client_id: Uuid) -> Result<usize, SearchError> {
        self.call("posting_count", move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM lsh_postings WHERE client_id = ?1",
                params![client_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(db_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProvisionRequest;
    use sealdex_core::types::{HeContext, LshConfig};

    async fn provisioned_db() -> (SearchDb, Uuid) {
        let db = SearchDb::open_in_memory().unwrap();
        let p = db
            .register_client(
                ProvisionRequest {
                    name: None,
                    api_key: "key".into(),
                    he: HeContext {
                        scheme: "mock".into(),
                        poly_modulus_degree: 4096,
                        scale: 1 << 30,
                        public_key: vec![],
                    },
                    embedding_dim: 8,
                    lsh: LshConfig {
                        num_tables: 3,
                        hash_size: 8,
                        num_candidates: 10,
                    },
                },
                "secret".into(),
                5,
            )
            .await
            .unwrap();
        (db, p.record.id)
    }

    #[tokio::test]
    async fn test_insert_writes_postings_atomically() {
        let (db, client) = provisioned_db().await;
        let id = db
            .insert_embedding(
                client,
                vec![1, 2, 3],
                vec![10, 20, 30],
                Some(serde_json::json!({"category": "tech"})),
                None,
            )
            .await
            .unwrap();

        assert_eq!(db.posting_count(client).await.unwrap(), 3);
        let fetched = db.fetch_embeddings(client, vec![id]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].ciphertext, vec![1, 2, 3]);
        assert_eq!(fetched[0].metadata.as_ref().unwrap()["category"], "tech");

        let record = db.get_client(client).await.unwrap();
        assert_eq!(record.total_embeddings, 1);
    }

    #[tokio::test]
    async fn test_wrong_hash_count_rejected() {
        let (db, client) = provisioned_db().await;
        let err = db
            .insert_embedding(client, vec![1], vec![10, 20], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::InvalidRequest(_)));
        // nothing half-written
        assert_eq!(db.posting_count(client).await.unwrap(), 0);
        assert_eq!(db.get_client(client).await.unwrap().total_embeddings, 0);
    }

    #[tokio::test]
    async fn test_duplicate_external_id() {
        let (db, client) = provisioned_db().await;
        db.insert_embedding(client, vec![1], vec![1, 2, 3], None, Some("doc-1".into()))
            .await
            .unwrap();
        let err = db
            .insert_embedding(client, vec![2], vec![4, 5, 6], None, Some("doc-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::DuplicateExternalId(s) if s == "doc-1"));
        // failed insert leaves no postings behind
        assert_eq!(db.posting_count(client).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let (db, client) = provisioned_db().await;
        for i in 0..5 {
            db.insert_embedding(client, vec![i], vec![1, 2, 3], None, None)
                .await
                .unwrap();
        }
        let err = db
            .insert_embedding(client, vec![9], vec![1, 2, 3], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::QuotaExceeded(5)));
    }

    #[tokio::test]
    async fn test_fetch_preserves_request_order_and_skips_deleted() {
        let (db, client) = provisioned_db().await;
        let a = db
            .insert_embedding(client, vec![1], vec![1, 2, 3], None, None)
            .await
            .unwrap();
        let b = db
            .insert_embedding(client, vec![2], vec![1, 2, 3], None, None)
            .await
            .unwrap();
        let c = db
            .insert_embedding(client, vec![3], vec![1, 2, 3], None, None)
            .await
            .unwrap();

        db.soft_delete(client, b).await.unwrap();

        let fetched = db.fetch_embeddings(client, vec![c, b, a]).await.unwrap();
        let ids: Vec<Uuid> = fetched.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![c, a]);
    }

    #[tokio::test]
    async fn test_soft_delete_twice_is_not_found() {
        let (db, client) = provisioned_db().await;
        let id = db
            .insert_embedding(client, vec![1], vec![1, 2, 3], None, None)
            .await
            .unwrap();
        db.soft_delete(client, id).await.unwrap();
        assert!(matches!(
            db.soft_delete(client, id).await.unwrap_err(),
            SearchError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_purge_removes_old_soft_deleted() {
        let (db, client) = provisioned_db().await;
        let id = db
            .insert_embedding(client, vec![1], vec![1, 2, 3], None, None)
            .await
            .unwrap();
        db.soft_delete(client, id).await.unwrap();

        // retention 0 days: anything deleted before "now" goes
        let purged = db.purge_deleted(0).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(db.posting_count(client).await.unwrap(), 0);
        assert!(db.fetch_embeddings(client, vec![id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ciphertext_roundtrips_unchanged() {
        let (db, client) = provisioned_db().await;
        let blob: Vec<u8> = (0..=255).collect();
        let id = db
            .insert_embedding(client, blob.clone(), vec![1, 2, 3], None, None)
            .await
            .unwrap();
        let fetched = db.fetch_embeddings(client, vec![id]).await.unwrap();
        assert_eq!(fetched[0].ciphertext, blob);
    }
}
