//! LSH posting index: candidate selection with match-count ranking

use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, params, params_from_iter};
use sealdex_core::SearchError;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{SearchDb, db_err};

/// Ranked candidate pool for one query
#[derive(Debug, Clone)]
pub struct CandidateSet {
    /// Candidate ids, match-count descending, capped at the request limit
    pub ids: Vec<Uuid>,
    /// Distinct live embeddings matching at least one bucket, before the cap
    pub found: usize,
    /// Buckets that blew past the fanout cap and were subsampled
    pub truncated_buckets: usize,
}

impl CandidateSet {
    fn empty() -> Self {
        Self {
            ids: Vec::new(),
            found: 0,
            truncated_buckets: 0,
        }
    }
}

impl SearchDb {
    /// Select up to `limit` candidates for a query hash vector.
    ///
    /// An embedding qualifies when at least one of its postings matches a
    /// `(table_index, hash_value)` pair of the query. Ranking is match
    /// count descending, then most recent `created_at`, then embedding id.
    ///
    /// Any single bucket larger than `max_bucket_fanout` contributes at
    /// most that many embeddings, chosen by a deterministic subsample
    /// keyed on the SHA-256 of the embedding id, and the truncation is
    /// reported on the returned set.
    pub async fn lsh_candidates(
        &self,
        client_id: Uuid,
        hashes: Vec<u32>,
        limit: usize,
        max_bucket_fanout: usize,
    ) -> Result<CandidateSet, SearchError> {
        if hashes.is_empty() || limit == 0 {
            return Ok(CandidateSet::empty());
        }

        self.call("lsh_candidates", move |conn| {
            let client_key = client_id.to_string();

            // Bucket-size precheck so a pathological bucket never gets
            // loaded unbounded.
            let mut oversized = 0usize;
            let mut bucket_sizes = Vec::with_capacity(hashes.len());
            {
                let mut stmt = conn
                    .prepare(
                        "SELECT COUNT(*) FROM lsh_postings
                         WHERE client_id = ?1 AND table_index = ?2 AND hash_value = ?3",
                    )
                    .map_err(db_err)?;
                for (table_index, hash) in hashes.iter().enumerate() {
                    let size: i64 = stmt
                        .query_row(
                            params![client_key, table_index as i64, *hash as i64],
                            |row| row.get(0),
                        )
                        .map_err(db_err)?;
                    if size as usize > max_bucket_fanout {
                        oversized += 1;
                    }
                    bucket_sizes.push(size as usize);
                }
            }

            if oversized == 0 {
                return candidates_sql(conn, &client_key, &hashes, limit);
            }

            warn!(
                "Client {} query hit {} oversized LSH buckets (fanout cap {})",
                client_id, oversized, max_bucket_fanout
            );
            candidates_subsampled(conn, &client_key, &hashes, &bucket_sizes, limit, max_bucket_fanout)
                .map(|mut set| {
                    set.truncated_buckets = oversized;
                    set
                })
        })
        .await
    }
}

/// Fast path: the whole selection as one grouped join.
fn candidates_sql(
    conn: &rusqlite::Connection,
    client_key: &str,
    hashes: &[u32],
    limit: usize,
) -> Result<CandidateSet, SearchError> {
    let placeholders = vec!["(?, ?)"; hashes.len()].join(", ");
    let mut pair_params: Vec<SqlValue> = Vec::with_capacity(hashes.len() * 2 + 2);
    for (table_index, hash) in hashes.iter().enumerate() {
        pair_params.push(SqlValue::Integer(table_index as i64));
        pair_params.push(SqlValue::Integer(*hash as i64));
    }

    let found: i64 = {
        let sql = format!(
            "WITH q(table_index, hash_value) AS (VALUES {placeholders})
             SELECT COUNT(DISTINCT p.embedding_id)
             FROM lsh_postings p
             JOIN q ON q.table_index = p.table_index AND q.hash_value = p.hash_value
             JOIN embeddings e ON e.id = p.embedding_id
             WHERE p.client_id = ? AND e.is_deleted = 0"
        );
        let mut all = pair_params.clone();
        all.push(SqlValue::Text(client_key.to_string()));
        conn.query_row(&sql, params_from_iter(all), |row| row.get(0))
            .map_err(db_err)?
    };

    let sql = format!(
        "WITH q(table_index, hash_value) AS (VALUES {placeholders})
         SELECT p.embedding_id
         FROM lsh_postings p
         JOIN q ON q.table_index = p.table_index AND q.hash_value = p.hash_value
         JOIN embeddings e ON e.id = p.embedding_id
         WHERE p.client_id = ? AND e.is_deleted = 0
         GROUP BY p.embedding_id
         ORDER BY COUNT(*) DESC, e.created_at DESC, p.embedding_id ASC
         LIMIT ?"
    );
    let mut all = pair_params;
    all.push(SqlValue::Text(client_key.to_string()));
    all.push(SqlValue::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let ids = stmt
        .query_map(params_from_iter(all), |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err)?
        .into_iter()
        .filter_map(|s| Uuid::parse_str(&s).ok())
        .collect::<Vec<_>>();

    debug!("LSH filter matched {} candidates ({} returned)", found, ids.len());
    Ok(CandidateSet {
        ids,
        found: found as usize,
        truncated_buckets: 0,
    })
}

/// Slow path: per-bucket loads with deterministic subsampling of any
/// bucket over the fanout cap, match counts re-aggregated in memory.
fn candidates_subsampled(
    conn: &rusqlite::Connection,
    client_key: &str,
    hashes: &[u32],
    bucket_sizes: &[usize],
    limit: usize,
    max_bucket_fanout: usize,
) -> Result<CandidateSet, SearchError> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT embedding_id FROM lsh_postings
                 WHERE client_id = ?1 AND table_index = ?2 AND hash_value = ?3",
            )
            .map_err(db_err)?;
        for (table_index, hash) in hashes.iter().enumerate() {
            let mut bucket: Vec<String> = stmt
                .query_map(
                    params![client_key, table_index as i64, *hash as i64],
                    |row| row.get(0),
                )
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;

            if bucket_sizes[table_index] > max_bucket_fanout {
                bucket.sort_by_cached_key(|id| Sha256::digest(id.as_bytes()).to_vec());
                bucket.truncate(max_bucket_fanout);
            }
            for id in bucket {
                *counts.entry(id).or_insert(0) += 1;
            }
        }
    }

    // Drop soft-deleted rows, attach recency for the tie-break
    let mut ranked: Vec<(String, usize, String)> = Vec::with_capacity(counts.len());
    {
        let mut stmt = conn
            .prepare("SELECT created_at FROM embeddings WHERE id = ?1 AND is_deleted = 0")
            .map_err(db_err)?;
        for (id, count) in counts {
            let created: Option<String> = stmt
                .query_row(params![id], |row| row.get(0))
                .optional()
                .map_err(db_err)?;
            if let Some(created_at) = created {
                ranked.push((id, count, created_at));
            }
        }
    }

    let found = ranked.len();
    ranked.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then_with(|| b.2.cmp(&a.2))
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked.truncate(limit);

    Ok(CandidateSet {
        ids: ranked
            .into_iter()
            .filter_map(|(id, _, _)| Uuid::parse_str(&id).ok())
            .collect(),
        found,
        truncated_buckets: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProvisionRequest;
    use sealdex_core::types::{HeContext, LshConfig};

    async fn db_with_client(num_tables: u32) -> (SearchDb, Uuid) {
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
                    embedding_dim: 4,
                    lsh: LshConfig {
                        num_tables,
                        hash_size: 8,
                        num_candidates: 100,
                    },
                },
                "secret".into(),
                100_000,
            )
            .await
            .unwrap();
        (db, p.record.id)
    }

    #[tokio::test]
    async fn test_match_count_ranking() {
        let (db, client) = db_with_client(3).await;
        // a matches all three query buckets, b two, c one, d none
        let a = db
            .insert_embedding(client, vec![0], vec![1, 2, 3], None, None)
            .await
            .unwrap();
        let b = db
            .insert_embedding(client, vec![0], vec![1, 2, 99], None, None)
            .await
            .unwrap();
        let c = db
            .insert_embedding(client, vec![0], vec![1, 98, 99], None, None)
            .await
            .unwrap();
        let _d = db
            .insert_embedding(client, vec![0], vec![97, 98, 99], None, None)
            .await
            .unwrap();

        let set = db
            .lsh_candidates(client, vec![1, 2, 3], 10, 1000)
            .await
            .unwrap();
        assert_eq!(set.ids, vec![a, b, c]);
        assert_eq!(set.found, 3);
        assert_eq!(set.truncated_buckets, 0);
    }

    #[tokio::test]
    async fn test_limit_caps_results_but_not_found() {
        let (db, client) = db_with_client(1).await;
        for _ in 0..10 {
            db.insert_embedding(client, vec![0], vec![42], None, None)
                .await
                .unwrap();
        }
        let set = db.lsh_candidates(client, vec![42], 4, 1000).await.unwrap();
        assert_eq!(set.ids.len(), 4);
        assert_eq!(set.found, 10);
    }

    #[tokio::test]
    async fn test_soft_deleted_never_surface() {
        let (db, client) = db_with_client(1).await;
        let a = db
            .insert_embedding(client, vec![0], vec![7], None, None)
            .await
            .unwrap();
        let b = db
            .insert_embedding(client, vec![0], vec![7], None, None)
            .await
            .unwrap();
        db.soft_delete(client, a).await.unwrap();

        let set = db.lsh_candidates(client, vec![7], 10, 1000).await.unwrap();
        assert_eq!(set.ids, vec![b]);
        assert_eq!(set.found, 1);
    }

    #[tokio::test]
    async fn test_recency_breaks_ties() {
        let (db, client) = db_with_client(1).await;
        let older = db
            .insert_embedding(client, vec![0], vec![5], None, None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let newer = db
            .insert_embedding(client, vec![0], vec![5], None, None)
            .await
            .unwrap();

        let set = db.lsh_candidates(client, vec![5], 10, 1000).await.unwrap();
        assert_eq!(set.ids, vec![newer, older]);
    }

    #[tokio::test]
    async fn test_no_match_is_empty_not_error() {
        let (db, client) = db_with_client(2).await;
        db.insert_embedding(client, vec![0], vec![1, 2], None, None)
            .await
            .unwrap();
        let set = db
            .lsh_candidates(client, vec![50, 60], 10, 1000)
            .await
            .unwrap();
        assert!(set.ids.is_empty());
        assert_eq!(set.found, 0);
    }

    #[tokio::test]
    async fn test_fanout_cap_subsamples_deterministically() {
        let (db, client) = db_with_client(1).await;
        for _ in 0..20 {
            db.insert_embedding(client, vec![0], vec![9], None, None)
                .await
                .unwrap();
        }

        let set = db.lsh_candidates(client, vec![9], 50, 8).await.unwrap();
        assert_eq!(set.ids.len(), 8);
        assert_eq!(set.found, 8);
        assert_eq!(set.truncated_buckets, 1);

        // deterministic: same query, same subsample
        let again = db.lsh_candidates(client, vec![9], 50, 8).await.unwrap();
        assert_eq!(set.ids, again.ids);
    }

    #[tokio::test]
    async fn test_cross_client_isolation() {
        let (db, client_a) = db_with_client(1).await;
        let p = db
            .register_client(
                ProvisionRequest {
                    name: None,
                    api_key: "other-key".into(),
                    he: HeContext {
                        scheme: "mock".into(),
                        poly_modulus_degree: 4096,
                        scale: 1 << 30,
                        public_key: vec![],
                    },
                    embedding_dim: 4,
                    lsh: LshConfig {
                        num_tables: 1,
                        hash_size: 8,
                        num_candidates: 100,
                    },
                },
                "secret".into(),
                100,
            )
            .await
            .unwrap();
        let client_b = p.record.id;

        let a = db
            .insert_embedding(client_a, vec![0], vec![3], None, None)
            .await
            .unwrap();
        let b = db
            .insert_embedding(client_b, vec![0], vec![3], None, None)
            .await
            .unwrap();

        let set_a = db.lsh_candidates(client_a, vec![3], 10, 1000).await.unwrap();
        let set_b = db.lsh_candidates(client_b, vec![3], 10, 1000).await.unwrap();
        assert_eq!(set_a.ids, vec![a]);
        assert_eq!(set_b.ids, vec![b]);
    }
}
