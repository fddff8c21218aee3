//! Client records and configuration shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SearchError;

/// Polynomial modulus degrees the CKKS-style context descriptor accepts
pub const VALID_POLY_DEGREES: [u32; 4] = [4096, 8192, 16384, 32768];

/// Bounds on the LSH table count
pub const MIN_TABLES: u32 = 1;
pub const MAX_TABLES: u32 = 50;

/// Bounds on bits per hash
pub const MIN_HASH_SIZE: u32 = 8;
pub const MAX_HASH_SIZE: u32 = 32;

/// Per-client LSH shape: `num_tables` tables of `hash_size`-bit hashes,
/// candidate pool capped at `num_candidates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LshConfig {
    pub num_tables: u32,
    pub hash_size: u32,
    pub num_candidates: u32,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            num_tables: 20,
            hash_size: 16,
            num_candidates: 100,
        }
    }
}

impl LshConfig {
    pub fn validate(&self) -> Result<(), SearchError> {
        if !(MIN_TABLES..=MAX_TABLES).contains(&self.num_tables) {
            return Err(SearchError::InvalidRequest(format!(
                "num_tables must be in [{MIN_TABLES}, {MAX_TABLES}], got {}",
                self.num_tables
            )));
        }
        if !(MIN_HASH_SIZE..=MAX_HASH_SIZE).contains(&self.hash_size) {
            return Err(SearchError::InvalidRequest(format!(
                "hash_size must be in [{MIN_HASH_SIZE}, {MAX_HASH_SIZE}], got {}",
                self.hash_size
            )));
        }
        if self.num_candidates == 0 {
            return Err(SearchError::InvalidRequest(
                "num_candidates must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// HE context descriptor stored per client. The public key is opaque to the
/// server; only the scheme tag routes to a codec implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeContext {
    pub scheme: String,
    pub poly_modulus_degree: u32,
    pub scale: i64,
    pub public_key: Vec<u8>,
}

impl HeContext {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.scheme.trim().is_empty() {
            return Err(SearchError::InvalidRequest("scheme must not be empty".into()));
        }
        if !VALID_POLY_DEGREES.contains(&self.poly_modulus_degree) {
            return Err(SearchError::InvalidRequest(format!(
                "poly_modulus_degree must be one of {VALID_POLY_DEGREES:?}, got {}",
                self.poly_modulus_degree
            )));
        }
        if self.scale <= 0 {
            return Err(SearchError::InvalidRequest("scale must be positive".into()));
        }
        Ok(())
    }

    /// True when the parameters that shape stored ciphertexts agree.
    /// The public key is deliberately excluded; it carries no shape.
    pub fn same_shape(&self, other: &HeContext) -> bool {
        self.scheme.eq_ignore_ascii_case(&other.scheme)
            && self.poly_modulus_degree == other.poly_modulus_degree
            && self.scale == other.scale
    }
}

/// One tenant of the search service.
///
/// Created by `initialize`, mutated only by counter updates and
/// deactivation, never destroyed while embeddings exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: Uuid,
    pub name: String,
    pub api_key_hash: String,
    pub he: HeContext,
    pub embedding_dim: usize,
    pub lsh: LshConfig,
    pub max_embeddings: u64,
    pub total_embeddings: u64,
    pub total_searches: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub is_active: bool,
}

impl ClientRecord {
    /// Validate a request against this record's immutable shape.
    pub fn check_shape(&self, embedding_dim: usize, lsh: &LshConfig) -> Result<(), SearchError> {
        if self.embedding_dim != embedding_dim {
            return Err(SearchError::ConfigConflict(format!(
                "embedding_dim is fixed at {} for this client, got {}",
                self.embedding_dim, embedding_dim
            )));
        }
        if self.lsh != *lsh {
            return Err(SearchError::ConfigConflict(
                "lsh_config is fixed for this client".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsh_config_bounds() {
        assert!(LshConfig::default().validate().is_ok());
        assert!(
            LshConfig {
                num_tables: 0,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            LshConfig {
                num_tables: 51,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            LshConfig {
                hash_size: 7,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            LshConfig {
                hash_size: 33,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            LshConfig {
                num_candidates: 0,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_he_context_degree_whitelist() {
        let mut ctx = HeContext {
            scheme: "mock".into(),
            poly_modulus_degree: 8192,
            scale: 1 << 40,
            public_key: vec![],
        };
        assert!(ctx.validate().is_ok());
        ctx.poly_modulus_degree = 1024;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_same_shape_ignores_public_key() {
        let a = HeContext {
            scheme: "CKKS".into(),
            poly_modulus_degree: 8192,
            scale: 1 << 40,
            public_key: vec![1, 2, 3],
        };
        let mut b = a.clone();
        b.public_key = vec![9, 9];
        b.scheme = "ckks".into();
        assert!(a.same_shape(&b));

        b.poly_modulus_degree = 16384;
        assert!(!a.same_shape(&b));
    }
}
