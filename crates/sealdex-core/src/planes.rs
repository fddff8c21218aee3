//! Keyed random-hyperplane LSH
//!
//! Each client gets a dense `(T, b, d)` matrix of standard-normal floats,
//! generated from a seed derived from `(client_id, server_secret)`. The
//! same seed reproduces the same planes bit-for-bit on any host, so the
//! server can regenerate a client's planes instead of trusting the stored
//! blob, and client and server always hash identically.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::SearchError;
use crate::types::LshConfig;

/// Per-client hyperplane matrix of shape `(num_tables, hash_size, dim)`
#[derive(Debug, Clone, PartialEq)]
pub struct LshPlanes {
    num_tables: usize,
    hash_size: usize,
    dim: usize,
    planes: Vec<f32>,
}

impl LshPlanes {
    /// Derive the plane seed for a client. The server secret keys the
    /// planes so no party without it can reconstruct a client's buckets.
    pub fn seed_for(client_id: Uuid, server_secret: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(client_id.as_bytes());
        hasher.update(server_secret.as_bytes());
        hasher.finalize().into()
    }

    /// Generate planes from a seed. ChaCha20 keeps this portable: the same
    /// seed yields the same floats on every platform.
    pub fn generate(seed: [u8; 32], lsh: &LshConfig, dim: usize) -> Self {
        let num_tables = lsh.num_tables as usize;
        let hash_size = lsh.hash_size as usize;
        let mut rng = ChaCha20Rng::from_seed(seed);
        let mut planes = Vec::with_capacity(num_tables * hash_size * dim);
        for _ in 0..num_tables * hash_size * dim {
            planes.push(rng.sample::<f32, _>(StandardNormal));
        }
        Self {
            num_tables,
            hash_size,
            dim,
            planes,
        }
    }

    pub fn num_tables(&self) -> usize {
        self.num_tables
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn plane(&self, table: usize, bit: usize) -> &[f32] {
        let start = (table * self.hash_size + bit) * self.dim;
        &self.planes[start..start + self.dim]
    }

    /// Hash a vector into one bucket id per table.
    ///
    /// Bit `i` of table `t`'s hash is set iff `P[t,i] · v ≥ 0`, so each
    /// hash lies in `[0, 2^hash_size)`.
    pub fn hash_vector(&self, v: &[f32]) -> Result<Vec<u32>, SearchError> {
        if v.len() != self.dim {
            return Err(SearchError::InvalidRequest(format!(
                "vector dimension {} does not match plane dimension {}",
                v.len(),
                self.dim
            )));
        }
        let mut hashes = Vec::with_capacity(self.num_tables);
        for t in 0..self.num_tables {
            let mut hash: u32 = 0;
            for i in 0..self.hash_size {
                let dot: f32 = self.plane(t, i).iter().zip(v.iter()).map(|(p, x)| p * x).sum();
                if dot >= 0.0 {
                    hash |= 1 << i;
                }
            }
            hashes.push(hash);
        }
        Ok(hashes)
    }

    /// Serialize as LE f32 bytes; shape travels separately in the client
    /// record / lsh config.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.planes.len() * 4);
        for v in &self.planes {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(lsh: &LshConfig, dim: usize, bytes: &[u8]) -> Result<Self, SearchError> {
        let num_tables = lsh.num_tables as usize;
        let hash_size = lsh.hash_size as usize;
        let expected = num_tables * hash_size * dim * 4;
        if bytes.len() != expected {
            return Err(SearchError::InvalidRequest(format!(
                "plane blob is {} bytes, expected {expected} for shape ({num_tables}, {hash_size}, {dim})",
                bytes.len()
            )));
        }
        let planes = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            num_tables,
            hash_size,
            dim,
            planes,
        })
    }
}
