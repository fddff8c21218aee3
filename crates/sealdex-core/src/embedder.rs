//! Deterministic text embedding for tests and the CLI
//!
//! Real deployments plug in an external embedding model; the seeded
//! embedder maps text to a reproducible unit vector so end-to-end flows
//! (hashing, encryption, retrieval) can run without a model.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use sha2::{Digest, Sha256};

use crate::error::SearchError;

/// Text-to-vector seam
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError>;

    fn dim(&self) -> usize;
}

/// Pseudo-embedder: unit vector drawn from a ChaCha20 stream seeded by the
/// SHA-256 of the text. Identical text yields identical vectors on any
/// host; unrelated texts are near-orthogonal in high dimensions.
pub struct SeededEmbedder {
    dim: usize,
}

impl SeededEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Embedder for SeededEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        if self.dim == 0 {
            return Err(SearchError::InvalidRequest(
                "embedding dimension must be positive".into(),
            ));
        }
        let seed: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        let mut rng = ChaCha20Rng::from_seed(seed);
        let mut v: Vec<f32> = (0..self.dim)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        Ok(v)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let embedder = SeededEmbedder::new(64);
        assert_eq!(
            embedder.embed("hello world").unwrap(),
            embedder.embed("hello world").unwrap()
        );
    }

    #[test]
    fn test_unit_norm() {
        let embedder = SeededEmbedder::new(384);
        let v = embedder.embed("machine learning and AI").unwrap();
        assert_eq!(v.len(), 384);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_distinct_texts_differ() {
        let embedder = SeededEmbedder::new(64);
        let a = embedder.embed("alpha").unwrap();
        let b = embedder.embed("beta").unwrap();
        assert_ne!(a, b);

        // near-orthogonal in expectation
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        assert!(dot.abs() < 0.5);
    }

    #[test]
    fn test_zero_dim_rejected() {
        let embedder = SeededEmbedder::new(0);
        assert!(embedder.embed("anything").is_err());
    }
}
