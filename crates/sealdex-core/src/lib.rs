//! sealdex-core — shared foundation for the sealdex encrypted search stack
//!
//! Holds the pieces every other crate agrees on: typed errors with stable
//! wire codes, client/LSH configuration records, the JSON wire protocol,
//! the `HeCodec` capability seam (with the deterministic mock codec), and
//! seeded random-hyperplane generation.

pub mod codec;
pub mod embedder;
pub mod error;
pub mod planes;
pub mod protocol;
pub mod types;

pub use codec::{Ciphertext, EncryptedScalar, HeCodec, MockHeCodec, codec_for, register_codec};
pub use embedder::{Embedder, SeededEmbedder};
pub use error::SearchError;
pub use planes::LshPlanes;
pub use types::{ClientRecord, HeContext, LshConfig};
