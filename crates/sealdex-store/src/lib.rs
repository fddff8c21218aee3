//! sealdex-store — durable state for the search service
//!
//! One SQLite database holds the client registry, the ciphertext store,
//! and the LSH posting index. All access goes through [`SearchDb`], which
//! serializes blocking work onto the tokio blocking pool and retries
//! connection-level failures with bounded backoff.

pub mod db;
pub mod embeddings;
pub mod index;
pub mod registry;

pub use db::SearchDb;
pub use embeddings::FetchedEmbedding;
pub use index::CandidateSet;
pub use registry::{PlaneCache, Provisioned, ProvisionRequest, hash_api_key};
