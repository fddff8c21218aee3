//! sealdex-client — the key-holding side of the protocol
//!
//! Text is embedded, hashed, and encrypted locally; only ciphertexts and
//! bucket ids ever leave the process. Encrypted similarity scores come
//! back and are decrypted and ranked here, because the server cannot
//! order what it cannot read.

pub mod config;
pub mod pipeline;

pub use config::ClientConfig;
pub use pipeline::{RankedResult, SearchPipeline, SessionState};
