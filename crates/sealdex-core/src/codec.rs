//! The `HeCodec` capability seam
//!
//! The engine only ever sees this trait: opaque ciphertexts in, encrypted
//! similarity scalars out. Production backends (CKKS et al.) register
//! through [`register_codec`]; the deterministic mock codec ships built in
//! and is what every test runs against.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::SearchError;
use crate::types::HeContext;

/// Opaque encrypted vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext(Vec<u8>);

impl Ciphertext {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque encrypted scalar (a similarity score the server cannot read)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedScalar(Vec<u8>);

impl EncryptedScalar {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Homomorphic codec capability.
///
/// `encode_*` and `decrypt_scalar` run client-side (they need key
/// material); `inner_product` and the byte codecs run on either side.
/// Every implementation must satisfy
/// `decrypt(inner_product(encode(a), encode(b))) ≈ a·b`.
pub trait HeCodec: Send + Sync {
    fn scheme(&self) -> &str;

    fn encode_vector(&self, plain: &[f32]) -> Result<Ciphertext, SearchError>;

    fn encode_query(&self, plain: &[f32]) -> Result<Ciphertext, SearchError>;

    fn inner_product(
        &self,
        a: &Ciphertext,
        b: &Ciphertext,
    ) -> Result<EncryptedScalar, SearchError>;

    fn serialize(&self, cipher: &Ciphertext) -> Vec<u8>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Ciphertext, SearchError>;

    fn encode_scalar_bytes(&self, scalar: &EncryptedScalar) -> Vec<u8>;

    fn decode_scalar_bytes(&self, bytes: &[u8]) -> Result<EncryptedScalar, SearchError>;

    fn decrypt_scalar(&self, scalar: &EncryptedScalar) -> Result<f32, SearchError>;
}

// ── Mock codec ──

const MOCK_MAGIC: &[u8; 8] = b"SDXMOCK1";
const SCALAR_MAGIC: &[u8; 8] = b"SDXSCAL1";
const SCALAR_LEN: usize = 64;

/// Deterministic stand-in for a real HE backend.
///
/// Ciphertexts are fixed-size for a given dimension: magic + dim + the LE
/// f32 payload, padded with a SHA-256 keystream so the bytes look opaque.
/// `inner_product` recovers both plaintexts and embeds the exact dot
/// product, so round-trip accuracy is limited only by f32.
pub struct MockHeCodec {
    dim: usize,
    ciphertext_len: usize,
}

impl MockHeCodec {
    pub fn new(dim: usize) -> Self {
        let payload = MOCK_MAGIC.len() + 4 + dim * 4;
        Self {
            dim,
            ciphertext_len: payload.next_multiple_of(1024),
        }
    }

    pub fn ciphertext_len(&self) -> usize {
        self.ciphertext_len
    }

    fn recover_plaintext(&self, cipher: &Ciphertext) -> Result<Vec<f32>, SearchError> {
        let bytes = cipher.as_bytes();
        if bytes.len() != self.ciphertext_len {
            return Err(SearchError::CorruptCiphertext(format!(
                "expected {} bytes, got {}",
                self.ciphertext_len,
                bytes.len()
            )));
        }
        if &bytes[..8] != MOCK_MAGIC {
            return Err(SearchError::CorruptCiphertext("bad magic".into()));
        }
        let dim = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        if dim != self.dim {
            return Err(SearchError::CorruptCiphertext(format!(
                "dimension {dim} does not match codec dimension {}",
                self.dim
            )));
        }
        let payload = &bytes[12..12 + dim * 4];
        Ok(payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn encode(&self, plain: &[f32]) -> Result<Ciphertext, SearchError> {
        if plain.len() != self.dim {
            return Err(SearchError::InvalidRequest(format!(
                "vector dimension {} does not match codec dimension {}",
                plain.len(),
                self.dim
            )));
        }
        let mut bytes = Vec::with_capacity(self.ciphertext_len);
        bytes.extend_from_slice(MOCK_MAGIC);
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        for v in plain {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let pad = keystream(&bytes, self.ciphertext_len - bytes.len());
        bytes.extend_from_slice(&pad);
        Ok(Ciphertext(bytes))
    }
}

impl HeCodec for MockHeCodec {
    fn scheme(&self) -> &str {
        "mock"
    }

    fn encode_vector(&self, plain: &[f32]) -> Result<Ciphertext, SearchError> {
        self.encode(plain)
    }

    fn encode_query(&self, plain: &[f32]) -> Result<Ciphertext, SearchError> {
        self.encode(plain)
    }

    fn inner_product(
        &self,
        a: &Ciphertext,
        b: &Ciphertext,
    ) -> Result<EncryptedScalar, SearchError> {
        let va = self.recover_plaintext(a)?;
        let vb = self.recover_plaintext(b)?;
        let dot: f32 = va.iter().zip(vb.iter()).map(|(x, y)| x * y).sum();

        let mut bytes = Vec::with_capacity(SCALAR_LEN);
        bytes.extend_from_slice(SCALAR_MAGIC);
        bytes.extend_from_slice(&dot.to_le_bytes());
        let pad = keystream(&bytes, SCALAR_LEN - bytes.len());
        bytes.extend_from_slice(&pad);
        Ok(EncryptedScalar(bytes))
    }

    fn serialize(&self, cipher: &Ciphertext) -> Vec<u8> {
        cipher.0.clone()
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Ciphertext, SearchError> {
        let cipher = Ciphertext(bytes.to_vec());
        self.recover_plaintext(&cipher)?;
        Ok(cipher)
    }

    fn encode_scalar_bytes(&self, scalar: &EncryptedScalar) -> Vec<u8> {
        scalar.0.clone()
    }

    fn decode_scalar_bytes(&self, bytes: &[u8]) -> Result<EncryptedScalar, SearchError> {
        if bytes.len() != SCALAR_LEN || &bytes[..8] != SCALAR_MAGIC {
            return Err(SearchError::CorruptCiphertext(
                "not a mock encrypted scalar".into(),
            ));
        }
        Ok(EncryptedScalar(bytes.to_vec()))
    }

    fn decrypt_scalar(&self, scalar: &EncryptedScalar) -> Result<f32, SearchError> {
        let bytes = scalar.as_bytes();
        if bytes.len() != SCALAR_LEN || &bytes[..8] != SCALAR_MAGIC {
            return Err(SearchError::CorruptCiphertext(
                "not a mock encrypted scalar".into(),
            ));
        }
        Ok(f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]))
    }
}

/// Deterministic SHA-256 keystream used to pad mock ciphertexts to their
/// fixed size.
fn keystream(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u64 = 0;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(counter.to_le_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

// ── Codec registry ──

/// Builds a codec for a given HE context and embedding dimension
pub type CodecFactory =
    Arc<dyn Fn(&HeContext, usize) -> Result<Arc<dyn HeCodec>, SearchError> + Send + Sync>;

static CODECS: OnceLock<RwLock<HashMap<String, CodecFactory>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, CodecFactory>> {
    CODECS.get_or_init(|| {
        let mut map: HashMap<String, CodecFactory> = HashMap::new();
        map.insert(
            "mock".to_string(),
            Arc::new(|_ctx, dim| Ok(Arc::new(MockHeCodec::new(dim)) as Arc<dyn HeCodec>)),
        );
        RwLock::new(map)
    })
}

/// Register a codec backend under a scheme tag (case-insensitive).
/// Process-wide; intended to be called once at startup.
pub fn register_codec(scheme: &str, factory: CodecFactory) {
    let mut map = registry().write().unwrap_or_else(|p| p.into_inner());
    debug!("Registering HE codec for scheme '{}'", scheme);
    map.insert(scheme.to_ascii_lowercase(), factory);
}

/// Resolve the codec for a client's HE context.
pub fn codec_for(ctx: &HeContext, dim: usize) -> Result<Arc<dyn HeCodec>, SearchError> {
    let map = registry().read().unwrap_or_else(|p| p.into_inner());
    let factory = map.get(&ctx.scheme.to_ascii_lowercase()).ok_or_else(|| {
        SearchError::Internal(format!("no codec registered for scheme '{}'", ctx.scheme))
    })?;
    factory(ctx, dim)
}
