//! Shared application state

use std::sync::Arc;
use std::time::Duration;

use sealdex_core::SearchError;
use sealdex_engine::{EngineConfig, SearchEngine};
use sealdex_store::{PlaneCache, SearchDb};

use crate::config::GatewayConfig;
use crate::ratelimit::RateLimiter;

/// Process-wide state handed to every handler. The database handle, the
/// plane cache, and the rate limiter are the only caches that outlive a
/// request.
#[derive(Clone)]
pub struct AppState {
    pub db: SearchDb,
    pub engine: Arc<SearchEngine>,
    pub planes: Arc<PlaneCache>,
    pub limiter: RateLimiter,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self, SearchError> {
        let db = SearchDb::open(&config.db_path)?;
        Self::with_db(db, config)
    }

    /// Build state over an existing handle; tests use in-memory databases.
    pub fn with_db(db: SearchDb, config: GatewayConfig) -> Result<Self, SearchError> {
        let engine = SearchEngine::new(
            db.clone(),
            EngineConfig {
                max_bucket_fanout: config.max_bucket_fanout,
                request_timeout: Duration::from_secs(config.request_timeout_secs),
            },
        );
        Ok(Self {
            db,
            engine: Arc::new(engine),
            planes: Arc::new(PlaneCache::new(config.plane_cache_capacity)),
            limiter: RateLimiter::new(config.rate_limit_per_minute, Duration::from_secs(60)),
            config: Arc::new(config),
        })
    }
}
