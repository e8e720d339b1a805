use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::cache::RedisCache;
use crate::config::Config;
use crate::db::DatabaseProxy;
use crate::response::AppError;

#[derive(Clone)]
pub struct AppState {
    started_at: Instant,
    started_at_system: SystemTime,
    config: Arc<Config>,
    db_proxy: Option<Arc<DatabaseProxy>>,
    cache: Option<Arc<RedisCache>>,
}

impl AppState {
    pub fn new(
        config: Config,
        db_proxy: Option<Arc<DatabaseProxy>>,
        cache: Option<Arc<RedisCache>>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            started_at_system: SystemTime::now(),
            config: Arc::new(config),
            db_proxy,
            cache,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn started_at_system(&self) -> SystemTime {
        self.started_at_system
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db_proxy(&self) -> Option<Arc<DatabaseProxy>> {
        self.db_proxy.clone()
    }

    /// The database, or a 503 for handlers that cannot work without it.
    pub fn require_db(&self) -> Result<Arc<DatabaseProxy>, AppError> {
        self.db_proxy
            .clone()
            .ok_or_else(|| AppError::service_unavailable("Database service unavailable"))
    }

    pub fn cache(&self) -> Option<Arc<RedisCache>> {
        self.cache.clone()
    }
}
