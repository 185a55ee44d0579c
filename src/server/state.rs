use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::infrastructure::postgres::{PoolBackend, PoolManager};

pub struct AppState<B: PoolBackend> {
    pub settings: Arc<Settings>,
    pub db: Arc<PoolManager<B>>,
    pub start_time: Instant,
}

impl<B: PoolBackend> AppState<B> {
    pub fn new(settings: Settings, db: Arc<PoolManager<B>>) -> Self {
        Self {
            settings: Arc::new(settings),
            db,
            start_time: Instant::now(),
        }
    }
}

// Derived Clone would require `B: Clone`
impl<B: PoolBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            db: self.db.clone(),
            start_time: self.start_time,
        }
    }
}
