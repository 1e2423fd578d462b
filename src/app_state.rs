use std::sync::Arc;

use crate::{broadcast::Broadcaster, config::Config, db::DbPool, storage::Storage};

#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub config: Arc<Config>,
    pub broadcaster: Arc<Broadcaster>,
    pub storage: Storage,
}

impl AppState {
    pub fn new(db_pool: DbPool, config: Config, broadcaster: Broadcaster) -> Self {
        let storage = Storage::new(&config.storage.root, &config.storage.public_url);
        Self {
            db_pool,
            config: Arc::new(config),
            broadcaster: Arc::new(broadcaster),
            storage,
        }
    }
}
