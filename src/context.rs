use crate::config::AppConfig;
use crate::core::CopyExecutor;
use crate::store::{FolderConfigStore, JsonFolderStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn FolderConfigStore>,
    pub executor: CopyExecutor,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self::with_store(config, Arc::new(JsonFolderStore::new()))
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn FolderConfigStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            executor: CopyExecutor::new(),
        }
    }
}
