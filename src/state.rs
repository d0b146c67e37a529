use crate::config::settings::AppConfig;
use crate::infrastructure::queue::TaskQueue;
use crate::infrastructure::storage::local::FileLayout;
use crate::modules::jobs::repository::JobStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub files: FileLayout,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        files: FileLayout,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            files,
        }
    }
}
