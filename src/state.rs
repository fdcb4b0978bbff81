//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::UploadService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    uploads: UploadService,
}

impl AppState {
    /// Create application state; the upload service is rooted at the
    /// configured storage root
    pub fn new(config: Config) -> Self {
        let uploads = UploadService::new(config.storage.root.clone());
        Self {
            inner: Arc::new(AppStateInner { config, uploads }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }
}
