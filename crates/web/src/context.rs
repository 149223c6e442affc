//! Shared, read-only state handed to every request

use crate::config::ConsoleConfig;
use qmanager_common::{Database, ProcessInvoker, Store};
use std::sync::Arc;

/// Process-wide collaborators, built once at startup
#[derive(Clone)]
pub struct AppContext {
    pub config: ConsoleConfig,
    pub store: Arc<dyn Store>,
    pub invoker: ProcessInvoker,
}

impl AppContext {
    pub fn new(config: ConsoleConfig, store: Arc<dyn Store>, invoker: ProcessInvoker) -> Self {
        Self {
            config,
            store,
            invoker,
        }
    }

    /// Open the configured database and use the host executor
    pub fn open(config: ConsoleConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.images_dir)?;
        let db = Database::open(config.db_path())?;
        Ok(Self::new(config, Arc::new(db), ProcessInvoker::system()))
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }
}
