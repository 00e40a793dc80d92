pub mod config;
pub mod fetch;
pub mod notify;
pub mod rest;
pub mod storage;
pub mod sync;

use std::sync::Arc;
use std::time::Instant;

use config::DaemonConfig;
use storage::Storage;
use sync::SyncEngine;

/// Shared state handed to every REST handler.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub sync: Arc<SyncEngine>,
    pub started_at: Instant,
}
