use std::sync::Arc;

use crate::ingest::IngestHandle;
use crate::storage::alerts::AlertManager;
use crate::storage::SqliteStore;
use crate::watch::WatchRegistry;

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub alerts: AlertManager,
    pub registry: Arc<WatchRegistry>,
    pub ingest: IngestHandle,
}
