pub mod logger;
pub mod store;

use crate::config::HistoryConfig;
use logger::PredictionLogger;
use store::{JsonlStore, LogStore, MemoryStore, StorageError};

/// Opens the prediction log described by `config`.
pub fn open_logger(config: &HistoryConfig) -> Result<PredictionLogger, StorageError> {
    let store: Box<dyn LogStore> = match &config.path {
        Some(path) => Box::new(JsonlStore::new(path)),
        None => Box::new(MemoryStore::new()),
    };
    PredictionLogger::open(store, config.max_entries, config.default_limit)
}
