// ABOUTME: Library root for watermark-sync
// ABOUTME: Incremental, watermark-based table synchronization into PostgreSQL

pub mod config;
pub mod error;
pub mod postgres;
pub mod sync;
pub mod utils;

pub use config::{SyncSettings, TableSyncConfig};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use sync::{CycleReport, SyncOrchestrator, Watermark};
