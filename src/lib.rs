// 公开导出的模块，供外部使用
pub mod models;
pub mod errors;
pub mod store;
pub mod services;
pub mod scrapers;
pub mod config;

#[doc(hidden)]
pub mod util;

// 重新导出常用类型，方便使用
pub use models::record::{
    DateRange, HistoryPoint, InstrumentHistory, InstrumentMetadata, InstrumentRecord, RawRow,
    Snapshot, SnapshotKey,
};
pub use errors::{ErrorCategory, Result, SnapshotError};
pub use config::Config;
pub use services::pipeline::{RunOutcome, SnapshotPipeline};
pub use services::snapshot_writer::{SnapshotWriter, WriteReport};
pub use store::{DocumentPath, DocumentStore, DocumentWrite};
