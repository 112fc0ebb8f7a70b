use crate::config::Config;
use crate::errors::{Result, SnapshotError};
use crate::models::record::{DateRange, InstrumentMetadata, RawRow, Snapshot, SnapshotKey};
use crate::scrapers::base::InstrumentFetcher;
use crate::services::normalizer::{Normalizer, SkippedRow};
use crate::services::snapshot_writer::{HistoryKind, SnapshotWriter, WriteReport};
use crate::store::DocumentStore;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// 一次运行的结果
#[derive(Debug)]
pub enum RunOutcome {
    /// Records were written, possibly with some rows skipped.
    Written { report: WriteReport, skipped: Vec<SkippedRow> },
    /// Nothing valid to write; the stored snapshot was left untouched.
    NoOp { reason: String, skipped: Vec<SkippedRow> },
}

impl RunOutcome {
    pub fn written(&self) -> usize {
        match self {
            RunOutcome::Written { report, .. } => report.written,
            RunOutcome::NoOp { .. } => 0,
        }
    }

    pub fn skipped(&self) -> &[SkippedRow] {
        match self {
            RunOutcome::Written { skipped, .. } | RunOutcome::NoOp { skipped, .. } => skipped,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, RunOutcome::NoOp { .. })
    }
}

/// Fetch, normalize and write one snapshot per run.
pub struct SnapshotPipeline {
    config: Config,
    fetcher: Arc<dyn InstrumentFetcher>,
    writer: SnapshotWriter,
    metadata: HashMap<String, InstrumentMetadata>,
}

impl SnapshotPipeline {
    /// The store handle is created once by the caller and reused for every chunk.
    pub fn new(
        config: Config,
        fetcher: Arc<dyn InstrumentFetcher>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let writer = SnapshotWriter::new(store, &config)?;
        Ok(Self {
            config,
            fetcher,
            writer,
            metadata: HashMap::new(),
        })
    }

    /// Descriptive fields used when the source rows lack them.
    pub fn with_metadata(mut self, metadata: HashMap<String, InstrumentMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn fetch_rows(&self, range: &DateRange, codes: Option<&[String]>) -> Result<Vec<RawRow>> {
        info!("Fetching from {} ({} - {})", self.fetcher.source_name(), range.start, range.end);
        let mut rows = self.fetcher.fetch(range, codes).await.map_err(|e| match e {
            SnapshotError::FetchError(_) => e,
            other => SnapshotError::FetchError(format!("{}: {}", self.fetcher.source_name(), other)),
        })?;

        if rows.is_empty() {
            return Err(SnapshotError::FetchError(format!(
                "{} returned no rows for {} - {}",
                self.fetcher.source_name(),
                range.start,
                range.end
            )));
        }

        // 调试模式：只处理前N条
        if self.config.debug_mode {
            let original_count = rows.len();
            rows.truncate(self.config.debug_record_limit);
            info!("DEBUG MODE: Processing only {} out of {} rows", rows.len(), original_count);
        }

        Ok(rows)
    }

    /// Runs fetch → normalize → write for the snapshot addressed by `key`.
    pub async fn run_snapshot(
        &self,
        key: SnapshotKey,
        range: &DateRange,
        codes: Option<&[String]>,
    ) -> Result<RunOutcome> {
        info!("Processing snapshot {}", key);
        let rows = self.fetch_rows(range, codes).await?;

        let report = Normalizer::normalize(rows, &self.metadata);
        let snapshot = Snapshot::new(key, report.records);
        debug!("snapshot {} captured at {}", snapshot.key, snapshot.captured_at);

        match self.writer.write_snapshot(&snapshot).await {
            Ok(write) => {
                info!(
                    "Snapshot {} written: {} records in {} chunks ({} rows skipped)",
                    snapshot.key,
                    write.written,
                    write.chunks,
                    report.skipped.len() + write.skipped
                );
                Ok(RunOutcome::Written { report: write, skipped: report.skipped })
            }
            Err(SnapshotError::EmptySnapshotError(reason)) => {
                warn!("Nothing to write for {}: {}", snapshot.key, reason);
                Ok(RunOutcome::NoOp { reason, skipped: report.skipped })
            }
            Err(e) => Err(e),
        }
    }

    /// Writes full close series, one document per instrument.
    pub async fn run_history(
        &self,
        kind: &HistoryKind,
        range: &DateRange,
        codes: Option<&[String]>,
    ) -> Result<RunOutcome> {
        info!("Processing {} history {} - {}", kind.prefix, range.start, range.end);
        let rows = self.fetch_rows(range, codes).await?;

        let (histories, skipped) = Normalizer::build_histories(rows);
        match self
            .writer
            .write_histories(&self.config.history_collection, kind, &histories)
            .await
        {
            Ok(write) => {
                info!("{} histories written to {}", write.written, write.target);
                Ok(RunOutcome::Written { report: write, skipped })
            }
            Err(SnapshotError::EmptySnapshotError(reason)) => {
                warn!("Nothing to write: {}", reason);
                Ok(RunOutcome::NoOp { reason, skipped })
            }
            Err(e) => Err(e),
        }
    }
}
