use crate::config::Config;
use crate::errors::{Result, SnapshotError};
use crate::models::record::{InstrumentHistory, Snapshot, SnapshotKey};
use crate::services::validation;
use crate::store::{Document, DocumentPath, DocumentStore, DocumentWrite};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Writer progress; there is no retry state, a failed commit ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Init,
    Chunking,
    Committing { chunk: usize, of: usize },
    Done,
}

/// Outcome of one chunked write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    /// Where the documents went, e.g. `fonlar/2025-12-03/records`.
    pub target: String,
    pub written: usize,
    pub skipped: usize,
    pub chunks: usize,
}

/// Labels stored with every history document.
#[derive(Debug, Clone)]
pub struct HistoryKind {
    pub prefix: String,
    pub asset_type: String,
    pub period: String,
}

impl HistoryKind {
    pub fn new(prefix: &str, asset_type: &str, period: &str) -> Self {
        Self {
            prefix: prefix.to_uppercase(),
            asset_type: asset_type.to_string(),
            period: period.to_string(),
        }
    }

    /// `365` → `1y`, `730` → `2y`, anything else in days (`90d`).
    pub fn period_label(days: i64) -> String {
        if days > 0 && days % 365 == 0 {
            format!("{}y", days / 365)
        } else {
            format!("{}d", days)
        }
    }
}

/// 快照写入器：分块提交，每块一个原子批次
pub struct SnapshotWriter {
    store: Arc<dyn DocumentStore>,
    chunk_size: usize,
    commit_pause: Duration,
    commit_timeout: Duration,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Result<Self> {
        config.validate(store.max_batch_size())?;
        Ok(Self {
            store,
            chunk_size: config.chunk_size,
            commit_pause: config.commit_pause,
            commit_timeout: config.commit_timeout,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Collection holding the record documents of a snapshot.
    pub fn records_collection(key: &SnapshotKey) -> Result<DocumentPath> {
        let date_doc = DocumentPath::collection(&key.collection).child(&key.date)?;
        match &key.time {
            Some(time) => date_doc.child("snapshots")?.child(time)?.child("records"),
            None => date_doc.child("records"),
        }
    }

    /// Document carrying `captured_at` and `record_count` for a snapshot.
    pub fn snapshot_container(key: &SnapshotKey) -> Result<DocumentPath> {
        let date_doc = DocumentPath::collection(&key.collection).child(&key.date)?;
        match &key.time {
            Some(time) => date_doc.child("snapshots")?.child(time),
            None => Ok(date_doc),
        }
    }

    /// Upserts every record of the snapshot under `(collection, date, time, code)`.
    ///
    /// Invalid records are skipped and counted. Replaying the same snapshot
    /// leaves the record documents unchanged.
    pub async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<WriteReport> {
        validation::validate_snapshot(snapshot)?;

        let records = Self::records_collection(&snapshot.key)?;
        let mut writes = Vec::with_capacity(snapshot.len());
        let mut skipped = 0;

        for (code, record) in &snapshot.records {
            if let Err(e) = validation::validate_record(code, record) {
                warn!("not writing {}: {}", code, e);
                skipped += 1;
                continue;
            }
            let fields = match serde_json::to_value(record)? {
                Value::Object(fields) => fields,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            writes.push(DocumentWrite::new(records.child(code)?, fields));
        }

        if writes.is_empty() {
            return Err(SnapshotError::EmptySnapshotError(format!(
                "all {} records of {} failed validation",
                snapshot.len(),
                snapshot.key
            )));
        }

        // 先建日期文档，记录全部提交后再写快照文档的计数
        let date_doc = DocumentPath::collection(&snapshot.key.collection).child(&snapshot.key.date)?;
        self.with_timeout(
            "date container",
            self.store
                .merge_document(DocumentWrite::new(date_doc, Document::new()).with_server_timestamp("created_at")),
        )
        .await?;

        info!("Writing {} records to {} via {}", writes.len(), records, self.store.name());
        let (written, chunks) = self.commit_chunked(writes).await?;

        let mut container = Document::new();
        container.insert("record_count".to_string(), Value::from(written));
        if let Some(time) = &snapshot.key.time {
            container.insert("date".to_string(), Value::from(snapshot.key.date.clone()));
            container.insert("time".to_string(), Value::from(time.clone()));
        }
        self.with_timeout(
            "snapshot container",
            self.store.merge_document(
                DocumentWrite::new(Self::snapshot_container(&snapshot.key)?, container)
                    .with_server_timestamp("captured_at"),
            ),
        )
        .await?;

        Ok(WriteReport {
            target: records.to_string(),
            written,
            skipped,
            chunks,
        })
    }

    /// One document per instrument at `{collection}/{PREFIX}_{code}`.
    pub async fn write_histories(
        &self,
        collection: &str,
        kind: &HistoryKind,
        histories: &[InstrumentHistory],
    ) -> Result<WriteReport> {
        let root = DocumentPath::collection(collection);
        let mut writes = Vec::with_capacity(histories.len());
        let mut skipped = 0;

        for history in histories {
            if let Err(e) = validation::validate_history(history) {
                warn!("not writing history of {}: {}", history.symbol, e);
                skipped += 1;
                continue;
            }
            let points: Vec<Value> = history
                .points
                .iter()
                .map(|p| json!({ "d": p.date.format("%Y-%m-%d").to_string(), "c": p.close }))
                .collect();

            let mut fields = Document::new();
            fields.insert("symbol".to_string(), Value::from(history.symbol.clone()));
            fields.insert("type".to_string(), Value::from(kind.asset_type.clone()));
            fields.insert("period".to_string(), Value::from(kind.period.clone()));
            fields.insert("history".to_string(), Value::Array(points));

            let id = format!("{}_{}", kind.prefix, history.code);
            writes.push(DocumentWrite::new(root.child(&id)?, fields).with_server_timestamp("last_updated"));
        }

        if writes.is_empty() {
            return Err(SnapshotError::EmptySnapshotError(format!(
                "no valid {} histories for {}",
                kind.prefix, collection
            )));
        }

        info!("Writing {} {} histories to {}", writes.len(), kind.prefix, root);
        let (written, chunks) = self.commit_chunked(writes).await?;

        Ok(WriteReport {
            target: root.to_string(),
            written,
            skipped,
            chunks,
        })
    }

    /// Commits `writes` in order, `chunk_size` at a time, pausing between chunks.
    async fn commit_chunked(&self, writes: Vec<DocumentWrite>) -> Result<(usize, usize)> {
        let mut state = WriterState::Init;
        debug!("writer {:?}", state);

        state = WriterState::Chunking;
        debug!("writer {:?}", state);
        let total_chunks = (writes.len() + self.chunk_size - 1) / self.chunk_size;
        let mut written = 0;
        let mut pending = writes.into_iter().peekable();
        let mut chunk_index = 0;

        while pending.peek().is_some() {
            let chunk: Vec<DocumentWrite> = pending.by_ref().take(self.chunk_size).collect();
            chunk_index += 1;
            state = WriterState::Committing { chunk: chunk_index, of: total_chunks };
            debug!("writer {:?}", state);

            let size = chunk.len();
            self.with_timeout("chunk commit", self.store.commit_batch(chunk))
                .await
                .map_err(|e| {
                    SnapshotError::WriteError(format!(
                        "chunk {}/{} failed after {} records were written: {}",
                        chunk_index, total_chunks, written, e
                    ))
                })?;
            written += size;
            info!("   -> committed chunk {}/{} ({} records, {} total)", chunk_index, total_chunks, size, written);

            if pending.peek().is_some() && !self.commit_pause.is_zero() {
                tokio::time::sleep(self.commit_pause).await;
            }
        }

        state = WriterState::Done;
        debug!("writer {:?}", state);
        Ok((written, chunk_index))
    }

    async fn with_timeout<F>(&self, what: &str, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.commit_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::WriteError(format!(
                "{} timed out after {:?}",
                what, self.commit_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_periods_use_years_for_whole_years() {
        assert_eq!(HistoryKind::period_label(365), "1y");
        assert_eq!(HistoryKind::period_label(730), "2y");
        assert_eq!(HistoryKind::period_label(90), "90d");
        assert_eq!(HistoryKind::new("us", "stock", "1y").prefix, "US");
    }
}
