//! Backing-store seam: the pipeline only needs an atomic batched upsert, a
//! single-document merge and a server-assigned timestamp.

pub mod memory;
pub mod arrow_store;

pub use arrow_store::ArrowStore;
pub use memory::MemoryStore;

use crate::errors::{Result, SnapshotError};
use async_trait::async_trait;
use serde_json::{Map, Value};

pub type Document = Map<String, Value>;

/// Slash-joined path alternating collection and document ids,
/// e.g. `fonlar/2025-12-03/snapshots/19:42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath {
    segments: Vec<String>,
}

impl DocumentPath {
    pub fn collection(name: &str) -> Self {
        Self {
            segments: vec![name.to_string()],
        }
    }

    /// Appends a segment. Segments must not contain `/` themselves.
    pub fn child(&self, segment: &str) -> Result<Self> {
        if segment.is_empty() || segment.contains('/') {
            return Err(SnapshotError::InvalidCodeError(segment.to_string()));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// A document path has an even number of segments.
    pub fn is_document(&self) -> bool {
        self.segments.len() % 2 == 0
    }

    /// Collection holding this document (the path minus its last segment).
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn id(&self) -> &str {
        self.segments.last().map(|s| s.as_str()).unwrap_or_default()
    }
}

impl std::fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// One upsert inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub path: DocumentPath,
    pub fields: Document,
    /// Field the store fills with its own clock at commit time.
    pub server_timestamp: Option<String>,
}

impl DocumentWrite {
    pub fn new(path: DocumentPath, fields: Document) -> Self {
        Self {
            path,
            fields,
            server_timestamp: None,
        }
    }

    pub fn with_server_timestamp(mut self, field: &str) -> Self {
        self.server_timestamp = Some(field.to_string());
        self
    }
}

/// Document database collaborator.
///
/// Writes are merge-on-conflict: fields present in the write replace the stored
/// ones, fields absent from the write are kept.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store name used in log lines.
    fn name(&self) -> &'static str;

    /// Largest number of writes accepted by one `commit_batch` call.
    fn max_batch_size(&self) -> usize;

    /// Applies every write atomically, or none of them.
    async fn commit_batch(&self, writes: Vec<DocumentWrite>) -> Result<()>;

    /// Merges fields into a single document, creating it when missing.
    async fn merge_document(&self, write: DocumentWrite) -> Result<()>;

    /// Documents directly under a collection, sorted by id.
    async fn read_collection(&self, collection: &DocumentPath) -> Result<Vec<(String, Document)>>;
}

/// Merge `update` into `target` field by field.
pub(crate) fn merge_fields(target: &mut Document, update: &Document) {
    for (field, value) in update {
        target.insert(field.clone(), value.clone());
    }
}

pub(crate) fn check_batch(store: &dyn DocumentStore, writes: &[DocumentWrite]) -> Result<()> {
    if writes.len() > store.max_batch_size() {
        return Err(SnapshotError::WriteError(format!(
            "{} rejected batch of {} writes (limit {})",
            store.name(),
            writes.len(),
            store.max_batch_size()
        )));
    }
    if let Some(bad) = writes.iter().find(|w| !w.path.is_document()) {
        return Err(SnapshotError::WriteError(format!(
            "{} is a collection path, not a document",
            bad.path
        )));
    }
    Ok(())
}
