use crate::errors::{Result, SnapshotError};
use crate::store::{check_batch, merge_fields, Document, DocumentPath, DocumentStore, DocumentWrite};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process document store, used for dry runs and as the test double.
pub struct MemoryStore {
    documents: Mutex<BTreeMap<DocumentPath, Document>>,
    commits: Mutex<Vec<usize>>,
    fixed_clock: Option<DateTime<Utc>>,
    fail_on_commit: Option<usize>,
    batch_cap: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(BTreeMap::new()),
            commits: Mutex::new(Vec::new()),
            fixed_clock: None,
            fail_on_commit: None,
            batch_cap: crate::config::STORE_BATCH_HARD_CAP,
        }
    }

    /// Server timestamps always read `at`, which makes stored state comparable across runs.
    pub fn with_fixed_clock(mut self, at: DateTime<Utc>) -> Self {
        self.fixed_clock = Some(at);
        self
    }

    /// The n-th `commit_batch` call (1-based) fails as if the connection dropped.
    pub fn with_failure_on_commit(mut self, n: usize) -> Self {
        self.fail_on_commit = Some(n);
        self
    }

    pub fn with_batch_cap(mut self, cap: usize) -> Self {
        self.batch_cap = cap;
        self
    }

    /// Sizes of every successful `commit_batch` call, in order.
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.commits.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn document(&self, path: &DocumentPath) -> Option<Document> {
        self.documents.lock().ok()?.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full copy of the stored state.
    pub fn dump(&self) -> BTreeMap<DocumentPath, Document> {
        self.documents.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn now(&self) -> Value {
        let at = self.fixed_clock.unwrap_or_else(Utc::now);
        Value::from(at.to_rfc3339())
    }

    fn apply(&self, documents: &mut BTreeMap<DocumentPath, Document>, write: &DocumentWrite) {
        let stored = documents.entry(write.path.clone()).or_default();
        merge_fields(stored, &write.fields);
        if let Some(field) = &write.server_timestamp {
            stored.insert(field.clone(), self.now());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> SnapshotError {
    SnapshotError::WriteError("memory store lock poisoned".to_string())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn max_batch_size(&self) -> usize {
        self.batch_cap
    }

    async fn commit_batch(&self, writes: Vec<DocumentWrite>) -> Result<()> {
        check_batch(self, &writes)?;

        let mut commits = self.commits.lock().map_err(|_| poisoned())?;
        if self.fail_on_commit == Some(commits.len() + 1) {
            return Err(SnapshotError::WriteError(format!(
                "connection lost during commit {}",
                commits.len() + 1
            )));
        }

        let mut documents = self.documents.lock().map_err(|_| poisoned())?;
        for write in &writes {
            self.apply(&mut documents, write);
        }
        commits.push(writes.len());
        debug!("memory store committed {} writes", writes.len());
        Ok(())
    }

    async fn merge_document(&self, write: DocumentWrite) -> Result<()> {
        check_batch(self, std::slice::from_ref(&write))?;
        let mut documents = self.documents.lock().map_err(|_| poisoned())?;
        self.apply(&mut documents, &write);
        Ok(())
    }

    async fn read_collection(&self, collection: &DocumentPath) -> Result<Vec<(String, Document)>> {
        let documents = self.documents.lock().map_err(|_| poisoned())?;
        Ok(documents
            .iter()
            .filter(|(path, _)| path.parent().as_ref() == Some(collection))
            .map(|(path, doc)| (path.id().to_string(), doc.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(id: &str, price: f64) -> DocumentWrite {
        let path = DocumentPath::collection("c").child(id).unwrap();
        let fields = json!({ "price": price }).as_object().cloned().unwrap();
        DocumentWrite::new(path, fields)
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let store = MemoryStore::new().with_failure_on_commit(1);
        let result = store.commit_batch(vec![write("A", 1.0), write("B", 2.0)]).await;
        assert!(matches!(result, Err(SnapshotError::WriteError(_))));
        assert!(store.is_empty());
        assert!(store.commit_sizes().is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let store = MemoryStore::new().with_batch_cap(1);
        let result = store.commit_batch(vec![write("A", 1.0), write("B", 2.0)]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_collection_lists_direct_children_only() {
        let store = MemoryStore::new();
        store.commit_batch(vec![write("B", 2.0), write("A", 1.0)]).await.unwrap();
        let nested = DocumentPath::collection("c")
            .child("A")
            .and_then(|p| p.child("records"))
            .and_then(|p| p.child("X"))
            .unwrap();
        store.merge_document(DocumentWrite::new(nested, Document::new())).await.unwrap();

        let docs = store.read_collection(&DocumentPath::collection("c")).await.unwrap();
        let ids: Vec<_> = docs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }
}
