use crate::errors::{Result, SnapshotError};
use crate::store::{check_batch, merge_fields, Document, DocumentPath, DocumentStore, DocumentWrite};
use crate::util::arrow_utils::{self, StoredDocument};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// 本地文件存储：每个集合路径对应一个 Arrow IPC 文件
///
/// `fonlar/2025-12-03/records` is kept in `<root>/fonlar/2025-12-03/records.arrow`.
/// A batch touching several collections is staged to temporary files first and
/// only renamed into place once every file was written.
pub struct ArrowStore {
    root: PathBuf,
    // 同一进程内串行化读改写
    write_lock: Mutex<()>,
}

impl ArrowStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            SnapshotError::WriteError(format!("cannot create store directory {}: {}", root.display(), e))
        })?;
        info!("Arrow store rooted at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing a collection path.
    pub fn collection_file(&self, collection: &DocumentPath) -> PathBuf {
        let mut path = self.root.clone();
        let segments = collection.segments();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            path.push(fs_segment(segment));
        }
        if let Some(last) = segments.last() {
            path.push(format!("{}.arrow", fs_segment(last)));
        }
        path
    }

    fn load(&self, collection: &DocumentPath) -> Result<BTreeMap<String, StoredDocument>> {
        let file = self.collection_file(collection);
        if !file.exists() {
            return Ok(BTreeMap::new());
        }
        let docs = arrow_utils::read_documents_from_arrow(&file).map_err(|e| {
            SnapshotError::WriteError(format!("cannot read {}: {}", file.display(), e))
        })?;
        Ok(docs.into_iter().map(|d| (d.id.clone(), d)).collect())
    }

    /// Applies writes grouped by collection and swaps the files in.
    fn apply(&self, writes: &[DocumentWrite]) -> Result<()> {
        let now = Utc::now();
        let mut grouped: BTreeMap<DocumentPath, Vec<&DocumentWrite>> = BTreeMap::new();
        for write in writes {
            let parent = write.path.parent().ok_or_else(|| {
                SnapshotError::WriteError(format!("{} has no parent collection", write.path))
            })?;
            grouped.entry(parent).or_default().push(write);
        }

        let mut staged = Vec::with_capacity(grouped.len());
        for (collection, writes) in grouped {
            let mut docs = self.load(&collection)?;
            for write in writes {
                let doc = docs
                    .entry(write.path.id().to_string())
                    .or_insert_with(|| StoredDocument {
                        id: write.path.id().to_string(),
                        fields: Document::new(),
                        updated_at: 0,
                    });
                merge_fields(&mut doc.fields, &write.fields);
                if let Some(field) = &write.server_timestamp {
                    doc.fields.insert(field.clone(), Value::from(now.to_rfc3339()));
                }
                doc.updated_at = now.timestamp_millis();
            }

            let target = self.collection_file(&collection);
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir)?;
            }
            let temp = target.with_extension("arrow.tmp");
            let docs: Vec<StoredDocument> = docs.into_values().collect();
            arrow_utils::save_documents_to_arrow(&docs, &temp)?;
            staged.push((temp, target));
        }

        for (temp, target) in staged {
            fs::rename(&temp, &target)?;
            debug!("replaced {}", target.display());
        }
        Ok(())
    }
}

/// Keeps path segments portable as file names.
fn fs_segment(segment: &str) -> String {
    segment.replace(':', "%3A").replace('\\', "%5C")
}

fn to_write_error(err: SnapshotError) -> SnapshotError {
    match err {
        SnapshotError::WriteError(_) => err,
        other => SnapshotError::WriteError(other.to_string()),
    }
}

#[async_trait]
impl DocumentStore for ArrowStore {
    fn name(&self) -> &'static str {
        "arrow"
    }

    fn max_batch_size(&self) -> usize {
        crate::config::STORE_BATCH_HARD_CAP
    }

    async fn commit_batch(&self, writes: Vec<DocumentWrite>) -> Result<()> {
        check_batch(self, &writes)?;
        let _guard = self.write_lock.lock().await;
        self.apply(&writes).map_err(to_write_error)
    }

    async fn merge_document(&self, write: DocumentWrite) -> Result<()> {
        check_batch(self, std::slice::from_ref(&write))?;
        let _guard = self.write_lock.lock().await;
        self.apply(std::slice::from_ref(&write)).map_err(to_write_error)
    }

    async fn read_collection(&self, collection: &DocumentPath) -> Result<Vec<(String, Document)>> {
        let docs = self.load(collection)?;
        Ok(docs.into_iter().map(|(id, doc)| (id, doc.fields)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_write(collection: &DocumentPath, id: &str, fields: Value) -> DocumentWrite {
        DocumentWrite::new(
            collection.child(id).unwrap(),
            fields.as_object().cloned().unwrap(),
        )
    }

    #[tokio::test]
    async fn upserts_survive_reopen_and_merge_fields() {
        let dir = tempfile::tempdir().unwrap();
        let records = DocumentPath::collection("fonlar")
            .child("2025-12-03")
            .and_then(|p| p.child("records"))
            .unwrap();

        let store = ArrowStore::open(dir.path()).unwrap();
        store
            .commit_batch(vec![
                record_write(&records, "TTE", json!({"price": 1.5, "name": "Fon"})),
                record_write(&records, "MAC", json!({"price": 2.0})),
            ])
            .await
            .unwrap();
        store
            .commit_batch(vec![record_write(&records, "TTE", json!({"price": 1.6}))])
            .await
            .unwrap();

        let reopened = ArrowStore::open(dir.path()).unwrap();
        let docs = reopened.read_collection(&records).await.unwrap();
        assert_eq!(docs.len(), 2);
        let (id, tte) = &docs[1];
        assert_eq!(id, "TTE");
        assert_eq!(tte["price"], json!(1.6));
        assert_eq!(tte["name"], json!("Fon"));
    }

    #[tokio::test]
    async fn time_keys_map_to_portable_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrowStore::open(dir.path()).unwrap();
        let records = DocumentPath::collection("fonlar")
            .child("2025-12-03")
            .and_then(|p| p.child("snapshots"))
            .and_then(|p| p.child("19:42"))
            .and_then(|p| p.child("records"))
            .unwrap();

        let file = store.collection_file(&records);
        assert!(file.ends_with("fonlar/2025-12-03/snapshots/19%3A42/records.arrow"));
    }

    #[tokio::test]
    async fn server_timestamp_is_filled_on_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrowStore::open(dir.path()).unwrap();
        let root = DocumentPath::collection("fonlar");
        let write = DocumentWrite::new(root.child("2025-12-03").unwrap(), Document::new())
            .with_server_timestamp("created_at");
        store.merge_document(write).await.unwrap();

        let docs = store.read_collection(&root).await.unwrap();
        assert!(docs[0].1["created_at"].is_string());
    }
}
