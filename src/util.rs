use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use crate::errors::{Result, SnapshotError};
use crate::models::record::InstrumentMetadata;
use crate::services::normalizer::sanitize_code;
use log::warn;
use std::collections::HashMap;

// 日期转换工具
pub fn parse_date_arg(date_str: &str) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d")?)
}

/// Accepts `HH:MM` and returns it zero-padded.
pub fn parse_time_arg(time_str: &str) -> Result<String> {
    let time = chrono::NaiveTime::parse_from_str(time_str.trim(), "%H:%M")?;
    Ok(time.format("%H:%M").to_string())
}

/// Wall-clock date and `HH:MM` key in the source market's timezone.
pub fn local_date_time(now: DateTime<Utc>, tz: Tz) -> (NaiveDate, String) {
    let local = now.with_timezone(&tz);
    (local.date_naive(), local.format("%H:%M").to_string())
}

/// TEFAS 的日期是毫秒时间戳字符串（UTC 零点）
pub fn epoch_millis_to_date(millis: &str) -> Result<NaiveDate> {
    let value = millis
        .trim()
        .parse::<i64>()
        .map_err(|e| SnapshotError::ParseError(format!("timestamp {:?}: {}", millis, e)))?;
    Utc.timestamp_millis_opt(value)
        .single()
        .map(|dt| dt.date_naive())
        .ok_or_else(|| SnapshotError::ParseError(format!("timestamp out of range: {}", value)))
}

/// Spreadsheet dates come either as text (`dd.mm.YYYY` / `YYYY-mm-dd`) or as
/// Excel serial day numbers.
pub fn parse_sheet_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    for fmt in ["%d.%m.%Y", "%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Ok(date);
        }
    }
    Err(SnapshotError::ParseError(format!("unrecognised date {:?}", raw)))
}

pub fn excel_serial_to_date(serial: f64) -> Result<NaiveDate> {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)
        .ok_or_else(|| SnapshotError::ParseError("excel epoch".to_string()))?;
    if !serial.is_finite() || serial < 0.0 {
        return Err(SnapshotError::ParseError(format!("excel serial {}", serial)));
    }
    epoch
        .checked_add_signed(chrono::Duration::days(serial.floor() as i64))
        .ok_or_else(|| SnapshotError::ParseError(format!("excel serial {}", serial)))
}

/// Reads a `{"CODE": {"name": .., "size": .., "holder_count": ..}}` JSON file.
///
/// Keys go through [`sanitize_code`] so they match the stored record keys.
pub fn load_metadata_file(path: &std::path::Path) -> Result<HashMap<String, InstrumentMetadata>> {
    let text = std::fs::read_to_string(path)?;
    let raw: HashMap<String, InstrumentMetadata> = serde_json::from_str(&text)?;

    let mut metadata = HashMap::with_capacity(raw.len());
    for (code, meta) in raw {
        match sanitize_code(&code) {
            Ok(key) => {
                metadata.insert(key, meta);
            }
            Err(e) => warn!("ignoring metadata entry {:?}: {}", code, e),
        }
    }
    Ok(metadata)
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

// Arrow数据转换工具
pub mod arrow_utils {
    use super::*;
    use crate::store::Document;
    use arrow::ipc::reader::FileReader;
    use arrow::ipc::writer::FileWriter;
    use arrow::record_batch::RecordBatch;
    use arrow_array::{Array, ArrayRef, Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use log::debug;
    use std::fs::File;
    use std::path::Path;
    use std::sync::Arc;

    /// One stored document: id, JSON fields and last write time in millis.
    #[derive(Debug, Clone, PartialEq)]
    pub struct StoredDocument {
        pub id: String,
        pub fields: Document,
        pub updated_at: i64,
    }

    fn document_schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("body", DataType::Utf8, false),
            Field::new("updated_at", DataType::Int64, false),
        ])
    }

    // 将文档转换为Arrow记录批次
    pub fn documents_to_record_batch(docs: &[StoredDocument]) -> Result<RecordBatch> {
        let mut ids = Vec::with_capacity(docs.len());
        let mut bodies = Vec::with_capacity(docs.len());
        let mut updated = Vec::with_capacity(docs.len());

        for doc in docs {
            ids.push(doc.id.clone());
            bodies.push(serde_json::to_string(&doc.fields)?);
            updated.push(doc.updated_at);
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(bodies)),
            Arc::new(Int64Array::from(updated)),
        ];

        RecordBatch::try_new(Arc::new(document_schema()), columns)
            .map_err(|e| SnapshotError::ArrowError(e.to_string()))
    }

    // 从Arrow文件读取文档
    pub fn read_documents_from_arrow(path: &Path) -> Result<Vec<StoredDocument>> {
        let file = File::open(path)?;
        let reader = FileReader::try_new(file, None)
            .map_err(|e| SnapshotError::ArrowError(e.to_string()))?;

        let mut result = Vec::new();

        for batch in reader {
            let batch = batch.map_err(|e| SnapshotError::ArrowError(e.to_string()))?;

            let id_array = batch.column(0).as_any().downcast_ref::<StringArray>()
                .ok_or_else(|| SnapshotError::ArrowError("Failed to downcast id column".to_string()))?;
            let body_array = batch.column(1).as_any().downcast_ref::<StringArray>()
                .ok_or_else(|| SnapshotError::ArrowError("Failed to downcast body column".to_string()))?;
            let updated_array = batch.column(2).as_any().downcast_ref::<Int64Array>()
                .ok_or_else(|| SnapshotError::ArrowError("Failed to downcast updated_at column".to_string()))?;

            for i in 0..batch.num_rows() {
                if id_array.is_null(i) {
                    continue;
                }
                let fields: Document = serde_json::from_str(body_array.value(i))?;
                result.push(StoredDocument {
                    id: id_array.value(i).to_string(),
                    fields,
                    updated_at: updated_array.value(i),
                });
            }
        }

        Ok(result)
    }

    // 将文档保存到Arrow文件
    pub fn save_documents_to_arrow(docs: &[StoredDocument], path: &Path) -> Result<()> {
        debug!("Saving {} documents to {}", docs.len(), path.display());

        let batch = documents_to_record_batch(docs)?;
        let file = File::create(path)?;

        let mut writer = FileWriter::try_new(file, &batch.schema())
            .map_err(|e| SnapshotError::ArrowError(e.to_string()))?;

        writer.write(&batch)
            .map_err(|e| SnapshotError::ArrowError(e.to_string()))?;
        writer.finish()
            .map_err(|e| SnapshotError::ArrowError(e.to_string()))?;

        Ok(())
    }
}
