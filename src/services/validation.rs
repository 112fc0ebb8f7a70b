use crate::errors::{Result, SnapshotError};
use crate::models::record::{InstrumentHistory, InstrumentRecord, Snapshot};

/// Record-level invariants: storable code, non-negative finite price.
pub fn validate_record(code: &str, record: &InstrumentRecord) -> Result<()> {
    if code.is_empty() || code.contains('/') || code.contains('\\') {
        return Err(SnapshotError::InvalidCodeError(code.to_string()));
    }
    if record.code != code {
        return Err(SnapshotError::ValidationError(format!(
            "record keyed {} carries code {}",
            code, record.code
        )));
    }
    if !record.price.is_finite() || record.price < 0.0 {
        return Err(SnapshotError::ParseError(format!(
            "price {} of {} is not a valid price",
            record.price, code
        )));
    }
    if !record.change_percent.is_finite() || !record.size.is_finite() {
        return Err(SnapshotError::ValidationError(format!("{} has non-finite fields", code)));
    }
    Ok(())
}

/// 写入前的快照检查：空快照直接拒绝，避免覆盖已有数据
pub fn validate_snapshot(snapshot: &Snapshot) -> Result<()> {
    if snapshot.key.collection.is_empty() || snapshot.key.date.is_empty() {
        return Err(SnapshotError::ValidationError(format!(
            "incomplete snapshot key {}",
            snapshot.key
        )));
    }
    if snapshot.is_empty() {
        return Err(SnapshotError::EmptySnapshotError(format!(
            "no records for {}",
            snapshot.key
        )));
    }
    Ok(())
}

/// Dates within one series must be strictly increasing.
pub fn validate_history(history: &InstrumentHistory) -> Result<()> {
    if history.code.is_empty() || history.code.contains('/') {
        return Err(SnapshotError::InvalidCodeError(history.code.clone()));
    }
    if history.points.is_empty() {
        return Err(SnapshotError::EmptySnapshotError(format!("no history for {}", history.code)));
    }
    if let Some(pair) = history.points.windows(2).find(|w| w[0].date >= w[1].date) {
        return Err(SnapshotError::ValidationError(format!(
            "{}: {} is not after {}",
            history.code, pair[1].date, pair[0].date
        )));
    }
    if let Some(point) = history.points.iter().find(|p| !p.close.is_finite() || p.close < 0.0) {
        return Err(SnapshotError::ParseError(format!(
            "{}: bad close {} on {}",
            history.code, point.close, point.date
        )));
    }
    Ok(())
}
