use crate::errors::{Result, SnapshotError};
use crate::models::record::{
    HistoryPoint, InstrumentHistory, InstrumentMetadata, InstrumentRecord, RawRow,
};
use crate::util::round_to;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};

/// Replacement for `/` and `\` in instrument codes used as storage keys.
pub const SAFE_SEPARATOR: char = '_';

/// 解析价格，兼容 `1.234,56` 与 `12.5` 两种写法
///
/// When both separators appear, the one that comes last is the decimal mark.
/// A lone comma is a decimal comma. Several dots with no comma are thousands
/// separators; a single dot is a decimal point.
pub fn parse_price(raw: &str) -> Result<f64> {
    let value = parse_decimal(raw)?;
    if value < 0.0 {
        return Err(SnapshotError::ParseError(format!("negative price {:?}", raw)));
    }
    Ok(value)
}

/// Signed variant of [`parse_price`], used for changes and metadata.
pub fn parse_decimal(raw: &str) -> Result<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\'')
        .collect();
    if cleaned.is_empty() {
        return Err(SnapshotError::ParseError("empty value".to_string()));
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let canonical = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(_)) => {
            if cleaned.matches(',').count() > 1 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        (Some(_), None) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    let value = canonical
        .parse::<f64>()
        .map_err(|_| SnapshotError::ParseError(format!("not a number: {:?}", raw)))?;
    if !value.is_finite() {
        return Err(SnapshotError::ParseError(format!("not a finite number: {:?}", raw)));
    }
    Ok(value)
}

/// Whole counts such as holder numbers: every `.` or `,` is a thousands separator.
pub fn parse_count(raw: &str) -> Result<u64> {
    let digits: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(*c, '.' | ',' | '\u{a0}') && !c.is_whitespace())
        .collect();
    digits
        .parse::<u64>()
        .map_err(|_| SnapshotError::ParseError(format!("not a count: {:?}", raw)))
}

/// Trims the code and replaces path separators so it can be a document id.
pub fn sanitize_code(raw: &str) -> Result<String> {
    let code: String = raw
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' { SAFE_SEPARATOR } else { c })
        .collect();
    if code.is_empty() {
        return Err(SnapshotError::InvalidCodeError(raw.to_string()));
    }
    Ok(code)
}

/// Percentage change between the last two prices of a date-ordered series,
/// rounded to two decimals. Fewer than two observations, or a zero previous
/// price, give `0.0`.
pub fn compute_change(prices: &[f64]) -> f64 {
    match prices {
        [.., previous, latest] if *previous != 0.0 => {
            round_to((latest - previous) / previous * 100.0, 2)
        }
        _ => 0.0,
    }
}

/// 按代码补全描述字段，缺失时保持默认值
pub fn merge_metadata(
    mut record: InstrumentRecord,
    metadata_by_code: &HashMap<String, InstrumentMetadata>,
) -> InstrumentRecord {
    if let Some(meta) = metadata_by_code.get(&record.code) {
        if record.name.is_empty() {
            record.name = meta.name.clone();
        }
        if record.size == 0.0 {
            record.size = meta.size;
        }
        if record.holder_count == 0 {
            record.holder_count = meta.holder_count;
        }
    }
    record
}

/// A row dropped during normalization.
#[derive(Debug)]
pub struct SkippedRow {
    pub code: String,
    pub error: SnapshotError,
}

/// Result of normalizing one fetch.
#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub records: BTreeMap<String, InstrumentRecord>,
    pub skipped: Vec<SkippedRow>,
}

impl NormalizeReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Metadata carried on the row itself; unparsable numbers fall back to zero.
fn row_metadata(row: &RawRow) -> InstrumentMetadata {
    let size = match row.size.as_deref() {
        Some(raw) if !raw.trim().is_empty() => parse_decimal(raw).unwrap_or_else(|e| {
            debug!("ignoring size of {}: {}", row.code, e);
            0.0
        }),
        _ => 0.0,
    };
    let holder_count = match row.holder_count.as_deref() {
        Some(raw) if !raw.trim().is_empty() => parse_count(raw).unwrap_or_else(|e| {
            debug!("ignoring holder count of {}: {}", row.code, e);
            0
        }),
        _ => 0,
    };
    InstrumentMetadata {
        name: row.name.as_deref().map(str::trim).unwrap_or_default().to_string(),
        size,
        holder_count,
    }
}

struct Grouped {
    symbol: String,
    // 同一日期以最后出现的行为准
    points: BTreeMap<chrono::NaiveDate, (f64, InstrumentMetadata)>,
}

/// 清洗原始行：无状态，失败的行只计数不重试
pub struct Normalizer;

impl Normalizer {
    fn group(rows: Vec<RawRow>, skipped: &mut Vec<SkippedRow>) -> BTreeMap<String, Grouped> {
        let mut grouped: BTreeMap<String, Grouped> = BTreeMap::new();

        for row in rows {
            let code = match sanitize_code(&row.code) {
                Ok(code) => code,
                Err(error) => {
                    warn!("skipping row with invalid code {:?}", row.code);
                    skipped.push(SkippedRow { code: row.code.clone(), error });
                    continue;
                }
            };
            let price = match parse_price(&row.price) {
                Ok(price) => price,
                Err(error) => {
                    warn!("skipping {} on {}: {}", code, row.date, error);
                    skipped.push(SkippedRow { code, error });
                    continue;
                }
            };

            let symbol = row.code.trim();
            let group = grouped.entry(code.clone()).or_insert_with(|| Grouped {
                symbol: symbol.to_string(),
                points: BTreeMap::new(),
            });
            // 不同代码清洗后撞键，保留先出现的那个
            if group.symbol != symbol {
                warn!("{:?} collides with {:?} under key {}", symbol, group.symbol, code);
                skipped.push(SkippedRow {
                    code: symbol.to_string(),
                    error: SnapshotError::InvalidCodeError(format!(
                        "{} collides with {} under key {}",
                        symbol, group.symbol, code
                    )),
                });
                continue;
            }
            group.points.insert(row.date, (price, row_metadata(&row)));
        }

        grouped
    }

    /// Builds the snapshot records: latest price per code, change against the
    /// previous observation, metadata merged.
    pub fn normalize(
        rows: Vec<RawRow>,
        metadata_by_code: &HashMap<String, InstrumentMetadata>,
    ) -> NormalizeReport {
        let total = rows.len();
        let mut skipped = Vec::new();
        let grouped = Self::group(rows, &mut skipped);

        let mut records = BTreeMap::new();
        for (code, group) in grouped {
            let prices: Vec<f64> = group.points.values().map(|(price, _)| *price).collect();
            let Some((date, (price, meta))) = group.points.into_iter().next_back() else {
                continue;
            };

            let mut record = InstrumentRecord::new(code.clone(), date, price);
            record.change_percent = compute_change(&prices);
            record.name = meta.name;
            record.size = meta.size;
            record.holder_count = meta.holder_count;
            records.insert(code, merge_metadata(record, metadata_by_code));
        }

        info!(
            "Normalized {} rows into {} records ({} skipped)",
            total,
            records.len(),
            skipped.len()
        );
        NormalizeReport { records, skipped }
    }

    /// Groups rows into per-instrument close series with strictly increasing dates.
    pub fn build_histories(rows: Vec<RawRow>) -> (Vec<InstrumentHistory>, Vec<SkippedRow>) {
        let mut skipped = Vec::new();
        let grouped = Self::group(rows, &mut skipped);

        let histories = grouped
            .into_iter()
            .map(|(code, group)| InstrumentHistory {
                code,
                symbol: group.symbol,
                points: group
                    .points
                    .into_iter()
                    .map(|(date, (close, _))| HistoryPoint { date, close })
                    .collect(),
            })
            .collect();

        (histories, skipped)
    }
}
