use crate::errors::{Result, SnapshotError};
use crate::models::record::{DateRange, RawRow};
use crate::scrapers::base::InstrumentFetcher;
use crate::util;
use async_trait::async_trait;
use calamine::{open_workbook_auto, DataType, Range, Reader};
use log::{info, warn};
use std::path::PathBuf;

// 表头别名（已做土耳其字母折叠、小写）
const CODE_ALIASES: &[&str] = &["kod", "fon kodu", "code", "symbol", "sembol", "hisse"];
const PRICE_ALIASES: &[&str] = &["fiyat", "price", "close", "son", "kapanis", "son fiyat"];
const NAME_ALIASES: &[&str] = &["ad", "fon adi", "unvan", "fon unvani", "name", "title"];
const SIZE_ALIASES: &[&str] = &["buyukluk", "portfoy buyuklugu", "fon toplam degeri", "size"];
const HOLDER_ALIASES: &[&str] = &["kisi sayisi", "yatirimci sayisi", "holder_count", "holders"];
const DATE_ALIASES: &[&str] = &["tarih", "date"];

/// Header text folded to lowercase ASCII so `KİŞİ SAYISI` matches `kisi sayisi`.
fn fold_header(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            'İ' | 'I' | 'ı' => 'i',
            'Ş' | 'ş' => 's',
            'Ğ' | 'ğ' => 'g',
            'Ü' | 'ü' => 'u',
            'Ö' | 'ö' => 'o',
            'Ç' | 'ç' => 'c',
            other => other,
        })
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Default, PartialEq)]
struct Columns {
    code: usize,
    price: usize,
    name: Option<usize>,
    size: Option<usize>,
    holders: Option<usize>,
    date: Option<usize>,
}

impl Columns {
    fn locate(header: &[DataType]) -> Result<Self> {
        let folded: Vec<String> = header.iter().map(|c| fold_header(&c.to_string())).collect();
        let find = |aliases: &[&str]| folded.iter().position(|h| aliases.contains(&h.as_str()));

        let price = find(PRICE_ALIASES).ok_or_else(|| {
            SnapshotError::FetchError(format!("no price column among {:?}", folded))
        })?;
        Ok(Self {
            // 找不到代码列时默认第一列
            code: find(CODE_ALIASES).unwrap_or(0),
            price,
            name: find(NAME_ALIASES),
            size: find(SIZE_ALIASES),
            holders: find(HOLDER_ALIASES),
            date: find(DATE_ALIASES),
        })
    }
}

fn cell_text(row: &[DataType], idx: Option<usize>) -> Option<String> {
    let cell = row.get(idx?)?;
    if cell.is_empty() {
        return None;
    }
    Some(cell.to_string().trim().to_string())
}

fn cell_date(cell: &DataType) -> Result<chrono::NaiveDate> {
    match cell {
        DataType::DateTime(serial) | DataType::Float(serial) => util::excel_serial_to_date(*serial),
        DataType::Int(serial) => util::excel_serial_to_date(*serial as f64),
        other => util::parse_sheet_date(&other.to_string()),
    }
}

/// Reads exported spreadsheets (`.xlsx`, `.xls`, `.ods`) of fund or stock tables.
pub struct SpreadsheetFetcher {
    path: PathBuf,
}

impl SpreadsheetFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn rows_from(sheet: &Range<DataType>, range: &DateRange, codes: Option<&[String]>) -> Result<Vec<RawRow>> {
        let mut rows_iter = sheet.rows();
        let header = rows_iter
            .next()
            .ok_or_else(|| SnapshotError::FetchError("spreadsheet is empty".to_string()))?;
        let columns = Columns::locate(header)?;

        let mut rows = Vec::new();
        for (line, row) in rows_iter.enumerate() {
            let Some(code) = cell_text(row, Some(columns.code)) else { continue };
            if let Some(codes) = codes.filter(|c| !c.is_empty()) {
                if !codes.iter().any(|c| c.eq_ignore_ascii_case(&code)) {
                    continue;
                }
            }

            let date = match columns.date.and_then(|idx| row.get(idx)).filter(|c| !c.is_empty()) {
                Some(cell) => match cell_date(cell) {
                    Ok(date) => date,
                    Err(e) => {
                        warn!("row {}: {}", line + 2, e);
                        continue;
                    }
                },
                None => range.end,
            };
            if !range.contains(&date) {
                continue;
            }

            rows.push(RawRow {
                code,
                date,
                price: cell_text(row, Some(columns.price)).unwrap_or_default(),
                name: cell_text(row, columns.name),
                size: cell_text(row, columns.size),
                holder_count: cell_text(row, columns.holders),
            });
        }
        Ok(rows)
    }
}

#[async_trait]
impl InstrumentFetcher for SpreadsheetFetcher {
    fn source_name(&self) -> &'static str {
        "spreadsheet"
    }

    async fn fetch(&self, range: &DateRange, codes: Option<&[String]>) -> Result<Vec<RawRow>> {
        info!("Reading {}", self.path.display());

        let path = self.path.clone();
        let sheet = tokio::task::spawn_blocking(move || -> Result<Range<DataType>> {
            let mut workbook = open_workbook_auto(&path)?;
            workbook
                .worksheet_range_at(0)
                .ok_or_else(|| SnapshotError::FetchError(format!("{} has no worksheet", path.display())))?
                .map_err(SnapshotError::ExcelError)
        })
        .await
        .map_err(|e| SnapshotError::FetchError(format!("spreadsheet reader panicked: {}", e)))??;

        let rows = Self::rows_from(&sheet, range, codes)?;
        info!("Read {} rows from {}", rows.len(), self.path.display());
        Ok(rows)
    }
}
