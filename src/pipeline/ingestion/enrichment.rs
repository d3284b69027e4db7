use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;
use tracing::{debug, info, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use super::feed::FeedRecord;
use crate::error::{PipelineError, Result};
use crate::observability::metrics;

pub const EXTERNAL_ID_HEADERS: &[&str] = &["codigo", "codigo imovel", "codigo do imovel", "id externo", "external id"];
pub const INTERNET_ID_HEADERS: &[&str] = &["id internet", "codigo internet", "cod internet", "internet id"];
pub const REFERENCE_HEADERS: &[&str] = &["referencia", "ref", "referencia do imovel", "reference"];
pub const OWNER_NAME_HEADERS: &[&str] = &[
    "proprietario",
    "nome proprietario",
    "nome do proprietario",
    "owner",
    "owner name",
];
pub const PHONE_HEADERS: &[&str] = &["telefone", "telefone proprietario", "celular", "fone", "phone"];
pub const EMAIL_HEADERS: &[&str] = &["email", "e-mail", "email proprietario"];
pub const COMPANY_HEADERS: &[&str] = &["empresa", "imobiliaria", "company"];

/// One row of the enrichment export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentRecord {
    /// 1-based row number in the export, header included
    pub row: usize,
    pub external_id: String,
    pub internet_id: String,
    pub reference: String,
    pub owner_name: String,
    pub phone: String,
    pub email: String,
    pub company: String,
}

impl EnrichmentRecord {
    fn has_key(&self) -> bool {
        !(self.external_id.is_empty() && self.internet_id.is_empty() && self.reference.is_empty())
    }
}

/// Which key linked a feed record to its enrichment row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    ExternalId,
    Reference,
}

impl MatchKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKey::ExternalId => "external_id",
            MatchKey::Reference => "reference",
        }
    }
}

/// Lower-case, trim, collapse inner whitespace and strip diacritics
/// ("  Referência " => "referencia").
pub fn normalize_header(raw: &str) -> String {
    let stripped: String = raw
        .trim()
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Header-name tolerant column lookup
#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    columns: HashMap<String, usize>,
}

impl ColumnIndex {
    pub fn from_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut columns = HashMap::new();
        for (idx, header) in headers.into_iter().enumerate() {
            let key = normalize_header(header.as_ref());
            if !key.is_empty() {
                columns.entry(key).or_insert(idx);
            }
        }
        Self { columns }
    }

    /// Position of the first variant present in the header row
    pub fn find(&self, variants: &[&str]) -> Option<usize> {
        variants
            .iter()
            .find_map(|variant| self.columns.get(&normalize_header(variant)).copied())
    }
}

/// Resolved positions of the logical enrichment fields
#[derive(Debug, Clone, Copy, Default)]
struct FieldColumns {
    external_id: Option<usize>,
    internet_id: Option<usize>,
    reference: Option<usize>,
    owner_name: Option<usize>,
    phone: Option<usize>,
    email: Option<usize>,
    company: Option<usize>,
}

impl FieldColumns {
    fn resolve(index: &ColumnIndex) -> Self {
        Self {
            external_id: index.find(EXTERNAL_ID_HEADERS),
            internet_id: index.find(INTERNET_ID_HEADERS),
            reference: index.find(REFERENCE_HEADERS),
            owner_name: index.find(OWNER_NAME_HEADERS),
            phone: index.find(PHONE_HEADERS),
            email: index.find(EMAIL_HEADERS),
            company: index.find(COMPANY_HEADERS),
        }
    }

    fn has_any_key(&self) -> bool {
        self.external_id.is_some() || self.internet_id.is_some() || self.reference.is_some()
    }

    fn record(&self, row: usize, cells: &[String]) -> EnrichmentRecord {
        let cell = |col: Option<usize>| {
            col.and_then(|c| cells.get(c))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        EnrichmentRecord {
            row,
            external_id: cell(self.external_id),
            internet_id: cell(self.internet_id),
            reference: cell(self.reference),
            owner_name: cell(self.owner_name),
            phone: cell(self.phone),
            email: cell(self.email),
            company: cell(self.company),
        }
    }
}

/// A decoded grid row, or the reason it could not be decoded
type GridRow = std::result::Result<Vec<String>, String>;

/// All usable enrichment rows plus lookup tables for matching
#[derive(Debug, Clone, Default)]
pub struct EnrichmentIndex {
    records: Vec<EnrichmentRecord>,
    by_id: HashMap<String, usize>,
    by_reference: HashMap<String, usize>,
    skipped_rows: usize,
}

impl EnrichmentIndex {
    /// Decode an enrichment export. Spreadsheet formats are detected from
    /// their magic bytes; anything else is read as delimited text.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let grid = if is_spreadsheet(bytes) {
            read_spreadsheet(bytes)?
        } else {
            read_delimited(bytes)?
        };
        let index = Self::from_grid(grid)?;
        metrics::enrichment::rows_loaded(index.records.len());
        info!(
            "📇 Loaded {} enrichment rows ({} skipped)",
            index.records.len(),
            index.skipped_rows
        );
        Ok(index)
    }

    fn from_grid(grid: Vec<GridRow>) -> Result<Self> {
        let mut rows = grid.into_iter();
        let header = match rows.next() {
            Some(Ok(header)) => header,
            Some(Err(reason)) => {
                return Err(PipelineError::EnrichmentUnreadable(format!(
                    "header row could not be decoded: {}",
                    reason
                )))
            }
            None => {
                warn!("Enrichment export is empty");
                return Ok(Self::default());
            }
        };

        let columns = FieldColumns::resolve(&ColumnIndex::from_headers(&header));
        if !columns.has_any_key() {
            warn!("Enrichment export has no id or reference column; no record can match: {:?}", header);
        }

        let mut index = Self::default();
        for (offset, row) in rows.enumerate() {
            // Header is row 1
            let row_number = offset + 2;
            match row {
                Ok(cells) => {
                    let record = columns.record(row_number, &cells);
                    if record.has_key() {
                        index.insert(record);
                    }
                }
                Err(reason) => {
                    let err = PipelineError::EnrichmentRowMalformed { row: row_number, reason };
                    warn!("Skipping enrichment row: {}", err);
                    metrics::enrichment::row_skipped();
                    index.skipped_rows += 1;
                }
            }
        }
        Ok(index)
    }

    fn insert(&mut self, record: EnrichmentRecord) {
        let position = self.records.len();
        for key in [&record.external_id, &record.internet_id] {
            if !key.is_empty() {
                self.by_id.entry(key.clone()).or_insert(position);
            }
        }
        if !record.reference.is_empty() {
            self.by_reference.entry(record.reference.clone()).or_insert(position);
        }
        self.records.push(record);
    }

    /// Best-matching row for a feed record: external id (against the row's
    /// external id or internet id) first, then reference. No other fallback.
    pub fn find_for(&self, feed: &FeedRecord) -> Option<(&EnrichmentRecord, MatchKey)> {
        let external_id = feed.external_id.trim();
        if !external_id.is_empty() {
            if let Some(&pos) = self.by_id.get(external_id) {
                return Some((&self.records[pos], MatchKey::ExternalId));
            }
        }

        let reference = feed.reference.trim();
        if !reference.is_empty() {
            if let Some(&pos) = self.by_reference.get(reference) {
                return Some((&self.records[pos], MatchKey::Reference));
            }
        }

        debug!("No enrichment row for {} / {}", feed.external_id, feed.reference);
        None
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows dropped because they could not be decoded
    pub fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }
}

fn is_spreadsheet(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0])
}

fn read_spreadsheet(bytes: &[u8]) -> Result<Vec<GridRow>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| PipelineError::EnrichmentUnreadable(format!("failed to open workbook: {}", e)))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| PipelineError::EnrichmentUnreadable("workbook has no sheets".to_string()))?;

    let range = workbook.worksheet_range(&sheet_name).map_err(|e| {
        PipelineError::EnrichmentUnreadable(format!("failed to read sheet '{}': {}", sheet_name, e))
    })?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect::<std::result::Result<Vec<_>, _>>())
        .collect())
}

fn cell_to_string(cell: &Data) -> std::result::Result<String, String> {
    match cell {
        Data::Empty => Ok(String::new()),
        Data::String(s) => Ok(s.trim().to_string()),
        // Ids exported as numbers come back as floats
        Data::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => Ok(format!("{}", *n as i64)),
        Data::Float(n) => Ok(n.to_string()),
        Data::Int(n) => Ok(n.to_string()),
        Data::Error(e) => Err(format!("cell error {:?}", e)),
        other => Ok(other.to_string().trim().to_string()),
    }
}

/// `;` wins when the header line carries more of them than commas
fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let semicolons = first_line.iter().filter(|b| **b == b';').count();
    let commas = first_line.iter().filter(|b| **b == b',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// UTF-8 when valid, otherwise Windows-1252 (Excel exports in pt-BR locales)
fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => {
            debug!("Enrichment export is not UTF-8, decoding as Windows-1252");
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded
        }
    }
}

fn read_delimited(bytes: &[u8]) -> Result<Vec<GridRow>> {
    // Excel-exported CSVs often start with a UTF-8 BOM
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
    let text = decode_text(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(text.as_bytes()))
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    Ok(reader
        .records()
        .map(|result| {
            result
                .map(|record| record.iter().map(|f| f.trim().to_string()).collect())
                .map_err(|e| e.to_string())
        })
        .collect())
}
