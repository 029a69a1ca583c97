use std::{
    fs::File,
    io::{BufRead, BufReader, Cursor},
    path::Path,
    sync::Arc,
};

use calamine::{Data, Reader, Xlsx};
use rust_xlsxwriter::Workbook;
use schema::{FieldValue, Record};
use thiserror::Error;

const XLSX_MAX_ROWS: usize = 1_048_576;
const XLSX_MAX_COLUMNS: usize = 16_384;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed table: {0}")]
    Malformed(String),
    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns an ordered list of records into the bytes of a tabular document and
/// back. The first row of every document is the header.
pub trait RecordCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extension without the leading dot.
    fn extension(&self) -> &'static str;

    /// `schema_hint` fixes the leading column order; columns only present in
    /// the records follow in first-seen order.
    fn encode(&self, records: &[Record], schema_hint: &[&str]) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>, CodecError>;

    fn peek_header(&self, bytes: &[u8]) -> Result<Vec<String>, CodecError>;

    fn peek_header_path(&self, path: &Path) -> Result<Vec<String>, CodecError> {
        let bytes = std::fs::read(path)?;
        self.peek_header(&bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    #[default]
    Xlsx,
    Delimited,
}

impl CodecKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "xlsx" => Some(Self::Xlsx),
            "tsv" | "delimited" => Some(Self::Delimited),
            _ => None,
        }
    }

    pub fn build(self) -> Arc<dyn RecordCodec> {
        match self {
            Self::Xlsx => Arc::new(XlsxCodec),
            Self::Delimited => Arc::new(DelimitedCodec),
        }
    }
}

fn column_order(records: &[Record], schema_hint: &[&str]) -> Vec<String> {
    let mut columns: Vec<String> = schema_hint.iter().map(|name| name.to_string()).collect();
    for record in records {
        for name in record.field_names() {
            if !columns.iter().any(|column| column == name) {
                columns.push(name.to_string());
            }
        }
    }
    columns
}

fn row_to_record(header: &[String], row: Vec<FieldValue>) -> Option<Record> {
    let mut record = Record::new();
    let mut values = row.into_iter();
    for name in header {
        let value = values.next().unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        record.insert(name.clone(), value);
    }
    (!record.is_blank()).then_some(record)
}

// ----- Spreadsheet -----

#[derive(Debug, Clone, Copy, Default)]
pub struct XlsxCodec;

fn spreadsheet_error(err: impl std::fmt::Display) -> CodecError {
    CodecError::Spreadsheet(err.to_string())
}

fn cell_value(cell: &Data) -> FieldValue {
    match cell {
        Data::Empty | Data::Error(_) => FieldValue::Empty,
        Data::String(raw) => FieldValue::text(raw.as_str()),
        Data::Float(value) => FieldValue::Number(*value),
        Data::Int(value) => FieldValue::Number(*value as f64),
        Data::Bool(value) => FieldValue::Text(value.to_string()),
        other => FieldValue::text(other.to_string()),
    }
}

fn open_sheet(bytes: &[u8]) -> Result<Option<calamine::Range<Data>>, CodecError> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes)).map_err(spreadsheet_error)?;
    match workbook.worksheet_range_at(0) {
        Some(range) => range.map(Some).map_err(spreadsheet_error),
        None => Ok(None),
    }
}

fn header_row<'a>(rows: &mut impl Iterator<Item = &'a [Data]>) -> Option<Vec<String>> {
    rows.find(|row| row.iter().any(|cell| !matches!(cell, Data::Empty)))
        .map(|row| row.iter().map(|cell| cell_value(cell).as_text()).collect())
}

impl RecordCodec for XlsxCodec {
    fn name(&self) -> &'static str {
        "xlsx"
    }

    fn extension(&self) -> &'static str {
        "xlsx"
    }

    fn encode(&self, records: &[Record], schema_hint: &[&str]) -> Result<Vec<u8>, CodecError> {
        let columns = column_order(records, schema_hint);
        if records.len() >= XLSX_MAX_ROWS || columns.len() > XLSX_MAX_COLUMNS {
            return Err(CodecError::Malformed(format!(
                "table of {} rows x {} columns exceeds the sheet limits",
                records.len(),
                columns.len()
            )));
        }

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, name) in columns.iter().enumerate() {
            sheet
                .write_string(0, col as u16, name.as_str())
                .map_err(spreadsheet_error)?;
        }
        for (index, record) in records.iter().enumerate() {
            let row = index as u32 + 1;
            for (col, name) in columns.iter().enumerate() {
                let col = col as u16;
                match record.get(name) {
                    Some(FieldValue::Text(raw)) => {
                        sheet
                            .write_string(row, col, raw.as_str())
                            .map_err(spreadsheet_error)?;
                    }
                    Some(FieldValue::Number(value)) => {
                        sheet
                            .write_number(row, col, *value)
                            .map_err(spreadsheet_error)?;
                    }
                    Some(FieldValue::Empty) | None => {}
                }
            }
        }
        workbook.save_to_buffer().map_err(spreadsheet_error)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>, CodecError> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let Some(range) = open_sheet(bytes)? else {
            return Ok(Vec::new());
        };
        let mut rows = range.rows();
        let Some(header) = header_row(&mut rows) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .filter_map(|row| row_to_record(&header, row.iter().map(cell_value).collect()))
            .collect())
    }

    fn peek_header(&self, bytes: &[u8]) -> Result<Vec<String>, CodecError> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let Some(range) = open_sheet(bytes)? else {
            return Ok(Vec::new());
        };
        Ok(header_row(&mut range.rows()).unwrap_or_default())
    }
}

// ----- Tab-delimited text -----

#[derive(Debug, Clone, Copy, Default)]
pub struct DelimitedCodec;

fn escape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_field(raw: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some(escaped) = chars.next() else {
            return Err(CodecError::Malformed(
                "field ends inside an escape".to_string(),
            ));
        };
        match escaped {
            '\\' => out.push('\\'),
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => {
                return Err(CodecError::Malformed(format!(
                    "field has unsupported escape: \\{escaped}"
                )));
            }
        }
    }
    Ok(out)
}

fn split_line(line: &str) -> Result<Vec<String>, CodecError> {
    line.split('\t').map(unescape_field).collect()
}

fn as_utf8(bytes: &[u8]) -> Result<&str, CodecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| CodecError::Malformed(format!("table is not utf-8: {err}")))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

impl RecordCodec for DelimitedCodec {
    fn name(&self) -> &'static str {
        "tsv"
    }

    fn extension(&self) -> &'static str {
        "tsv"
    }

    fn encode(&self, records: &[Record], schema_hint: &[&str]) -> Result<Vec<u8>, CodecError> {
        let columns = column_order(records, schema_hint);
        let mut out = columns
            .iter()
            .map(|name| escape_field(name))
            .collect::<Vec<_>>()
            .join("\t");
        out.push('\n');
        for record in records {
            let line = columns
                .iter()
                .map(|name| {
                    record
                        .get(name)
                        .map(|value| escape_field(&value.as_text()))
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join("\t");
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>, CodecError> {
        let text = as_utf8(bytes)?;
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let Some(header) = lines.next() else {
            return Ok(Vec::new());
        };
        let header = split_line(header)?;
        let mut records = Vec::new();
        for line in lines {
            let row = split_line(line)?
                .into_iter()
                .map(FieldValue::text)
                .collect();
            if let Some(record) = row_to_record(&header, row) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn peek_header(&self, bytes: &[u8]) -> Result<Vec<String>, CodecError> {
        let text = as_utf8(bytes)?;
        match text.lines().find(|line| !line.trim().is_empty()) {
            Some(line) => split_line(line),
            None => Ok(Vec::new()),
        }
    }

    fn peek_header_path(&self, path: &Path) -> Result<Vec<String>, CodecError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(Vec::new());
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            let trimmed = trimmed.strip_prefix('\u{feff}').unwrap_or(trimmed);
            if !trimmed.trim().is_empty() {
                return split_line(trimmed);
            }
        }
    }
}
