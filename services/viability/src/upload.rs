//! Replacement of the CTO master list from an uploaded spreadsheet.
//!
//! Uploads are checked before anything is written: the header must carry the
//! coordinate columns, and the body must decode strictly and hold at least one
//! row. Every accepted row is rewritten under the canonical CTO column names
//! so the stored base never depends on how the upload spelled its headers.
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use schema::{
    CTO_COLUMNS, CTO_CRITICAL_COLUMNS, ColumnMap, CtoEntry, FieldValue, Record, ValidationError,
};
use serde::Serialize;
use store::{
    DatasetKey, DatasetStore, DelimitedCodec, PersistenceBackend, RecordCodec, SnapshotInfo,
    StoreError, StoreResult, XlsxCodec,
};
use tracing::{info, warn};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const NUMERIC_COLUMNS: [&str; 6] = ["latitude", "longitude", "portas", "ocupado", "livre", "pct_ocup"];

/// Xlsx workbooks are zip archives; anything else is read as delimited text.
pub fn sniff_codec(bytes: &[u8]) -> Arc<dyn RecordCodec> {
    if bytes.starts_with(ZIP_MAGIC) {
        Arc::new(XlsxCodec)
    } else {
        Arc::new(DelimitedCodec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInspection {
    pub format: &'static str,
    pub headers: Vec<String>,
    pub columns: ColumnMap,
    pub missing_optional: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub rows: usize,
    pub rows_without_coordinates: usize,
    pub missing_optional: Vec<String>,
    pub backend: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub file_name: String,
    pub modified_unix_secs: u64,
}

impl From<&SnapshotInfo> for SnapshotSummary {
    fn from(info: &SnapshotInfo) -> Self {
        Self {
            file_name: info.file_name.clone(),
            modified_unix_secs: unix_secs(info.modified),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseInfo {
    pub current: Option<SnapshotSummary>,
    pub backups: Vec<SnapshotSummary>,
    pub rows: usize,
}

pub struct UploadPipeline {
    backend: Arc<dyn PersistenceBackend>,
    files: Arc<DatasetStore>,
}

impl UploadPipeline {
    /// `files` is the local store whose snapshot directory backs
    /// [`UploadPipeline::base_info`]; writes go through `backend`.
    pub fn new(backend: Arc<dyn PersistenceBackend>, files: Arc<DatasetStore>) -> Self {
        Self { backend, files }
    }

    /// Header-only check of an upload.
    pub fn inspect(&self, bytes: &[u8]) -> Result<UploadInspection, ValidationError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ValidationError::EmptyUpload);
        }
        let codec = sniff_codec(bytes);
        let headers: Vec<String> = codec
            .peek_header(bytes)
            .map_err(|err| ValidationError::Unreadable(err.to_string()))?
            .into_iter()
            .map(|header| header.trim().to_string())
            .filter(|header| !header.is_empty())
            .collect();

        let columns = ColumnMap::resolve(&headers, &CTO_COLUMNS);
        let missing = columns.missing();
        let (critical, optional): (Vec<String>, Vec<String>) = missing
            .into_iter()
            .partition(|name| CTO_CRITICAL_COLUMNS.contains(&name.as_str()));
        if !critical.is_empty() {
            warn!(missing = ?critical, found = ?headers, "upload rejected: coordinate columns missing");
            return Err(ValidationError::MissingCriticalColumns {
                missing: critical,
                found: headers,
            });
        }
        if !optional.is_empty() {
            warn!(missing = ?optional, "upload lacks optional columns");
        }

        Ok(UploadInspection {
            format: codec.name(),
            headers,
            columns,
            missing_optional: optional,
        })
    }

    /// Validates the upload and makes it the current CTO base. When another
    /// backend stores the rows, they are also written to the local snapshots
    /// so [`UploadPipeline::base_info`] describes the same upload.
    pub async fn commit(&self, bytes: Vec<u8>) -> StoreResult<UploadReport> {
        let inspection = self.inspect(&bytes)?;
        let codec = sniff_codec(&bytes);
        let decoded = tokio::task::spawn_blocking(move || codec.decode(&bytes))
            .await
            .map_err(|err| StoreError::Io(std::io::Error::other(err)))?
            .map_err(|err| ValidationError::Unreadable(err.to_string()))?;

        let rows: Vec<Record> = decoded
            .iter()
            .map(|record| normalize(&inspection.columns, record))
            .filter(|record| !record.is_blank())
            .collect();
        if rows.is_empty() {
            return Err(ValidationError::EmptyUpload.into());
        }
        let rows_without_coordinates = rows
            .iter()
            .filter(|record| CtoEntry::from_record(record).coordinates().is_none())
            .count();

        let count = rows.len();
        let served = self.backend.replace(DatasetKey::CtoBase, rows.clone()).await?;
        if served != PersistenceBackend::backend_name(self.files.as_ref())
            && let Err(err) = self.files.replace(DatasetKey::CtoBase, &rows).await
        {
            warn!(backend = served, error = %err, "could not mirror cto base into local snapshots");
        }
        let report = UploadReport {
            rows: count,
            rows_without_coordinates,
            missing_optional: inspection.missing_optional,
            backend: served,
        };
        info!(
            rows = report.rows,
            rows_without_coordinates = report.rows_without_coordinates,
            format = inspection.format,
            backend = report.backend,
            "cto base replaced"
        );
        Ok(report)
    }

    pub async fn base_info(&self) -> StoreResult<BaseInfo> {
        let current = self.files.current_snapshot(DatasetKey::CtoBase).await?;
        let backups = self.files.backups(DatasetKey::CtoBase).await?;
        let rows = self.backend.peek(DatasetKey::CtoBase).await?.len();
        Ok(BaseInfo {
            current: current.as_ref().map(SnapshotSummary::from),
            backups: backups.iter().map(SnapshotSummary::from).collect(),
            rows,
        })
    }
}

fn normalize(columns: &ColumnMap, record: &Record) -> Record {
    let mut projected = columns.project(record);
    for column in NUMERIC_COLUMNS {
        if let Some(number) = projected.get(column).and_then(FieldValue::as_f64) {
            projected.insert(column, FieldValue::Number(number));
        }
    }
    projected
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
