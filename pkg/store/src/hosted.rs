use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use schema::{FieldValue, Record};
use tracing::{debug, warn};

use crate::{
    DatasetKey, StoreError, StoreResult,
    backend::{Mutation, PersistenceBackend},
    gate::DatasetGate,
};

const INSERT_CHUNK_ROWS: usize = 500;

/// Column stamped on every hosted row with the write batch that produced it.
pub const BATCH_COLUMN: &str = "lote";

static BATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Batch ids sort in write order within a process.
fn next_batch() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let sequence = BATCH_COUNTER.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    format!("{nanos:020}-{sequence:06}")
}

/// Rows of the newest batch, with the batch column stripped.
struct HostedRows {
    records: Vec<Record>,
    batch: Option<String>,
}

/// `Some(added)` when `after` only extends `before` at the end.
fn appended<'a>(before: &[Record], after: &'a [Record]) -> Option<&'a [Record]> {
    (after.len() >= before.len() && after[..before.len()] == *before).then(|| &after[before.len()..])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// Tables on a PostgREST-style JSON API, one table per dataset. Writes from
/// this process are serialized per dataset; concurrent writers in other
/// processes are last-write-wins.
pub struct HostedBackend {
    client: Client,
    config: HostedConfig,
    gate: DatasetGate,
}

fn backend_error(err: reqwest::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

async fn ensure_success(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Backend(format!(
        "hosted table returned {status}: {}",
        body.trim()
    )))
}

impl HostedBackend {
    pub fn new(config: HostedConfig, lock_timeout: Duration) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(backend_error)?;
        Ok(Self {
            client,
            config,
            gate: DatasetGate::new(lock_timeout),
        })
    }

    pub fn config(&self) -> &HostedConfig {
        &self.config
    }

    fn table_url(&self, key: DatasetKey) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            key.hosted_table()
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
    }

    /// Reads the table. Rows from batches older than the newest one are
    /// leftovers of an interrupted replace and are skipped.
    async fn fetch(&self, key: DatasetKey) -> StoreResult<HostedRows> {
        let request = self
            .client
            .get(self.table_url(key))
            .query(&[("select", "*")]);
        let response = self.authorized(request).send().await.map_err(backend_error)?;
        let rows: Vec<Record> = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(backend_error)?;

        let fetched = rows.len();
        let mut stamped: Vec<(Option<String>, Record)> = rows
            .into_iter()
            .map(|mut row| {
                let batch = row
                    .remove(BATCH_COLUMN)
                    .map(|value| value.as_text())
                    .filter(|batch| !batch.is_empty());
                (batch, row)
            })
            .collect();
        let batch = stamped.iter().filter_map(|(batch, _)| batch.clone()).max();
        stamped.retain(|(row_batch, _)| *row_batch == batch);
        let records: Vec<Record> = stamped.into_iter().map(|(_, row)| row).collect();
        if records.len() < fetched {
            warn!(dataset = %key, skipped = fetched - records.len(), "skipping hosted rows from superseded batches");
        }
        debug!(dataset = %key, records = records.len(), "fetched hosted table");
        Ok(HostedRows { records, batch })
    }

    async fn insert(&self, key: DatasetKey, records: &[Record], batch: Option<&str>) -> StoreResult<()> {
        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let rows: Vec<Record> = chunk
                .iter()
                .map(|record| match batch {
                    Some(batch) => record.clone().with(BATCH_COLUMN, FieldValue::text(batch)),
                    None => record.clone(),
                })
                .collect();
            let request = self
                .client
                .post(self.table_url(key))
                .header("Prefer", "return=minimal")
                .json(&rows);
            let response = self.authorized(request).send().await.map_err(backend_error)?;
            ensure_success(response).await?;
        }
        Ok(())
    }

    async fn delete_where(&self, key: DatasetKey, column: &str, filter: &str) -> StoreResult<()> {
        let request = self
            .client
            .delete(self.table_url(key))
            .query(&[(column, filter)]);
        let response = self.authorized(request).send().await.map_err(backend_error)?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Inserts the new rows under a fresh batch, then deletes every other
    /// batch. A failed insert removes its partial batch and leaves the
    /// previous rows in place.
    async fn overwrite(&self, key: DatasetKey, records: &[Record]) -> StoreResult<()> {
        let batch = next_batch();
        if let Err(err) = self.insert(key, records, Some(&batch)).await {
            if let Err(cleanup) = self
                .delete_where(key, BATCH_COLUMN, &format!("eq.{batch}"))
                .await
            {
                warn!(dataset = %key, batch = %batch, error = %cleanup, "could not remove partial hosted batch");
            }
            return Err(err);
        }
        let superseded = format!("({BATCH_COLUMN}.is.null,{BATCH_COLUMN}.neq.{batch})");
        if let Err(err) = self.delete_where(key, "or", &superseded).await {
            warn!(dataset = %key, batch = %batch, error = %err, "could not delete superseded hosted rows");
        }
        debug!(dataset = %key, records = records.len(), batch = %batch, "overwrote hosted table");
        Ok(())
    }
}

#[async_trait]
impl PersistenceBackend for HostedBackend {
    fn backend_name(&self) -> &'static str {
        "hosted"
    }

    async fn read(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        let _guard = self.gate.acquire(key.as_str()).await?;
        Ok(self.fetch(key).await?.records)
    }

    async fn peek(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        Ok(self.fetch(key).await?.records)
    }

    async fn append(&self, key: DatasetKey, record: Record) -> StoreResult<()> {
        let _guard = self.gate.acquire(key.as_str()).await?;
        let batch = self.fetch(key).await?.batch;
        self.insert(key, std::slice::from_ref(&record), batch.as_deref())
            .await
    }

    async fn replace(&self, key: DatasetKey, records: Vec<Record>) -> StoreResult<&'static str> {
        let _guard = self.gate.acquire(key.as_str()).await?;
        self.overwrite(key, &records).await?;
        Ok(self.backend_name())
    }

    /// Mutations that only add rows at the end are written as inserts into
    /// the current batch; anything else rewrites the table.
    async fn mutate(&self, key: DatasetKey, mutation: Mutation) -> StoreResult<Vec<Record>> {
        let _guard = self.gate.acquire(key.as_str()).await?;
        let HostedRows { records: before, batch } = self.fetch(key).await?;
        let mut records = before.clone();
        mutation(&mut records)?;
        match appended(&before, &records) {
            Some([]) => {}
            Some(added) => self.insert(key, added, batch.as_deref()).await?,
            None => self.overwrite(key, &records).await?,
        }
        Ok(records)
    }
}
