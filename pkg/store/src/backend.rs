use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use schema::Record;
use tracing::{debug, warn};

use crate::{DatasetKey, StoreResult, dataset::DatasetStore};

/// A read-modify-write step. Shared so the same step can be replayed on a
/// fallback backend.
pub type Mutation = Arc<dyn Fn(&mut Vec<Record>) -> StoreResult<()> + Send + Sync>;

#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn read(&self, key: DatasetKey) -> StoreResult<Vec<Record>>;

    /// Read that does not wait for in-flight writers.
    async fn peek(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        self.read(key).await
    }

    async fn append(&self, key: DatasetKey, record: Record) -> StoreResult<()>;

    /// Returns the name of the backend that stored `records`.
    async fn replace(&self, key: DatasetKey, records: Vec<Record>) -> StoreResult<&'static str>;

    /// Applies `mutation` atomically with respect to other writers of `key`
    /// and returns the records as persisted.
    async fn mutate(&self, key: DatasetKey, mutation: Mutation) -> StoreResult<Vec<Record>>;
}

#[async_trait]
impl PersistenceBackend for DatasetStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn read(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        DatasetStore::read(self, key).await
    }

    async fn peek(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        self.read_ungated(key).await
    }

    async fn append(&self, key: DatasetKey, record: Record) -> StoreResult<()> {
        DatasetStore::append(self, key, record).await.map(|_| ())
    }

    async fn replace(&self, key: DatasetKey, records: Vec<Record>) -> StoreResult<&'static str> {
        DatasetStore::replace(self, key, &records).await?;
        Ok(self.backend_name())
    }

    async fn mutate(&self, key: DatasetKey, mutation: Mutation) -> StoreResult<Vec<Record>> {
        self.update(key, move |records| {
            mutation(records)?;
            Ok(records.clone())
        })
        .await
    }
}

/// Serves every call from `primary` and retries on `fallback` when the
/// primary's storage medium fails. Request errors are never retried.
pub struct FallbackBackend {
    primary: Arc<dyn PersistenceBackend>,
    fallback: Arc<dyn PersistenceBackend>,
}

impl FallbackBackend {
    pub fn new(primary: Arc<dyn PersistenceBackend>, fallback: Arc<dyn PersistenceBackend>) -> Self {
        Self { primary, fallback }
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, key: DatasetKey, call: F) -> StoreResult<T>
    where
        F: Fn(Arc<dyn PersistenceBackend>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        match call(Arc::clone(&self.primary)).await {
            Ok(value) => {
                debug!(backend = self.primary.backend_name(), operation, dataset = %key, "served");
                Ok(value)
            }
            Err(err) if err.is_infrastructure() => {
                warn!(
                    primary = self.primary.backend_name(),
                    fallback = self.fallback.backend_name(),
                    operation,
                    dataset = %key,
                    error = %err,
                    "primary backend failed, serving from fallback"
                );
                let result = call(Arc::clone(&self.fallback)).await;
                if result.is_ok() {
                    debug!(backend = self.fallback.backend_name(), operation, dataset = %key, "served");
                }
                result
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl PersistenceBackend for FallbackBackend {
    fn backend_name(&self) -> &'static str {
        self.primary.backend_name()
    }

    async fn read(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        self.run("read", key, |backend| async move { backend.read(key).await })
            .await
    }

    async fn peek(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        self.run("peek", key, |backend| async move { backend.peek(key).await })
            .await
    }

    async fn append(&self, key: DatasetKey, record: Record) -> StoreResult<()> {
        self.run("append", key, |backend| {
            let record = record.clone();
            async move { backend.append(key, record).await }
        })
        .await
    }

    async fn replace(&self, key: DatasetKey, records: Vec<Record>) -> StoreResult<&'static str> {
        self.run("replace", key, |backend| {
            let records = records.clone();
            async move { backend.replace(key, records).await }
        })
        .await
    }

    async fn mutate(&self, key: DatasetKey, mutation: Mutation) -> StoreResult<Vec<Record>> {
        self.run("mutate", key, |backend| {
            let mutation = Arc::clone(&mutation);
            async move { backend.mutate(key, mutation).await }
        })
        .await
    }
}
