use std::sync::Arc;

use schema::{OutcomeTag, Record, names_equal, validate_name};
use store::{DatasetKey, Mutation, PersistenceBackend, StoreError, StoreResult};
use tracing::info;

/// Outcome labels offered when closing a viability study. Kept sorted
/// alphabetically, ignoring case.
pub struct Tags {
    backend: Arc<dyn PersistenceBackend>,
}

impl Tags {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    pub async fn list(&self) -> StoreResult<Vec<OutcomeTag>> {
        let records = self.backend.read(DatasetKey::Tags).await?;
        Ok(tags_of(&records))
    }

    pub async fn add(&self, name: &str) -> StoreResult<Vec<OutcomeTag>> {
        let name = validate_name("tabulacao", name)?;
        let tag = OutcomeTag { name: name.clone() };
        let tags = self
            .edit(move |tags| {
                if tags.iter().any(|existing| names_equal(&existing.name, &tag.name)) {
                    return Err(StoreError::Conflict(format!("tag `{}` already exists", tag.name)));
                }
                tags.push(tag.clone());
                Ok(())
            })
            .await?;
        info!(tag = %name, "tag added");
        Ok(tags)
    }

    pub async fn remove(&self, name: &str) -> StoreResult<Vec<OutcomeTag>> {
        let name = validate_name("tabulacao", name)?;
        let target = name.clone();
        let tags = self
            .edit(move |tags| {
                let index = tags
                    .iter()
                    .position(|tag| names_equal(&tag.name, &target))
                    .ok_or_else(|| StoreError::NotFound(format!("tag `{target}`")))?;
                tags.remove(index);
                Ok(())
            })
            .await?;
        info!(tag = %name, "tag removed");
        Ok(tags)
    }

    async fn edit<F>(&self, step: F) -> StoreResult<Vec<OutcomeTag>>
    where
        F: Fn(&mut Vec<OutcomeTag>) -> StoreResult<()> + Send + Sync + 'static,
    {
        let mutation: Mutation = Arc::new(move |records: &mut Vec<Record>| -> StoreResult<()> {
            let mut tags = tags_of(records);
            step(&mut tags)?;
            tags.sort_by_cached_key(|tag| tag.name.to_lowercase());
            *records = tags.iter().map(OutcomeTag::to_record).collect();
            Ok(())
        });
        let records = self.backend.mutate(DatasetKey::Tags, mutation).await?;
        Ok(tags_of(&records))
    }
}

fn tags_of(records: &[Record]) -> Vec<OutcomeTag> {
    records.iter().filter_map(OutcomeTag::from_record).collect()
}
