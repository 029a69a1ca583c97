use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use schema::{DesignerEntry, Record, names_equal, validate_name};
use store::{DatasetKey, Mutation, PersistenceBackend, StoreError, StoreResult};
use tracing::{info, warn};

/// Designers allowed to log in. Names are unique ignoring case and
/// surrounding whitespace.
pub struct Roster {
    backend: Arc<dyn PersistenceBackend>,
}

impl Roster {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    pub async fn list(&self) -> StoreResult<Vec<DesignerEntry>> {
        let records = self.backend.read(DatasetKey::Roster).await?;
        Ok(entries_of(&records))
    }

    pub async fn add(&self, name: &str, secret: &str) -> StoreResult<DesignerEntry> {
        let entry = DesignerEntry {
            name: validate_name("nome", name)?,
            secret: Some(validate_name("senha", secret)?),
        };
        let added = entry.clone();
        self.edit(move |entries| {
            if entries.iter().any(|existing| names_equal(&existing.name, &entry.name)) {
                return Err(StoreError::Conflict(format!(
                    "designer `{}` already exists",
                    entry.name
                )));
            }
            entries.push(entry.clone());
            Ok(())
        })
        .await?;
        info!(designer = %added.name, "designer added");
        Ok(added)
    }

    pub async fn rename(&self, current: &str, new_name: &str) -> StoreResult<DesignerEntry> {
        self.update(current, Some(new_name), None).await
    }

    pub async fn update_secret(&self, name: &str, secret: &str) -> StoreResult<DesignerEntry> {
        self.update(name, None, Some(secret)).await
    }

    /// Applies a rename and a secret change in one roster write. A conflict or
    /// a missing designer leaves the roster untouched.
    pub async fn update(
        &self,
        current: &str,
        new_name: Option<&str>,
        secret: Option<&str>,
    ) -> StoreResult<DesignerEntry> {
        let current = validate_name("nome", current)?;
        let new_name = new_name
            .map(|new_name| validate_name("novo_nome", new_name))
            .transpose()?;
        let secret = secret.map(|secret| validate_name("senha", secret)).transpose()?;
        let final_name = new_name.clone().unwrap_or_else(|| current.clone());

        let (from, to, rotated) = (current.clone(), new_name.clone(), secret.is_some());
        let entries = self
            .edit(move |entries| {
                let index = position(entries, &from)?;
                if let Some(to) = &to {
                    let taken = entries
                        .iter()
                        .enumerate()
                        .any(|(other, entry)| other != index && names_equal(&entry.name, to));
                    if taken {
                        return Err(StoreError::Conflict(format!("designer `{to}` already exists")));
                    }
                    entries[index].name = to.clone();
                }
                if let Some(secret) = &secret {
                    entries[index].secret = Some(secret.clone());
                }
                Ok(())
            })
            .await?;
        if let Some(new_name) = &new_name {
            info!(from = %current, to = %new_name, "designer renamed");
        }
        if rotated {
            info!(designer = %final_name, "designer secret updated");
        }
        find(&entries, &final_name)
    }

    pub async fn remove(&self, name: &str) -> StoreResult<()> {
        let name = validate_name("nome", name)?;
        let target = name.clone();
        self.edit(move |entries| {
            let index = position(entries, &target)?;
            entries.remove(index);
            Ok(())
        })
        .await?;
        info!(designer = %name, "designer removed");
        Ok(())
    }

    /// Returns the entry when `secret` matches. Entries carried over from the
    /// bare-name roster have no secret and never authenticate.
    pub async fn verify_credentials(
        &self,
        name: &str,
        secret: &str,
    ) -> StoreResult<Option<DesignerEntry>> {
        let entries = self.list().await?;
        let Some(entry) = entries
            .into_iter()
            .find(|entry| names_equal(&entry.name, name))
        else {
            return Ok(None);
        };
        match entry.secret.as_deref() {
            Some(expected) if auth::secrets_match(secret.trim(), expected) => Ok(Some(entry)),
            Some(_) => Ok(None),
            None => {
                warn!(designer = %entry.name, "login refused for designer without a secret");
                Ok(None)
            }
        }
    }

    /// Rewrites a bare-name roster into the `nome, senha` layout. Returns the
    /// number of rows converted; zero leaves the dataset untouched.
    pub async fn migrate_legacy(&self) -> StoreResult<usize> {
        let records = self.backend.peek(DatasetKey::Roster).await?;
        if !records.iter().any(DesignerEntry::is_legacy_record) {
            return Ok(0);
        }

        let converted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&converted);
        let mutation: Mutation = Arc::new(move |records: &mut Vec<Record>| -> StoreResult<()> {
            let legacy = records
                .iter()
                .filter(|record| DesignerEntry::is_legacy_record(record))
                .count();
            counter.store(legacy, Ordering::Relaxed);
            if legacy > 0 {
                *records = write_entries(&entries_of(records));
            }
            Ok(())
        });
        self.backend.mutate(DatasetKey::Roster, mutation).await?;

        let converted = converted.load(Ordering::Relaxed);
        if converted > 0 {
            info!(rows = converted, "legacy roster migrated");
        }
        Ok(converted)
    }

    async fn edit<F>(&self, step: F) -> StoreResult<Vec<DesignerEntry>>
    where
        F: Fn(&mut Vec<DesignerEntry>) -> StoreResult<()> + Send + Sync + 'static,
    {
        let mutation: Mutation = Arc::new(move |records: &mut Vec<Record>| -> StoreResult<()> {
            let mut entries = entries_of(records);
            step(&mut entries)?;
            *records = write_entries(&entries);
            Ok(())
        });
        let records = self.backend.mutate(DatasetKey::Roster, mutation).await?;
        Ok(entries_of(&records))
    }
}

fn entries_of(records: &[Record]) -> Vec<DesignerEntry> {
    records.iter().filter_map(DesignerEntry::from_record).collect()
}

fn write_entries(entries: &[DesignerEntry]) -> Vec<Record> {
    entries.iter().map(DesignerEntry::to_record).collect()
}

fn position(entries: &[DesignerEntry], name: &str) -> StoreResult<usize> {
    entries
        .iter()
        .position(|entry| names_equal(&entry.name, name))
        .ok_or_else(|| StoreError::NotFound(format!("designer `{name}`")))
}

fn find(entries: &[DesignerEntry], name: &str) -> StoreResult<DesignerEntry> {
    position(entries, name).map(|index| entries[index].clone())
}
