use std::sync::Arc;

use chrono::Local;
use schema::{
    LEDGER_COLUMNS, Record, TicketEntry, TicketIdPattern, ValidationError, validate_ticket,
};
use serde::Deserialize;
use store::{DatasetKey, Mutation, PersistenceBackend, StoreError, StoreResult};
use tracing::{info, warn};

const LEDGER_DATE_FORMAT: &str = "%d/%m/%Y";

/// Next free sequence number: one past the highest id in the ledger. Rows
/// whose id does not parse are ignored.
pub fn next_sequence(records: &[Record], pattern: &TicketIdPattern) -> u64 {
    records
        .iter()
        .filter_map(|record| record.lookup(LEDGER_COLUMNS[0]))
        .filter_map(|value| pattern.parse_sequence(&value.as_text()))
        .max()
        .map_or(1, |max| max.saturating_add(1))
}

/// A ticket submitted for the ledger. `proposed_id` is whatever the client
/// was shown by a preview and is only advisory.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewTicket {
    #[serde(default)]
    pub proposed_id: Option<String>,
    #[serde(default)]
    pub sub_area: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

pub struct TicketAllocator {
    backend: Arc<dyn PersistenceBackend>,
    pattern: TicketIdPattern,
}

impl TicketAllocator {
    pub fn new(backend: Arc<dyn PersistenceBackend>, prefix: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            backend,
            pattern: TicketIdPattern::new(prefix)?,
        })
    }

    pub fn prefix(&self) -> &str {
        self.pattern.prefix()
    }

    /// Id the next commit would get if nothing else commits first. Does not
    /// wait for writers.
    pub async fn preview(&self) -> StoreResult<String> {
        let records = self.backend.peek(DatasetKey::Ledger).await?;
        Ok(self.pattern.format(next_sequence(&records, &self.pattern)))
    }

    /// Appends the ticket with a sequence number chosen while the ledger is
    /// locked, so concurrent commits never share an id.
    pub async fn commit(&self, ticket: NewTicket) -> StoreResult<TicketEntry> {
        let template = TicketEntry {
            ticket_id: String::new(),
            sub_area: ticket.sub_area.trim().to_string(),
            date: ticket
                .date
                .map(|date| date.trim().to_string())
                .filter(|date| !date.is_empty())
                .unwrap_or_else(|| Local::now().format(LEDGER_DATE_FORMAT).to_string()),
            operator: ticket.operator.trim().to_string(),
            city: ticket.city.trim().to_string(),
            address: ticket.address.trim().to_string(),
            latitude: ticket.latitude,
            longitude: ticket.longitude,
        };
        validate_ticket(&template)?;

        let pattern = self.pattern.clone();
        let proposed = ticket.proposed_id.map(|id| id.trim().to_string());
        let mutation: Mutation = Arc::new(move |records: &mut Vec<Record>| -> StoreResult<()> {
            let allocated = pattern.format(next_sequence(records, &pattern));
            if let Some(proposed) = proposed.as_deref()
                && proposed != allocated
            {
                warn!(proposed, allocated = %allocated, "proposed ticket id was taken, using the next free one");
            }
            let mut entry = template.clone();
            entry.ticket_id = allocated;
            records.push(entry.to_record());
            Ok(())
        });

        let records = self.backend.mutate(DatasetKey::Ledger, mutation).await?;
        let entry = records
            .last()
            .map(TicketEntry::from_record)
            .ok_or_else(|| StoreError::Backend("ledger came back empty after append".to_string()))?;
        info!(ticket = %entry.ticket_id, operator = %entry.operator, "ticket committed");
        Ok(entry)
    }

    /// Ledger entries, newest first.
    pub async fn list(&self) -> StoreResult<Vec<TicketEntry>> {
        let records = self.backend.read(DatasetKey::Ledger).await?;
        Ok(records.iter().rev().map(TicketEntry::from_record).collect())
    }

    pub async fn for_operator(&self, operator: &str) -> StoreResult<Vec<TicketEntry>> {
        let mut entries = self.list().await?;
        entries.retain(|entry| schema::names_equal(&entry.operator, operator));
        Ok(entries)
    }
}
