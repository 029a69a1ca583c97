pub mod allocator;
pub mod config;
pub mod cto;
pub mod observability;
pub mod roster;
pub mod tags;
pub mod transport;
pub mod upload;

use std::sync::Arc;

use anyhow::{Context, Result};
use auth::SessionTracker;
use schema::DesignerEntry;
use store::{DatasetStore, FallbackBackend, HostedBackend, PersistenceBackend, StoreResult};
use tracing::info;

pub use allocator::{NewTicket, TicketAllocator};
pub use config::ViabilityConfig;
pub use cto::{CtoDirectory, NearbyCto};
pub use roster::Roster;
pub use tags::Tags;
pub use upload::{BaseInfo, UploadPipeline, UploadReport};

/// Everything a request handler needs, wired once at startup.
pub struct ViabilityService {
    pub files: Arc<DatasetStore>,
    pub backend: Arc<dyn PersistenceBackend>,
    pub sessions: Arc<SessionTracker>,
    pub allocator: TicketAllocator,
    pub roster: Roster,
    pub tags: Tags,
    pub uploads: UploadPipeline,
    pub ctos: CtoDirectory,
}

impl ViabilityService {
    pub fn new(
        files: Arc<DatasetStore>,
        backend: Arc<dyn PersistenceBackend>,
        sessions: Arc<SessionTracker>,
        ticket_prefix: &str,
    ) -> Result<Self> {
        let allocator = TicketAllocator::new(Arc::clone(&backend), ticket_prefix)
            .with_context(|| format!("invalid ticket prefix `{ticket_prefix}`"))?;
        Ok(Self {
            roster: Roster::new(Arc::clone(&backend)),
            tags: Tags::new(Arc::clone(&backend)),
            uploads: UploadPipeline::new(Arc::clone(&backend), Arc::clone(&files)),
            ctos: CtoDirectory::new(Arc::clone(&backend)),
            allocator,
            files,
            backend,
            sessions,
        })
    }

    /// Local spreadsheet store, mirrored behind the hosted tables when they
    /// are configured.
    pub fn from_config(config: &ViabilityConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
        let files = Arc::new(DatasetStore::new(
            config.data_dir.clone(),
            config.codec.build(),
            config.store_options(),
        ));
        let backend: Arc<dyn PersistenceBackend> = match &config.hosted {
            Some(hosted) => {
                let primary = HostedBackend::new(hosted.clone(), config.lock_timeout)
                    .context("build hosted backend")?;
                info!(url = %hosted.base_url, "hosted tables enabled with local fallback");
                Arc::new(FallbackBackend::new(Arc::new(primary), files.clone()))
            }
            None => files.clone(),
        };
        let sessions = Arc::new(SessionTracker::new(config.session_timeout));
        Self::new(files, backend, sessions, &config.ticket_prefix)
    }

    /// Checks credentials and opens a session on success.
    pub async fn login(&self, name: &str, secret: &str, now: u64) -> StoreResult<Option<DesignerEntry>> {
        let entry = self.roster.verify_credentials(name, secret).await?;
        if let Some(entry) = &entry {
            self.sessions.login(&entry.name, now);
            info!(designer = %entry.name, "login");
        }
        Ok(entry)
    }
}
