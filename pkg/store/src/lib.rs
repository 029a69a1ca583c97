mod backend;
mod codec;
mod dataset;
mod gate;
mod hosted;
mod naming;

use std::{fmt, time::Duration};

use schema::{CTO_COLUMNS, LEDGER_COLUMNS, ROSTER_COLUMNS, TAG_COLUMNS, ValidationError};
use thiserror::Error;

pub use backend::{FallbackBackend, Mutation, PersistenceBackend};
pub use codec::{CodecError, CodecKind, DelimitedCodec, RecordCodec, XlsxCodec};
pub use dataset::{
    DEFAULT_BACKUP_RETENTION, DatasetStore, ReplaceReport, SnapshotInfo, StoreOptions,
};
pub use gate::{ContentionSnapshot, DEFAULT_LOCK_TIMEOUT, DatasetGate, GateGuard};
pub use hosted::{BATCH_COLUMN, HostedBackend, HostedConfig};
pub use naming::{NamingScheme, SnapshotFile, SnapshotKind, SnapshotName, SnapshotNamer};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timed out after {waited:?} waiting for dataset `{key}`")]
    LockTimeout { key: String, waited: Duration },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("hosted backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Failures of the storage medium itself, as opposed to failures caused
    /// by the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Codec(_) | Self::Backend(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The independently persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatasetKey {
    Roster,
    Tags,
    Ledger,
    CtoBase,
}

impl DatasetKey {
    pub const ALL: [DatasetKey; 4] = [Self::Roster, Self::Tags, Self::Ledger, Self::CtoBase];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Roster => "roster",
            Self::Tags => "tags",
            Self::Ledger => "ledger",
            Self::CtoBase => "cto_base",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Roster => &ROSTER_COLUMNS,
            Self::Tags => &TAG_COLUMNS,
            Self::Ledger => &LEDGER_COLUMNS,
            Self::CtoBase => &CTO_COLUMNS,
        }
    }

    pub fn naming_scheme(self) -> NamingScheme {
        match self {
            Self::Roster => NamingScheme::Fixed {
                stem: "projetistas",
                backup_prefix: "backup_projetistas_",
            },
            Self::Tags => NamingScheme::Fixed {
                stem: "tabulacoes",
                backup_prefix: "backup_tabulacoes_",
            },
            Self::Ledger => NamingScheme::Fixed {
                stem: "base_VI ALA",
                backup_prefix: "backup_VI ALA_",
            },
            Self::CtoBase => NamingScheme::Rotating {
                current_prefix: "base_atual_",
                backup_prefix: "backup_",
                legacy_stem: "base",
            },
        }
    }

    pub fn hosted_table(self) -> &'static str {
        match self {
            Self::Roster => "projetistas",
            Self::Tags => "tabulacoes",
            Self::Ledger => "vi_ala",
            Self::CtoBase => "base_cto",
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
