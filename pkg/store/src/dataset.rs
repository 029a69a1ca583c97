use std::{
    cmp::Reverse,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use chrono::Local;
use schema::Record;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::{
    DatasetKey, StoreError, StoreResult,
    codec::RecordCodec,
    gate::{DEFAULT_LOCK_TIMEOUT, DatasetGate},
    naming::{NamingScheme, SnapshotFile, SnapshotKind, SnapshotNamer},
};

pub const DEFAULT_BACKUP_RETENTION: usize = 5;

const READ_RESCAN_DELAY: Duration = Duration::from_millis(10);

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub backup_retention: usize,
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            backup_retention: DEFAULT_BACKUP_RETENTION,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub file_name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl From<&SnapshotFile> for SnapshotInfo {
    fn from(file: &SnapshotFile) -> Self {
        Self {
            file_name: file.file_name.clone(),
            path: file.path.clone(),
            modified: file.modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceReport {
    pub dataset: DatasetKey,
    pub records: usize,
    pub current: String,
    pub demoted: Option<String>,
    pub removed_stale: usize,
    pub pruned: usize,
}

/// File-backed tables, one directory for all datasets. Every operation on a
/// dataset except [`DatasetStore::read_ungated`] holds that dataset's gate.
pub struct DatasetStore {
    root: PathBuf,
    codec: Arc<dyn RecordCodec>,
    gate: DatasetGate,
    backup_retention: usize,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>, codec: Arc<dyn RecordCodec>, options: StoreOptions) -> Self {
        Self {
            root: root.into(),
            codec,
            gate: DatasetGate::new(options.lock_timeout),
            backup_retention: options.backup_retention,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn codec(&self) -> &Arc<dyn RecordCodec> {
        &self.codec
    }

    pub fn gate(&self) -> &DatasetGate {
        &self.gate
    }

    pub fn namer(&self, key: DatasetKey) -> SnapshotNamer {
        SnapshotNamer::new(key.naming_scheme(), self.codec.extension())
    }

    pub async fn read(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        let _guard = self.gate.acquire(key.as_str()).await?;
        self.read_unlocked(key).await
    }

    /// Reads without waiting for writers. The result may be stale by the time
    /// it is used.
    pub async fn read_ungated(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        self.read_unlocked(key).await
    }

    /// Returns the number of records after the append.
    pub async fn append(&self, key: DatasetKey, record: Record) -> StoreResult<usize> {
        self.update(key, move |records| {
            records.push(record);
            Ok(records.len())
        })
        .await
    }

    /// Read-modify-write under the gate. When `mutate` fails nothing is
    /// written.
    pub async fn update<T, F>(&self, key: DatasetKey, mutate: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Vec<Record>) -> StoreResult<T>,
    {
        let _guard = self.gate.acquire(key.as_str()).await?;
        let mut records = self.read_unlocked(key).await?;
        let output = mutate(&mut records)?;
        self.replace_unlocked(key, &records).await?;
        Ok(output)
    }

    pub async fn replace(&self, key: DatasetKey, records: &[Record]) -> StoreResult<ReplaceReport> {
        let _guard = self.gate.acquire(key.as_str()).await?;
        self.replace_unlocked(key, records).await
    }

    pub async fn current_snapshot(&self, key: DatasetKey) -> StoreResult<Option<SnapshotInfo>> {
        let _guard = self.gate.acquire(key.as_str()).await?;
        let namer = self.namer(key);
        let listing = self.scan(&namer).await?;
        Ok(namer.select_current(&listing).map(SnapshotInfo::from))
    }

    /// Backups of `key`, newest first.
    pub async fn backups(&self, key: DatasetKey) -> StoreResult<Vec<SnapshotInfo>> {
        let _guard = self.gate.acquire(key.as_str()).await?;
        let namer = self.namer(key);
        let listing = self.scan(&namer).await?;
        Ok(namer
            .backups(&listing)
            .into_iter()
            .map(SnapshotInfo::from)
            .collect())
    }

    // ----- Directory scan -----

    async fn scan(&self, namer: &SnapshotNamer) -> StoreResult<Vec<SnapshotFile>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(name) = namer.classify(&file_name) else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(err) => {
                    debug!(file = %file_name, error = %err, "skipping unreadable directory entry");
                    continue;
                }
            };
            listing.push(SnapshotFile {
                path: entry.path(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                file_name,
                name,
            });
        }
        Ok(listing)
    }

    // ----- Read path -----

    /// Publishing swaps files by rename, so a scan can briefly miss the
    /// current snapshot. One rescan covers a vanished file, or an empty
    /// selection while backups exist.
    async fn read_unlocked(&self, key: DatasetKey) -> StoreResult<Vec<Record>> {
        let namer = self.namer(key);
        let mut rescanned = false;
        loop {
            let listing = self.scan(&namer).await?;
            let Some(current) = namer.select_current(&listing) else {
                if rescanned || namer.select_newest_backup(&listing).is_none() {
                    return Ok(Vec::new());
                }
                debug!(dataset = %key, "no current snapshot beside backups, rescanning");
                rescanned = true;
                tokio::time::sleep(READ_RESCAN_DELAY).await;
                continue;
            };
            match fs::read(&current.path).await {
                Ok(bytes) => return Ok(self.decode_lenient(key, &current.file_name, bytes).await),
                Err(err) if err.kind() == ErrorKind::NotFound && !rescanned => {
                    debug!(dataset = %key, file = %current.file_name, "snapshot vanished during read, rescanning");
                    rescanned = true;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    warn!(dataset = %key, file = %current.file_name, "snapshot vanished twice during read");
                    return Ok(Vec::new());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn decode_lenient(&self, key: DatasetKey, file_name: &str, bytes: Vec<u8>) -> Vec<Record> {
        let codec = Arc::clone(&self.codec);
        match tokio::task::spawn_blocking(move || codec.decode(&bytes)).await {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                warn!(dataset = %key, file = file_name, error = %err, "snapshot could not be decoded, treating dataset as empty");
                Vec::new()
            }
            Err(err) => {
                warn!(dataset = %key, file = file_name, error = %err, "decode task failed, treating dataset as empty");
                Vec::new()
            }
        }
    }

    // ----- Replace path -----

    async fn replace_unlocked(&self, key: DatasetKey, records: &[Record]) -> StoreResult<ReplaceReport> {
        let namer = self.namer(key);
        fs::create_dir_all(&self.root).await?;
        self.remove_leftover_temp_files(key).await;

        let payload = self.encode(key, records).await?;
        let tmp_path = self.temp_path(key);
        if let Err(err) = write_synced(&tmp_path, &payload).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        let today = Local::now().date_naive();
        let listing = match self.scan(&namer).await {
            Ok(listing) => listing,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        let mut currents: Vec<&SnapshotFile> = listing
            .iter()
            .filter(|file| file.name.kind == SnapshotKind::Current)
            .collect();
        currents.sort_by_key(|file| Reverse(file.recency()));
        let previous = currents
            .first()
            .copied()
            .or_else(|| namer.select_current(&listing));

        let current_name = namer.current_name(
            today,
            match namer.scheme() {
                NamingScheme::Fixed { .. } => 1,
                NamingScheme::Rotating { .. } => {
                    namer.next_ordinal(&listing, SnapshotKind::Current, today)
                }
            },
        );
        let current_path = self.root.join(&current_name);
        let backup_path = self.root.join(namer.backup_name(
            today,
            namer.next_ordinal(&listing, SnapshotKind::Backup, today),
        ));

        // A fixed-name current is overwritten in place, so its backup is a
        // copy taken before the rename.
        let mut demoted: Option<PathBuf> = None;
        if let Some(previous) = previous
            && previous.path == current_path
        {
            match fs::copy(&previous.path, &backup_path).await {
                Ok(_) => {
                    debug!(dataset = %key, from = %previous.file_name, to = %backup_path.display(), "copied current snapshot to backup");
                    demoted = Some(backup_path.clone());
                }
                Err(err) => {
                    warn!(dataset = %key, file = %previous.file_name, error = %err, "could not back up current snapshot");
                }
            }
        }

        if let Err(err) = fs::rename(&tmp_path, &current_path).await {
            error!(dataset = %key, file = %current_name, error = %err, "could not publish snapshot");
            let _ = fs::remove_file(&tmp_path).await;
            if let Some(backup) = demoted.take() {
                let _ = fs::remove_file(&backup).await;
            }
            return Err(err.into());
        }

        if let Some(previous) = previous
            && previous.path != current_path
        {
            match demote(&previous.path, &backup_path).await {
                Ok(()) => {
                    debug!(dataset = %key, from = %previous.file_name, to = %backup_path.display(), "demoted current snapshot");
                    demoted = Some(backup_path.clone());
                }
                Err(err) => {
                    warn!(dataset = %key, file = %previous.file_name, error = %err, "could not demote current snapshot");
                }
            }
        }

        let mut removed_stale = 0usize;
        for stale in currents.iter().skip(1) {
            if stale.path == current_path {
                continue;
            }
            match fs::remove_file(&stale.path).await {
                Ok(()) => removed_stale += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(dataset = %key, file = %stale.file_name, error = %err, "could not remove stale current snapshot");
                }
            }
        }

        let pruned = self.prune_backups(key, &namer).await;
        let demoted = demoted.and_then(|backup| {
            backup
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
        });
        info!(
            dataset = %key,
            file = %current_name,
            records = records.len(),
            demoted = demoted.as_deref().unwrap_or("-"),
            removed_stale,
            pruned,
            "published snapshot"
        );
        Ok(ReplaceReport {
            dataset: key,
            records: records.len(),
            current: current_name,
            demoted,
            removed_stale,
            pruned,
        })
    }

    async fn encode(&self, key: DatasetKey, records: &[Record]) -> StoreResult<Vec<u8>> {
        let codec = Arc::clone(&self.codec);
        let records = records.to_vec();
        let columns = key.columns();
        tokio::task::spawn_blocking(move || codec.encode(&records, columns))
            .await
            .map_err(|err| StoreError::Io(std::io::Error::other(err)))?
            .map_err(StoreError::from)
    }

    async fn prune_backups(&self, key: DatasetKey, namer: &SnapshotNamer) -> usize {
        let listing = match self.scan(namer).await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(dataset = %key, error = %err, "could not list backups for pruning");
                return 0;
            }
        };
        let mut pruned = 0usize;
        for stale in namer.backups_to_prune(&listing, self.backup_retention) {
            match fs::remove_file(&stale.path).await {
                Ok(()) => pruned += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(dataset = %key, file = %stale.file_name, error = %err, "could not prune backup");
                }
            }
        }
        pruned
    }

    fn temp_prefix(key: DatasetKey) -> String {
        format!(".{}-", key.as_str())
    }

    fn temp_path(&self, key: DatasetKey) -> PathBuf {
        let sequence = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}{}-{sequence}.tmp",
            Self::temp_prefix(key),
            std::process::id()
        ))
    }

    async fn remove_leftover_temp_files(&self, key: DatasetKey) {
        let prefix = Self::temp_prefix(key);
        let Ok(mut entries) = fs::read_dir(&self.root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !file_name.starts_with(&prefix) || !file_name.ends_with(".tmp") {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => debug!(dataset = %key, file = %file_name, "removed leftover temp file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(dataset = %key, file = %file_name, error = %err, "could not remove leftover temp file"),
            }
        }
    }
}

async fn write_synced(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    Ok(())
}

async fn demote(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(file = %from.display(), error = %err, "rename failed, falling back to copy and delete");
            fs::copy(from, to).await?;
            if let Err(err) = fs::remove_file(from).await {
                let _ = fs::remove_file(to).await;
                return Err(err);
            }
            Ok(())
        }
    }
}
