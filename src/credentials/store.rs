use crate::credentials::material::Credentials;
use crate::env;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use regex::Regex;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

static SNAPSHOT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(creds-\d{8}T\d{12}Z)\.json(\.gz)?$").expect("snapshot name pattern is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential material at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode credential material: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::PermissionDenied {
            Self::Unavailable {
                path: path.to_path_buf(),
                source,
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// One entry of the snapshot set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: String,
    pub path: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub compressed: bool,
}

#[derive(Debug, Default)]
struct StoreIo {
    last_snapshot_at: Option<DateTime<Utc>>,
}

/// Durable credential material plus its rotating snapshot set.
///
/// Every operation takes the same async lock, so credential writes from the
/// session and the backup rotation never interleave on disk.
#[derive(Debug)]
pub struct CredentialStore {
    dir: PathBuf,
    compress_snapshots: bool,
    io: Mutex<StoreIo>,
}

impl CredentialStore {
    /// Open (and create if needed) the credential directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Unavailable {
            path: dir.clone(),
            source,
        })?;

        debug!("Credential store opened at {}", dir.display());
        Ok(Self {
            dir,
            compress_snapshots: false,
            io: Mutex::new(StoreIo::default()),
        })
    }

    pub fn with_compressed_snapshots(mut self, compress: bool) -> Self {
        self.compress_snapshots = compress;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read persisted material, starting fresh when none exists.
    ///
    /// Malformed primary material is replaced by the newest readable snapshot,
    /// or by fresh material when no snapshot can be read.
    pub async fn load(&self) -> Result<Credentials, StoreError> {
        let _io = self.io.lock().await;
        let path = env::creds_file_path(&self.dir);

        let content = match async_fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No stored credentials, starting with fresh material");
                return Ok(Credentials::fresh());
            }
            Err(source) => return Err(StoreError::Unavailable { path, source }),
        };

        match serde_json::from_slice::<Credentials>(&content) {
            Ok(credentials) => {
                debug!("Loaded credentials from {}", path.display());
                Ok(credentials)
            }
            Err(e) => {
                warn!(
                    "Stored credentials at {} are malformed ({}), looking for a snapshot",
                    path.display(),
                    e
                );
                match self.newest_readable_snapshot().await {
                    Some((snapshot, credentials)) => {
                        self.write_primary(&credentials).await?;
                        info!("Recovered credentials from snapshot {}", snapshot.id);
                        Ok(credentials)
                    }
                    None => {
                        warn!("No usable snapshot, starting with fresh material");
                        Ok(Credentials::fresh())
                    }
                }
            }
        }
    }

    /// Persist changed material before returning
    pub async fn on_change(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let _io = self.io.lock().await;
        self.write_primary(credentials).await?;
        debug!("Credentials saved to {}", self.dir.display());
        Ok(())
    }

    /// Replace the primary material with fresh, unpaired material.
    ///
    /// Snapshots are kept; only the next session has to pair again.
    pub async fn forget_pairing(&self) -> Result<(), StoreError> {
        let _io = self.io.lock().await;
        self.write_primary(&Credentials::fresh()).await?;
        info!("Pairing cleared in {}", self.dir.display());
        Ok(())
    }

    /// Delete all material, snapshots included, and recreate an empty store.
    ///
    /// Failures are logged and never returned.
    pub async fn wipe(&self) {
        let mut io = self.io.lock().await;
        io.last_snapshot_at = None;

        match async_fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("Failed to wipe credentials at {}: {}", self.dir.display(), e),
        }

        if let Err(e) = async_fs::create_dir_all(&self.dir).await {
            error!(
                "Failed to recreate credential directory {}: {}",
                self.dir.display(),
                e
            );
            return;
        }

        info!("Credential store wiped: {}", self.dir.display());
    }

    /// True when the store holds no files at all
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        let _io = self.io.lock().await;
        let mut entries = match async_fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let first = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;
        Ok(first.is_none())
    }

    /// Copy the primary artifact into the snapshot set.
    ///
    /// Returns `None` when there is nothing to back up yet.
    pub async fn snapshot(&self) -> Result<Option<SnapshotInfo>, StoreError> {
        let mut io = self.io.lock().await;
        let source = env::creds_file_path(&self.dir);

        let exists = async_fs::try_exists(&source)
            .await
            .map_err(|e| StoreError::io(&source, e))?;
        if !exists {
            debug!("No credentials to back up yet");
            return Ok(None);
        }

        // Names must sort in creation order even within one clock tick
        let mut taken_at = Utc::now().trunc_subsecs(6);
        if let Some(last) = io.last_snapshot_at
            && taken_at <= last
        {
            taken_at = last + chrono::Duration::microseconds(1);
        }

        let id = format!(
            "{}{}",
            env::credentials::SNAPSHOT_PREFIX,
            taken_at.format(env::credentials::SNAPSHOT_TIMESTAMP_FORMAT)
        );
        let backups_dir = env::backups_dir_path(&self.dir);
        async_fs::create_dir_all(&backups_dir)
            .await
            .map_err(|e| StoreError::io(&backups_dir, e))?;

        let dest = env::snapshot_file_path(&self.dir, &id, self.compress_snapshots);
        let size_bytes = if self.compress_snapshots {
            let content = async_fs::read(&source)
                .await
                .map_err(|e| StoreError::io(&source, e))?;
            let compressed = compress(&content).map_err(|e| StoreError::io(&dest, e))?;
            async_fs::write(&dest, &compressed)
                .await
                .map_err(|e| StoreError::io(&dest, e))?;
            compressed.len() as u64
        } else {
            async_fs::copy(&source, &dest)
                .await
                .map_err(|e| StoreError::io(&dest, e))?
        };

        io.last_snapshot_at = Some(taken_at);
        info!("Credential snapshot created: {} ({} bytes)", id, size_bytes);

        Ok(Some(SnapshotInfo {
            id,
            path: dest,
            created_at: Some(taken_at),
            size_bytes,
            compressed: self.compress_snapshots,
        }))
    }

    /// Delete the oldest snapshots until at most `limit` remain
    pub async fn enforce_retention(&self, limit: usize) -> Result<usize, StoreError> {
        let _io = self.io.lock().await;
        let snapshots = self.list_snapshots_unlocked().await?;

        let excess = snapshots.len().saturating_sub(limit);
        for snapshot in snapshots.iter().take(excess) {
            async_fs::remove_file(&snapshot.path)
                .await
                .map_err(|e| StoreError::io(&snapshot.path, e))?;
            debug!("Evicted credential snapshot: {}", snapshot.id);
        }

        if excess > 0 {
            info!("Evicted {} old credential snapshots", excess);
        }
        Ok(excess)
    }

    /// List snapshots, oldest first
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, StoreError> {
        let _io = self.io.lock().await;
        self.list_snapshots_unlocked().await
    }

    /// Replace the primary credentials with the content of a snapshot
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<Credentials, StoreError> {
        let _io = self.io.lock().await;
        let snapshot = self
            .list_snapshots_unlocked()
            .await?
            .into_iter()
            .find(|snapshot| snapshot.id == snapshot_id)
            .ok_or_else(|| StoreError::SnapshotNotFound(snapshot_id.to_string()))?;

        let credentials = read_snapshot(&snapshot).await?;
        self.write_primary(&credentials).await?;

        info!("Restored credentials from snapshot: {}", snapshot.id);
        Ok(credentials)
    }

    async fn list_snapshots_unlocked(&self) -> Result<Vec<SnapshotInfo>, StoreError> {
        let backups_dir = env::backups_dir_path(&self.dir);
        let mut entries = match async_fs::read_dir(&backups_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&backups_dir, e)),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&backups_dir, e))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(captures) = SNAPSHOT_NAME.captures(name) else {
                continue;
            };

            let id = captures[1].to_string();
            let compressed = captures.get(2).is_some();
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);

            snapshots.push(SnapshotInfo {
                created_at: parse_snapshot_time(&id),
                id,
                path,
                size_bytes,
                compressed,
            });
        }

        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    async fn newest_readable_snapshot(&self) -> Option<(SnapshotInfo, Credentials)> {
        let snapshots = match self.list_snapshots_unlocked().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!("Failed to list credential snapshots: {}", e);
                return None;
            }
        };

        for snapshot in snapshots.into_iter().rev() {
            match read_snapshot(&snapshot).await {
                Ok(credentials) => return Some((snapshot, credentials)),
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", snapshot.id, e),
            }
        }
        None
    }

    /// Atomically replace the primary artifact (temp file, fsync, rename)
    async fn write_primary(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec_pretty(credentials).map_err(StoreError::Encode)?;

        async_fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let temp_path = env::creds_temp_file_path(&self.dir);
        let final_path = env::creds_file_path(&self.dir);

        let mut file = async_fs::File::create(&temp_path)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(&serialized)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        async_fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| StoreError::io(&final_path, e))?;
        Ok(())
    }
}

async fn read_snapshot(snapshot: &SnapshotInfo) -> Result<Credentials, StoreError> {
    let raw = async_fs::read(&snapshot.path)
        .await
        .map_err(|e| StoreError::io(&snapshot.path, e))?;
    let content = if snapshot.compressed {
        decompress(&raw).map_err(|e| StoreError::io(&snapshot.path, e))?
    } else {
        raw
    };

    serde_json::from_slice(&content).map_err(|source| StoreError::Malformed {
        path: snapshot.path.clone(),
        source,
    })
}

fn parse_snapshot_time(id: &str) -> Option<DateTime<Utc>> {
    let stamp = id.strip_prefix(env::credentials::SNAPSHOT_PREFIX)?;
    NaiveDateTime::parse_from_str(stamp, env::credentials::SNAPSHOT_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut content = Vec::new();
    decoder.read_to_end(&mut content)?;
    Ok(content)
}
