use crate::credentials::store::{CredentialStore, SnapshotInfo, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

/// Configuration for periodic credential snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub interval_ms: u64,
    pub retention: usize,
    /// Store snapshots gzip-compressed
    pub compress: bool,
}

impl BackupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000, // 5 minutes
            retention: 5,
            compress: false,
        }
    }
}

/// Outcome of one rotation
#[derive(Debug, Clone)]
pub struct BackupCycle {
    pub snapshot: Option<SnapshotInfo>,
    pub evicted: usize,
}

/// Take one snapshot and trim the set back to `retention`
pub async fn run_backup_cycle(
    store: &CredentialStore,
    retention: usize,
) -> Result<BackupCycle, StoreError> {
    let snapshot = store.snapshot().await?;
    let evicted = store.enforce_retention(retention).await?;
    Ok(BackupCycle { snapshot, evicted })
}

/// Background snapshot rotation; stops when dropped
#[derive(Debug)]
pub struct BackupScheduler {
    task: JoinHandle<()>,
}

impl BackupScheduler {
    /// Start rotating snapshots every `config.interval()`, first run one interval from now
    pub fn start(store: Arc<CredentialStore>, config: &BackupConfig) -> Self {
        let period = config.interval();
        let retention = config.retention;

        let task = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;

                match run_backup_cycle(&store, retention).await {
                    Ok(cycle) => debug!(
                        "Backup cycle completed: snapshot={:?}, evicted={}",
                        cycle.snapshot.map(|s| s.id),
                        cycle.evicted
                    ),
                    Err(e) => error!("Credential backup failed, skipping this cycle: {}", e),
                }
            }
        });

        info!(
            "Credential backups started with interval: {} ms, retention: {}",
            period.as_millis(),
            retention
        );
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
        debug!("Credential backups stopped");
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}
