//! Database backups
//!
//! Plain file copies of the SQLite database taken after a WAL checkpoint.
//! Automatic backups (made by the scheduler) are subject to retention cleanup;
//! manual ones are never removed automatically.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::database::{Database, DatabaseError};
use crate::notifications::NotificationStore;

const BACKUP_PREFIX: &str = "media-pipeline";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Invalid backup name: {0}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Restore failed and the live database was recovered: {0}")]
    RestoreRecovered(std::io::Error),

    #[error("Restore failed ({restore}) and recovery failed ({recovery})")]
    RestoreUnrecovered {
        restore: std::io::Error,
        recovery: std::io::Error,
    },
}

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Manual,
    Automatic,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Automatic => "automatic",
        }
    }

    fn from_name(name: &str) -> Self {
        if name.contains("_automatic_") {
            BackupKind::Automatic
        } else {
            BackupKind::Manual
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub kind: BackupKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_backups: usize,
    pub automatic_backups: usize,
    pub manual_backups: usize,
    pub total_size: u64,
    pub oldest_backup: Option<DateTime<Utc>>,
    pub newest_backup: Option<DateTime<Utc>>,
}

pub struct BackupService {
    db: Arc<Database>,
    notifications: Arc<NotificationStore>,
    backup_dir: PathBuf,
}

impl BackupService {
    pub fn new(
        db: Arc<Database>,
        notifications: Arc<NotificationStore>,
        backup_dir: impl Into<PathBuf>,
    ) -> BackupResult<Arc<Self>> {
        let backup_dir = backup_dir.into();
        std::fs::create_dir_all(&backup_dir)?;
        Ok(Arc::new(Self {
            db,
            notifications,
            backup_dir,
        }))
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Checkpoint the WAL and copy the database file. A failure is reported as
    /// degraded system health.
    pub async fn create_backup(&self, kind: BackupKind) -> BackupResult<BackupInfo> {
        match self.copy_database(kind).await {
            Ok(info) => {
                if let Err(e) = self
                    .notifications
                    .notify_backup_completed(&info.filename, info.size, kind.as_str())
                    .await
                {
                    warn!("Failed to send backup notification: {}", e);
                }
                Ok(info)
            }
            Err(e) => {
                if let Err(notify_err) = self
                    .notifications
                    .notify_system_health_degraded("backup", &format!("Backup failed: {}", e))
                    .await
                {
                    warn!("Failed to send backup failure notification: {}", notify_err);
                }
                Err(e)
            }
        }
    }

    async fn copy_database(&self, kind: BackupKind) -> BackupResult<BackupInfo> {
        let filename = format!(
            "{}_{}_{}.db",
            BACKUP_PREFIX,
            kind.as_str(),
            Local::now().format(TIMESTAMP_FORMAT)
        );
        let target = self.backup_dir.join(&filename);
        info!("Creating {} backup: {}", kind.as_str(), filename);

        if let Err(e) = self.db.checkpoint_wal().await {
            warn!("WAL checkpoint failed before backup: {}", e);
        }
        tokio::fs::copy(self.db.db_path(), &target).await?;

        let info = describe(&target, filename)?;
        info!(
            "Backup created: {} ({:.2} MB)",
            info.filename,
            info.size as f64 / 1024.0 / 1024.0
        );
        Ok(info)
    }

    /// Every `.db` file in the backup directory, newest first.
    pub fn list_backups(&self) -> BackupResult<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type()?.is_file() || !name.ends_with(".db") {
                continue;
            }
            match describe(&entry.path(), name) {
                Ok(info) => backups.push(info),
                Err(e) => warn!("Failed to stat backup {}: {}", entry.path().display(), e),
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    pub fn backup(&self, filename: &str) -> BackupResult<BackupInfo> {
        let path = self.resolve(filename)?;
        describe(&path, filename.to_string())
    }

    /// Overwrite the live database with a backup. A safety copy of the current
    /// file is taken first and copied back if the restore fails. The process
    /// should be restarted afterwards so the pool reopens the restored file.
    pub async fn restore_backup(&self, filename: &str) -> BackupResult<PathBuf> {
        let source = self.resolve(filename)?;
        let live = self.db.db_path().to_path_buf();
        info!("Restoring database from backup: {}", filename);

        if let Err(e) = self.db.checkpoint_wal().await {
            warn!("WAL checkpoint failed before restore: {}", e);
        }

        let mut safety = live.clone().into_os_string();
        safety.push(format!(".pre-restore-{}", Local::now().format(TIMESTAMP_FORMAT)));
        let safety = PathBuf::from(safety);
        tokio::fs::copy(&live, &safety).await?;
        info!("Created safety backup: {}", safety.display());

        if let Err(restore) = tokio::fs::copy(&source, &live).await {
            warn!("Restore failed, recovering from safety backup: {}", restore);
            return match tokio::fs::copy(&safety, &live).await {
                Ok(_) => Err(BackupError::RestoreRecovered(restore)),
                Err(recovery) => Err(BackupError::RestoreUnrecovered { restore, recovery }),
            };
        }

        info!("Database restored from {}", filename);
        if let Err(e) = self.notifications.notify_backup_restored(filename).await {
            warn!("Failed to send restore notification: {}", e);
        }
        Ok(safety)
    }

    pub fn delete_backup(&self, filename: &str) -> BackupResult<()> {
        let path = self.resolve(filename)?;
        std::fs::remove_file(&path)?;
        info!("Deleted backup: {}", filename);
        Ok(())
    }

    /// Remove automatic backups older than `retention_days`, always keeping the
    /// newest `keep_minimum`. Manual backups are never touched.
    pub fn cleanup_old_backups(&self, retention_days: i64, keep_minimum: usize) -> BackupResult<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let mut deleted = 0;

        let automatic = self
            .list_backups()?
            .into_iter()
            .filter(|b| b.kind == BackupKind::Automatic);
        for backup in automatic.skip(keep_minimum) {
            if backup.created_at >= cutoff {
                continue;
            }
            match self.delete_backup(&backup.filename) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete old backup {}: {}", backup.filename, e),
            }
        }

        if deleted > 0 {
            info!("Cleaned up {} old backups", deleted);
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> BackupResult<BackupStats> {
        let backups = self.list_backups()?;
        Ok(BackupStats {
            total_backups: backups.len(),
            automatic_backups: backups.iter().filter(|b| b.kind == BackupKind::Automatic).count(),
            manual_backups: backups.iter().filter(|b| b.kind == BackupKind::Manual).count(),
            total_size: backups.iter().map(|b| b.size).sum(),
            oldest_backup: backups.last().map(|b| b.created_at),
            newest_backup: backups.first().map(|b| b.created_at),
        })
    }

    /// Map a bare file name inside the backup directory to its path.
    fn resolve(&self, filename: &str) -> BackupResult<PathBuf> {
        let bare = Path::new(filename).file_name().map(|n| n == filename).unwrap_or(false);
        if !bare || filename.contains("..") || !filename.ends_with(".db") {
            return Err(BackupError::InvalidName(filename.to_string()));
        }
        let path = self.backup_dir.join(filename);
        if !path.is_file() {
            return Err(BackupError::NotFound(filename.to_string()));
        }
        Ok(path)
    }
}

fn describe(path: &Path, filename: String) -> BackupResult<BackupInfo> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(BackupInfo {
        kind: BackupKind::from_name(&filename),
        filename,
        path: path.to_path_buf(),
        size: meta.len(),
        created_at: DateTime::<Utc>::from(modified),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityBus;
    use crate::database::test_database;
    use crate::notifications::NotificationFilter;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio_util::sync::CancellationToken;

    async fn service() -> (TempDir, Arc<NotificationStore>, Arc<BackupService>) {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let bus = ActivityBus::new(db.clone(), CancellationToken::new());
        let notifications = NotificationStore::new(bus);
        let service = BackupService::new(db, notifications.clone(), dir.path().join("backups")).unwrap();
        (dir, notifications, service)
    }

    fn age(path: &Path, days: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(days * 86_400))
            .unwrap();
    }

    fn fake_backup(service: &BackupService, name: &str, days_old: u64) {
        let path = service.backup_dir().join(name);
        std::fs::write(&path, b"SQLite format 3\0").unwrap();
        age(&path, days_old);
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (_dir, notifications, service) = service().await;

        let info = service.create_backup(BackupKind::Automatic).await.unwrap();
        assert!(info.filename.starts_with("media-pipeline_automatic_"));
        assert!(info.size > 0);
        assert_eq!(info.kind, BackupKind::Automatic);

        let listed = service.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, info.filename);

        let notes = notifications.list(NotificationFilter::default()).await.unwrap();
        assert!(notes.iter().any(|n| n.kind == "backup_completed"));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (_dir, _notifications, service) = service().await;
        assert!(matches!(service.backup("../pipeline.db"), Err(BackupError::InvalidName(_))));
        assert!(matches!(service.delete_backup("a/b.db"), Err(BackupError::InvalidName(_))));
        assert!(matches!(service.backup("notes.txt"), Err(BackupError::InvalidName(_))));
        assert!(matches!(service.backup("missing.db"), Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_minimum_and_manual() {
        let (_dir, _notifications, service) = service().await;
        fake_backup(&service, "media-pipeline_automatic_a.db", 40);
        fake_backup(&service, "media-pipeline_automatic_b.db", 50);
        fake_backup(&service, "media-pipeline_automatic_c.db", 60);
        fake_backup(&service, "media-pipeline_automatic_d.db", 70);
        fake_backup(&service, "media-pipeline_automatic_e.db", 1);
        fake_backup(&service, "media-pipeline_manual_old.db", 365);

        let deleted = service.cleanup_old_backups(30, 3).unwrap();
        assert_eq!(deleted, 2);

        let mut left: Vec<String> = service.list_backups().unwrap().into_iter().map(|b| b.filename).collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "media-pipeline_automatic_a.db",
                "media-pipeline_automatic_b.db",
                "media-pipeline_automatic_e.db",
                "media-pipeline_manual_old.db",
            ]
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, _notifications, service) = service().await;
        fake_backup(&service, "media-pipeline_automatic_x.db", 2);
        fake_backup(&service, "media-pipeline_manual_y.db", 1);

        let stats = service.stats().unwrap();
        assert_eq!(stats.total_backups, 2);
        assert_eq!(stats.automatic_backups, 1);
        assert_eq!(stats.manual_backups, 1);
        assert!(stats.oldest_backup < stats.newest_backup);
    }

    #[tokio::test]
    async fn test_restore_keeps_safety_copy() {
        let (_dir, _notifications, service) = service().await;
        let info = service.create_backup(BackupKind::Manual).await.unwrap();

        let safety = service.restore_backup(&info.filename).await.unwrap();
        assert!(safety.is_file());
        assert!(safety.to_string_lossy().contains(".pre-restore-"));
        assert!(matches!(
            service.restore_backup("media-pipeline_manual_missing.db").await,
            Err(BackupError::NotFound(_))
        ));
    }
}
