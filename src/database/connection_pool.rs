//! SQLite connection pool
//!
//! Separate read and write pools gated by semaphores:
//! 1. WAL mode so readers never block the single-file writer
//! 2. Per-connection pragmas (busy timeout, foreign keys, cache)
//! 3. Idle connections are validated and recycled, stale ones dropped
//! 4. Guards hand their connection back to the idle list on drop

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, Error as SqliteError, OpenFlags};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection timeout after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl From<SqliteError> for PoolError {
    fn from(error: SqliteError) -> Self {
        PoolError::Database(error.to_string())
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_read_connections: usize,
    pub max_write_connections: usize,
    /// Idle connections kept per side; extra connections are closed when returned
    pub max_idle_connections: usize,
    pub connection_timeout: Duration,
    pub max_idle_time: Duration,
    pub busy_timeout: Duration,
    pub enable_wal_mode: bool,
    pub pragmas: Vec<(String, String)>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_read_connections: 4,
            max_write_connections: 1,
            max_idle_connections: 4,
            connection_timeout: Duration::from_secs(10),
            max_idle_time: Duration::from_secs(300),
            busy_timeout: Duration::from_secs(5),
            enable_wal_mode: true,
            pragmas: vec![
                ("foreign_keys".to_string(), "ON".to_string()),
                ("synchronous".to_string(), "NORMAL".to_string()),
                ("cache_size".to_string(), "-16000".to_string()),
                ("temp_store".to_string(), "MEMORY".to_string()),
            ],
        }
    }
}

impl PoolConfig {
    /// Map the idle/open caps from the environment onto the two pools.
    pub fn from_caps(max_idle: usize, max_open: usize) -> Self {
        let open = max_open.max(2);
        Self {
            max_read_connections: (open - 1).min(16),
            max_write_connections: 1,
            max_idle_connections: max_idle.max(1),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct PooledConnection {
    connection: Connection,
    last_used: Instant,
    use_count: usize,
    is_readonly: bool,
}

impl PooledConnection {
    fn new(connection: Connection, is_readonly: bool) -> Self {
        Self {
            connection,
            last_used: Instant::now(),
            use_count: 0,
            is_readonly,
        }
    }

    pub fn is_stale(&self, max_idle: Duration) -> bool {
        self.last_used.elapsed() > max_idle
    }

    pub fn validate(&self) -> PoolResult<()> {
        self.connection
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| {
                error!("Connection validation failed: {}", e);
                PoolError::Database(e.to_string())
            })
    }
}

#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    pub total_read_connections: usize,
    pub total_write_connections: usize,
    pub active_read_connections: usize,
    pub active_write_connections: usize,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub connection_timeouts: u64,
    pub connection_errors: u64,
}

type IdleList = Arc<Mutex<Vec<PooledConnection>>>;

pub struct DatabasePool {
    db_path: PathBuf,
    config: PoolConfig,
    read_connections: IdleList,
    write_connections: IdleList,
    read_semaphore: Semaphore,
    write_semaphore: Semaphore,
    is_shutdown: Arc<AtomicBool>,
    stats: Arc<RwLock<PoolStats>>,
    checkouts: AtomicUsize,
}

impl DatabasePool {
    pub fn new(db_path: impl AsRef<Path>, config: PoolConfig) -> PoolResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if config.max_read_connections == 0 {
            return Err(PoolError::InvalidConfig("max_read_connections must be > 0".to_string()));
        }
        if config.max_write_connections == 0 {
            return Err(PoolError::InvalidConfig("max_write_connections must be > 0".to_string()));
        }

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PoolError::InvalidConfig(format!("Failed to create directory: {}", e)))?;
            }
        }

        let pool = Self {
            db_path,
            read_semaphore: Semaphore::new(config.max_read_connections),
            write_semaphore: Semaphore::new(config.max_write_connections),
            config,
            read_connections: Arc::new(Mutex::new(Vec::new())),
            write_connections: Arc::new(Mutex::new(Vec::new())),
            is_shutdown: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(PoolStats::default())),
            checkouts: AtomicUsize::new(0),
        };

        pool.init_database()?;

        info!(
            read = pool.config.max_read_connections,
            write = pool.config.max_write_connections,
            path = %pool.db_path.display(),
            "Database pool initialized"
        );

        Ok(pool)
    }

    fn init_database(&self) -> PoolResult<()> {
        let conn = self.create_raw_connection(false)?;

        if self.config.enable_wal_mode {
            let mode: String = conn
                .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
                .map_err(|e| PoolError::Database(format!("Failed to set journal_mode=WAL: {}", e)))?;
            debug!("Journal mode set to: {}", mode);
        }

        Ok(())
    }

    fn apply_pragmas(&self, conn: &Connection) {
        if let Err(e) = conn.busy_timeout(self.config.busy_timeout) {
            warn!("Failed to set busy timeout: {}", e);
        }
        for (pragma, value) in &self.config.pragmas {
            if let Err(e) = conn.pragma_update(None, pragma, value) {
                warn!("Failed to set pragma {} = {}: {}", pragma, value, e);
            }
        }
    }

    fn create_raw_connection(&self, readonly: bool) -> PoolResult<Connection> {
        let conn = if readonly {
            Connection::open_with_flags(
                &self.db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open(&self.db_path)?
        };

        self.apply_pragmas(&conn);
        self.stats.write().connections_created += 1;

        debug!("Created {} connection", if readonly { "read" } else { "write" });
        Ok(conn)
    }

    pub async fn get_read_connection(&self) -> PoolResult<PooledConnectionGuard<'_>> {
        self.checkout(true).await
    }

    pub async fn get_write_connection(&self) -> PoolResult<PooledConnectionGuard<'_>> {
        self.checkout(false).await
    }

    async fn checkout(&self, readonly: bool) -> PoolResult<PooledConnectionGuard<'_>> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }

        let semaphore = if readonly { &self.read_semaphore } else { &self.write_semaphore };
        let permit = match timeout(self.config.connection_timeout, semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::ShuttingDown),
            Err(_) => {
                self.stats.write().connection_timeouts += 1;
                return Err(PoolError::ConnectionTimeout(self.config.connection_timeout));
            }
        };

        let connection = self.acquire_connection(readonly)?;
        self.checkouts.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnectionGuard {
            connection: Some(connection),
            _permit: permit,
            idle: if readonly { self.read_connections.clone() } else { self.write_connections.clone() },
            idle_cap: self.config.max_idle_connections,
            is_shutdown: self.is_shutdown.clone(),
            pool_stats: self.stats.clone(),
        })
    }

    fn acquire_connection(&self, readonly: bool) -> PoolResult<PooledConnection> {
        let idle = if readonly { &self.read_connections } else { &self.write_connections };

        loop {
            let Some(conn) = idle.lock().pop() else { break };

            if conn.is_stale(self.config.max_idle_time) {
                self.stats.write().connections_destroyed += 1;
                continue;
            }
            if conn.validate().is_ok() {
                self.mark_active(readonly, false);
                return Ok(conn);
            }

            let mut stats = self.stats.write();
            stats.connections_destroyed += 1;
            stats.connection_errors += 1;
        }

        match self.create_raw_connection(readonly) {
            Ok(raw) => {
                self.mark_active(readonly, true);
                Ok(PooledConnection::new(raw, readonly))
            }
            Err(e) => {
                self.stats.write().connection_errors += 1;
                Err(e)
            }
        }
    }

    fn mark_active(&self, readonly: bool, created: bool) {
        let mut stats = self.stats.write();
        if readonly {
            stats.active_read_connections += 1;
            if created {
                stats.total_read_connections += 1;
            }
        } else {
            stats.active_write_connections += 1;
            if created {
                stats.total_write_connections += 1;
            }
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_stats(&self) -> PoolStats {
        self.stats.read().clone()
    }

    pub fn total_checkouts(&self) -> usize {
        self.checkouts.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::Release);
        self.read_semaphore.close();
        self.write_semaphore.close();

        let read_count = std::mem::take(&mut *self.read_connections.lock()).len();
        let write_count = std::mem::take(&mut *self.write_connections.lock()).len();
        self.stats.write().connections_destroyed += (read_count + write_count) as u64;

        info!("Database pool shutdown complete");
    }
}

/// RAII guard for pooled connections
pub struct PooledConnectionGuard<'a> {
    connection: Option<PooledConnection>,
    _permit: SemaphorePermit<'a>,
    idle: IdleList,
    idle_cap: usize,
    is_shutdown: Arc<AtomicBool>,
    pool_stats: Arc<RwLock<PoolStats>>,
}

impl PooledConnectionGuard<'_> {
    pub fn connection(&self) -> &Connection {
        match &self.connection {
            Some(pooled) => &pooled.connection,
            // Only emptied inside Drop.
            None => unreachable!("connection taken before guard drop"),
        }
    }
}

impl Drop for PooledConnectionGuard<'_> {
    fn drop(&mut self) {
        let Some(mut conn) = self.connection.take() else { return };
        let mut stats = self.pool_stats.write();

        if conn.is_readonly {
            stats.active_read_connections = stats.active_read_connections.saturating_sub(1);
        } else {
            stats.active_write_connections = stats.active_write_connections.saturating_sub(1);
        }

        if self.is_shutdown.load(Ordering::Acquire) {
            stats.connections_destroyed += 1;
            return;
        }

        conn.last_used = Instant::now();
        conn.use_count += 1;

        let mut idle = self.idle.lock();
        if idle.len() < self.idle_cap {
            idle.push(conn);
        } else {
            stats.connections_destroyed += 1;
        }
    }
}

pub async fn init_database_pool(db_path: impl AsRef<Path>, config: Option<PoolConfig>) -> PoolResult<Arc<DatabasePool>> {
    let config = config.unwrap_or_default();
    let pool = DatabasePool::new(db_path, config)?;
    Ok(Arc::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_pool_creation() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let pool = DatabasePool::new(&db_path, PoolConfig::default()).unwrap();

        let write_conn = pool.get_write_connection().await.unwrap();
        write_conn.connection().execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        drop(write_conn);

        let read_conn = pool.get_read_connection().await.unwrap();
        let count: i64 = read_conn
            .connection()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_connections_are_recycled() {
        let temp_dir = tempdir().unwrap();
        let pool = DatabasePool::new(temp_dir.path().join("test.db"), PoolConfig::default()).unwrap();

        for _ in 0..5 {
            let conn = pool.get_read_connection().await.unwrap();
            conn.connection().query_row("SELECT 1", [], |_| Ok(())).unwrap();
        }

        let stats = pool.get_stats();
        assert_eq!(stats.total_read_connections, 1);
        assert_eq!(stats.active_read_connections, 0);
        assert_eq!(pool.total_checkouts(), 5);
    }

    #[tokio::test]
    async fn test_read_only_connection_rejects_writes() {
        let temp_dir = tempdir().unwrap();
        let pool = DatabasePool::new(temp_dir.path().join("test.db"), PoolConfig::default()).unwrap();

        let conn = pool.get_read_connection().await.unwrap();
        assert!(conn.connection().execute("CREATE TABLE nope (x INTEGER)", []).is_err());
    }

    #[tokio::test]
    async fn test_write_checkout_times_out_when_exhausted() {
        let temp_dir = tempdir().unwrap();
        let config = PoolConfig {
            max_write_connections: 1,
            connection_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let pool = DatabasePool::new(temp_dir.path().join("test.db"), config).unwrap();

        let _held = pool.get_write_connection().await.unwrap();
        let second = pool.get_write_connection().await;
        assert!(matches!(second, Err(PoolError::ConnectionTimeout(_))));
        assert_eq!(pool.get_stats().connection_timeouts, 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_checkouts() {
        let temp_dir = tempdir().unwrap();
        let pool = DatabasePool::new(temp_dir.path().join("test.db"), PoolConfig::default()).unwrap();
        pool.shutdown().await;
        assert!(matches!(pool.get_read_connection().await, Err(PoolError::ShuttingDown)));
    }
}
