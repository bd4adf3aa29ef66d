//! Database schema management
//!
//! Creates the tables every engine relies on and tracks the schema version
//! so later releases can migrate in place.

use rusqlite::Connection;
use tracing::{error, info};

use super::{DatabasePool, PoolError, PoolResult};

pub const SCHEMA_VERSION: u32 = 1;

pub const REQUIRED_TABLES: [&str; 15] = [
    "activity_logs",
    "libraries",
    "videos",
    "performers",
    "tags",
    "studios",
    "scraped_threads",
    "scraped_posts",
    "scraped_download_links",
    "scheduled_jobs",
    "job_execution_history",
    "notifications",
    "app_settings",
    "ai_audit_logs",
    "schema_version",
];

pub async fn initialize_schema(pool: &DatabasePool) -> PoolResult<()> {
    let conn = pool.get_write_connection().await?;
    let conn = conn.connection();

    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_initial_schema(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Database schema initialized to version {}", SCHEMA_VERSION);
    } else if current_version < SCHEMA_VERSION {
        run_migrations(conn, current_version)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Database schema migrated from version {} to {}", current_version, SCHEMA_VERSION);
    } else if current_version > SCHEMA_VERSION {
        error!(
            "Database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        );
        return Err(PoolError::InvalidConfig(
            "Database schema is newer than supported version".to_string(),
        ));
    }

    Ok(())
}

fn create_initial_schema(conn: &Connection) -> PoolResult<()> {
    conn.execute_batch(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS activity_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running'
                CHECK (status IN ('pending', 'running', 'completed', 'failed')),
            message TEXT NOT NULL DEFAULT '',
            progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            details TEXT,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            is_paused INTEGER NOT NULL DEFAULT 0,
            paused_at TEXT,
            checkpoint TEXT
        );

        CREATE TABLE IF NOT EXISTS libraries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            path TEXT NOT NULL UNIQUE,
            created_at TEXT
        );

        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            library_id INTEGER REFERENCES libraries(id) ON DELETE SET NULL,
            title TEXT NOT NULL DEFAULT '',
            file_path TEXT NOT NULL UNIQUE,
            thumbnail_path TEXT,
            preview_path TEXT,
            metadata TEXT,
            created_at TEXT
        );

        CREATE TABLE IF NOT EXISTS performers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            category TEXT NOT NULL DEFAULT 'regular',
            thumbnail_path TEXT,
            preview_path TEXT,
            metadata TEXT,
            created_at TEXT
        );

        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS studios (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS scraped_threads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL,
            source TEXT NOT NULL,
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            reply_count INTEGER NOT NULL DEFAULT 0,
            view_count INTEGER NOT NULL DEFAULT 0,
            post_count INTEGER NOT NULL DEFAULT 0,
            download_count INTEGER NOT NULL DEFAULT 0,
            metadata TEXT,
            first_scraped_at TEXT NOT NULL,
            last_scraped_at TEXT NOT NULL,
            UNIQUE (external_id, source)
        );

        CREATE TABLE IF NOT EXISTS scraped_posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id INTEGER NOT NULL REFERENCES scraped_threads(id) ON DELETE CASCADE,
            external_id TEXT NOT NULL,
            source TEXT NOT NULL,
            author TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            plain_text TEXT NOT NULL DEFAULT '',
            post_number INTEGER NOT NULL,
            like_count INTEGER NOT NULL DEFAULT 0,
            posted_at TEXT,
            attachments TEXT,
            metadata TEXT,
            scraped_at TEXT NOT NULL,
            UNIQUE (external_id, source)
        );

        CREATE TABLE IF NOT EXISTS scraped_download_links (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id INTEGER NOT NULL REFERENCES scraped_threads(id) ON DELETE CASCADE,
            post_id INTEGER REFERENCES scraped_posts(id) ON DELETE CASCADE,
            provider TEXT NOT NULL,
            url TEXT NOT NULL,
            original_url TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'unchecked'
                CHECK (status IN ('active', 'dead', 'expired', 'unchecked')),
            download_status TEXT NOT NULL DEFAULT 'not_downloaded',
            downloaded_at TEXT,
            last_checked_at TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (url, source)
        );

        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            job_type TEXT NOT NULL,
            schedule_type TEXT NOT NULL CHECK (schedule_type IN ('interval', 'cron', 'once')),
            schedule_config TEXT NOT NULL DEFAULT '{}',
            target_type TEXT,
            target_id INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT,
            next_run_at TEXT,
            run_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_execution_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL REFERENCES scheduled_jobs(id) ON DELETE CASCADE,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            status TEXT NOT NULL,
            result_data TEXT,
            error_message TEXT,
            duration_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'normal',
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'system',
            action_url TEXT,
            action_label TEXT,
            metadata TEXT,
            is_read INTEGER NOT NULL DEFAULT 0,
            is_archived INTEGER NOT NULL DEFAULT 0,
            related_entity_type TEXT,
            related_entity_id INTEGER,
            created_at TEXT NOT NULL,
            read_at TEXT,
            expires_at TEXT
        );

        CREATE TABLE IF NOT EXISTS app_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ai_audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            details TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        COMMIT;",
    )?;

    create_indexes(conn)?;

    info!("Initial database schema created successfully");
    Ok(())
}

fn create_indexes(conn: &Connection) -> PoolResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_activity_status ON activity_logs(status);
        CREATE INDEX IF NOT EXISTS idx_activity_started ON activity_logs(started_at);
        CREATE INDEX IF NOT EXISTS idx_activity_completed ON activity_logs(status, completed_at);
        CREATE INDEX IF NOT EXISTS idx_posts_thread ON scraped_posts(thread_id, post_number);
        CREATE INDEX IF NOT EXISTS idx_links_thread ON scraped_download_links(thread_id);
        CREATE INDEX IF NOT EXISTS idx_links_provider ON scraped_download_links(provider, status);
        CREATE INDEX IF NOT EXISTS idx_links_checked ON scraped_download_links(last_checked_at);
        CREATE INDEX IF NOT EXISTS idx_threads_url ON scraped_threads(url);
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduled_jobs(enabled, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_history_job ON job_execution_history(job_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_notifications_created ON notifications(created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_created ON ai_audit_logs(created_at);",
    )?;

    info!("Database indexes created successfully");
    Ok(())
}

fn run_migrations(conn: &Connection, from_version: u32) -> PoolResult<()> {
    match from_version {
        0 => create_initial_schema(conn),
        _ => Err(PoolError::InvalidConfig(format!(
            "No migration path from version {}",
            from_version
        ))),
    }
}

pub fn get_schema_version(conn: &Connection) -> PoolResult<u32> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| Ok(row.get::<_, i64>(0)? > 0),
    )?;

    if !table_exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> PoolResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        [version],
    )?;
    Ok(())
}

/// Check that every required table exists and SQLite reports no corruption.
pub async fn verify_schema_integrity(pool: &DatabasePool) -> PoolResult<bool> {
    let guard = pool.get_read_connection().await?;
    let conn = guard.connection();

    for table_name in REQUIRED_TABLES {
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table_name],
            |row| Ok(row.get::<_, i64>(0)? > 0),
        )?;

        if !exists {
            error!("Required table '{}' does not exist", table_name);
            return Ok(false);
        }
    }

    let integrity: String = conn.query_row("PRAGMA integrity_check(1)", [], |row| row.get(0))?;
    if integrity != "ok" {
        error!("Database integrity check failed: {}", integrity);
        return Ok(false);
    }

    Ok(true)
}
