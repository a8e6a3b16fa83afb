use chrono::Utc;
use rusqlite::Error::InvalidParameterName;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation: caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check the data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check the data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

/// Имя файла БД в каталоге данных
pub const DB_FILE_NAME: &str = "condo.db";

/// Durable local storage: key/value поверх SQLite.
/// Все операции синхронные, как localStorage; соединение под одним Mutex.
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Безопасная блокировка соединения с обработкой poisoned mutex
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Database mutex poisoned: {}. A panic occurred while holding the lock.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;

        // GUARD: Integrity check on startup: detect corruption before init
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Database corruption detected: {}",
                integrity
            )));
        }

        // journal_mode возвращает строку, поэтому pragma_update_and_check
        if let Err(e) = conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| {
            r.get::<_, String>(0)
        }) {
            warn!(
                "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                e
            );
        }
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Открыть `condo.db` в каталоге данных.
    /// Auto-recovery: при повреждении файл переименовывается в `condo.db.corrupted.<ts>`
    /// и создаётся новая БД (один раз).
    pub fn open_with_recovery(data_dir: &Path) -> SqliteResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            InvalidParameterName(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let db_path = data_dir.join(DB_FILE_NAME);
        let db_path_str = db_path.to_str().ok_or_else(|| {
            InvalidParameterName(format!(
                "Database path contains invalid UTF-8: {}",
                db_path.display()
            ))
        })?;

        match Database::new(db_path_str) {
            Ok(db) => Ok(db),
            Err(e) => {
                let err_str = e.to_string();
                let is_corruption = err_str.contains("corruption")
                    || err_str.contains("integrity")
                    || err_str.contains("not a database");
                if !is_corruption || !db_path.exists() {
                    return Err(e);
                }
                let backup_path = data_dir.join(format!(
                    "{}.corrupted.{}",
                    DB_FILE_NAME,
                    Utc::now().timestamp()
                ));
                std::fs::rename(&db_path, &backup_path).map_err(|rename_e| {
                    warn!(
                        "[DB] Failed to rename corrupted DB to {:?}: {}",
                        backup_path, rename_e
                    );
                    InvalidParameterName(format!(
                        "Database corrupted and could not backup: {}",
                        e
                    ))
                })?;
                info!(
                    "[DB] Corrupted DB backed up to {:?}, starting fresh",
                    backup_path
                );
                Database::new(db_path_str)
            }
        }
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 1;

    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
                [],
            )?;
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    pub fn get_item(&self, key: &str) -> SqliteResult<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT value FROM local_storage WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_item(&self, key: &str, value: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO local_storage (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, now],
        )
        .map_err(|e| {
            log_io_error_if_any("set_item", &e);
            e
        })?;
        Ok(())
    }

    pub fn remove_item(&self, key: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM local_storage WHERE key = ?1", params![key])
            .map_err(|e| {
                log_io_error_if_any("remove_item", &e);
                e
            })?;
        Ok(())
    }

    /// Удалить несколько ключей одной транзакцией (logout)
    pub fn remove_items(&self, keys: &[&str]) -> SqliteResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM local_storage WHERE key = ?1", params![key])?;
        }
        tx.commit().map_err(|e| {
            log_io_error_if_any("remove_items commit", &e);
            e
        })
    }

    pub fn keys(&self) -> SqliteResult<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT key FROM local_storage ORDER BY key ASC")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(keys)
    }
}
