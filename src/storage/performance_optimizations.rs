//! SQLite connection tuning for the action store
//!
//! Funding and completion write several tables inside one transaction, so
//! the safe presets keep `synchronous` at NORMAL or FULL. Only the test
//! preset trades durability for speed.

use tokio_rusqlite::Connection;

use crate::errors::{WalletError, WalletResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlitePerformanceConfig {
    /// Enable WAL (Write-Ahead Logging) mode for better concurrency
    pub enable_wal_mode: bool,
    /// Set synchronous mode (0=OFF, 1=NORMAL, 2=FULL)
    pub synchronous_mode: u8,
    /// Cache size in KB
    pub cache_size_kb: i32,
    /// Temporary storage mode (0=default, 1=file, 2=memory)
    pub temp_store: u8,
    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u32,
    pub enforce_foreign_keys: bool,
}

impl Default for SqlitePerformanceConfig {
    fn default() -> Self {
        Self::production_optimized()
    }
}

impl SqlitePerformanceConfig {
    /// Maximum durability
    pub fn conservative() -> Self {
        Self {
            enable_wal_mode: true,
            synchronous_mode: 2,
            cache_size_kb: 16_000,
            temp_store: 2,
            busy_timeout_ms: 5000,
            enforce_foreign_keys: true,
        }
    }

    pub fn production_optimized() -> Self {
        Self {
            enable_wal_mode: true,
            synchronous_mode: 1,
            cache_size_kb: 32_000,
            temp_store: 2,
            busy_timeout_ms: 8000,
            enforce_foreign_keys: true,
        }
    }

    /// For throwaway databases in tests; not crash safe
    pub fn fast_testing() -> Self {
        Self {
            enable_wal_mode: false,
            synchronous_mode: 0,
            cache_size_kb: 8_000,
            temp_store: 2,
            busy_timeout_ms: 1000,
            enforce_foreign_keys: true,
        }
    }

    /// Synchronous OFF can lose committed funding on power loss
    pub fn is_production_safe(&self) -> bool {
        self.synchronous_mode > 0
    }

    pub async fn apply_to_connection(&self, connection: &Connection) -> WalletResult<()> {
        let config = self.clone();
        connection
            .call(move |conn| {
                if config.enable_wal_mode {
                    conn.pragma_update(None, "journal_mode", "WAL")?;
                }
                conn.pragma_update(None, "synchronous", config.synchronous_mode)?;
                // negative = KB rather than pages
                conn.pragma_update(None, "cache_size", -config.cache_size_kb)?;
                conn.pragma_update(None, "temp_store", config.temp_store)?;
                conn.pragma_update(None, "busy_timeout", config.busy_timeout_ms)?;
                conn.pragma_update(
                    None,
                    "foreign_keys",
                    if config.enforce_foreign_keys { "ON" } else { "OFF" },
                )?;
                Ok(())
            })
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to apply SQLite configuration: {e}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_report_durability() {
        assert!(SqlitePerformanceConfig::conservative().is_production_safe());
        assert!(SqlitePerformanceConfig::production_optimized().is_production_safe());
        assert!(!SqlitePerformanceConfig::fast_testing().is_production_safe());
        assert_eq!(
            SqlitePerformanceConfig::default(),
            SqlitePerformanceConfig::production_optimized()
        );
    }

    #[tokio::test]
    async fn applies_to_in_memory_connection() {
        let connection = Connection::open_in_memory().await.unwrap();
        SqlitePerformanceConfig::fast_testing()
            .apply_to_connection(&connection)
            .await
            .unwrap();
        let timeout: i64 = connection
            .call(|conn| Ok(conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(timeout, 1000);
    }
}
