//! SQLite storage backend for actions, outputs and source transactions
//!
//! Every multi-record operation runs inside one SQLite transaction on the
//! connection's worker thread. Lock races are reported to the caller as
//! `ConflictError`; all other driver failures become `StorageError`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, types::Type, Connection as RawConnection, OptionalExtension, Row};
use serde::{de::DeserializeOwned, Serialize};
use tokio_rusqlite::Connection;

use crate::{
    beef::Beef,
    data_structures::{ActionStatus, Outpoint, OutputOrigin, Script, Txid},
    errors::{WalletError, WalletResult},
    storage::{
        FundingCommit, OutputFilter, OutputStatus, SignedCommit, SimpleEvent,
        SqlitePerformanceConfig, StoredAction, StoredBasket, StoredInput, StoredOutput,
        StoredTransaction, WalletStorage,
    },
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS baskets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        reference TEXT UNIQUE NOT NULL,
        status INTEGER NOT NULL,
        description TEXT NOT NULL,
        version INTEGER NOT NULL,
        lock_time INTEGER NOT NULL,
        fee_model_json TEXT NOT NULL,
        fee BIGINT NOT NULL DEFAULT 0,
        satoshis BIGINT NOT NULL DEFAULT 0,
        no_send BOOLEAN NOT NULL DEFAULT FALSE,
        beef_json TEXT NOT NULL,
        txid TEXT,
        raw_tx BLOB,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS action_labels (
        action_id INTEGER NOT NULL REFERENCES actions(id) ON DELETE CASCADE,
        label TEXT NOT NULL,
        UNIQUE(action_id, label)
    );

    CREATE TABLE IF NOT EXISTS outputs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action_id INTEGER REFERENCES actions(id),
        basket_id INTEGER REFERENCES baskets(id),
        txid TEXT,
        vout INTEGER NOT NULL,
        satoshis BIGINT NOT NULL,
        locking_script BLOB NOT NULL,
        spendable BOOLEAN NOT NULL DEFAULT FALSE,
        origin_json TEXT NOT NULL,
        description TEXT,
        custom_instructions TEXT,
        tags_json TEXT NOT NULL DEFAULT '[]',
        sort_key INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 0,
        locked_by_action INTEGER REFERENCES actions(id),
        spent_by_action INTEGER REFERENCES actions(id),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(txid, vout)
    );

    CREATE TABLE IF NOT EXISTS inputs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action_id INTEGER NOT NULL REFERENCES actions(id),
        vin INTEGER NOT NULL,
        txid TEXT NOT NULL,
        vout INTEGER NOT NULL,
        source_satoshis BIGINT NOT NULL,
        source_locking_script BLOB NOT NULL,
        sequence INTEGER NOT NULL,
        unlocking_script BLOB,
        unlocking_script_length INTEGER NOT NULL,
        description TEXT,
        source_json TEXT NOT NULL,
        UNIQUE(action_id, vin),
        UNIQUE(action_id, txid, vout)
    );

    CREATE TABLE IF NOT EXISTS transactions (
        txid TEXT PRIMARY KEY,
        raw_tx BLOB NOT NULL,
        merkle_path BLOB,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS action_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action_id INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        event_data TEXT NOT NULL,
        timestamp INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_outputs_basket_funding
        ON outputs(basket_id, spendable, status, locked_by_action, satoshis);
    CREATE INDEX IF NOT EXISTS idx_outputs_action ON outputs(action_id);
    CREATE INDEX IF NOT EXISTS idx_outputs_locked_by ON outputs(locked_by_action);
    CREATE INDEX IF NOT EXISTS idx_inputs_action ON inputs(action_id);
    CREATE INDEX IF NOT EXISTS idx_inputs_outpoint ON inputs(txid, vout);
    CREATE INDEX IF NOT EXISTS idx_actions_status ON actions(status);
    CREATE INDEX IF NOT EXISTS idx_events_action_id ON action_events(action_id);

    CREATE TRIGGER IF NOT EXISTS update_actions_timestamp
    AFTER UPDATE ON actions
    BEGIN
        UPDATE actions SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
    END;

    CREATE TRIGGER IF NOT EXISTS update_outputs_timestamp
    AFTER UPDATE ON outputs
    BEGIN
        UPDATE outputs SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
    END;
"#;

fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn parse_txid(text: &str) -> rusqlite::Result<Txid> {
    Txid::from_hex(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn conflict<T>(message: String) -> Result<WalletResult<T>, tokio_rusqlite::Error> {
    Ok(Err(WalletError::ConflictError(message)))
}

/// SQLite storage backend
pub struct SqliteStorage {
    connection: Connection,
    performance_config: SqlitePerformanceConfig,
}

impl SqliteStorage {
    pub async fn new<P: AsRef<Path>>(database_path: P) -> WalletResult<Self> {
        Self::new_with_config(database_path, SqlitePerformanceConfig::production_optimized())
            .await
    }

    pub async fn new_with_config<P: AsRef<Path>>(
        database_path: P,
        performance_config: SqlitePerformanceConfig,
    ) -> WalletResult<Self> {
        let connection = Connection::open(database_path).await.map_err(|e| {
            WalletError::StorageError(format!("Failed to open SQLite database: {e}"))
        })?;
        Self::with_connection(connection, performance_config).await
    }

    /// In-memory database, for tests
    pub async fn new_in_memory() -> WalletResult<Self> {
        let connection = Connection::open_in_memory().await.map_err(|e| {
            WalletError::StorageError(format!("Failed to create in-memory database: {e}"))
        })?;
        Self::with_connection(connection, SqlitePerformanceConfig::fast_testing()).await
    }

    async fn with_connection(
        connection: Connection,
        performance_config: SqlitePerformanceConfig,
    ) -> WalletResult<Self> {
        let storage = Self {
            connection,
            performance_config,
        };
        storage
            .performance_config
            .apply_to_connection(&storage.connection)
            .await?;
        Ok(storage)
    }

    fn row_to_basket(row: &Row) -> rusqlite::Result<StoredBasket> {
        Ok(StoredBasket {
            id: Some(row.get::<_, i64>("id")? as u32),
            name: row.get("name")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_output(row: &Row) -> rusqlite::Result<StoredOutput> {
        let txid = row
            .get::<_, Option<String>>("txid")?
            .map(|t| parse_txid(&t))
            .transpose()?;
        Ok(StoredOutput {
            id: Some(row.get::<_, i64>("id")? as u32),
            action_id: row.get::<_, Option<i64>>("action_id")?.map(|id| id as u32),
            basket_id: row.get::<_, Option<i64>>("basket_id")?.map(|id| id as u32),
            txid,
            vout: row.get::<_, i64>("vout")? as u32,
            satoshis: row.get::<_, i64>("satoshis")? as u64,
            locking_script: Script::new(row.get("locking_script")?),
            spendable: row.get("spendable")?,
            origin: from_json(row, "origin_json")?,
            description: row.get("description")?,
            custom_instructions: row.get("custom_instructions")?,
            tags: from_json(row, "tags_json")?,
            sort_key: row.get::<_, i64>("sort_key")? as u32,
            status: OutputStatus::from(row.get::<_, i64>("status")? as u32),
            locked_by_action: row
                .get::<_, Option<i64>>("locked_by_action")?
                .map(|id| id as u32),
            spent_by_action: row
                .get::<_, Option<i64>>("spent_by_action")?
                .map(|id| id as u32),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Labels are filled in separately
    fn row_to_action(row: &Row) -> rusqlite::Result<StoredAction> {
        let status = ActionStatus::try_from(row.get::<_, i32>("status")?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, e.into())
        })?;
        let txid = row
            .get::<_, Option<String>>("txid")?
            .map(|t| parse_txid(&t))
            .transpose()?;
        Ok(StoredAction {
            id: Some(row.get::<_, i64>("id")? as u32),
            reference: row.get("reference")?,
            status,
            description: row.get("description")?,
            version: row.get::<_, i64>("version")? as u32,
            lock_time: row.get::<_, i64>("lock_time")? as u32,
            fee_model: from_json(row, "fee_model_json")?,
            fee: row.get::<_, i64>("fee")? as u64,
            satoshis: row.get("satoshis")?,
            no_send: row.get("no_send")?,
            labels: Vec::new(),
            beef: from_json::<Beef>(row, "beef_json")?,
            txid,
            raw_tx: row.get("raw_tx")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_input(row: &Row) -> rusqlite::Result<StoredInput> {
        let txid = parse_txid(&row.get::<_, String>("txid")?)?;
        Ok(StoredInput {
            id: Some(row.get::<_, i64>("id")? as u32),
            action_id: row.get::<_, i64>("action_id")? as u32,
            vin: row.get::<_, i64>("vin")? as u32,
            outpoint: Outpoint::new(txid, row.get::<_, i64>("vout")? as u32),
            source_satoshis: row.get::<_, i64>("source_satoshis")? as u64,
            source_locking_script: Script::new(row.get("source_locking_script")?),
            sequence: row.get::<_, i64>("sequence")? as u32,
            unlocking_script: row
                .get::<_, Option<Vec<u8>>>("unlocking_script")?
                .map(Script::new),
            unlocking_script_length: row.get::<_, i64>("unlocking_script_length")? as usize,
            description: row.get("description")?,
            source: from_json(row, "source_json")?,
        })
    }

    fn load_labels(conn: &RawConnection, action: &mut StoredAction) -> rusqlite::Result<()> {
        let Some(id) = action.id else {
            return Ok(());
        };
        let mut stmt =
            conn.prepare("SELECT label FROM action_labels WHERE action_id = ? ORDER BY rowid")?;
        let rows = stmt.query_map(params![id as i64], |row| row.get::<_, String>(0))?;
        action.labels = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(())
    }

    fn insert_output(
        conn: &RawConnection,
        output: &StoredOutput,
        action_id: Option<u32>,
    ) -> rusqlite::Result<u32> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO outputs (
                id, action_id, basket_id, txid, vout, satoshis, locking_script, spendable,
                origin_json, description, custom_instructions, tags_json, sort_key, status,
                locked_by_action, spent_by_action
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                output.id.map(|id| id as i64),
                action_id.map(|id| id as i64),
                output.basket_id.map(|id| id as i64),
                output.txid.map(|t| t.to_hex()),
                output.vout as i64,
                output.satoshis as i64,
                output.locking_script.as_bytes(),
                output.spendable,
                to_json(&output.origin)?,
                output.description,
                output.custom_instructions,
                to_json(&output.tags)?,
                output.sort_key as i64,
                u32::from(output.status) as i64,
                output.locked_by_action.map(|id| id as i64),
                output.spent_by_action.map(|id| id as i64),
            ],
        )?;
        Ok(conn.last_insert_rowid() as u32)
    }

    /// Live (not failed) action other than `except` with an input on `outpoint`
    fn spending_action(
        conn: &RawConnection,
        outpoint: &Outpoint,
        except: Option<u32>,
    ) -> rusqlite::Result<Option<u32>> {
        conn.query_row(
            r#"
            SELECT i.action_id FROM inputs i
            JOIN actions a ON a.id = i.action_id
            WHERE i.txid = ? AND i.vout = ? AND a.status != ?
              AND (? IS NULL OR i.action_id != ?)
            LIMIT 1
            "#,
            params![
                outpoint.txid.to_hex(),
                outpoint.vout as i64,
                i32::from(ActionStatus::Failed),
                except.map(|id| id as i64),
                except.map(|id| id as i64),
            ],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|id| id.map(|id| id as u32))
    }

    fn action_status(conn: &RawConnection, action_id: u32) -> rusqlite::Result<Option<ActionStatus>> {
        let status: Option<i32> = conn
            .query_row(
                "SELECT status FROM actions WHERE id = ?",
                params![action_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        status
            .map(|s| {
                ActionStatus::try_from(s).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, e.into())
                })
            })
            .transpose()
    }

    fn save_transaction_row(conn: &RawConnection, tx: &StoredTransaction) -> rusqlite::Result<()> {
        conn.execute(
            r#"
            INSERT INTO transactions (txid, raw_tx, merkle_path) VALUES (?, ?, ?)
            ON CONFLICT(txid) DO UPDATE
                SET merkle_path = COALESCE(transactions.merkle_path, excluded.merkle_path)
            "#,
            params![tx.txid.to_hex(), tx.raw_tx, tx.merkle_path],
        )?;
        Ok(())
    }

    fn build_output_filter_clause(
        filter: &OutputFilter,
    ) -> (String, Vec<Box<dyn rusqlite::ToSql + Send>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();

        if let Some(basket_id) = filter.basket_id {
            conditions.push("basket_id = ?");
            params.push(Box::new(basket_id as i64));
        }
        if let Some(action_id) = filter.action_id {
            conditions.push("action_id = ?");
            params.push(Box::new(action_id as i64));
        }
        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(u32::from(status) as i64));
        }
        if let Some(spendable) = filter.spendable {
            conditions.push("spendable = ?");
            params.push(Box::new(spendable));
        }
        if let Some(action_id) = filter.locked_by_action {
            conditions.push("locked_by_action = ?");
            params.push(Box::new(action_id as i64));
        }

        if conditions.is_empty() {
            (String::new(), params)
        } else {
            (format!("WHERE {}", conditions.join(" AND ")), params)
        }
    }
}

#[async_trait]
impl WalletStorage for SqliteStorage {
    async fn initialize(&self) -> WalletResult<()> {
        self.connection
            .call(move |conn| Ok(conn.execute_batch(SCHEMA)?))
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to create schema: {e}")))
    }

    async fn find_basket(&self, name: &str) -> WalletResult<Option<StoredBasket>> {
        let name = name.to_string();
        self.connection
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT * FROM baskets WHERE name = ?",
                        params![name],
                        Self::row_to_basket,
                    )
                    .optional()?)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to find basket: {e}")))
    }

    async fn save_basket(&self, basket: &StoredBasket) -> WalletResult<u32> {
        let basket = basket.clone();
        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO baskets (id, name) VALUES (?, ?)",
                    params![basket.id.map(|id| id as i64), basket.name],
                )?;
                Ok(conn.last_insert_rowid() as u32)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to save basket: {e}")))
    }

    async fn save_output(&self, output: &StoredOutput) -> WalletResult<u32> {
        let output = output.clone();
        self.connection
            .call(move |conn| Ok(Self::insert_output(conn, &output, output.action_id)?))
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to save output: {e}")))
    }

    async fn get_output(&self, output_id: u32) -> WalletResult<Option<StoredOutput>> {
        self.connection
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT * FROM outputs WHERE id = ?",
                        params![output_id as i64],
                        Self::row_to_output,
                    )
                    .optional()?)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to get output: {e}")))
    }

    async fn get_output_by_outpoint(
        &self,
        outpoint: &Outpoint,
    ) -> WalletResult<Option<StoredOutput>> {
        let txid = outpoint.txid.to_hex();
        let vout = outpoint.vout as i64;
        self.connection
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT * FROM outputs WHERE txid = ? AND vout = ?",
                        params![txid, vout],
                        Self::row_to_output,
                    )
                    .optional()?)
            })
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to get output by outpoint: {e}"))
            })
    }

    async fn get_outputs(&self, filter: OutputFilter) -> WalletResult<Vec<StoredOutput>> {
        self.connection
            .call(move |conn| {
                let (where_clause, params_values) = Self::build_output_filter_clause(&filter);
                let mut query = format!("SELECT * FROM outputs {where_clause} ORDER BY id ASC");
                if let Some(limit) = filter.limit {
                    query.push_str(&format!(" LIMIT {limit}"));
                    if let Some(offset) = filter.offset {
                        query.push_str(&format!(" OFFSET {offset}"));
                    }
                } else if let Some(offset) = filter.offset {
                    query.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
                }

                let mut stmt = conn.prepare(&query)?;
                let param_refs: Vec<&dyn rusqlite::ToSql> = params_values
                    .iter()
                    .map(|p| p.as_ref() as &dyn rusqlite::ToSql)
                    .collect();
                let rows = stmt.query_map(&param_refs[..], Self::row_to_output)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to get outputs: {e}")))
    }

    async fn get_spendable_change(&self, basket_id: u32) -> WalletResult<Vec<StoredOutput>> {
        self.connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT * FROM outputs
                    WHERE basket_id = ?
                      AND spendable = 1
                      AND status = 0
                      AND spent_by_action IS NULL
                      AND locked_by_action IS NULL
                    ORDER BY satoshis ASC, id ASC
                    "#,
                )?;
                let rows = stmt.query_map(params![basket_id as i64], Self::row_to_output)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to query spendable change: {e}"))
            })
    }

    async fn lock_outputs(&self, action_id: u32, output_ids: &[u32]) -> WalletResult<()> {
        let output_ids = output_ids.to_vec();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &output_ids {
                    let row: Option<(i64, Option<i64>, Option<i64>)> = tx
                        .query_row(
                            "SELECT status, locked_by_action, spent_by_action FROM outputs WHERE id = ?",
                            params![*id as i64],
                            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                        )
                        .optional()?;
                    match row {
                        None => {
                            return Ok(Err(WalletError::ResourceNotFound(format!(
                                "Output {id} not found"
                            ))))
                        }
                        Some((status, locked_by, spent_by)) => {
                            let taken = locked_by.is_some_and(|owner| owner != action_id as i64);
                            if status != 0 || spent_by.is_some() || taken {
                                return conflict(format!(
                                    "Output {id} is already spent or locked by another action"
                                ));
                            }
                        }
                    }
                }
                for id in &output_ids {
                    tx.execute(
                        "UPDATE outputs SET locked_by_action = ? WHERE id = ?",
                        params![action_id as i64, *id as i64],
                    )?;
                }
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to lock outputs: {e}")))?
    }

    async fn insert_action(&self, action: &StoredAction) -> WalletResult<u32> {
        let action = action.clone();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"
                    INSERT INTO actions (
                        reference, status, description, version, lock_time, fee_model_json,
                        fee, satoshis, no_send, beef_json, txid, raw_tx
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                    params![
                        action.reference,
                        i32::from(action.status),
                        action.description,
                        action.version as i64,
                        action.lock_time as i64,
                        to_json(&action.fee_model)?,
                        action.fee as i64,
                        action.satoshis,
                        action.no_send,
                        to_json(&action.beef)?,
                        action.txid.map(|t| t.to_hex()),
                        action.raw_tx,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                for label in &action.labels {
                    tx.execute(
                        "INSERT OR IGNORE INTO action_labels (action_id, label) VALUES (?, ?)",
                        params![id, label],
                    )?;
                }
                tx.commit()?;
                Ok(id as u32)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to insert action: {e}")))
    }

    async fn get_action(&self, action_id: u32) -> WalletResult<Option<StoredAction>> {
        self.connection
            .call(move |conn| {
                let action = conn
                    .query_row(
                        "SELECT * FROM actions WHERE id = ?",
                        params![action_id as i64],
                        Self::row_to_action,
                    )
                    .optional()?;
                match action {
                    Some(mut action) => {
                        Self::load_labels(conn, &mut action)?;
                        Ok(Some(action))
                    }
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to get action: {e}")))
    }

    async fn get_action_by_reference(
        &self,
        reference: &str,
    ) -> WalletResult<Option<StoredAction>> {
        let reference = reference.to_string();
        self.connection
            .call(move |conn| {
                let action = conn
                    .query_row(
                        "SELECT * FROM actions WHERE reference = ?",
                        params![reference],
                        Self::row_to_action,
                    )
                    .optional()?;
                match action {
                    Some(mut action) => {
                        Self::load_labels(conn, &mut action)?;
                        Ok(Some(action))
                    }
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to get action by reference: {e}"))
            })
    }

    async fn list_actions(&self, status: Option<ActionStatus>) -> WalletResult<Vec<StoredAction>> {
        self.connection
            .call(move |conn| {
                let mut actions = {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM actions WHERE (?1 IS NULL OR status = ?1) ORDER BY id ASC",
                    )?;
                    let rows = stmt.query_map(
                        params![status.map(i32::from)],
                        Self::row_to_action,
                    )?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                for action in actions.iter_mut() {
                    Self::load_labels(conn, action)?;
                }
                Ok(actions)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to list actions: {e}")))
    }

    async fn get_action_inputs(&self, action_id: u32) -> WalletResult<Vec<StoredInput>> {
        self.connection
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT * FROM inputs WHERE action_id = ? ORDER BY vin ASC")?;
                let rows = stmt.query_map(params![action_id as i64], Self::row_to_input)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to get action inputs: {e}")))
    }

    async fn get_action_outputs(&self, action_id: u32) -> WalletResult<Vec<StoredOutput>> {
        self.connection
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT * FROM outputs WHERE action_id = ? ORDER BY vout ASC")?;
                let rows = stmt.query_map(params![action_id as i64], Self::row_to_output)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to get action outputs: {e}")))
    }

    async fn transition_action_status(
        &self,
        action_id: u32,
        expected: ActionStatus,
        new_status: ActionStatus,
    ) -> WalletResult<bool> {
        self.connection
            .call(move |conn| {
                if Self::action_status(conn, action_id)?.is_none() {
                    return Ok(Err(WalletError::ResourceNotFound(format!(
                        "Action {action_id} not found"
                    ))));
                }
                let rows_affected = conn.execute(
                    "UPDATE actions SET status = ? WHERE id = ? AND status = ?",
                    params![
                        i32::from(new_status),
                        action_id as i64,
                        i32::from(expected)
                    ],
                )?;
                Ok(Ok(rows_affected == 1))
            })
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to transition action status: {e}"))
            })?
    }

    async fn commit_funding(&self, commit: &FundingCommit) -> WalletResult<()> {
        let commit = commit.clone();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                match Self::action_status(&tx, commit.action_id)? {
                    Some(ActionStatus::Unfunded) => {}
                    Some(status) => {
                        return conflict(format!(
                            "Action {} is {status}, expected unfunded",
                            commit.action_id
                        ))
                    }
                    None => {
                        return Ok(Err(WalletError::ResourceNotFound(format!(
                            "Action {} not found",
                            commit.action_id
                        ))))
                    }
                }

                for id in &commit.locked_output_ids {
                    let held: bool = tx
                        .query_row(
                            r#"
                            SELECT COUNT(*) FROM outputs
                            WHERE id = ? AND locked_by_action = ? AND status = 0
                              AND spent_by_action IS NULL
                            "#,
                            params![*id as i64, commit.action_id as i64],
                            |row| row.get::<_, i64>(0),
                        )
                        .map(|count| count == 1)?;
                    if !held {
                        return conflict(format!(
                            "Output {id} was spent or taken by another action before funding committed"
                        ));
                    }
                }

                for input in &commit.inputs {
                    if let Some(owner) =
                        Self::spending_action(&tx, &input.outpoint, Some(commit.action_id))?
                    {
                        return conflict(format!(
                            "Input {} is already spent by action {owner}",
                            input.outpoint
                        ));
                    }
                }

                for input in &commit.inputs {
                    tx.execute(
                        r#"
                        INSERT INTO inputs (
                            action_id, vin, txid, vout, source_satoshis, source_locking_script,
                            sequence, unlocking_script, unlocking_script_length, description,
                            source_json
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                        params![
                            commit.action_id as i64,
                            input.vin as i64,
                            input.outpoint.txid.to_hex(),
                            input.outpoint.vout as i64,
                            input.source_satoshis as i64,
                            input.source_locking_script.as_bytes(),
                            input.sequence as i64,
                            input.unlocking_script.as_ref().map(|s| s.as_bytes().to_vec()),
                            input.unlocking_script_length as i64,
                            input.description,
                            to_json(&input.source)?,
                        ],
                    )?;
                }
                for output in &commit.outputs {
                    let mut output = output.clone();
                    output.id = None;
                    Self::insert_output(&tx, &output, Some(commit.action_id))?;
                }

                tx.execute(
                    "UPDATE actions SET fee = ?, satoshis = ?, beef_json = ?, status = ? WHERE id = ?",
                    params![
                        commit.fee as i64,
                        commit.satoshis,
                        to_json(&commit.beef)?,
                        i32::from(ActionStatus::Funded),
                        commit.action_id as i64,
                    ],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to commit funding: {e}")))?
    }

    async fn find_spending_action(&self, outpoint: &Outpoint) -> WalletResult<Option<u32>> {
        let outpoint = *outpoint;
        self.connection
            .call(move |conn| Ok(Self::spending_action(conn, &outpoint, None)?))
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to look up spending action: {e}"))
            })
    }

    async fn fail_action(&self, action_id: u32) -> WalletResult<()> {
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                match Self::action_status(&tx, action_id)? {
                    None => {
                        return Ok(Err(WalletError::ResourceNotFound(format!(
                            "Action {action_id} not found"
                        ))))
                    }
                    Some(ActionStatus::Failed) => return Ok(Ok(())),
                    Some(status @ (ActionStatus::Signed | ActionStatus::Finalized)) => {
                        return Ok(Err(WalletError::ValidationError(format!(
                            "Action {action_id} is {status} and can no longer fail"
                        ))))
                    }
                    Some(_) => {}
                }
                tx.execute(
                    "UPDATE outputs SET locked_by_action = NULL WHERE locked_by_action = ?",
                    params![action_id as i64],
                )?;
                tx.execute(
                    "UPDATE actions SET status = ? WHERE id = ?",
                    params![i32::from(ActionStatus::Failed), action_id as i64],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to fail action: {e}")))?
    }

    async fn complete_signed_action(&self, commit: &SignedCommit) -> WalletResult<()> {
        let commit = commit.clone();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                match Self::action_status(&tx, commit.action_id)? {
                    Some(ActionStatus::Signable) => {}
                    Some(status) => {
                        return conflict(format!(
                            "Action {} is {status}, expected signable",
                            commit.action_id
                        ))
                    }
                    None => {
                        return Ok(Err(WalletError::ResourceNotFound(format!(
                            "Action {} not found",
                            commit.action_id
                        ))))
                    }
                }

                let txid = commit.txid.to_hex();
                tx.execute(
                    "UPDATE actions SET status = ?, txid = ?, raw_tx = ?, beef_json = ? WHERE id = ?",
                    params![
                        i32::from(ActionStatus::Signed),
                        txid,
                        commit.raw_tx,
                        to_json(&commit.beef)?,
                        commit.action_id as i64,
                    ],
                )?;
                for (vin, script) in &commit.unlocking_scripts {
                    tx.execute(
                        "UPDATE inputs SET unlocking_script = ? WHERE action_id = ? AND vin = ?",
                        params![script.as_bytes(), commit.action_id as i64, *vin as i64],
                    )?;
                }
                tx.execute(
                    "UPDATE outputs SET txid = ? WHERE action_id = ?",
                    params![txid, commit.action_id as i64],
                )?;
                tx.execute(
                    r#"
                    UPDATE outputs
                    SET status = ?, spent_by_action = ?, locked_by_action = NULL, spendable = 0
                    WHERE locked_by_action = ?
                    "#,
                    params![
                        u32::from(OutputStatus::Spent) as i64,
                        commit.action_id as i64,
                        commit.action_id as i64,
                    ],
                )?;
                Self::save_transaction_row(
                    &tx,
                    &StoredTransaction {
                        txid: commit.txid,
                        raw_tx: commit.raw_tx.clone(),
                        merkle_path: None,
                    },
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to record signed action: {e}"))
            })?
    }

    async fn finalize_action(&self, action_id: u32) -> WalletResult<()> {
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                match Self::action_status(&tx, action_id)? {
                    Some(ActionStatus::Signed) => {}
                    Some(status) => {
                        return Ok(Err(WalletError::ValidationError(format!(
                            "Action {action_id} is {status}, only signed actions can be finalized"
                        ))))
                    }
                    None => {
                        return Ok(Err(WalletError::ResourceNotFound(format!(
                            "Action {action_id} not found"
                        ))))
                    }
                }
                let no_send: bool = tx.query_row(
                    "SELECT no_send FROM actions WHERE id = ?",
                    params![action_id as i64],
                    |row| row.get(0),
                )?;

                let outputs: HashMap<u32, bool> = {
                    let mut stmt = tx.prepare("SELECT * FROM outputs WHERE action_id = ?")?;
                    let rows = stmt.query_map(params![action_id as i64], Self::row_to_output)?;
                    let mut spendable = HashMap::new();
                    for row in rows {
                        let output = row?;
                        let now_spendable = match &output.origin {
                            OutputOrigin::Change { .. } => !no_send,
                            OutputOrigin::Caller => output.basket_id.is_some(),
                            OutputOrigin::Commission { .. } => false,
                        };
                        if let Some(id) = output.id {
                            spendable.insert(id, now_spendable);
                        }
                    }
                    spendable
                };
                for (id, spendable) in outputs {
                    tx.execute(
                        "UPDATE outputs SET spendable = ? WHERE id = ?",
                        params![spendable, id as i64],
                    )?;
                }
                tx.execute(
                    "UPDATE actions SET status = ? WHERE id = ?",
                    params![i32::from(ActionStatus::Finalized), action_id as i64],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to finalize action: {e}")))?
    }

    async fn get_source_transaction(
        &self,
        txid: &Txid,
    ) -> WalletResult<Option<StoredTransaction>> {
        let txid_hex = txid.to_hex();
        let txid = *txid;
        self.connection
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT raw_tx, merkle_path FROM transactions WHERE txid = ?",
                        params![txid_hex],
                        |row| {
                            Ok(StoredTransaction {
                                txid,
                                raw_tx: row.get(0)?,
                                merkle_path: row.get(1)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to get source transaction: {e}"))
            })
    }

    async fn save_source_transaction(&self, tx: &StoredTransaction) -> WalletResult<()> {
        let tx = tx.clone();
        self.connection
            .call(move |conn| Ok(Self::save_transaction_row(conn, &tx)?))
            .await
            .map_err(|e| {
                WalletError::StorageError(format!("Failed to save source transaction: {e}"))
            })
    }

    async fn store_simple_event(
        &self,
        action_id: u32,
        event_type: &str,
        event_data: &str,
    ) -> WalletResult<()> {
        let event_type = event_type.to_string();
        let event_data = event_data.to_string();

        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO action_events (action_id, event_type, event_data) VALUES (?, ?, ?)",
                    params![action_id as i64, event_type, event_data],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to store event: {e}")))
    }

    async fn get_simple_events(&self, action_id: u32) -> WalletResult<Vec<SimpleEvent>> {
        self.connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_type, event_data FROM action_events WHERE action_id = ? ORDER BY id",
                )?;
                let rows = stmt.query_map(params![action_id as i64], |row| {
                    Ok(SimpleEvent {
                        action_id,
                        event_type: row.get(0)?,
                        event_data: row.get(1)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(|e| WalletError::StorageError(format!("Failed to get events: {e}")))
    }
}
