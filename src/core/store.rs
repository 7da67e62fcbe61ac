use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::core::error::StoreError;

/// Remote-origin bug data, keyed by bug ID.
pub const RECORDS: &str = "records";
/// Private overlay (unread/starred), keyed by bug ID.
pub const ANNOTATIONS: &str = "annotations";
/// User preferences, keyed by pref name.
pub const PREFS: &str = "prefs";
/// Subscribed record sets (set name → bug IDs).
pub const SUBSCRIPTIONS: &str = "subscriptions";

/// Current version of the per-account schema.
pub const ACCOUNT_SCHEMA_VERSION: u32 = 3;

/// Handle given to the upgrade hook while the schema is being migrated.
/// All statements run inside one transaction together with the version bump.
pub struct SchemaUpgrade<'a> {
    conn: &'a Connection,
    old_version: u32,
    new_version: u32,
}

impl SchemaUpgrade<'_> {
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    /// Create a key/value table. No-op if it already exists.
    pub fn create_table(&self, table: &str) -> Result<(), StoreError> {
        check_table(table)?;
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );"
        ))?;
        Ok(())
    }

    /// Drop a table. No-op if it does not exist.
    pub fn drop_table(&self, table: &str) -> Result<(), StoreError> {
        check_table(table)?;
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
        Ok(())
    }
}

/// Upgrade steps for the per-account database.
pub fn account_upgrade(up: &SchemaUpgrade<'_>) -> Result<(), StoreError> {
    if up.old_version() < 1 {
        up.create_table(RECORDS)?;
        up.create_table(PREFS)?;
    }
    if up.old_version() < 2 {
        // Overlay moved out of the record rows so a re-fetch never clobbers it
        up.create_table(ANNOTATIONS)?;
    }
    if up.old_version() < 3 {
        up.create_table(SUBSCRIPTIONS)?;
    }
    Ok(())
}

/// Table names are interpolated into SQL, so only `[a-z_]` is accepted.
fn check_table(table: &str) -> Result<(), StoreError> {
    if !table.is_empty() && table.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

enum StoreCmd {
    Read {
        table: String,
        key: String,
        reply: oneshot::Sender<Result<Option<String>, StoreError>>,
    },
    ReadAll {
        table: String,
        reply: oneshot::Sender<Result<Vec<(String, String)>, StoreError>>,
    },
    Write {
        table: String,
        entries: Vec<(String, String)>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Delete {
        table: String,
        key: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    DeleteAll {
        table: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

// ---------------------------------------------------------------------------
// StoreHandle — Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCmd>,
}

impl StoreHandle {
    /// Open (or create) the named database under the data dir, migrate it to
    /// `version`, and spawn the background thread.
    pub fn open<F>(name: &str, version: u32, upgrade: F) -> Result<Self, StoreError>
    where
        F: FnOnce(&SchemaUpgrade<'_>) -> Result<(), StoreError>,
    {
        Self::open_in(&Self::resolve_dir(), name, version, upgrade)
    }

    /// Open the named database inside `dir`, creating the directory if needed.
    pub fn open_in<F>(dir: &Path, name: &str, version: u32, upgrade: F) -> Result<Self, StoreError>
    where
        F: FnOnce(&SchemaUpgrade<'_>) -> Result<(), StoreError>,
    {
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("Failed to create store dir: {e}")))?;
        Self::open_at(&dir.join(db_file_name(name)), version, upgrade)
    }

    /// Open a database file at an explicit path.
    pub fn open_at<F>(path: &Path, version: u32, upgrade: F) -> Result<Self, StoreError>
    where
        F: FnOnce(&SchemaUpgrade<'_>) -> Result<(), StoreError>,
    {
        let conn = Connection::open(path)?;
        log::info!("Opened store at {}", path.display());
        Self::start(conn, version, upgrade)
    }

    /// Open a throwaway database that lives as long as the handle.
    pub fn open_in_memory<F>(version: u32, upgrade: F) -> Result<Self, StoreError>
    where
        F: FnOnce(&SchemaUpgrade<'_>) -> Result<(), StoreError>,
    {
        Self::start(Connection::open_in_memory()?, version, upgrade)
    }

    fn resolve_dir() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("bugdeck")
    }

    fn start<F>(conn: Connection, version: u32, upgrade: F) -> Result<Self, StoreError>
    where
        F: FnOnce(&SchemaUpgrade<'_>) -> Result<(), StoreError>,
    {
        migrate(&conn, version, upgrade)?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("bugdeck-store".into())
            .spawn(move || Self::run_loop(conn, rx))
            .map_err(|e| StoreError::Io(format!("Failed to spawn store thread: {e}")))?;

        Ok(StoreHandle { tx })
    }

    // -- async methods -------------------------------------------------------

    pub async fn read_raw(&self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::Read {
            table: table.to_string(),
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    pub async fn read_all_raw(&self, table: &str) -> Result<Vec<(String, String)>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::ReadAll {
            table: table.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    pub async fn write_raw(
        &self,
        table: &str,
        entries: Vec<(String, String)>,
    ) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::Write {
            table: table.to_string(),
            entries,
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    pub async fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::Delete {
            table: table.to_string(),
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    pub async fn delete_all(&self, table: &str) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::DeleteAll {
            table: table.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    // -- typed helpers -------------------------------------------------------

    pub async fn read<T: DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.read_raw(table, key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every row of a table. Rows that fail to decode are skipped with a warning
    /// so one bad row does not hide the rest of the cache.
    pub async fn read_all<T: DeserializeOwned>(
        &self,
        table: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let rows = self.read_all_raw(table).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, json) in rows {
            match serde_json::from_str(&json) {
                Ok(value) => out.push((key, value)),
                Err(e) => log::warn!("Skipping undecodable row {table}/{key}: {e}"),
            }
        }
        Ok(out)
    }

    pub async fn write<T: Serialize>(
        &self,
        table: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        self.write_raw(table, vec![(key.to_string(), json)]).await
    }

    /// Write several rows in one transaction.
    pub async fn write_many<T: Serialize>(
        &self,
        table: &str,
        values: &[(String, T)],
    ) -> Result<(), StoreError> {
        let mut entries = Vec::with_capacity(values.len());
        for (key, value) in values {
            entries.push((key.clone(), serde_json::to_string(value)?));
        }
        self.write_raw(table, entries).await
    }

    fn send(&self, cmd: StoreCmd) -> Result<(), StoreError> {
        self.tx.send(cmd).map_err(|_| StoreError::Unavailable)
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<StoreCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                StoreCmd::Read { table, key, reply } => {
                    let _ = reply.send(Self::do_read(&conn, &table, &key));
                }
                StoreCmd::ReadAll { table, reply } => {
                    let _ = reply.send(Self::do_read_all(&conn, &table));
                }
                StoreCmd::Write {
                    table,
                    entries,
                    reply,
                } => {
                    let _ = reply.send(Self::do_write(&conn, &table, &entries));
                }
                StoreCmd::Delete { table, key, reply } => {
                    let _ = reply.send(Self::do_delete(&conn, &table, &key));
                }
                StoreCmd::DeleteAll { table, reply } => {
                    let _ = reply.send(Self::do_delete_all(&conn, &table));
                }
            }
        }
        log::debug!("Store thread exiting");
    }

    // -- synchronous DB operations -------------------------------------------

    fn do_read(conn: &Connection, table: &str, key: &str) -> Result<Option<String>, StoreError> {
        check_table(table)?;
        let result = conn.query_row(
            &format!("SELECT value FROM {table} WHERE key = ?1"),
            [key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn do_read_all(conn: &Connection, table: &str) -> Result<Vec<(String, String)>, StoreError> {
        check_table(table)?;
        let mut stmt = conn.prepare(&format!("SELECT key, value FROM {table} ORDER BY key"))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn do_write(
        conn: &Connection,
        table: &str,
        entries: &[(String, String)],
    ) -> Result<(), StoreError> {
        check_table(table)?;
        let tx = conn.unchecked_transaction()?;

        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {table} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ))?;
        for (key, value) in entries {
            stmt.execute(rusqlite::params![key, value])?;
        }
        drop(stmt);

        tx.commit()?;
        Ok(())
    }

    fn do_delete(conn: &Connection, table: &str, key: &str) -> Result<(), StoreError> {
        check_table(table)?;
        conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), [key])?;
        Ok(())
    }

    fn do_delete_all(conn: &Connection, table: &str) -> Result<(), StoreError> {
        check_table(table)?;
        conn.execute(&format!("DELETE FROM {table}"), [])?;
        Ok(())
    }
}

/// Run the upgrade hook when the stored `user_version` is behind `version`.
fn migrate<F>(conn: &Connection, version: u32, upgrade: F) -> Result<(), StoreError>
where
    F: FnOnce(&SchemaUpgrade<'_>) -> Result<(), StoreError>,
{
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > version {
        return Err(StoreError::VersionTooNew {
            found: current,
            expected: version,
        });
    }
    if current == version {
        return Ok(());
    }

    log::info!("Upgrading store schema v{current} → v{version}");
    let tx = conn.unchecked_transaction()?;
    upgrade(&SchemaUpgrade {
        conn: &tx,
        old_version: current,
        new_version: version,
    })?;
    tx.pragma_update(None, "user_version", version)?;
    tx.commit()?;
    Ok(())
}

/// `bugzilla.mozilla.org::me@example.com` → `bugzilla.mozilla.org__me_example.com.db`
fn db_file_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.db")
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pref {
        value: String,
    }

    fn account_store() -> StoreHandle {
        StoreHandle::open_in_memory(ACCOUNT_SCHEMA_VERSION, account_upgrade).unwrap()
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let store = account_store();
        let pref = Pref {
            value: "dark".into(),
        };
        store.write(PREFS, "ui.theme", &pref).await.unwrap();
        let loaded: Option<Pref> = store.read(PREFS, "ui.theme").await.unwrap();
        assert_eq!(loaded, Some(pref));
    }

    #[tokio::test]
    async fn write_overwrites_existing_key() {
        let store = account_store();
        store.write(PREFS, "k", &1u32).await.unwrap();
        store.write(PREFS, "k", &2u32).await.unwrap();
        assert_eq!(store.read::<u32>(PREFS, "k").await.unwrap(), Some(2));
        assert_eq!(store.read_all::<u32>(PREFS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_key_reads_none() {
        let store = account_store();
        assert_eq!(store.read::<u32>(RECORDS, "404").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_all_only_clears_one_table() {
        let store = account_store();
        store.write(ANNOTATIONS, "1", &true).await.unwrap();
        store.write(RECORDS, "1", &true).await.unwrap();
        store.delete_all(ANNOTATIONS).await.unwrap();
        assert!(store.read_all::<bool>(ANNOTATIONS).await.unwrap().is_empty());
        assert_eq!(store.read_all::<bool>(RECORDS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_table_is_an_error() {
        let store = account_store();
        let err = store.read::<u32>("users", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
        let err = store.read::<u32>("bad; DROP", "x").await.unwrap_err();
        assert_eq!(err, StoreError::InvalidTable("bad; DROP".into()));
    }

    #[tokio::test]
    async fn undecodable_rows_are_skipped() {
        let store = account_store();
        store
            .write_raw(
                PREFS,
                vec![("a".into(), "1".into()), ("b".into(), "not json".into())],
            )
            .await
            .unwrap();
        let rows = store.read_all::<u32>(PREFS).await.unwrap();
        assert_eq!(rows, vec![("a".to_string(), 1)]);
    }

    #[test]
    fn upgrade_runs_only_missing_steps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.db");

        // v1 database
        {
            let conn = Connection::open(&path).unwrap();
            migrate(&conn, 1, account_upgrade).unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        let mut seen = None;
        migrate(&conn, ACCOUNT_SCHEMA_VERSION, |up| {
            seen = Some((up.old_version(), up.new_version()));
            account_upgrade(up)
        })
        .unwrap();
        assert_eq!(seen, Some((1, 3)));

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |r| r.get(0))
            .unwrap();
        assert_eq!(version, 3);
        for table in [RECORDS, PREFS, ANNOTATIONS, SUBSCRIPTIONS] {
            assert!(StoreHandle::do_read_all(&conn, table).is_ok(), "{table}");
        }
    }

    #[test]
    fn upgrade_is_idempotent_when_rerun() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn, ACCOUNT_SCHEMA_VERSION, account_upgrade).unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        account_upgrade(&SchemaUpgrade {
            conn: &tx,
            old_version: 0,
            new_version: ACCOUNT_SCHEMA_VERSION,
        })
        .unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn newer_database_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn, 5, |_| Ok(())).unwrap();
        let err = migrate(&conn, 3, account_upgrade).unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionTooNew {
                found: 5,
                expected: 3
            }
        );
    }

    #[test]
    fn up_to_date_database_skips_hook() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn, 2, |_| Ok(())).unwrap();
        migrate(&conn, 2, |_| panic!("hook must not run")).unwrap();
    }

    #[test]
    fn db_file_name_replaces_separators() {
        assert_eq!(
            db_file_name("bugzilla.mozilla.org::me@example.com"),
            "bugzilla.mozilla.org__me_example.com.db"
        );
    }
}
