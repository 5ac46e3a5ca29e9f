//! SQLite Store
//!
//! Implements PersistentStore on a local SQLite file. Documents and queues
//! are stored as JSON text; works get one row per code.

use crate::domain::entities::{SharedDocument, WorkRecord};
use crate::domain::identity::NodeId;
use crate::domain::ports::{KnownPeer, PersistentStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

const DOCUMENT_KEY: &str = "document";
const PENDING_KEY: &str = "pending_works";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// SQLite-backed store.
///
/// One connection guarded by a mutex; every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_db(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS known_peers (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                position INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS works (
                code TEXT PRIMARY KEY,
                last_modified_at INTEGER NOT NULL,
                data TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| StoreError::Backend(format!("spawn_blocking error: {}", e)))?
    }

    fn read_blob(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
        let data = conn
            .query_row("SELECT data FROM documents WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(data)
    }

    fn write_blob(conn: &Connection, key: &str, data: &str) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO documents (key, data, updated_at) VALUES (?1, ?2, strftime('%s','now'))
             ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![key, data],
        )?;
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn load_known_peers(&self) -> Result<Vec<KnownPeer>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, display_name FROM known_peers ORDER BY position")?;
            let peers = stmt
                .query_map([], |row| {
                    Ok(KnownPeer {
                        id: NodeId::new(row.get::<_, String>(0)?),
                        display_name: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(peers)
        })
        .await
    }

    async fn save_known_peers(&self, peers: &[KnownPeer]) -> Result<(), StoreError> {
        let peers = peers.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM known_peers", [])?;
            for (position, peer) in peers.iter().enumerate() {
                tx.execute(
                    "INSERT OR REPLACE INTO known_peers (id, display_name, position) VALUES (?1, ?2, ?3)",
                    params![peer.id.as_str(), peer.display_name, position as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_document(&self) -> Result<Option<SharedDocument>, StoreError> {
        let data = self.with_conn(|conn| Self::read_blob(conn, DOCUMENT_KEY)).await?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_document(&self, doc: &SharedDocument) -> Result<(), StoreError> {
        let json = serde_json::to_string(doc)?;
        self.with_conn(move |conn| Self::write_blob(conn, DOCUMENT_KEY, &json))
            .await
    }

    async fn load_works(&self) -> Result<Vec<WorkRecord>, StoreError> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM works ORDER BY code")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut works = Vec::with_capacity(rows.len());
        for json in rows {
            works.push(serde_json::from_str(&json)?);
        }
        Ok(works)
    }

    async fn save_work(&self, work: &WorkRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(work)?;
        let code = work.code.clone();
        let last_modified_at = work.last_modified_at;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO works (code, last_modified_at, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(code) DO UPDATE SET
                    last_modified_at = excluded.last_modified_at,
                    data = excluded.data",
                params![code, last_modified_at, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_pending_works(&self) -> Result<Vec<WorkRecord>, StoreError> {
        let data = self.with_conn(|conn| Self::read_blob(conn, PENDING_KEY)).await?;
        match data {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_pending_works(&self, works: &[WorkRecord]) -> Result<(), StoreError> {
        let json = serde_json::to_string(works)?;
        self.with_conn(move |conn| Self::write_blob(conn, PENDING_KEY, &json))
            .await
    }
}
