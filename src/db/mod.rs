use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn db_path(app_dir: &Path) -> PathBuf {
    app_dir.join("crosstalk.db")
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if user_version < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  doc TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
        )?;
        conn.execute_batch("PRAGMA user_version = 1;")?;
    }

    Ok(())
}

pub fn open(app_dir: &Path) -> Result<Connection> {
    fs::create_dir_all(app_dir)?;
    let conn = Connection::open(db_path(app_dir))?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    migrate(&conn)?;
    Ok(conn)
}

pub fn kv_get_string(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        r#"SELECT value FROM kv WHERE key = ?1"#,
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn kv_set_string(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"INSERT INTO kv(key, value) VALUES (?1, ?2)
           ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
        params![key, value],
    )?;
    Ok(())
}

pub fn kv_delete(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(r#"DELETE FROM kv WHERE key = ?1"#, params![key])?;
    Ok(())
}

fn doc_id(doc: &Value) -> Result<String> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("conversation doc missing id"))?;
    if id.is_empty() {
        return Err(anyhow!("conversation doc has empty id"));
    }
    Ok(id.to_string())
}

type StoreObserver = Box<dyn Fn(&BTreeMap<String, Value>, &BTreeMap<String, Value>) + Send + Sync>;

struct StoreInner {
    conn: Mutex<Connection>,
    snapshot: Mutex<BTreeMap<String, Value>>,
    observers: Mutex<Vec<(u64, StoreObserver)>>,
    next_observer_id: AtomicU64,
}

/// Local store of conversation documents, hydrated into memory on open.
///
/// Documents are opaque JSON objects with a mandatory top-level `id`. Every
/// mutation notifies subscribed observers with the (prev, next) snapshots so
/// the sync watcher can diff them. The store does not know or care whether a
/// mutation was user-originated or applied from the remote; that distinction
/// is the mute registry's job.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl ConversationStore {
    pub fn open(app_dir: &Path) -> Result<Self> {
        Self::from_connection(open(app_dir)?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        let mut snapshot = BTreeMap::new();
        {
            let mut stmt = conn.prepare(r#"SELECT id, doc FROM conversations"#)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let doc: String = row.get(1)?;
                let value: Value = serde_json::from_str(&doc)?;
                snapshot.insert(id, value);
            }
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                snapshot: Mutex::new(snapshot),
                observers: Mutex::new(Vec::new()),
                next_observer_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner
            .snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.inner
            .snapshot
            .lock()
            .ok()
            .and_then(|s| s.get(id).cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .snapshot
            .lock()
            .map(|s| s.contains_key(id))
            .unwrap_or(false)
    }

    pub fn save(&self, doc: &Value) -> Result<()> {
        if !doc.is_object() {
            return Err(anyhow!("conversation doc must be a JSON object"));
        }
        let id = doc_id(doc)?;
        let serialized = serde_json::to_string(doc)?;

        {
            let conn = self
                .inner
                .conn
                .lock()
                .map_err(|_| anyhow!("poisoned lock"))?;
            conn.execute(
                r#"INSERT INTO conversations(id, doc, updated_at) VALUES (?1, ?2, ?3)
                   ON CONFLICT(id) DO UPDATE SET
                     doc = excluded.doc,
                     updated_at = excluded.updated_at"#,
                params![id, serialized, now_ms()],
            )?;
        }

        let (prev, next) = {
            let mut snapshot = self
                .inner
                .snapshot
                .lock()
                .map_err(|_| anyhow!("poisoned lock"))?;
            let prev = snapshot.clone();
            snapshot.insert(id, doc.clone());
            (prev, snapshot.clone())
        };
        self.notify(&prev, &next);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = {
            let conn = self
                .inner
                .conn
                .lock()
                .map_err(|_| anyhow!("poisoned lock"))?;
            conn.execute(r#"DELETE FROM conversations WHERE id = ?1"#, params![id])? > 0
        };

        let (prev, next, changed) = {
            let mut snapshot = self
                .inner
                .snapshot
                .lock()
                .map_err(|_| anyhow!("poisoned lock"))?;
            let prev = snapshot.clone();
            let changed = snapshot.remove(id).is_some();
            (prev, snapshot.clone(), changed)
        };
        if changed {
            self.notify(&prev, &next);
        }
        Ok(removed || next.len() != prev.len())
    }

    pub fn subscribe(
        &self,
        observer: impl Fn(&BTreeMap<String, Value>, &BTreeMap<String, Value>) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut observers) = self.inner.observers.lock() {
            observers.push((id, Box::new(observer)));
        }
        id
    }

    pub fn unsubscribe(&self, observer_id: u64) {
        if let Ok(mut observers) = self.inner.observers.lock() {
            observers.retain(|(id, _)| *id != observer_id);
        }
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .inner
            .conn
            .lock()
            .map_err(|_| anyhow!("poisoned lock"))?;
        f(&conn)
    }

    fn notify(&self, prev: &BTreeMap<String, Value>, next: &BTreeMap<String, Value>) {
        let observers = match self.inner.observers.lock() {
            Ok(observers) => observers,
            Err(_) => return,
        };
        for (_, observer) in observers.iter() {
            observer(prev, next);
        }
    }
}
