use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::now_ms;

pub const MAX_CONVERSATION_ID_LEN: usize = 128;
pub const MAX_USER_ID_LEN: usize = 64;

pub fn valid_conversation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CONVERSATION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConversationMetaRecord {
    pub conversation_id: String,
    pub revision: u64,
    pub deleted: bool,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub revision: u64,
    pub deleted: bool,
    pub data: Option<Value>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Result of an optimistic-concurrency write. A conflict carries the current
/// row so the caller can hand the loser enough context to resolve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WriteOutcome {
    Ok { revision: u64, updated_at_ms: i64 },
    Conflict { revision: u64, deleted: bool },
    NotFound,
}

fn store_migrate(conn: &Connection) -> Result<()> {
    let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if user_version < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS conversation_sync (
  user_id TEXT NOT NULL,
  conversation_id TEXT NOT NULL,
  revision INTEGER NOT NULL,
  deleted INTEGER NOT NULL DEFAULT 0,
  data TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (user_id, conversation_id)
);

CREATE INDEX IF NOT EXISTS idx_conversation_sync_user_updated
  ON conversation_sync(user_id, updated_at DESC);
"#,
        )?;
        conn.execute_batch("PRAGMA user_version = 1;")?;
    }
    Ok(())
}

fn with_immediate_transaction<T>(conn: &Connection, f: impl FnOnce() -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE;")?;
    match f() {
        Ok(v) => {
            conn.execute_batch("COMMIT;")?;
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(e)
        }
    }
}

/// Authoritative per-user revision log. Every accepted write bumps the row's
/// revision inside a single immediate transaction, so revisions are strictly
/// increasing per `(user, conversation)` even under concurrent writers.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_millis(5_000))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        store_migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        store_migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("poisoned lock"))
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<ConversationMetaRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT conversation_id, revision, deleted, updated_at
               FROM conversation_sync
               WHERE user_id = ?1
               ORDER BY updated_at DESC, conversation_id ASC"#,
        )?;
        let mut rows = stmt.query(params![user_id])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let revision: i64 = row.get(1)?;
            let deleted: i64 = row.get(2)?;
            out.push(ConversationMetaRecord {
                conversation_id: row.get(0)?,
                revision: revision as u64,
                deleted: deleted != 0,
                updated_at_ms: row.get(3)?,
            });
        }
        Ok(out)
    }

    pub fn get(&self, user_id: &str, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        let conn = self.lock_conn()?;
        let row: Option<(i64, i64, Option<String>, i64, i64)> = conn
            .query_row(
                r#"SELECT revision, deleted, data, created_at, updated_at
                   FROM conversation_sync
                   WHERE user_id = ?1 AND conversation_id = ?2"#,
                params![user_id, conversation_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((revision, deleted, data, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let data = match data {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(Some(ConversationRecord {
            conversation_id: conversation_id.to_string(),
            revision: revision as u64,
            deleted: deleted != 0,
            data,
            created_at_ms: created_at,
            updated_at_ms: updated_at,
        }))
    }

    pub fn upsert(
        &self,
        user_id: &str,
        conversation_id: &str,
        base_revision: Option<u64>,
        data: &Value,
    ) -> Result<WriteOutcome> {
        let serialized = serde_json::to_string(data)?;
        let conn = self.lock_conn()?;
        with_immediate_transaction(&conn, || {
            let now = now_ms();
            match base_revision {
                // Create semantics: never overwrite an existing row.
                None => {
                    if let Some((revision, deleted)) =
                        current_row(&conn, user_id, conversation_id)?
                    {
                        return Ok(WriteOutcome::Conflict { revision, deleted });
                    }
                    conn.execute(
                        r#"INSERT INTO conversation_sync(
                             user_id, conversation_id, revision, deleted, data, created_at, updated_at
                           )
                           VALUES (?1, ?2, 1, 0, ?3, ?4, ?4)"#,
                        params![user_id, conversation_id, serialized, now],
                    )?;
                    Ok(WriteOutcome::Ok {
                        revision: 1,
                        updated_at_ms: now,
                    })
                }
                Some(base) => {
                    // A base that cannot exist (e.g. 0 or > i64::MAX) never
                    // matches the equality guard, so the lookup below decides
                    // between conflict and not-found.
                    let base = i64::try_from(base).unwrap_or(-1);
                    let updated = conn.execute(
                        r#"UPDATE conversation_sync
                           SET revision = revision + 1,
                               deleted = 0,
                               data = ?4,
                               updated_at = ?5
                           WHERE user_id = ?1 AND conversation_id = ?2 AND revision = ?3"#,
                        params![user_id, conversation_id, base, serialized, now],
                    )?;
                    if updated == 1 {
                        return Ok(WriteOutcome::Ok {
                            revision: (base as u64) + 1,
                            updated_at_ms: now,
                        });
                    }
                    match current_row(&conn, user_id, conversation_id)? {
                        Some((revision, deleted)) => {
                            Ok(WriteOutcome::Conflict { revision, deleted })
                        }
                        None => Ok(WriteOutcome::NotFound),
                    }
                }
            }
        })
    }

    pub fn tombstone(
        &self,
        user_id: &str,
        conversation_id: &str,
        base_revision: Option<u64>,
    ) -> Result<WriteOutcome> {
        let conn = self.lock_conn()?;
        with_immediate_transaction(&conn, || {
            let now = now_ms();
            match base_revision {
                None => {
                    if let Some((revision, deleted)) =
                        current_row(&conn, user_id, conversation_id)?
                    {
                        return Ok(WriteOutcome::Conflict { revision, deleted });
                    }
                    // Deleting something we never saw still records the
                    // intent: other clients must observe the tombstone.
                    conn.execute(
                        r#"INSERT INTO conversation_sync(
                             user_id, conversation_id, revision, deleted, data, created_at, updated_at
                           )
                           VALUES (?1, ?2, 1, 1, NULL, ?3, ?3)"#,
                        params![user_id, conversation_id, now],
                    )?;
                    Ok(WriteOutcome::Ok {
                        revision: 1,
                        updated_at_ms: now,
                    })
                }
                Some(base) => {
                    let base = i64::try_from(base).unwrap_or(-1);
                    let updated = conn.execute(
                        r#"UPDATE conversation_sync
                           SET revision = revision + 1,
                               deleted = 1,
                               data = NULL,
                               updated_at = ?4
                           WHERE user_id = ?1 AND conversation_id = ?2 AND revision = ?3"#,
                        params![user_id, conversation_id, base, now],
                    )?;
                    if updated == 1 {
                        return Ok(WriteOutcome::Ok {
                            revision: (base as u64) + 1,
                            updated_at_ms: now,
                        });
                    }
                    match current_row(&conn, user_id, conversation_id)? {
                        Some((revision, deleted)) => {
                            Ok(WriteOutcome::Conflict { revision, deleted })
                        }
                        None => Ok(WriteOutcome::NotFound),
                    }
                }
            }
        })
    }

    /// Administrative purge: the only path that physically removes history.
    pub fn purge_user(&self, user_id: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            r#"DELETE FROM conversation_sync WHERE user_id = ?1"#,
            params![user_id],
        )?;
        Ok(removed as u64)
    }
}

fn current_row(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
) -> Result<Option<(u64, bool)>> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            r#"SELECT revision, deleted
               FROM conversation_sync
               WHERE user_id = ?1 AND conversation_id = ?2"#,
            params![user_id, conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row.map(|(revision, deleted)| (revision as u64, deleted != 0)))
}
