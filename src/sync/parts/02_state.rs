const SYNC_STATE_SCHEMA_VERSION: u32 = 1;

fn sync_state_key(user_id: &str) -> String {
    format!("sync.state:{user_id}")
}

/// A pending local intent that the server has not acknowledged yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyOp {
    Upsert,
    Delete,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty_op: Option<DirtyOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncEntry {
    fn is_empty(&self) -> bool {
        self.remote_revision.is_none()
            && self.dirty_op.is_none()
            && self.last_attempt_at_ms.is_none()
            && self.last_error.is_none()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSyncState {
    schema_version: u32,
    entries: BTreeMap<String, SyncEntry>,
}

/// Durable per-conversation sync bookkeeping, persisted write-through as one
/// versioned JSON document in the client kv table. The pending upsert
/// payload buffer deliberately lives elsewhere: it is rebuilt from the local
/// store on restart, never persisted.
pub struct SyncStateStore {
    store: ConversationStore,
    key: String,
    entries: BTreeMap<String, SyncEntry>,
}

impl SyncStateStore {
    pub fn load(store: &ConversationStore, user_id: &str) -> Result<Self> {
        let key = sync_state_key(user_id);
        let raw = store.with_conn(|conn| crate::db::kv_get_string(conn, &key))?;

        let entries = match raw {
            None => BTreeMap::new(),
            Some(raw) => match serde_json::from_str::<PersistedSyncState>(&raw) {
                Ok(persisted) if persisted.schema_version == SYNC_STATE_SCHEMA_VERSION => {
                    persisted.entries
                }
                Ok(persisted) => {
                    tracing::warn!(
                        version = persisted.schema_version,
                        "discarding sync state with unknown schema version"
                    );
                    BTreeMap::new()
                }
                Err(e) => {
                    tracing::warn!("discarding unreadable sync state: {e}");
                    BTreeMap::new()
                }
            },
        };

        Ok(Self {
            store: store.clone(),
            key,
            entries,
        })
    }

    fn persist(&self) -> Result<()> {
        let serialized = serde_json::to_string(&PersistedSyncState {
            schema_version: SYNC_STATE_SCHEMA_VERSION,
            entries: self.entries.clone(),
        })?;
        self.store
            .with_conn(|conn| crate::db::kv_set_string(conn, &self.key, &serialized))
    }

    pub fn entries(&self) -> &BTreeMap<String, SyncEntry> {
        &self.entries
    }

    pub fn entry(&self, conversation_id: &str) -> Option<&SyncEntry> {
        self.entries.get(conversation_id)
    }

    pub fn remote_revision(&self, conversation_id: &str) -> Option<u64> {
        self.entries
            .get(conversation_id)
            .and_then(|entry| entry.remote_revision)
    }

    pub fn dirty_op(&self, conversation_id: &str) -> Option<DirtyOp> {
        self.entries
            .get(conversation_id)
            .and_then(|entry| entry.dirty_op)
    }

    pub fn dirty_ids(&self) -> Vec<(String, DirtyOp)> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| entry.dirty_op.map(|op| (id.clone(), op)))
            .collect()
    }

    pub fn mark_dirty(&mut self, conversation_id: &str, op: DirtyOp) -> Result<()> {
        self.entries
            .entry(conversation_id.to_string())
            .or_default()
            .dirty_op = Some(op);
        self.persist()
    }

    pub fn clear_dirty(&mut self, conversation_id: &str) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(conversation_id) {
            entry.dirty_op = None;
        }
        self.prune(conversation_id);
        self.persist()
    }

    pub fn set_remote_revision(&mut self, conversation_id: &str, revision: u64) -> Result<()> {
        self.entries
            .entry(conversation_id.to_string())
            .or_default()
            .remote_revision = Some(revision);
        self.persist()
    }

    pub fn set_attempt(&mut self, conversation_id: &str, at_ms: i64) -> Result<()> {
        self.entries
            .entry(conversation_id.to_string())
            .or_default()
            .last_attempt_at_ms = Some(at_ms);
        self.persist()
    }

    pub fn set_error(&mut self, conversation_id: &str, error: Option<String>) -> Result<()> {
        if error.is_none() && !self.entries.contains_key(conversation_id) {
            return Ok(());
        }
        self.entries
            .entry(conversation_id.to_string())
            .or_default()
            .last_error = error;
        self.prune(conversation_id);
        self.persist()
    }

    pub fn forget(&mut self, conversation_id: &str) -> Result<()> {
        if self.entries.remove(conversation_id).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn prune(&mut self, conversation_id: &str) {
        if self
            .entries
            .get(conversation_id)
            .is_some_and(SyncEntry::is_empty)
        {
            self.entries.remove(conversation_id);
        }
    }
}
