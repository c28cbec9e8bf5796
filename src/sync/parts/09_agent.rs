/// Everything the agent needs to start syncing one user's conversations.
pub struct AgentConfig {
    pub user_id: String,
    pub engine: EngineConfig,
}

impl AgentConfig {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            engine: EngineConfig::default(),
        }
    }
}

struct AgentInner {
    engine: SyncEngine,
    observer_id: u64,
}

impl AgentInner {
    fn stop(&self) {
        self.engine.stop();
        self.engine.store().unsubscribe(self.observer_id);
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle on the running sync agent. Cloneable; `stop` tears down the
/// watcher, timers, and realtime channel, and turns any in-flight callbacks
/// into no-ops.
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<AgentInner>,
}

impl AgentHandle {
    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.engine.is_stopped()
    }

    pub fn stop(&self) {
        self.inner.stop();
    }
}

static ACTIVE_AGENT: Mutex<Option<AgentHandle>> = Mutex::new(None);

/// Start the sync agent for one user. The agent is a process-wide
/// singleton: a second start while one is live returns the existing handle.
///
/// The local store must already be hydrated (ConversationStore::open loads
/// synchronously, so any opened store qualifies).
pub fn start_agent(
    store: ConversationStore,
    live_transport: Arc<dyn SyncTransport>,
    config: AgentConfig,
) -> Result<AgentHandle> {
    let mut active = ACTIVE_AGENT
        .lock()
        .map_err(|_| anyhow!("poisoned lock"))?;
    if let Some(handle) = active.as_ref() {
        if !handle.is_stopped() {
            return Ok(handle.clone());
        }
    }

    let engine = SyncEngine::new(store, &config.user_id, config.engine)?;

    // Watcher first, so local edits made during the initial pull are queued
    // rather than lost.
    let watcher = engine.clone();
    let observer_id = engine
        .store()
        .subscribe(move |prev, next| watcher.handle_store_change(prev, next));

    engine.start_scheduler();

    match engine.initial_pull(live_transport.as_ref()) {
        Ok(()) => {
            engine.enable_transport(live_transport);
            engine.reconcile_dirty();
            engine.flush_all_dirty();
            engine.start_realtime();
        }
        Err(e) => {
            // Offline start: the transport stays disabled, queued intents
            // stay persisted, and the next start retries.
            tracing::warn!("initial pull failed; sync stays offline: {e}");
        }
    }

    let handle = AgentHandle {
        inner: Arc::new(AgentInner {
            engine,
            observer_id,
        }),
    };
    *active = Some(handle.clone());
    Ok(handle)
}

impl SyncEngine {
    /// Bring local revision knowledge up to date from the server listing and
    /// apply remote rows we have never seen. Dirty ids are left completely
    /// alone: their stale base revision is exactly what makes the next push
    /// 409 so the resolver can run.
    pub fn initial_pull(&self, transport: &dyn SyncTransport) -> Result<()> {
        let known: HashMap<String, u64> = {
            let state = self
                .shared
                .state
                .lock()
                .map_err(|_| anyhow!("poisoned lock"))?;
            state
                .sync
                .entries()
                .iter()
                .filter_map(|(id, entry)| entry.remote_revision.map(|rev| (id.clone(), rev)))
                .collect()
        };

        let items = transport.list_conversations()?;

        for item in &items {
            let id = item.conversation_id.as_str();
            let dirty = {
                let Ok(state) = self.shared.state.lock() else {
                    continue;
                };
                state.sync.dirty_op(id).is_some()
            };
            if dirty {
                continue;
            }

            if let Ok(mut state) = self.shared.state.lock() {
                let _ = state.sync.set_remote_revision(id, item.revision);
            }

            if item.deleted {
                if self.shared.store.contains(id) {
                    self.shared.mute.with_muted(id, || {
                        if let Err(e) = self.shared.store.remove(id) {
                            tracing::warn!("failed to apply remote delete of {id}: {e}");
                        }
                    });
                }
                continue;
            }

            let have_local = self.shared.store.contains(id);
            if have_local && known.get(id) == Some(&item.revision) {
                continue;
            }

            let remote = match transport.get_conversation(id) {
                Ok(Some(remote)) => remote,
                Ok(None) => continue,
                Err(e) => {
                    self.record_error(id, &format!("remote_fetch_failed: {e}"));
                    continue;
                }
            };
            self.apply_remote_record(id, &remote);
            if let Ok(mut state) = self.shared.state.lock() {
                let _ = state.sync.set_remote_revision(id, remote.revision);
            }
        }

        Ok(())
    }

    /// Rebuild upload payload buffers for persisted dirty upserts. A
    /// conversation that vanished locally or is no longer eligible drops its
    /// intent; the engine never turns a missing payload into a delete.
    pub fn reconcile_dirty(&self) {
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        for (id, op) in state.sync.dirty_ids() {
            if op != DirtyOp::Upsert {
                continue;
            }
            match self.shared.store.get(&id) {
                Some(doc) if is_sync_eligible(&doc) => {
                    state.pending_payloads.insert(id, sanitize(&doc));
                }
                _ => {
                    let _ = state
                        .sync
                        .set_error(&id, Some("missing_upsert_payload".to_string()));
                    let _ = state.sync.clear_dirty(&id);
                    state.pending_payloads.remove(&id);
                    state.dirty_generation.remove(&id);
                }
            }
        }
    }

    pub fn flush_all_dirty(&self) {
        let dirty: Vec<String> = {
            let Ok(state) = self.shared.state.lock() else {
                return;
            };
            state
                .sync
                .dirty_ids()
                .into_iter()
                .map(|(id, _)| id)
                .collect()
        };
        for id in dirty {
            self.try_flush(&id);
        }
    }
}
