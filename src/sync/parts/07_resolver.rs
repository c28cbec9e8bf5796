fn conflict_copy_title(attempted: &Value) -> String {
    match attempted.get("title").and_then(Value::as_str) {
        Some(title) if !title.trim().is_empty() => format!("{title} (conflict copy)"),
        _ => "Conversation (conflict copy)".to_string(),
    }
}

impl SyncEngine {
    /// A concurrent writer won the original id. Keep both outcomes: the
    /// server's version takes over the original id, and the attempted local
    /// edit survives as a new conversation with a fresh id.
    pub(crate) fn resolve_upsert_conflict(&self, conversation_id: &str, attempted: Value) {
        let Some(transport) = self.current_transport() else {
            return;
        };

        // Copy creation is gated on a successful remote read, so a retried
        // resolution never mints duplicate copies.
        let remote = match transport.get_conversation(conversation_id) {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                self.record_error(conversation_id, "remote_fetch_failed: row missing");
                return;
            }
            Err(e) => {
                self.record_error(conversation_id, &format!("remote_fetch_failed: {e}"));
                return;
            }
        };

        let copy_id = uuid::Uuid::new_v4().to_string();
        let mut copy = sanitize(&attempted);
        if let Some(obj) = copy.as_object_mut() {
            let now = now_ms();
            obj.insert("id".to_string(), Value::from(copy_id.clone()));
            obj.insert("title".to_string(), Value::from(conflict_copy_title(&attempted)));
            obj.insert("created_at_ms".to_string(), Value::from(now));
            obj.insert("updated_at_ms".to_string(), Value::from(now));
        }

        let saved = self
            .shared
            .mute
            .with_muted(&copy_id, || self.shared.store.save(&copy));
        if let Err(e) = saved {
            self.record_error(conversation_id, &format!("conflict_copy_save_failed: {e}"));
            return;
        }

        self.apply_remote_record(conversation_id, &remote);

        {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            let _ = state
                .sync
                .set_remote_revision(conversation_id, remote.revision);
            let _ = state.sync.clear_dirty(conversation_id);
            let _ = state.sync.set_error(conversation_id, None);
            state.pending_payloads.remove(conversation_id);
            state.dirty_generation.remove(conversation_id);
        }

        tracing::debug!(
            conversation = conversation_id,
            copy = %copy_id,
            revision = remote.revision,
            "conflict resolved; local attempt preserved as copy"
        );

        // The copy was imported under mute, so the watcher will not emit it.
        self.enqueue_dirty_upsert(&copy_id, copy);
    }

    /// A local delete lost against a concurrent remote write. Accept the
    /// remote: a surviving remote row cancels the delete intent, a remote
    /// tombstone just means someone else deleted it first.
    pub(crate) fn resolve_delete_conflict(&self, conversation_id: &str) {
        let Some(transport) = self.current_transport() else {
            return;
        };

        let remote = match transport.get_conversation(conversation_id) {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                self.record_error(conversation_id, "remote_fetch_failed: row missing");
                return;
            }
            Err(e) => {
                self.record_error(conversation_id, &format!("remote_fetch_failed: {e}"));
                return;
            }
        };

        self.apply_remote_record(conversation_id, &remote);

        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        let _ = state
            .sync
            .set_remote_revision(conversation_id, remote.revision);
        let _ = state.sync.clear_dirty(conversation_id);
        let _ = state.sync.set_error(conversation_id, None);
        state.pending_payloads.remove(conversation_id);
        state.dirty_generation.remove(conversation_id);
    }

    /// Overwrite the local row with remote truth, under mute.
    fn apply_remote_record(&self, conversation_id: &str, remote: &RemoteConversation) {
        self.shared.mute.with_muted(conversation_id, || {
            if remote.deleted {
                if let Err(e) = self.shared.store.remove(conversation_id) {
                    tracing::warn!("failed to apply remote delete of {conversation_id}: {e}");
                }
            } else if let Some(data) = &remote.data {
                if let Err(e) = self.shared.store.save(&inflate(data)) {
                    tracing::warn!("failed to apply remote blob of {conversation_id}: {e}");
                }
            } else {
                tracing::warn!(
                    "remote conversation {conversation_id} is live but carried no blob"
                );
            }
        });
    }

    fn record_error(&self, conversation_id: &str, message: &str) {
        if let Ok(mut state) = self.shared.state.lock() {
            let _ = state
                .sync
                .set_error(conversation_id, Some(message.to_string()));
        }
    }
}
