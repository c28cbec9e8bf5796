impl SyncEngine {
    /// Flush one conversation's dirty intent. At most one request is in
    /// flight per id; between ids nothing is ordered. Failures stay dirty
    /// and retry event-driven (next store change, next realtime event, next
    /// startup), never on a timer, and a conflict never retries at all: it
    /// goes to the resolver.
    pub fn try_flush(&self, conversation_id: &str) {
        if self.is_stopped() {
            return;
        }

        let (op, base_revision, payload, generation, transport) = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            if state.inflight.contains(conversation_id) {
                return;
            }
            let Some(op) = state.sync.dirty_op(conversation_id) else {
                return;
            };
            if !state.transport_live {
                if !self.shared.disabled_logged.swap(true, Ordering::Relaxed) {
                    tracing::debug!("upload attempted before initial pull; transport disabled");
                }
                return;
            }

            if let Err(e) = state.sync.set_attempt(conversation_id, now_ms()) {
                tracing::warn!("failed to record sync attempt for {conversation_id}: {e}");
            }

            let payload = match op {
                DirtyOp::Upsert => {
                    match state.pending_payloads.get(conversation_id).cloned() {
                        Some(payload) => Some(payload),
                        None => {
                            // Nothing rebuildable to send. Drop the intent;
                            // extrapolating a delete would be destructive.
                            let _ = state.sync.set_error(
                                conversation_id,
                                Some("missing_upsert_payload".to_string()),
                            );
                            let _ = state.sync.clear_dirty(conversation_id);
                            state.dirty_generation.remove(conversation_id);
                            return;
                        }
                    }
                }
                DirtyOp::Delete => None,
            };

            let generation = state
                .dirty_generation
                .get(conversation_id)
                .copied()
                .unwrap_or(0);
            state.inflight.insert(conversation_id.to_string());
            let base_revision = state.sync.remote_revision(conversation_id);
            let transport = Arc::clone(&state.transport);
            (op, base_revision, payload, generation, transport)
        };

        let result = match (op, payload.as_ref()) {
            (DirtyOp::Upsert, Some(payload)) => {
                transport.upsert_conversation(conversation_id, base_revision, payload)
            }
            (DirtyOp::Upsert, None) => Err(anyhow!("missing_upsert_payload")),
            (DirtyOp::Delete, _) => transport.delete_conversation(conversation_id, base_revision),
        };

        if self.is_stopped() {
            // Late resume after stop(): leave state untouched.
            if let Ok(mut state) = self.shared.state.lock() {
                state.inflight.remove(conversation_id);
            }
            return;
        }

        let mut conflict = None;
        {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            match &result {
                Ok(PushOutcome::Ack { revision }) => {
                    if let Err(e) = state.sync.set_remote_revision(conversation_id, *revision) {
                        tracing::warn!("failed to persist revision for {conversation_id}: {e}");
                    }
                    let unchanged = state
                        .dirty_generation
                        .get(conversation_id)
                        .is_none_or(|current| *current == generation);
                    if unchanged {
                        let _ = state.sync.clear_dirty(conversation_id);
                        let _ = state.sync.set_error(conversation_id, None);
                        state.pending_payloads.remove(conversation_id);
                        state.dirty_generation.remove(conversation_id);
                    }
                    tracing::debug!(
                        conversation = conversation_id,
                        revision,
                        "sync push acknowledged"
                    );
                }
                Ok(PushOutcome::Conflict { revision, deleted }) => {
                    conflict = Some((op, *revision, *deleted));
                }
                Err(e) => {
                    let _ = state
                        .sync
                        .set_error(conversation_id, Some(e.to_string()));
                    tracing::debug!("sync push failed for {conversation_id}: {e}");
                }
            }
            if conflict.is_none() {
                state.inflight.remove(conversation_id);
            }
        }

        if let Some((op, revision, deleted)) = conflict {
            tracing::debug!(
                conversation = conversation_id,
                revision,
                deleted,
                "sync push conflicted; resolving"
            );
            match (op, payload) {
                (DirtyOp::Upsert, Some(attempted)) => {
                    self.resolve_upsert_conflict(conversation_id, attempted);
                }
                (DirtyOp::Upsert, None) => {}
                (DirtyOp::Delete, _) => self.resolve_delete_conflict(conversation_id),
            }
            if let Ok(mut state) = self.shared.state.lock() {
                state.inflight.remove(conversation_id);
            }
        }

        // The intent may have changed while the request was in flight.
        let reflush = {
            let Ok(state) = self.shared.state.lock() else {
                return;
            };
            state.sync.dirty_op(conversation_id).is_some()
                && state
                    .dirty_generation
                    .get(conversation_id)
                    .is_some_and(|current| *current != generation)
        };
        if reflush {
            self.try_flush(conversation_id);
        }
    }

    /// Direct enqueue that bypasses the watcher debounce. Used for conflict
    /// copies, which are imported under mute and would otherwise never
    /// upload.
    pub fn enqueue_dirty_upsert(&self, conversation_id: &str, payload: Value) {
        {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            if let Err(e) = state.sync.mark_dirty(conversation_id, DirtyOp::Upsert) {
                tracing::warn!("failed to persist dirty intent for {conversation_id}: {e}");
            }
            state
                .pending_payloads
                .insert(conversation_id.to_string(), payload);
            let generation = self.next_generation();
            state
                .dirty_generation
                .insert(conversation_id.to_string(), generation);
        }
        self.try_flush(conversation_id);
    }
}
