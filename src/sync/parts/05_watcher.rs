impl SyncEngine {
    /// Store-diff entry point, called by the local store observer on every
    /// mutation. Muted ids never produce intents; that is the entire defense
    /// against remote-apply feedback loops.
    pub fn handle_store_change(
        &self,
        prev: &BTreeMap<String, Value>,
        next: &BTreeMap<String, Value>,
    ) {
        if self.is_stopped() {
            return;
        }

        for (id, prev_doc) in prev {
            if !next.contains_key(id) && is_sync_eligible(prev_doc) {
                // Never sync a delete for a conversation that was never
                // eligible to sync in the first place.
                self.queue_delete(id);
            }
        }

        for (id, doc) in next {
            match prev.get(id) {
                None => {
                    if is_sync_eligible(doc) {
                        self.queue_upsert(doc);
                    }
                }
                Some(prev_doc) if prev_doc != doc => {
                    if is_sync_eligible(prev_doc) && !is_sync_eligible(doc) {
                        // Became a placeholder again; retract it.
                        self.queue_delete(id);
                    } else if is_sync_eligible(doc) {
                        self.queue_upsert(doc);
                    }
                }
                Some(_) => {}
            }
        }
    }

    pub fn queue_upsert(&self, doc: &Value) {
        let Some(id) = doc.get("id").and_then(Value::as_str) else {
            return;
        };
        if self.shared.mute.is_muted(id) {
            return;
        }
        self.queue_intent(id, IntentKind::Upsert(sanitize(doc)));
    }

    pub fn queue_delete(&self, conversation_id: &str) {
        if self.shared.mute.is_muted(conversation_id) {
            return;
        }
        self.queue_intent(conversation_id, IntentKind::Delete);
    }

    fn queue_intent(&self, conversation_id: &str, intent: IntentKind) {
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        let now = Instant::now();
        match state.debounce.get_mut(conversation_id) {
            Some(entry) => {
                let flipped = matches!(
                    (&entry.intent, &intent),
                    (IntentKind::Upsert(_), IntentKind::Delete)
                        | (IntentKind::Delete, IntentKind::Upsert(_))
                );
                entry.intent = intent;
                entry.last_touch = now;
                if flipped {
                    // The max-wait clock tracks the age of the current
                    // intent kind.
                    entry.first_queued = now;
                }
            }
            None => {
                state.debounce.insert(
                    conversation_id.to_string(),
                    DebounceEntry {
                        intent,
                        last_touch: now,
                        first_queued: now,
                    },
                );
            }
        }
        drop(state);
        self.shared.scheduler.notify_all();
    }

    /// Spawn the debounce scheduler thread; it exits when the engine stops.
    pub fn start_scheduler(&self) {
        let engine = self.clone();
        thread::spawn(move || engine.scheduler_loop());
    }

    /// Debounce scheduler: one thread owns every per-id deadline. An intent
    /// fires `debounce` after the last touch, but never later than
    /// `max_wait` after it was first queued, so continuous streaming edits
    /// still make progress.
    fn scheduler_loop(&self) {
        let config = &self.shared.config;
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };

        loop {
            if self.is_stopped() {
                return;
            }

            let now = Instant::now();
            let mut due: Vec<String> = Vec::new();
            let mut next_deadline: Option<Instant> = None;
            for (id, entry) in &state.debounce {
                let deadline =
                    (entry.last_touch + config.debounce).min(entry.first_queued + config.max_wait);
                if deadline <= now {
                    due.push(id.clone());
                } else {
                    next_deadline = Some(match next_deadline {
                        Some(existing) => existing.min(deadline),
                        None => deadline,
                    });
                }
            }

            if !due.is_empty() {
                for id in &due {
                    if let Some(entry) = state.debounce.remove(id) {
                        self.promote_intent(&mut state, id, entry.intent);
                    }
                }
                drop(state);
                for id in due {
                    self.spawn_flush(id);
                }
                state = match self.shared.state.lock() {
                    Ok(state) => state,
                    Err(_) => return,
                };
                continue;
            }

            state = match next_deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    match self.shared.scheduler.wait_timeout(state, timeout) {
                        Ok((state, _)) => state,
                        Err(_) => return,
                    }
                }
                None => match self.shared.scheduler.wait(state) {
                    Ok(state) => state,
                    Err(_) => return,
                },
            };
        }
    }

    fn promote_intent(&self, state: &mut EngineState, conversation_id: &str, intent: IntentKind) {
        let (op, payload) = match intent {
            IntentKind::Upsert(payload) => (DirtyOp::Upsert, Some(payload)),
            IntentKind::Delete => (DirtyOp::Delete, None),
        };
        if let Err(e) = state.sync.mark_dirty(conversation_id, op) {
            tracing::warn!("failed to persist dirty intent for {conversation_id}: {e}");
        }
        match payload {
            Some(payload) => {
                state
                    .pending_payloads
                    .insert(conversation_id.to_string(), payload);
            }
            None => {
                // A delete supersedes any buffered upsert payload.
                state.pending_payloads.remove(conversation_id);
            }
        }
        let generation = self.next_generation();
        state
            .dirty_generation
            .insert(conversation_id.to_string(), generation);
    }

    fn spawn_flush(&self, conversation_id: String) {
        let engine = self.clone();
        thread::spawn(move || engine.try_flush(&conversation_id));
    }
}
