impl SyncEngine {
    /// Spawn the realtime consumer thread; it exits when the engine stops.
    pub fn start_realtime(&self) {
        let engine = self.clone();
        thread::spawn(move || engine.realtime_loop());
    }

    /// Consume the server event stream until the engine stops, reconnecting
    /// with exponential backoff. Runs on its own thread.
    fn realtime_loop(&self) {
        let config = &self.shared.config;
        let mut backoff = config.initial_backoff;

        while !self.is_stopped() {
            let Some(transport) = self.current_transport() else {
                return;
            };

            match transport.subscribe_events() {
                Ok(subscription) => {
                    let mut saw_ready = false;
                    loop {
                        if self.is_stopped() {
                            return;
                        }
                        match subscription.recv_timeout(Duration::from_millis(250)) {
                            Ok(TransportEvent::Ready) => {
                                saw_ready = true;
                                backoff = config.initial_backoff;
                            }
                            Ok(TransportEvent::Changed(change)) => {
                                self.note_remote_change(change);
                            }
                            Ok(TransportEvent::Closed) => {
                                // Server TTL close; reconnect promptly so
                                // authorization gates re-apply.
                                break;
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    if !saw_ready {
                        backoff = next_backoff(backoff, config.max_backoff);
                    }
                }
                Err(e) => {
                    tracing::debug!("realtime subscribe failed: {e}");
                    backoff = next_backoff(backoff, config.max_backoff);
                }
            }

            self.sleep_unless_stopped(backoff);
        }
    }

    /// Coalesce an incoming event by id, keeping only the highest revision,
    /// and make sure exactly one drain loop is running.
    pub fn note_remote_change(&self, change: RemoteChange) {
        let drain = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            let entry = state
                .realtime_pending
                .entry(change.conversation_id.clone());
            use std::collections::hash_map::Entry;
            match entry {
                Entry::Occupied(mut occupied) => {
                    if change.revision > occupied.get().revision {
                        occupied.insert(change);
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(change);
                }
            }
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };
        if drain {
            self.drain_remote_changes();
        }
    }

    /// Serial drain: one entry at a time across all ids, so at most one GET
    /// per drain cycle per id. Events arriving mid-drain just update the
    /// pending map and get picked up on a later iteration.
    fn drain_remote_changes(&self) {
        loop {
            if self.is_stopped() {
                if let Ok(mut state) = self.shared.state.lock() {
                    state.draining = false;
                }
                return;
            }
            let next = {
                let Ok(mut state) = self.shared.state.lock() else {
                    return;
                };
                match state.realtime_pending.keys().next().cloned() {
                    Some(id) => state.realtime_pending.remove(&id),
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            if let Some(change) = next {
                self.apply_remote_change(change);
            }
        }
    }

    fn apply_remote_change(&self, change: RemoteChange) {
        let conversation_id = change.conversation_id.as_str();

        let transport = {
            let Ok(state) = self.shared.state.lock() else {
                return;
            };
            // Local wins until the 409 path resolves it.
            if state.sync.dirty_op(conversation_id).is_some() {
                return;
            }
            if state
                .sync
                .remote_revision(conversation_id)
                .is_some_and(|revision| revision >= change.revision)
            {
                return;
            }
            if !state.transport_live {
                return;
            }
            Arc::clone(&state.transport)
        };

        if change.deleted {
            self.shared.mute.with_muted(conversation_id, || {
                if self.shared.store.contains(conversation_id) {
                    if let Err(e) = self.shared.store.remove(conversation_id) {
                        tracing::warn!("failed to apply remote delete of {conversation_id}: {e}");
                        return;
                    }
                }
                if let Ok(mut state) = self.shared.state.lock() {
                    let _ = state
                        .sync
                        .set_remote_revision(conversation_id, change.revision);
                }
            });
            return;
        }

        let mut remote = match transport.get_conversation(conversation_id) {
            Ok(Some(remote)) => remote,
            Ok(None) => return,
            Err(e) => {
                self.record_error(conversation_id, &format!("remote_fetch_failed: {e}"));
                return;
            }
        };

        // A replica can serve a read that lags the write the event announced.
        if remote.revision < change.revision {
            thread::sleep(self.shared.config.refetch_delay);
            remote = match transport.get_conversation(conversation_id) {
                Ok(Some(remote)) => remote,
                Ok(None) => return,
                Err(e) => {
                    self.record_error(conversation_id, &format!("remote_fetch_failed: {e}"));
                    return;
                }
            };
        }

        self.apply_remote_record(conversation_id, &remote);
        if let Ok(mut state) = self.shared.state.lock() {
            let _ = state
                .sync
                .set_remote_revision(conversation_id, remote.revision);
        }
    }

    fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    use rand::Rng;

    let doubled = current.saturating_mul(2).min(max);
    // Jitter +/- 10% so reconnecting clients do not stampede.
    let jitter = rand::thread_rng().gen_range(0.9..1.1);
    doubled.mul_f64(jitter).min(max)
}
