/// Reference-counted per-conversation gate. While an id is muted, the
/// watcher ignores mutations to it, so applying remote changes locally does
/// not echo back as fresh upload intents. Counting (rather than a set) is
/// required: conflict resolution holds mutes for the copy id and the
/// original id at the same time.
pub struct MuteRegistry {
    counts: Mutex<HashMap<String, u32>>,
}

impl MuteRegistry {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_muted(&self, conversation_id: &str) -> bool {
        self.counts
            .lock()
            .map(|counts| counts.contains_key(conversation_id))
            .unwrap_or(false)
    }

    pub fn with_muted<T>(&self, conversation_id: &str, f: impl FnOnce() -> T) -> T {
        let _guard = self.acquire(conversation_id);
        f()
    }

    fn acquire(&self, conversation_id: &str) -> MuteGuard<'_> {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(conversation_id.to_string()).or_insert(0) += 1;
        }
        MuteGuard {
            registry: self,
            conversation_id: conversation_id.to_string(),
        }
    }
}

impl Default for MuteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct MuteGuard<'a> {
    registry: &'a MuteRegistry,
    conversation_id: String,
}

impl Drop for MuteGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut counts) = self.registry.counts.lock() {
            if let Some(count) = counts.get_mut(&self.conversation_id) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&self.conversation_id);
                }
            }
        }
    }
}
