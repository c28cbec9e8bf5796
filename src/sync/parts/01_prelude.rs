use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{now_ms, ConversationStore};
use crate::server::{SyncCore, WriteOutcome};

/// One row of the server's conversation listing.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationMeta {
    pub conversation_id: String,
    pub revision: u64,
    pub deleted: bool,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct RemoteConversation {
    pub conversation_id: String,
    pub revision: u64,
    pub deleted: bool,
    pub data: Option<Value>,
}

/// Server verdict on a push. A conflict is an expected outcome, not an
/// error: it must reach the resolver instead of a retry loop.
#[derive(Clone, Debug, PartialEq)]
pub enum PushOutcome {
    Ack { revision: u64 },
    Conflict { revision: u64, deleted: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteChange {
    pub conversation_id: String,
    pub revision: u64,
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Ready,
    Changed(RemoteChange),
    Closed,
}

/// One realtime connection attempt. The subscription ends when the server
/// closes the stream (TTL) or the connection drops; reconnecting is the
/// realtime channel's job.
pub struct EventSubscription {
    rx: Receiver<TransportEvent>,
    stop: Arc<AtomicBool>,
}

impl EventSubscription {
    pub fn new(rx: Receiver<TransportEvent>, stop: Arc<AtomicBool>) -> Self {
        Self { rx, stop }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<TransportEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub trait SyncTransport: Send + Sync {
    fn list_conversations(&self) -> Result<Vec<ConversationMeta>>;
    fn get_conversation(&self, conversation_id: &str) -> Result<Option<RemoteConversation>>;
    fn upsert_conversation(
        &self,
        conversation_id: &str,
        base_revision: Option<u64>,
        data: &Value,
    ) -> Result<PushOutcome>;
    fn delete_conversation(
        &self,
        conversation_id: &str,
        base_revision: Option<u64>,
    ) -> Result<PushOutcome>;
    fn subscribe_events(&self) -> Result<EventSubscription>;
}

/// Placeholder transport installed until the initial pull has established
/// revision knowledge. Writes attempted through it fail without touching the
/// network.
pub struct DisabledTransport;

impl SyncTransport for DisabledTransport {
    fn list_conversations(&self) -> Result<Vec<ConversationMeta>> {
        Err(anyhow!("transport_disabled"))
    }

    fn get_conversation(&self, _conversation_id: &str) -> Result<Option<RemoteConversation>> {
        Err(anyhow!("transport_disabled"))
    }

    fn upsert_conversation(
        &self,
        _conversation_id: &str,
        _base_revision: Option<u64>,
        _data: &Value,
    ) -> Result<PushOutcome> {
        Err(anyhow!("transport_disabled"))
    }

    fn delete_conversation(
        &self,
        _conversation_id: &str,
        _base_revision: Option<u64>,
    ) -> Result<PushOutcome> {
        Err(anyhow!("transport_disabled"))
    }

    fn subscribe_events(&self) -> Result<EventSubscription> {
        Err(anyhow!("transport_disabled"))
    }
}

/// Transport that talks to an in-process server core directly. Carries the
/// exact request-level semantics of the HTTP surface, so multi-client
/// scenarios can run in one test process.
pub struct InProcessTransport {
    core: Arc<SyncCore>,
    user_id: String,
}

impl InProcessTransport {
    pub fn new(core: Arc<SyncCore>, user_id: &str) -> Self {
        Self {
            core,
            user_id: user_id.to_string(),
        }
    }
}

impl SyncTransport for InProcessTransport {
    fn list_conversations(&self) -> Result<Vec<ConversationMeta>> {
        let rows = self
            .core
            .list(&self.user_id)
            .map_err(anyhow::Error::from)?;
        Ok(rows
            .into_iter()
            .map(|row| ConversationMeta {
                conversation_id: row.conversation_id,
                revision: row.revision,
                deleted: row.deleted,
                updated_at_ms: row.updated_at_ms,
            })
            .collect())
    }

    fn get_conversation(&self, conversation_id: &str) -> Result<Option<RemoteConversation>> {
        let record = self
            .core
            .get(&self.user_id, conversation_id)
            .map_err(anyhow::Error::from)?;
        Ok(record.map(|record| RemoteConversation {
            conversation_id: record.conversation_id,
            revision: record.revision,
            deleted: record.deleted,
            data: record.data,
        }))
    }

    fn upsert_conversation(
        &self,
        conversation_id: &str,
        base_revision: Option<u64>,
        data: &Value,
    ) -> Result<PushOutcome> {
        let outcome = self
            .core
            .upsert(&self.user_id, conversation_id, base_revision, data)
            .map_err(anyhow::Error::from)?;
        match outcome {
            WriteOutcome::Ok { revision, .. } => Ok(PushOutcome::Ack { revision }),
            WriteOutcome::Conflict { revision, deleted } => {
                Ok(PushOutcome::Conflict { revision, deleted })
            }
            WriteOutcome::NotFound => Err(anyhow!("not_found")),
        }
    }

    fn delete_conversation(
        &self,
        conversation_id: &str,
        base_revision: Option<u64>,
    ) -> Result<PushOutcome> {
        let outcome = self
            .core
            .tombstone(&self.user_id, conversation_id, base_revision)
            .map_err(anyhow::Error::from)?;
        match outcome {
            WriteOutcome::Ok { revision, .. } => Ok(PushOutcome::Ack { revision }),
            WriteOutcome::Conflict { revision, deleted } => {
                Ok(PushOutcome::Conflict { revision, deleted })
            }
            WriteOutcome::NotFound => Err(anyhow!("not_found")),
        }
    }

    fn subscribe_events(&self) -> Result<EventSubscription> {
        let mut subscription = self.core.notifier().subscribe(&self.user_id);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();

        let thread_stop = Arc::clone(&stop);
        thread::spawn(move || {
            if tx.send(TransportEvent::Ready).is_err() {
                return;
            }
            loop {
                if thread_stop.load(Ordering::Relaxed) {
                    return;
                }
                match subscription.try_recv() {
                    Ok(event) => {
                        let change = RemoteChange {
                            conversation_id: event.conversation_id,
                            revision: event.revision,
                            deleted: event.deleted,
                        };
                        if tx.send(TransportEvent::Changed(change)).is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::mpsc::error::TryRecvError::Empty) => {
                        thread::sleep(Duration::from_millis(20));
                    }
                    Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => {
                        let _ = tx.send(TransportEvent::Closed);
                        return;
                    }
                }
            }
        });

        Ok(EventSubscription::new(rx, stop))
    }
}

/// Tunables for the client engine. The defaults match production behavior;
/// tests shrink the timers.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Quiet period after the last local mutation before an intent uploads.
    pub debounce: Duration,
    /// Upper bound on deferral while an id keeps mutating (e.g. a streaming
    /// assistant response).
    pub max_wait: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Wait before the single re-fetch that absorbs read-after-write lag.
    pub refetch_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(900),
            max_wait: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            refetch_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum IntentKind {
    Upsert(Value),
    Delete,
}

struct DebounceEntry {
    intent: IntentKind,
    last_touch: Instant,
    first_queued: Instant,
}

struct EngineState {
    sync: SyncStateStore,
    pending_payloads: HashMap<String, Value>,
    dirty_generation: HashMap<String, u64>,
    debounce: HashMap<String, DebounceEntry>,
    inflight: HashSet<String>,
    realtime_pending: HashMap<String, RemoteChange>,
    draining: bool,
    transport: Arc<dyn SyncTransport>,
    transport_live: bool,
}

struct EngineShared {
    store: ConversationStore,
    mute: MuteRegistry,
    state: Mutex<EngineState>,
    scheduler: Condvar,
    stopped: AtomicBool,
    disabled_logged: AtomicBool,
    next_generation: AtomicU64,
    config: EngineConfig,
}

/// The client sync engine. All state mutations serialize on one mutex; the
/// only parallelism is in-flight transport calls, bounded per id by the
/// in-flight set.
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<EngineShared>,
}

impl SyncEngine {
    pub fn new(store: ConversationStore, user_id: &str, config: EngineConfig) -> Result<Self> {
        let sync = SyncStateStore::load(&store, user_id)?;
        Ok(Self {
            shared: Arc::new(EngineShared {
                store,
                mute: MuteRegistry::new(),
                state: Mutex::new(EngineState {
                    sync,
                    pending_payloads: HashMap::new(),
                    dirty_generation: HashMap::new(),
                    debounce: HashMap::new(),
                    inflight: HashSet::new(),
                    realtime_pending: HashMap::new(),
                    draining: false,
                    transport: Arc::new(DisabledTransport),
                    transport_live: false,
                }),
                scheduler: Condvar::new(),
                stopped: AtomicBool::new(false),
                disabled_logged: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
                config,
            }),
        })
    }

    pub fn store(&self) -> &ConversationStore {
        &self.shared.store
    }

    pub fn mute(&self) -> &MuteRegistry {
        &self.shared.mute
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Relaxed);
        self.shared.scheduler.notify_all();
    }

    /// Hot-swap from the disabled placeholder to the live transport; write
    /// traffic starts flowing after this.
    pub fn enable_transport(&self, transport: Arc<dyn SyncTransport>) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.transport = transport;
            state.transport_live = true;
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn SyncTransport>> {
        let state = self.shared.state.lock().ok()?;
        if !state.transport_live {
            return None;
        }
        Some(Arc::clone(&state.transport))
    }

    fn next_generation(&self) -> u64 {
        self.shared.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Eventually-consistent view of the persisted per-id sync state.
    pub fn state_snapshot(&self) -> BTreeMap<String, SyncEntry> {
        self.shared
            .state
            .lock()
            .map(|state| state.sync.entries().clone())
            .unwrap_or_default()
    }
}
