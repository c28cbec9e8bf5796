use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Metadata published to a user's subscribers on every accepted write.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub conversation_id: String,
    pub revision: u64,
    pub deleted: bool,
    pub updated_at: i64,
}

struct SubscriberEntry {
    id: Uuid,
    tx: UnboundedSender<ChangeEvent>,
}

/// In-process per-user publish/subscribe registry. One failing subscriber
/// never prevents delivery to the others; a user's entry disappears when the
/// last subscriber goes away. Multi-instance deployments substitute a broker
/// behind the same publish/subscribe surface.
pub struct Notifier {
    subscribers: Mutex<HashMap<String, Vec<SubscriberEntry>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(self: &Arc<Self>, user_id: &str) -> NotifierSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .entry(user_id.to_string())
                .or_default()
                .push(SubscriberEntry { id, tx });
        }
        NotifierSubscription {
            notifier: Arc::clone(self),
            user_id: user_id.to_string(),
            id,
            rx,
        }
    }

    pub fn publish(&self, user_id: &str, event: &ChangeEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(_) => return,
        };
        let Some(entries) = subscribers.get_mut(user_id) else {
            return;
        };
        entries.retain(|entry| {
            if entry.tx.send(event.clone()).is_ok() {
                true
            } else {
                tracing::debug!(
                    subscriber = %entry.id,
                    "dropping closed change subscriber"
                );
                false
            }
        });
        if entries.is_empty() {
            subscribers.remove(user_id);
        }
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.subscribers
            .lock()
            .map(|s| s.get(user_id).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn unsubscribe(&self, user_id: &str, id: Uuid) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(_) => return,
        };
        if let Some(entries) = subscribers.get_mut(user_id) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                subscribers.remove(user_id);
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Live subscription to a user's change feed; unsubscribes on drop.
pub struct NotifierSubscription {
    notifier: Arc<Notifier>,
    user_id: String,
    id: Uuid,
    rx: UnboundedReceiver<ChangeEvent>,
}

impl NotifierSubscription {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Blocking receive for callers outside the async runtime.
    pub fn blocking_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Result<ChangeEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for NotifierSubscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(&self.user_id, self.id);
    }
}
