use std::sync::Arc;

use crosstalk_rust::db::ConversationStore;
use crosstalk_rust::server::{Notifier, Store, SyncCore};
use crosstalk_rust::sync::{
    DirtyOp, EngineConfig, InProcessTransport, SyncEngine, SyncStateStore,
};
use serde_json::json;

fn setup_core() -> Arc<SyncCore> {
    let server_store = Arc::new(Store::open_in_memory().expect("open server store"));
    Arc::new(SyncCore::new(server_store, Arc::new(Notifier::new())))
}

#[test]
fn acked_flush_records_revision_and_clears_dirty() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open local store");
    let core = setup_core();

    let engine =
        SyncEngine::new(store, "alice", EngineConfig::default()).expect("create engine");
    engine.enable_transport(Arc::new(InProcessTransport::new(Arc::clone(&core), "alice")));

    engine.enqueue_dirty_upsert("c1", json!({"id": "c1", "title": "hello", "messages": []}));

    let record = core.get("alice", "c1").expect("get").expect("present");
    assert_eq!(record.revision, 1);

    let state = engine.state_snapshot();
    let entry = state.get("c1").expect("entry");
    assert_eq!(entry.remote_revision, Some(1));
    assert!(entry.dirty_op.is_none());
    assert!(entry.last_error.is_none());
    assert!(entry.last_attempt_at_ms.is_some());
}

#[test]
fn dirty_upsert_without_rebuildable_payload_is_dropped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open local store");
    let core = setup_core();

    // A previous run left a persisted dirty upsert behind, but nothing in
    // the local store to rebuild its payload from.
    {
        let mut state = SyncStateStore::load(&store, "alice").expect("load state");
        state.mark_dirty("ghost", DirtyOp::Upsert).expect("mark dirty");
    }

    let engine =
        SyncEngine::new(store, "alice", EngineConfig::default()).expect("create engine");
    engine.enable_transport(Arc::new(InProcessTransport::new(Arc::clone(&core), "alice")));

    engine.try_flush("ghost");

    // The intent is dropped; no delete is fabricated.
    assert!(core.get("alice", "ghost").expect("get").is_none());
    let state = engine.state_snapshot();
    let entry = state.get("ghost").expect("entry");
    assert!(entry.dirty_op.is_none());
    assert_eq!(entry.last_error.as_deref(), Some("missing_upsert_payload"));
}

#[test]
fn flush_before_transport_swap_is_a_quiet_no_op() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open local store");
    let core = setup_core();

    let engine =
        SyncEngine::new(store, "alice", EngineConfig::default()).expect("create engine");
    // No enable_transport: we are pre-initial-pull.

    engine.enqueue_dirty_upsert("c1", json!({"id": "c1", "title": "queued", "messages": []}));

    // Nothing sent, intent retained for the post-swap flush.
    assert!(core.get("alice", "c1").expect("get").is_none());
    let state = engine.state_snapshot();
    assert_eq!(
        state.get("c1").and_then(|e| e.dirty_op),
        Some(DirtyOp::Upsert)
    );

    // The swap happens; the queued intent flushes normally.
    engine.enable_transport(Arc::new(InProcessTransport::new(Arc::clone(&core), "alice")));
    engine.flush_all_dirty();
    assert_eq!(
        core.get("alice", "c1")
            .expect("get")
            .expect("present")
            .revision,
        1
    );
}

#[test]
fn dirty_delete_flushes_as_tombstone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open local store");
    let core = setup_core();

    core.upsert("alice", "c1", None, &json!({"id": "c1", "title": "t"}))
        .expect("seed server row");

    // Simulate a persisted delete intent from an earlier session.
    {
        let mut state = SyncStateStore::load(&store, "alice").expect("load state");
        state.set_remote_revision("c1", 1).expect("set revision");
        state.mark_dirty("c1", DirtyOp::Delete).expect("mark dirty");
    }

    let engine =
        SyncEngine::new(store, "alice", EngineConfig::default()).expect("create engine");
    engine.enable_transport(Arc::new(InProcessTransport::new(Arc::clone(&core), "alice")));

    engine.try_flush("c1");

    let record = core.get("alice", "c1").expect("get").expect("present");
    assert!(record.deleted);
    assert_eq!(record.revision, 2);
    let state = engine.state_snapshot();
    let entry = state.get("c1").expect("entry");
    assert_eq!(entry.remote_revision, Some(2));
    assert!(entry.dirty_op.is_none());
}

#[test]
fn transport_errors_keep_the_intent_dirty() {
    struct FailingTransport;

    impl crosstalk_rust::sync::SyncTransport for FailingTransport {
        fn list_conversations(
            &self,
        ) -> anyhow::Result<Vec<crosstalk_rust::sync::ConversationMeta>> {
            Err(anyhow::anyhow!("network down"))
        }

        fn get_conversation(
            &self,
            _conversation_id: &str,
        ) -> anyhow::Result<Option<crosstalk_rust::sync::RemoteConversation>> {
            Err(anyhow::anyhow!("network down"))
        }

        fn upsert_conversation(
            &self,
            _conversation_id: &str,
            _base_revision: Option<u64>,
            _data: &serde_json::Value,
        ) -> anyhow::Result<crosstalk_rust::sync::PushOutcome> {
            Err(anyhow::anyhow!("network down"))
        }

        fn delete_conversation(
            &self,
            _conversation_id: &str,
            _base_revision: Option<u64>,
        ) -> anyhow::Result<crosstalk_rust::sync::PushOutcome> {
            Err(anyhow::anyhow!("network down"))
        }

        fn subscribe_events(&self) -> anyhow::Result<crosstalk_rust::sync::EventSubscription> {
            Err(anyhow::anyhow!("network down"))
        }
    }

    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open local store");

    let engine =
        SyncEngine::new(store, "alice", EngineConfig::default()).expect("create engine");
    engine.enable_transport(Arc::new(FailingTransport));

    engine.enqueue_dirty_upsert("c1", json!({"id": "c1", "title": "kept", "messages": []}));

    let state = engine.state_snapshot();
    let entry = state.get("c1").expect("entry");
    assert_eq!(entry.dirty_op, Some(DirtyOp::Upsert));
    assert_eq!(entry.last_error.as_deref(), Some("network down"));
}
