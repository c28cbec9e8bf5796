use crosstalk_rust::db::{self, ConversationStore};
use crosstalk_rust::sync::{DirtyOp, SyncStateStore};

#[test]
fn state_round_trips_across_reopen() {
    let temp = tempfile::tempdir().expect("tempdir");
    let app_dir = temp.path().join("crosstalk");

    {
        let store = ConversationStore::open(&app_dir).expect("open store");
        let mut state = SyncStateStore::load(&store, "alice").expect("load state");
        state.set_remote_revision("c1", 7).expect("set revision");
        state.mark_dirty("c2", DirtyOp::Upsert).expect("mark dirty");
        state.set_attempt("c2", 1234).expect("set attempt");
        state
            .set_error("c2", Some("remote_fetch_failed: boom".to_string()))
            .expect("set error");
    }

    let store = ConversationStore::open(&app_dir).expect("reopen store");
    let state = SyncStateStore::load(&store, "alice").expect("reload state");

    assert_eq!(state.remote_revision("c1"), Some(7));
    assert_eq!(state.dirty_op("c2"), Some(DirtyOp::Upsert));
    let entry = state.entry("c2").expect("entry for c2");
    assert_eq!(entry.last_attempt_at_ms, Some(1234));
    assert_eq!(
        entry.last_error.as_deref(),
        Some("remote_fetch_failed: boom")
    );
}

#[test]
fn state_is_scoped_per_user() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open store");

    let mut alice = SyncStateStore::load(&store, "alice").expect("load alice");
    alice.set_remote_revision("c1", 3).expect("set revision");

    let bob = SyncStateStore::load(&store, "bob").expect("load bob");
    assert_eq!(bob.remote_revision("c1"), None);
}

#[test]
fn unknown_schema_version_is_discarded_not_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open store");

    store
        .with_conn(|conn| {
            db::kv_set_string(
                conn,
                "sync.state:alice",
                r#"{"schema_version":99,"entries":{"c1":{"remote_revision":5}}}"#,
            )
        })
        .expect("seed future-versioned state");

    let state = SyncStateStore::load(&store, "alice").expect("load state");
    assert_eq!(state.remote_revision("c1"), None);
    assert!(state.entries().is_empty());
}

#[test]
fn unreadable_state_is_discarded_not_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open store");

    store
        .with_conn(|conn| db::kv_set_string(conn, "sync.state:alice", "not json"))
        .expect("seed corrupt state");

    let state = SyncStateStore::load(&store, "alice").expect("load state");
    assert!(state.entries().is_empty());
}

#[test]
fn clearing_everything_prunes_the_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConversationStore::open(temp.path()).expect("open store");

    let mut state = SyncStateStore::load(&store, "alice").expect("load state");
    state.mark_dirty("c1", DirtyOp::Delete).expect("mark dirty");
    assert_eq!(state.dirty_ids(), vec![("c1".to_string(), DirtyOp::Delete)]);

    state.clear_dirty("c1").expect("clear dirty");
    assert!(state.entry("c1").is_none(), "empty entries are pruned");

    state.set_remote_revision("c2", 1).expect("set revision");
    state.forget("c2").expect("forget");
    assert!(state.entry("c2").is_none());
}
