use std::sync::Arc;
use std::time::{Duration, Instant};

use crosstalk_rust::db::ConversationStore;
use crosstalk_rust::server::{self, Notifier, ServerConfig, Store, SyncCore};
use crosstalk_rust::sync::{
    http_transport::HttpTransport, EngineConfig, SyncEngine, SyncTransport,
};
use serde_json::json;

fn start_test_server(
    config: ServerConfig,
) -> (
    tokio::runtime::Runtime,
    std::net::SocketAddr,
    server::ServerHandle,
    Arc<SyncCore>,
) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let store = Arc::new(Store::open_in_memory().expect("open store"));
    let notifier = Arc::new(Notifier::new());
    let core = Arc::new(SyncCore::new(store, notifier));
    let handle = rt
        .block_on(server::spawn(config, Arc::clone(&core)))
        .expect("spawn server");
    let addr = handle.local_addr;
    (rt, addr, handle, core)
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn transport_round_trips_writes_reads_and_conflicts() {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().expect("addr"),
        ..ServerConfig::default()
    };
    let (_rt, addr, _handle, _core) = start_test_server(config);

    let transport =
        HttpTransport::new(&format!("http://{addr}"), "alice", None).expect("build transport");

    use crosstalk_rust::sync::PushOutcome;

    let outcome = transport
        .upsert_conversation("c1", None, &json!({"id": "c1", "title": "first"}))
        .expect("create");
    assert_eq!(outcome, PushOutcome::Ack { revision: 1 });

    let outcome = transport
        .upsert_conversation("c1", Some(1), &json!({"id": "c1", "title": "second"}))
        .expect("update");
    assert_eq!(outcome, PushOutcome::Ack { revision: 2 });

    let outcome = transport
        .upsert_conversation("c1", Some(1), &json!({"id": "c1", "title": "stale"}))
        .expect("stale update");
    assert_eq!(
        outcome,
        PushOutcome::Conflict {
            revision: 2,
            deleted: false
        }
    );

    let remote = transport
        .get_conversation("c1")
        .expect("get")
        .expect("present");
    assert_eq!(remote.revision, 2);
    assert_eq!(remote.data.expect("blob")["title"], "second");

    assert!(transport
        .get_conversation("missing")
        .expect("get missing")
        .is_none());

    let rows = transport.list_conversations().expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].conversation_id, "c1");

    let outcome = transport
        .delete_conversation("c1", Some(2))
        .expect("delete");
    assert_eq!(outcome, PushOutcome::Ack { revision: 3 });
    let remote = transport
        .get_conversation("c1")
        .expect("get tombstone")
        .expect("present");
    assert!(remote.deleted);
    assert!(remote.data.is_none());
}

#[test]
fn realtime_over_http_survives_ttl_reconnects() {
    // Short TTL so the test crosses at least one forced disconnect.
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().expect("addr"),
        keepalive_interval: Duration::from_millis(300),
        stream_ttl: Duration::from_millis(900),
        ..ServerConfig::default()
    };
    let (_rt, addr, _handle, core) = start_test_server(config);
    let base_url = format!("http://{addr}");

    let temp = tempfile::tempdir().expect("tempdir");
    let local = ConversationStore::open(temp.path()).expect("open local store");
    let config = EngineConfig {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let engine = SyncEngine::new(local.clone(), "alice", config).expect("create engine");
    engine.enable_transport(Arc::new(
        HttpTransport::new(&base_url, "alice", None).expect("build transport"),
    ));
    engine.start_realtime();

    let writer = HttpTransport::new(&base_url, "alice", None).expect("writer transport");

    // Write only once the channel is actually subscribed.
    assert!(
        wait_until(Duration::from_secs(3), || {
            core.notifier().subscriber_count("alice") > 0
        }),
        "realtime channel never subscribed"
    );

    // First write inside the first stream window.
    writer
        .upsert_conversation("w1", None, &json!({"id": "w1", "title": "first window"}))
        .expect("write w1");
    assert!(
        wait_until(Duration::from_secs(5), || local.get("w1").is_some()),
        "first realtime apply never happened"
    );

    // Give the TTL time to close the stream, then write again; the channel
    // must have reconnected on its own.
    std::thread::sleep(Duration::from_millis(1_200));
    writer
        .upsert_conversation("w2", None, &json!({"id": "w2", "title": "second window"}))
        .expect("write w2");
    assert!(
        wait_until(Duration::from_secs(5), || local.get("w2").is_some()),
        "realtime apply after TTL reconnect never happened"
    );

    engine.stop();
}
