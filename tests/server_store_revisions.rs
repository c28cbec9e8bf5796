use crosstalk_rust::server::{Store, WriteOutcome};
use serde_json::json;

fn revision_of(outcome: &WriteOutcome) -> u64 {
    match outcome {
        WriteOutcome::Ok { revision, .. } => *revision,
        other => panic!("expected accepted write, got {other:?}"),
    }
}

#[test]
fn revisions_increase_monotonically_per_key() {
    let store = Store::open_in_memory().expect("open store");

    let mut last = 0u64;
    let mut base = None;
    for i in 0..50 {
        let outcome = store
            .upsert("alice", "c1", base, &json!({"id": "c1", "n": i}))
            .expect("upsert");
        let revision = revision_of(&outcome);
        assert!(revision > last, "revision {revision} must exceed {last}");
        last = revision;
        base = Some(revision);
    }

    // Interleave deletes and undeletes; the counter keeps climbing.
    let outcome = store.tombstone("alice", "c1", base).expect("tombstone");
    let tombstone_rev = revision_of(&outcome);
    assert!(tombstone_rev > last);

    let outcome = store
        .upsert("alice", "c1", Some(tombstone_rev), &json!({"id": "c1"}))
        .expect("resurrect");
    assert!(revision_of(&outcome) > tombstone_rev);
}

#[test]
fn create_semantics_never_overwrite() {
    let store = Store::open_in_memory().expect("open store");

    store
        .upsert("alice", "c1", None, &json!({"id": "c1", "v": "first"}))
        .expect("create");

    let outcome = store
        .upsert("alice", "c1", None, &json!({"id": "c1", "v": "second"}))
        .expect("second create attempt");
    assert_eq!(
        outcome,
        WriteOutcome::Conflict {
            revision: 1,
            deleted: false
        }
    );

    let record = store.get("alice", "c1").expect("get").expect("present");
    assert_eq!(record.data.unwrap()["v"], "first");
}

#[test]
fn stale_base_revision_conflicts_with_current_row() {
    let store = Store::open_in_memory().expect("open store");

    store
        .upsert("alice", "c1", None, &json!({"id": "c1"}))
        .expect("create");
    store
        .upsert("alice", "c1", Some(1), &json!({"id": "c1", "v": 2}))
        .expect("update");

    let outcome = store
        .upsert("alice", "c1", Some(1), &json!({"id": "c1", "v": "stale"}))
        .expect("stale update");
    assert_eq!(
        outcome,
        WriteOutcome::Conflict {
            revision: 2,
            deleted: false
        }
    );
}

#[test]
fn base_revision_zero_never_matches() {
    let store = Store::open_in_memory().expect("open store");

    // Absent row: revision 0 does not exist, so there is nothing to update.
    let outcome = store
        .upsert("alice", "c1", Some(0), &json!({"id": "c1"}))
        .expect("upsert at base 0");
    assert_eq!(outcome, WriteOutcome::NotFound);

    // Present row: same base, but now the row reports a conflict.
    store
        .upsert("alice", "c1", None, &json!({"id": "c1"}))
        .expect("create");
    let outcome = store
        .upsert("alice", "c1", Some(0), &json!({"id": "c1"}))
        .expect("upsert at base 0 again");
    assert_eq!(
        outcome,
        WriteOutcome::Conflict {
            revision: 1,
            deleted: false
        }
    );
}

#[test]
fn tombstone_of_absent_key_creates_revision_one() {
    let store = Store::open_in_memory().expect("open store");

    let outcome = store.tombstone("alice", "c2", None).expect("tombstone");
    assert_eq!(revision_of(&outcome), 1);

    let record = store.get("alice", "c2").expect("get").expect("present");
    assert!(record.deleted);
    assert!(record.data.is_none(), "tombstone must carry no blob");
    assert_eq!(record.revision, 1);

    // The tombstone is listed so other clients observe the delete.
    let rows = store.list("alice").expect("list");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].deleted);
}

#[test]
fn second_identical_delete_conflicts_with_tombstone() {
    let store = Store::open_in_memory().expect("open store");

    store
        .upsert("alice", "c1", None, &json!({"id": "c1"}))
        .expect("create");
    let outcome = store.tombstone("alice", "c1", Some(1)).expect("delete");
    let tombstone_rev = revision_of(&outcome);
    assert_eq!(tombstone_rev, 2);

    let outcome = store
        .tombstone("alice", "c1", Some(1))
        .expect("replayed delete");
    assert_eq!(
        outcome,
        WriteOutcome::Conflict {
            revision: tombstone_rev,
            deleted: true
        }
    );
}

#[test]
fn delete_with_base_on_absent_row_is_not_found() {
    let store = Store::open_in_memory().expect("open store");

    let outcome = store.tombstone("alice", "ghost", Some(3)).expect("delete");
    assert_eq!(outcome, WriteOutcome::NotFound);
}

#[test]
fn accepted_upsert_is_live_and_accepted_tombstone_is_bare() {
    let store = Store::open_in_memory().expect("open store");

    store
        .upsert("alice", "c1", None, &json!({"id": "c1", "v": 1}))
        .expect("create");
    let record = store.get("alice", "c1").expect("get").expect("present");
    assert!(!record.deleted);
    assert!(record.data.is_some());

    store.tombstone("alice", "c1", Some(1)).expect("delete");
    let record = store.get("alice", "c1").expect("get").expect("present");
    assert!(record.deleted);
    assert!(record.data.is_none());
}

#[test]
fn list_is_ordered_by_recency_and_scoped_per_user() {
    let store = Store::open_in_memory().expect("open store");

    store
        .upsert("alice", "older", None, &json!({"id": "older"}))
        .expect("create older");
    std::thread::sleep(std::time::Duration::from_millis(5));
    store
        .upsert("alice", "newer", None, &json!({"id": "newer"}))
        .expect("create newer");
    store
        .upsert("bob", "other-user", None, &json!({"id": "other-user"}))
        .expect("create for bob");

    let rows = store.list("alice").expect("list");
    let ids: Vec<&str> = rows.iter().map(|r| r.conversation_id.as_str()).collect();
    assert_eq!(ids, vec!["newer", "older"]);

    assert_eq!(store.list("bob").expect("list bob").len(), 1);
}

#[test]
fn purge_physically_removes_a_users_rows() {
    let store = Store::open_in_memory().expect("open store");

    store
        .upsert("alice", "c1", None, &json!({"id": "c1"}))
        .expect("create");
    store.tombstone("alice", "c2", None).expect("tombstone");
    store
        .upsert("bob", "c1", None, &json!({"id": "c1"}))
        .expect("create for bob");

    let removed = store.purge_user("alice").expect("purge");
    assert_eq!(removed, 2);
    assert!(store.list("alice").expect("list").is_empty());
    assert_eq!(store.list("bob").expect("list bob").len(), 1);
}
