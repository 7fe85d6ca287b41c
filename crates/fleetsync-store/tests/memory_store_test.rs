//! Memory store integration tests
//!
//! Cover keyspace notifications and model-checked command semantics.

use std::collections::HashMap;
use std::time::Duration;

use fleetsync_store::{
    KeyspaceEvent, MemoryStore, StoreClient, TxOp, TxOutcome, keyspace_channel,
};
use proptest::prelude::*;

// ============== Keyspace notification tests ==============

#[test]
fn test_notifications_only_for_subscribed_channels() {
    let store = MemoryStore::new();
    let client = store.connect();
    let mut rx = client.messages();

    client.set("unwatched", "x").unwrap();
    assert!(rx.try_recv().is_err());

    client.subscribe(&keyspace_channel("watched")).unwrap();
    client.set("watched", "x").unwrap();
    client
        .watch_and_commit("watched", &mut |_| Some(vec![TxOp::Del]))
        .unwrap();

    let set = rx.try_recv().unwrap();
    assert_eq!(set.channel, keyspace_channel("watched"));
    assert_eq!(set.event(), KeyspaceEvent::Set);
    assert_eq!(rx.try_recv().unwrap().event(), KeyspaceEvent::Del);
}

#[test]
fn test_unsubscribe_stops_notifications() {
    let store = MemoryStore::new();
    let client = store.connect();
    let channel = keyspace_channel("k");
    let mut rx = client.messages();

    client.subscribe(&channel).unwrap();
    client.subscribe(&channel).unwrap();
    client.unsubscribe(&channel).unwrap();
    client.set("k", "v").unwrap();

    assert!(rx.try_recv().is_err());
}

#[test]
fn test_subscriptions_are_per_client() {
    let store = MemoryStore::new();
    let a = store.connect();
    let b = store.connect();
    let mut a_rx = a.messages();
    let mut b_rx = b.messages();

    b.subscribe(&keyspace_channel("k")).unwrap();
    a.set("k", "v").unwrap();

    assert!(a_rx.try_recv().is_err());
    assert_eq!(b_rx.try_recv().unwrap().event(), KeyspaceEvent::Set);
}

#[test]
fn test_disabled_keyspace_events() {
    let store = MemoryStore::new();
    store.set_keyspace_events(false);
    let client = store.connect();
    let mut rx = client.messages();
    client.subscribe(&keyspace_channel("k")).unwrap();

    client.set("k", "v").unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_passive_expiry_is_published() {
    let store = MemoryStore::new();
    let client = store.connect();
    let mut rx = client.messages();
    client.subscribe(&keyspace_channel("lease")).unwrap();

    assert!(
        client
            .set_if_absent("lease", "shard-a", Duration::from_millis(30))
            .unwrap()
    );
    assert_eq!(rx.recv().await.unwrap().event(), KeyspaceEvent::Set);

    // Nobody touches the key; the reaper must publish the expiry
    let expired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("expiry notification")
        .unwrap();
    assert_eq!(expired.event(), KeyspaceEvent::Expired);
    assert_eq!(store.peek("lease"), None);
}

#[test]
fn test_force_expire_discards_open_transaction() {
    let store = MemoryStore::new();
    let client = store.connect();
    client
        .set_if_absent("lease", "shard-a", Duration::from_secs(10))
        .unwrap();

    let outcome = client
        .watch_and_commit("lease", &mut |_| {
            store.force_expire("lease");
            Some(vec![TxOp::PExpire(Duration::from_secs(10))])
        })
        .unwrap();

    assert_eq!(outcome, TxOutcome::Discarded);
    assert_eq!(store.peek("lease"), None);
}

// ============== Model-based property tests ==============

#[derive(Debug, Clone)]
enum Op {
    SetIfAbsent(usize, u8),
    Set(usize, u8),
    Get(usize),
    DelIfEquals(usize, u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3usize, any::<u8>()).prop_map(|(k, v)| Op::SetIfAbsent(k, v)),
        (0..3usize, any::<u8>()).prop_map(|(k, v)| Op::Set(k, v)),
        (0..3usize).prop_map(Op::Get),
        (0..3usize, any::<u8>()).prop_map(|(k, v)| Op::DelIfEquals(k, v)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_memory_store_matches_model(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let store = MemoryStore::new();
        let client = store.connect();
        let mut model: HashMap<String, String> = HashMap::new();
        let ttl = Duration::from_secs(600);

        for op in ops {
            match op {
                Op::SetIfAbsent(k, v) => {
                    let key = format!("k{}", k);
                    let created = client.set_if_absent(&key, &v.to_string(), ttl).unwrap();
                    let expected = !model.contains_key(&key);
                    if expected {
                        model.insert(key, v.to_string());
                    }
                    prop_assert_eq!(created, expected);
                }
                Op::Set(k, v) => {
                    let key = format!("k{}", k);
                    client.set(&key, &v.to_string()).unwrap();
                    model.insert(key, v.to_string());
                }
                Op::Get(k) => {
                    let key = format!("k{}", k);
                    prop_assert_eq!(client.get(&key).unwrap(), model.get(&key).cloned());
                }
                Op::DelIfEquals(k, v) => {
                    let key = format!("k{}", k);
                    let wanted = v.to_string();
                    let outcome = client
                        .watch_and_commit(&key, &mut |current| {
                            (current == Some(wanted.as_str())).then(|| vec![TxOp::Del])
                        })
                        .unwrap();
                    if model.get(&key) == Some(&wanted) {
                        model.remove(&key);
                        prop_assert_eq!(outcome, TxOutcome::Committed);
                    } else {
                        prop_assert_eq!(outcome, TxOutcome::Abandoned);
                    }
                }
            }
        }
    }
}
