//! Integration tests for backlog-queue

use backlog_queue::*;
use std::collections::HashSet;
use std::time::Duration;

/// Two stores on one backend behave like two processes sharing one Redis.
fn two_processes(clock: &ManualClock) -> (ItemListStore, ItemListStore) {
    let backend = MemoryBackend::new();
    let config = StoreConfig::new(Environment::Dev).with_key_prefix("it");
    let a = ItemListStore::with_backend(backend.clone(), config.clone())
        .unwrap()
        .with_clock(clock.clone());
    let b = ItemListStore::with_backend(backend, config)
        .unwrap()
        .with_clock(clock.clone());
    (a, b)
}

#[test]
fn test_store_config_defaults() {
    let config = StoreConfig::new(Environment::Prod);
    assert_eq!(config.in_process_window, Duration::from_secs(604_800));
    assert_eq!(config.timeout, Duration::from_secs(1200));
    assert_eq!(config.retry_delay, Duration::from_secs(900));
    assert_eq!(config.clock_drift, Duration::from_secs(15));
    assert_eq!(config.prefix(), "backlog:prod");
}

#[test]
fn test_store_rejects_overlapping_windows() {
    let config = StoreConfig::new(Environment::Dev).with_in_process_window(Duration::from_secs(60));
    assert!(matches!(
        ItemListStore::in_memory(config),
        Err(QueueError::Config(_))
    ));
}

#[tokio::test]
async fn test_claim_then_complete_scenario() {
    let clock = ManualClock::new(0.0);
    let (producer, other) = two_processes(&clock);
    let key = ListKey::new("webhook").unwrap();

    producer.add_new(&key).await.unwrap();

    clock.set(1.0);
    assert_eq!(
        producer.select_for_processing("webhook").await.unwrap(),
        Some(key.clone())
    );
    assert_eq!(other.select_for_processing("webhook").await.unwrap(), None);

    producer.remove_completed(&key).await.unwrap();
    assert_eq!(producer.select_for_processing("webhook").await.unwrap(), None);

    // Completing twice changes nothing.
    producer.remove_completed(&key).await.unwrap();
    assert_eq!(producer.pending_count("webhook").await.unwrap(), 0);
}

#[tokio::test]
async fn test_retry_becomes_ready_after_delay() {
    let clock = ManualClock::new(0.0);
    let (store, _) = two_processes(&clock);
    let key = ListKey::new("webhook").unwrap();

    store.add_retry(&key).await.unwrap();
    assert_eq!(store.select_for_processing("webhook").await.unwrap(), None);

    clock.set(900.0);
    assert_eq!(store.select_for_processing("webhook").await.unwrap(), Some(key));
}

#[tokio::test]
async fn test_abandoned_claim_recovered_by_other_process() {
    let clock = ManualClock::new(0.0);
    let (crashed, survivor) = two_processes(&clock);
    let key = ListKey::new("webhook").unwrap();
    crashed.add_new(&key).await.unwrap();
    assert_eq!(
        crashed.select_for_processing("webhook").await.unwrap(),
        Some(key.clone())
    );

    clock.set(600.0);
    assert_eq!(survivor.select_for_processing("webhook").await.unwrap(), None);

    clock.set(603_600.0);
    assert_eq!(
        survivor.select_for_processing("webhook").await.unwrap(),
        Some(key.clone())
    );
    // The fresh claim is not reclaimable right away.
    assert_eq!(crashed.select_for_processing("webhook").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_list_claimed_once_under_contention() {
    let clock = ManualClock::new(0.0);
    let (store, _) = two_processes(&clock);

    let mut expected = HashSet::new();
    for _ in 0..20 {
        let accepted = store.submit("csv", vec![Payload::from("x")]).await.unwrap();
        expected.insert(accepted.key.unwrap());
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(key) = store.select_for_processing("csv").await.unwrap() {
                claimed.push(key);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique, expected);
}

#[tokio::test]
async fn test_deferred_round_trip() {
    let clock = ManualClock::new(0.0);
    let (store, _) = two_processes(&clock);
    let key = ListKey::new("csv").unwrap();
    store.add_new(&key).await.unwrap();
    store.add_deferred(&key).await.unwrap();
    assert_eq!(store.pending_count("csv").await.unwrap(), 0);

    let undeferred = store.select_for_undeferral("csv").await.unwrap().unwrap();
    store.add_new(&undeferred).await.unwrap();
    store.remove_deferred(&undeferred).await.unwrap();

    assert_eq!(store.get_deferred_count("csv").await.unwrap(), 0);
    assert_eq!(store.pending_count("csv").await.unwrap(), 1);
    assert_eq!(store.select_for_processing("csv").await.unwrap(), Some(key));
}

#[tokio::test]
async fn test_generations_climb_until_deferred() {
    let clock = ManualClock::new(0.0);
    let (store, _) = two_processes(&clock);
    let worker = Worker::with_config(
        store.clone(),
        "csv",
        WorkerConfig {
            log_execution: false,
            ..Default::default()
        },
        |_, _| async { Outcome::TransientFailure("downstream unavailable".into()) },
    );
    store.submit("csv", vec![Payload::from("x")]).await.unwrap();

    let mut generations = Vec::new();
    loop {
        let Some(key) = store.select_for_processing("csv").await.unwrap() else {
            break;
        };
        generations.push(key.generation());
        let report = worker.drain_list(&key).await.unwrap();
        if let FollowUp::Deferred(_) = report.follow_up {
            break;
        }
        clock.advance(Duration::from_secs(900));
    }

    assert_eq!(generations, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(store.get_deferred_count("csv").await.unwrap(), 1);
    assert_eq!(store.pending_count("csv").await.unwrap(), 0);

    let control = DeferralControl::new(store.clone());
    let report = control.resubmit_all("csv").await.unwrap();
    assert_eq!(report.restarted_count, 1);
    let resubmitted = store.select_for_processing("csv").await.unwrap().unwrap();
    assert_eq!(resubmitted.generation(), 6);
    assert_eq!(store.item_count(&resubmitted).await.unwrap(), 1);
}

#[tokio::test]
async fn test_listener_does_not_lose_notifications() {
    let clock = ManualClock::new(0.0);
    let (store, producer) = two_processes(&clock);
    let mut listener = store.listen("webhook").await.unwrap();

    let first = producer.submit("webhook", vec![Payload::from("a")]).await.unwrap();
    let second = producer.submit("webhook", vec![Payload::from("b")]).await.unwrap();

    assert_eq!(listener.next().await, first.key);
    assert_eq!(listener.next().await, second.key);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_store_round_trip() {
    let config = StoreConfig::from_env()
        .unwrap()
        .with_key_prefix(format!("backlog:it:{}", uuid::Uuid::new_v4().simple()));
    let store = ItemListStore::open(config).await.unwrap();

    let accepted = store.submit("webhook", vec![Payload::from("a")]).await.unwrap();
    let key = store.select_for_processing("webhook").await.unwrap().unwrap();
    assert_eq!(Some(&key), accepted.key.as_ref());
    assert_eq!(store.select_for_processing("webhook").await.unwrap(), None);

    assert_eq!(store.pop_item(&key).await.unwrap(), Some(Payload::from("a")));
    store.remove_completed(&key).await.unwrap();
    assert_eq!(store.pending_count("webhook").await.unwrap(), 0);
    store.close();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_channel_wakes_listener() {
    let config = StoreConfig::from_env()
        .unwrap()
        .with_key_prefix(format!("backlog:it:{}", uuid::Uuid::new_v4().simple()));
    let store = ItemListStore::open(config).await.unwrap();
    let mut listener = store.listen("webhook").await.unwrap();
    // Give the subscription time to reach the server.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let key = ListKey::new("webhook").unwrap();
    store.add_new(&key).await.unwrap();
    let woken = tokio::time::timeout(Duration::from_secs(5), listener.next()).await;
    assert_eq!(woken.unwrap(), Some(key.clone()));

    store.remove_completed(&key).await.unwrap();
    store.close();
}

