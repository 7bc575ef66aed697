//! The in-module `locks` tests call `try_lock` synchronously on one
//! thread; this exercises real concurrent contention across spawned tasks.

use host_agent::locks::LockTable;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn only_one_of_many_concurrent_tasks_wins_the_same_key() {
    let table = Arc::new(LockTable::new());
    let winners = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let table = table.clone();
        let winners = winners.clone();
        tasks.push(tokio::spawn(async move {
            if let Some(_guard) = table.try_lock("start.shared-container") {
                winners.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);

    // Key is free again once every guard has dropped.
    assert!(table.try_lock("start.shared-container").is_some());
}

#[tokio::test]
async fn distinct_keys_proceed_concurrently() {
    let table = Arc::new(LockTable::new());
    let winners = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let table = table.clone();
        let winners = winners.clone();
        tasks.push(tokio::spawn(async move {
            if let Some(_guard) = table.try_lock(&format!("start.container-{i}")) {
                winners.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 8);
}
