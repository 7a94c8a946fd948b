//! Concurrency tests for the lock coordinator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use locking::{InMemoryLockStore, LockConfig, LockCoordinator, LockError};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquirers_get_exactly_one_winner() {
    let locks = LockCoordinator::new(Arc::new(InMemoryLockStore::new()), LockConfig::default());

    let mut handles = Vec::new();
    for _ in 0..32 {
        let locks = locks.clone();
        handles.push(tokio::spawn(async move {
            locks.try_acquire("order:idem:cart-42").await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(guard) = handle.await.unwrap() {
            winners.push(guard);
        }
    }
    assert_eq!(winners.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_sections_never_overlap() {
    let locks = LockCoordinator::new(Arc::new(InMemoryLockStore::new()), LockConfig::default());
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let locks = locks.clone();
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        let completed = Arc::clone(&completed);
        handles.push(tokio::spawn(async move {
            // Retry until this task gets a turn
            loop {
                let ran = locks
                    .with_lock("shared", || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, LockError>(())
                    })
                    .await
                    .unwrap();
                if ran.is_some() {
                    completed.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 16);
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}
