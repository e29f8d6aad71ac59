use super::*;
use crate::keyspace::MemoryKeyspace;
use std::sync::atomic::{AtomicUsize, Ordering};

fn manager() -> LockManager {
    LockManager::new(Arc::new(MemoryKeyspace::new()))
}

#[tokio::test]
async fn test_concurrent_acquire_has_single_winner() {
    let locks = manager();
    let ttl = Duration::from_secs(5);

    let (a, b) = tokio::join!(
        locks.acquire(ResourceType::Wallet, "w1", ttl),
        locks.acquire(ResourceType::Wallet, "w1", ttl),
    );

    let (winner, loser) = match (a, b) {
        (Ok(lease), Err(e)) | (Err(e), Ok(lease)) => (lease, e),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    assert!(matches!(loser, LockError::NotAcquired(_)));

    locks.release(&winner).await.unwrap();
    let third = locks.acquire(ResourceType::Wallet, "w1", ttl).await;
    assert!(third.is_ok());
}

#[tokio::test]
async fn test_release_with_foreign_token_keeps_lease() {
    let locks = manager();
    let lease = locks
        .acquire(ResourceType::Account, "a1", Duration::from_secs(5))
        .await
        .unwrap();

    let mut forged = lease.clone();
    forged.token = "someone-else".to_string();

    let err = locks.release(&forged).await.unwrap_err();
    assert!(matches!(err, LockError::NotOwned(_)));
    assert!(locks.is_locked(ResourceType::Account, "a1").await.unwrap());

    locks.release(&lease).await.unwrap();
    assert!(!locks.is_locked(ResourceType::Account, "a1").await.unwrap());
}

#[tokio::test]
async fn test_stale_holder_cannot_release_new_holder() {
    let locks = manager();
    let stale = locks
        .acquire(ResourceType::Task, "t1", Duration::from_millis(20))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    let fresh = locks
        .acquire(ResourceType::Task, "t1", Duration::from_secs(5))
        .await
        .unwrap();

    assert!(matches!(
        locks.release(&stale).await,
        Err(LockError::NotOwned(_))
    ));
    assert!(locks.is_locked(ResourceType::Task, "t1").await.unwrap());
    locks.release(&fresh).await.unwrap();
}

#[tokio::test]
async fn test_extend_requires_ownership() {
    let locks = manager();
    let mut lease = locks
        .acquire(ResourceType::Job, "j1", Duration::from_millis(30))
        .await
        .unwrap();

    locks.extend(&mut lease, Duration::from_secs(5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(locks.is_locked(ResourceType::Job, "j1").await.unwrap());

    let mut stranger = lease.clone();
    stranger.token = "other".to_string();
    assert!(matches!(
        locks.extend(&mut stranger, Duration::from_secs(5)).await,
        Err(LockError::Expired(_))
    ));
}

#[tokio::test]
async fn test_acquire_with_retry_waits_for_release() {
    let locks = manager();
    let held = locks
        .acquire(ResourceType::Wallet, "w2", Duration::from_secs(5))
        .await
        .unwrap();

    let releaser = locks.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        releaser.release(&held).await.unwrap();
    });

    let lease = locks
        .acquire_with_retry(
            ResourceType::Wallet,
            "w2",
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
        .await;
    assert!(lease.is_ok());
}

#[tokio::test]
async fn test_acquire_with_retry_times_out() {
    let locks = manager();
    let _held = locks
        .acquire(ResourceType::Wallet, "w3", Duration::from_secs(5))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = locks
        .acquire_with_retry(
            ResourceType::Wallet,
            "w3",
            Duration::from_secs(5),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LockError::NotAcquired(_)));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[derive(Debug)]
enum WorkError {
    Lock(LockError),
    Boom,
}

impl From<LockError> for WorkError {
    fn from(e: LockError) -> Self {
        Self::Lock(e)
    }
}

#[tokio::test]
async fn test_with_lock_releases_on_error() {
    let locks = manager();

    let result: std::result::Result<(), WorkError> = locks
        .with_lock(ResourceType::Campaign, "c1", Duration::from_secs(5), || async {
            Err(WorkError::Boom)
        })
        .await;

    assert!(matches!(result, Err(WorkError::Boom)));
    assert!(!locks.is_locked(ResourceType::Campaign, "c1").await.unwrap());
}

#[tokio::test]
async fn test_with_lock_reports_contention() {
    let locks = manager();
    let _held = locks
        .acquire(ResourceType::Campaign, "c2", Duration::from_secs(5))
        .await
        .unwrap();

    let result: std::result::Result<(), WorkError> = locks
        .with_lock(ResourceType::Campaign, "c2", Duration::from_secs(5), || async {
            Ok(())
        })
        .await;

    assert!(matches!(
        result,
        Err(WorkError::Lock(LockError::NotAcquired(_)))
    ));
}

#[tokio::test]
async fn test_mutual_exclusion_under_contention() {
    let locks = manager();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let locks = locks.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        handles.push(tokio::spawn(async move {
            locks
                .with_lock_retry(
                    ResourceType::Wallet,
                    "shared",
                    Duration::from_secs(5),
                    Duration::from_secs(10),
                    || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<(), LockError>(())
                    },
                )
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_acquire_all_is_ordered_and_rolls_back() {
    let locks = manager();
    let ttl = Duration::from_secs(5);

    let set = locks
        .acquire_all(
            vec![
                (ResourceType::Account, "a1".to_string()),
                (ResourceType::Wallet, "w1".to_string()),
                (ResourceType::Account, "a1".to_string()),
            ],
            ttl,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    let order: Vec<ResourceType> = set.leases().iter().map(|l| l.resource_type).collect();
    assert_eq!(order, vec![ResourceType::Wallet, ResourceType::Account]);
    set.release_all().await;

    let _blocker = locks.acquire(ResourceType::Account, "a2", ttl).await.unwrap();
    let err = locks
        .acquire_all(
            vec![
                (ResourceType::Wallet, "w2".to_string()),
                (ResourceType::Account, "a2".to_string()),
            ],
            ttl,
            Duration::from_millis(100),
        )
        .await
        .err()
        .unwrap();

    assert!(matches!(err, LockError::NotAcquired(_)));
    assert!(!locks.is_locked(ResourceType::Wallet, "w2").await.unwrap());
}

#[tokio::test]
async fn test_dropped_lease_set_is_released() {
    let locks = manager();
    let set = locks
        .acquire_all(
            vec![(ResourceType::Browser, "profile-1".to_string())],
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    drop(set);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!locks.is_locked(ResourceType::Browser, "profile-1").await.unwrap());
}
