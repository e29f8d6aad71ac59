use super::*;
use crate::keyspace::MemoryKeyspace;

fn limiter() -> RateLimiter {
    RateLimiter::new(Arc::new(MemoryKeyspace::new()))
}

#[test]
fn test_default_policy_table() {
    let table = PolicyTable::default();

    assert_eq!(table.get(Platform::Farcaster).limit(), 25);
    assert_eq!(table.get(Platform::Telegram).window, Duration::from_secs(1));
    assert_eq!(table.get(Platform::Twitter).burst, 0);
    assert_eq!(table.get(Platform::Discord).limit(), 60);
    // On-chain has no dedicated policy
    assert_eq!(table.get(Platform::Onchain).limit(), 35);
}

#[tokio::test]
async fn test_window_fills_then_frees() {
    let limiter = limiter();
    let account = "acct-1";

    for _ in 0..30 {
        limiter
            .record_action(Platform::Telegram, account)
            .await
            .unwrap();
    }

    assert!(!limiter.check_quota(Platform::Telegram, account).await.unwrap());
    assert_eq!(
        limiter
            .remaining_quota(Platform::Telegram, account)
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(limiter.check_quota(Platform::Telegram, account).await.unwrap());
    assert_eq!(
        limiter
            .remaining_quota(Platform::Telegram, account)
            .await
            .unwrap(),
        30
    );
}

#[tokio::test]
async fn test_accounts_and_platforms_are_independent() {
    let limiter = limiter().with_policies(
        PolicyTable::default().with_policy(
            Platform::Farcaster,
            RatePolicy::new(Duration::from_secs(60), 1, 0),
        ),
    );

    limiter.try_acquire(Platform::Farcaster, "a").await.unwrap();
    assert!(limiter.try_acquire(Platform::Farcaster, "a").await.is_err());
    assert!(limiter.try_acquire(Platform::Farcaster, "b").await.is_ok());
    assert!(limiter.try_acquire(Platform::Discord, "a").await.is_ok());
}

#[tokio::test]
async fn test_try_acquire_never_exceeds_limit_under_concurrency() {
    let limiter = limiter().with_policies(
        PolicyTable::default().with_policy(
            Platform::Farcaster,
            RatePolicy::new(Duration::from_secs(60), 8, 2),
        ),
    );

    let mut handles = Vec::new();
    for _ in 0..40 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.try_acquire(Platform::Farcaster, "busy").await.is_ok()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);

    let status = limiter.status(Platform::Farcaster, "busy").await.unwrap();
    assert_eq!(status.used, 10);
    assert_eq!(status.remaining, 0);
    assert!(status.reset_after > Duration::from_secs(50));
}

#[tokio::test]
async fn test_try_acquire_reports_retry_after() {
    let limiter = limiter().with_policies(
        PolicyTable::default().with_policy(
            Platform::Discord,
            RatePolicy::new(Duration::from_secs(30), 1, 0),
        ),
    );

    limiter.try_acquire(Platform::Discord, "a").await.unwrap();
    match limiter.try_acquire(Platform::Discord, "a").await {
        Err(RateLimitError::RateLimited { retry_after, .. }) => {
            assert!(retry_after <= Duration::from_secs(30));
            assert!(retry_after > Duration::from_secs(25));
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wait_for_quota_times_out() {
    let limiter = limiter()
        .with_policies(PolicyTable::default().with_policy(
            Platform::Twitter,
            RatePolicy::new(Duration::from_secs(60), 1, 0),
        ))
        .with_poll_interval(Duration::from_millis(20));

    limiter.record_action(Platform::Twitter, "a").await.unwrap();
    let err = limiter
        .wait_for_quota(Platform::Twitter, "a", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::RateLimited { .. }));
}

#[tokio::test]
async fn test_wait_for_quota_returns_once_window_slides() {
    let limiter = limiter()
        .with_policies(PolicyTable::default().with_policy(
            Platform::Telegram,
            RatePolicy::new(Duration::from_millis(200), 1, 0),
        ))
        .with_poll_interval(Duration::from_millis(20));

    limiter.record_action(Platform::Telegram, "a").await.unwrap();
    limiter
        .wait_for_quota(Platform::Telegram, "a", Duration::from_secs(2))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reset_clears_window() {
    let limiter = limiter();
    for _ in 0..25 {
        limiter.record_action(Platform::Farcaster, "a").await.unwrap();
    }
    assert!(!limiter.check_quota(Platform::Farcaster, "a").await.unwrap());

    limiter.reset(Platform::Farcaster, "a").await.unwrap();
    assert!(limiter.check_quota(Platform::Farcaster, "a").await.unwrap());
}
