//! Quota admission and reservation tests.

use chrono::{DateTime, TimeZone, Utc};

use campaign_dispatch::quota::QuotaTracker;
use campaign_dispatch::store::{Store, StoreError};

const ORG: &str = "org-1";
const ACCOUNT: &str = "acct-1";

fn day_one() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 23, 59, 0)
        .single()
        .expect("valid timestamp")
}

fn day_two() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, 0, 1, 0)
        .single()
        .expect("valid timestamp")
}

async fn setup_tracker(default_limit: i64) -> QuotaTracker {
    let store = Store::open_in_memory().await.expect("store should open");
    QuotaTracker::new(store, default_limit)
}

#[tokio::test]
async fn fresh_day_admits_with_implicit_zero_row() {
    let tracker = setup_tracker(1000).await;
    assert!(tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));

    let usage = tracker.usage(ORG, None, day_one()).await.expect("usage");
    assert_eq!(usage.sent_count, 0);
    assert_eq!(usage.limit_count, 1000);
    assert_eq!(usage.day, "2026-10-16");
    assert!(usage.account_id.is_none());
    assert_eq!(usage.remaining(), 1000);
}

#[tokio::test]
async fn reserve_increments_org_and_account_counters() {
    let tracker = setup_tracker(1000).await;
    tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve");
    tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve");
    tracker.reserve_quota(ORG, "acct-2", day_one()).await.expect("reserve");

    let org = tracker.usage(ORG, None, day_one()).await.expect("usage");
    let account = tracker.usage(ORG, Some(ACCOUNT), day_one()).await.expect("usage");
    let other = tracker.usage(ORG, Some("acct-2"), day_one()).await.expect("usage");
    assert_eq!(org.sent_count, 3);
    assert_eq!(account.sent_count, 2);
    assert_eq!(other.sent_count, 1);
}

#[tokio::test]
async fn admission_stops_at_the_limit() {
    let tracker = setup_tracker(2).await;
    for _ in 0..2 {
        assert!(tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));
        assert!(tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve"));
    }
    assert!(!tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));

    let org = tracker.usage(ORG, None, day_one()).await.expect("usage");
    assert!(org.sent_count <= org.limit_count);
    assert!(!org.has_room());
}

#[tokio::test]
async fn passed_checks_cannot_jointly_over_admit() {
    let tracker = setup_tracker(2).await;
    assert!(tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve"));

    // Two schedulers both see one slot left.
    assert!(tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));
    assert!(tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));
    assert!(tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve"));
    assert!(!tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve"));

    let org = tracker.usage(ORG, None, day_one()).await.expect("usage");
    let account = tracker.usage(ORG, Some(ACCOUNT), day_one()).await.expect("usage");
    assert_eq!(org.sent_count, 2);
    assert_eq!(account.sent_count, 2);
}

#[tokio::test]
async fn refused_reservation_counts_neither_scope() {
    let tracker = setup_tracker(1000).await;
    tracker.set_plan_limit(ORG, Some(ACCOUNT), 1, day_one()).await.expect("plan");
    assert!(tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve"));
    assert!(!tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve"));

    let org = tracker.usage(ORG, None, day_one()).await.expect("usage");
    assert_eq!(org.sent_count, 1);
}

#[tokio::test]
async fn zero_limit_refuses_reservation_without_a_row() {
    let tracker = setup_tracker(0).await;
    assert!(!tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve"));
    let org = tracker.usage(ORG, None, day_one()).await.expect("usage");
    assert_eq!(org.sent_count, 0);
}

#[tokio::test]
async fn exhausted_org_blocks_every_account() {
    let tracker = setup_tracker(1000).await;
    tracker.set_plan_limit(ORG, None, 1, day_one()).await.expect("plan");
    tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve");

    assert!(!tracker.check_quota(ORG, "acct-2", day_one()).await.expect("check"));
    assert!(tracker.check_quota("org-2", ACCOUNT, day_one()).await.expect("check"));
}

#[tokio::test]
async fn account_plan_limits_only_that_account() {
    let tracker = setup_tracker(1000).await;
    tracker.set_plan_limit(ORG, Some(ACCOUNT), 1, day_one()).await.expect("plan");
    tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve");

    assert!(!tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));
    assert!(tracker.check_quota(ORG, "acct-2", day_one()).await.expect("check"));
}

#[tokio::test]
async fn zero_limit_denies_even_without_a_row() {
    let tracker = setup_tracker(0).await;
    assert!(!tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));
}

#[tokio::test]
async fn counters_reset_on_a_new_utc_day() {
    let tracker = setup_tracker(1).await;
    tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve");
    assert!(!tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));

    assert!(tracker.check_quota(ORG, ACCOUNT, day_two()).await.expect("check"));
    let usage = tracker.usage(ORG, None, day_two()).await.expect("usage");
    assert_eq!(usage.sent_count, 0);
    assert_eq!(usage.day, "2026-10-17");
}

#[tokio::test]
async fn plan_change_applies_to_todays_row() {
    let tracker = setup_tracker(5).await;
    tracker.reserve_quota(ORG, ACCOUNT, day_one()).await.expect("reserve");
    assert_eq!(
        tracker.usage(ORG, None, day_one()).await.expect("usage").limit_count,
        5
    );

    tracker.set_plan_limit(ORG, None, 1, day_one()).await.expect("plan");
    let usage = tracker.usage(ORG, None, day_one()).await.expect("usage");
    assert_eq!(usage.limit_count, 1);
    assert!(!tracker.check_quota(ORG, ACCOUNT, day_one()).await.expect("check"));

    // Tomorrow's row picks up the plan, not the default.
    tracker.reserve_quota(ORG, ACCOUNT, day_two()).await.expect("reserve");
    let usage = tracker.usage(ORG, None, day_two()).await.expect("usage");
    assert_eq!(usage.limit_count, 1);
}

#[tokio::test]
async fn negative_plan_limit_is_rejected() {
    let tracker = setup_tracker(5).await;
    let result = tracker.set_plan_limit(ORG, None, -1, day_one()).await;
    assert!(matches!(result, Err(StoreError::InvalidRequest(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_are_never_lost() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Store::open(&dir.path().join("quota.db"), 4)
        .await
        .expect("store should open");
    let tracker = QuotaTracker::new(store.clone(), 1000);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker.reserve_quota(ORG, ACCOUNT, day_one()).await
        }));
    }
    for handle in handles {
        handle.await.expect("task").expect("reserve");
    }

    let org = tracker.usage(ORG, None, day_one()).await.expect("usage");
    let account = tracker.usage(ORG, Some(ACCOUNT), day_one()).await.expect("usage");
    assert_eq!(org.sent_count, 20);
    assert_eq!(account.sent_count, 20);
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_stop_at_the_limit() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Store::open(&dir.path().join("quota.db"), 4)
        .await
        .expect("store should open");
    let tracker = QuotaTracker::new(store.clone(), 5);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker.reserve_quota(ORG, ACCOUNT, day_one()).await
        }));
    }
    let mut granted: u32 = 0;
    for handle in handles {
        if handle.await.expect("task").expect("reserve") {
            granted = granted.saturating_add(1);
        }
    }

    let org = tracker.usage(ORG, None, day_one()).await.expect("usage");
    assert_eq!(granted, 5);
    assert_eq!(org.sent_count, 5);
    assert_eq!(org.limit_count, 5);
    store.close().await;
}
