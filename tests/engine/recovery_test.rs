//! Restart and operator-recovery paths across scheduler, dispatcher and
//! completion monitor.

use std::sync::Arc;
use std::time::Duration;

use campaign_dispatch::engine::{CampaignScheduler, CompletionMonitor, QueueDispatcher, RetryPolicy};
use campaign_dispatch::events::EventSink;
use campaign_dispatch::provider::MessageProvider;
use campaign_dispatch::store::{QueueStatus, RecipientStatus, RunStatus, Store};

use super::fixtures::{
    at, quota, schedule_now, seed_campaign, setup_store, t0, RecordingSink, ScriptedProvider, Step,
    ORG,
};

fn scheduler(store: &Store, sink: &Arc<RecordingSink>) -> CampaignScheduler {
    CampaignScheduler::new(store.clone(), quota(store), Arc::clone(sink) as Arc<dyn EventSink>, 10)
}

fn dispatcher(
    store: &Store,
    provider: &Arc<ScriptedProvider>,
    sink: &Arc<RecordingSink>,
) -> QueueDispatcher {
    QueueDispatcher::new(
        store.clone(),
        Arc::clone(provider) as Arc<dyn MessageProvider>,
        Arc::clone(sink) as Arc<dyn EventSink>,
        RetryPolicy::new(Duration::from_secs(5), 3),
        20,
    )
}

fn monitor(store: &Store, sink: &Arc<RecordingSink>) -> CompletionMonitor {
    CompletionMonitor::new(store.clone(), Arc::clone(sink) as Arc<dyn EventSink>)
}

#[tokio::test]
async fn crash_after_claim_leaves_run_for_the_next_cycle() {
    let store = setup_store().await;
    let sink = RecordingSink::new();
    let campaign = seed_campaign(&store, 2).await;
    let run = schedule_now(&store, &campaign, "run-1").await;

    // The process dies after claiming, before anything is committed.
    let mut tx = store.pool().begin().await.expect("begin");
    assert!(Store::claim_run_on(&mut tx, &run.id, t0()).await.expect("claim"));
    drop(tx);

    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Scheduled);
    let done = monitor(&store, &sink).finalize_drained_runs(at(10)).await.expect("pass");
    assert!(done.is_empty());

    let report = scheduler(&store, &sink).poll_once(at(40)).await.expect("poll");
    assert_eq!(report.claimed, 1);
    assert_eq!(report.enqueued, 2);

    let done = monitor(&store, &sink).finalize_drained_runs(at(50)).await.expect("pass");
    assert!(done.is_empty());
    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Running);

    let provider = ScriptedProvider::accepting();
    let report = dispatcher(&store, &provider, &sink).poll_once(at(60)).await.expect("dispatch");
    assert_eq!(report.sent, 2);
    assert_eq!(report.completed_runs, 1);
    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Completed);
}

#[tokio::test]
async fn failed_recipient_reset_and_resumed_is_sent_again() {
    let store = setup_store().await;
    let sink = RecordingSink::new();
    let tracker = quota(&store);
    let campaign = seed_campaign(&store, 2).await;
    tracker.set_plan_limit(ORG, None, 1, t0()).await.expect("plan");
    let run = schedule_now(&store, &campaign, "run-1").await;

    scheduler(&store, &sink).poll_once(t0()).await.expect("poll");
    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Paused);

    let provider = ScriptedProvider::scripted(
        vec![Step::Reject(503), Step::Reject(503), Step::Reject(503)],
        Step::Accept,
    );
    let send = dispatcher(&store, &provider, &sink);
    for secs in [0, 5, 15] {
        send.poll_once(at(secs)).await.expect("dispatch");
    }
    let first = store.entries_for_run(&run.id).await.expect("entries");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].status, QueueStatus::Failed);
    let reset_id = first[0].recipient_id.clone();
    assert_eq!(
        store.recipient(&reset_id).await.expect("recipient").status,
        RecipientStatus::Failed
    );

    tracker.set_plan_limit(ORG, None, 10, at(20)).await.expect("plan");
    assert_eq!(store.reset_failed_recipients(&campaign.id).await.expect("reset"), 1);
    assert!(store.resume_run(&run.id, at(20)).await.expect("resume"));

    let report = scheduler(&store, &sink).poll_once(at(20)).await.expect("poll");
    assert_eq!(report.enqueued, 2);
    assert_eq!(report.deferred, 0);

    let reopened = store.queue_entry(&first[0].id).await.expect("entry");
    assert_eq!(reopened.status, QueueStatus::Pending);
    assert_eq!(reopened.attempts, 0);
    assert!(reopened.next_retry_at.is_none());

    let report = send.poll_once(at(20)).await.expect("dispatch");
    assert_eq!(report.sent, 2);
    assert_eq!(report.completed_runs, 1);

    let recipient = store.recipient(&reset_id).await.expect("recipient");
    assert_eq!(recipient.status, RecipientStatus::Sent);
    let resent = provider
        .calls()
        .iter()
        .filter(|to| **to == recipient.phone_number)
        .count();
    assert_eq!(resent, 4);

    let entries = store.entries_for_run(&run.id).await.expect("entries");
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == QueueStatus::Sent));
    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Completed);
    assert_eq!(tracker.usage(ORG, None, at(20)).await.expect("usage").sent_count, 3);
}
