//! Tests for `src/engine/completion.rs`.

use std::sync::Arc;

use campaign_dispatch::engine::{CampaignScheduler, CompletionMonitor};
use campaign_dispatch::events::{EventSink, RUN_COMPLETED};
use campaign_dispatch::store::{RunStatus, Store};

use super::fixtures::{at, quota, schedule_now, seed_campaign, setup_store, t0, RecordingSink, ORG};

fn monitor(store: &Store, sink: &Arc<RecordingSink>) -> CompletionMonitor {
    CompletionMonitor::new(store.clone(), Arc::clone(sink) as Arc<dyn EventSink>)
}

async fn admit(store: &Store, sink: &Arc<RecordingSink>) {
    CampaignScheduler::new(
        store.clone(),
        quota(store),
        Arc::clone(sink) as Arc<dyn EventSink>,
        10,
    )
    .poll_once(t0())
    .await
    .expect("scheduler poll");
}

#[tokio::test]
async fn run_with_outstanding_entries_stays_running() {
    let store = setup_store().await;
    let sink = RecordingSink::new();
    let campaign = seed_campaign(&store, 2).await;
    let run = schedule_now(&store, &campaign, "run-1").await;
    admit(&store, &sink).await;

    let entries = store.entries_for_run(&run.id).await.expect("entries");
    store
        .record_sent(&entries[0], "wamid.1", "hi", t0())
        .await
        .expect("record");

    let done = monitor(&store, &sink).finalize_drained_runs(t0()).await.expect("pass");
    assert!(done.is_empty());
    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Running);

    store
        .record_failure(&entries[1], "gave up", at(30))
        .await
        .expect("record");
    let done = monitor(&store, &sink).finalize_drained_runs(at(30)).await.expect("pass");
    assert_eq!(done, vec![run.id.clone()]);

    let run = store.run(&run.id).await.expect("run");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_at, Some(at(30)));

    let completed = sink.payloads(RUN_COMPLETED);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["sent"], 1);
    assert_eq!(completed[0]["failed"], 1);
    assert_eq!(sink.orgs().last().map(String::as_str), Some(ORG));
}

#[tokio::test]
async fn paused_runs_are_never_completed() {
    let store = setup_store().await;
    let sink = RecordingSink::new();
    let campaign = seed_campaign(&store, 2).await;
    quota(&store).set_plan_limit(ORG, None, 1, t0()).await.expect("plan");
    let run = schedule_now(&store, &campaign, "run-1").await;
    admit(&store, &sink).await;
    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Paused);

    let entries = store.entries_for_run(&run.id).await.expect("entries");
    assert_eq!(entries.len(), 1);
    store
        .record_sent(&entries[0], "wamid.1", "hi", t0())
        .await
        .expect("record");

    let done = monitor(&store, &sink).finalize_drained_runs(t0()).await.expect("pass");
    assert!(done.is_empty());
    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Paused);
}

#[tokio::test]
async fn admission_is_never_observed_half_done() {
    let store = setup_store().await;
    let sink = RecordingSink::new();
    let campaign = seed_campaign(&store, 3).await;
    let run = schedule_now(&store, &campaign, "run-1").await;
    admit(&store, &sink).await;

    // Drain two of three: the third keeps the run open.
    let entries = store.entries_for_run(&run.id).await.expect("entries");
    assert_eq!(entries.len(), 3);
    for entry in &entries[..2] {
        store
            .record_sent(entry, "wamid.1", "hi", t0())
            .await
            .expect("record");
    }
    let done = monitor(&store, &sink).finalize_drained_runs(at(5)).await.expect("pass");
    assert!(done.is_empty());
    assert_eq!(store.run(&run.id).await.expect("run").status, RunStatus::Running);
}

#[tokio::test]
async fn completing_twice_is_a_no_op() {
    let store = setup_store().await;
    let sink = RecordingSink::new();
    let campaign = seed_campaign(&store, 1).await;
    let run = schedule_now(&store, &campaign, "run-1").await;
    admit(&store, &sink).await;
    let entries = store.entries_for_run(&run.id).await.expect("entries");
    store
        .record_sent(&entries[0], "wamid.1", "hi", t0())
        .await
        .expect("record");

    let first = monitor(&store, &sink).finalize_drained_runs(t0()).await.expect("pass");
    let second = monitor(&store, &sink).finalize_drained_runs(at(10)).await.expect("pass");
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(sink.payloads(RUN_COMPLETED).len(), 1);
    assert_eq!(store.run(&run.id).await.expect("run").completed_at, Some(t0()));
}
