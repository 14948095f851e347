//! Tests for `src/engine/mod.rs`: both loops running against one store.

use std::sync::Arc;
use std::time::Duration;

use campaign_dispatch::config::Config;
use campaign_dispatch::engine::Engine;
use campaign_dispatch::events::{EventBus, EventSink, RUN_COMPLETED};
use campaign_dispatch::provider::MessageProvider;
use campaign_dispatch::store::{RunStatus, Store};

use chrono::Utc;

use super::fixtures::{seed_campaign, setup_store, ScriptedProvider, ACCOUNT, ORG};

fn fast_config() -> Config {
    let mut config = Config::default();
    config.scheduler.interval_secs = 1;
    config.dispatcher.interval_secs = 1;
    config
}

async fn wait_for_status(store: &Store, run_id: &str, status: RunStatus) -> bool {
    for _ in 0..50 {
        let run = store.run(run_id).await.expect("run");
        if run.status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

#[tokio::test]
async fn running_engine_drains_a_due_run() {
    let store = setup_store().await;
    let campaign = seed_campaign(&store, 5).await;
    let now = Utc::now();
    let (run, _) = store
        .schedule_run(&campaign.id, ACCOUNT, now, "engine-run", now)
        .await
        .expect("schedule");

    let provider = ScriptedProvider::accepting();
    let bus = EventBus::new(64);
    let mut events = bus.subscribe(ORG);

    let engine = Engine::new(
        &fast_config(),
        store.clone(),
        Arc::clone(&provider) as Arc<dyn MessageProvider>,
        Arc::new(bus.clone()) as Arc<dyn EventSink>,
    );
    let running = engine.start();

    let completed = wait_for_status(&store, &run.id, RunStatus::Completed).await;
    running.stop().await;
    assert!(completed, "run should complete");
    assert_eq!(provider.calls().len(), 5);

    let mut names = Vec::new();
    while let Some(event) = events.try_recv() {
        names.push(event.name);
    }
    assert!(names.contains(&RUN_COMPLETED.to_owned()));
}
