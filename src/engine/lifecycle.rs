//! Owned start/stop handle around an interval-driven polling task.
//!
//! Each loop is a spawned tokio task ticking on `tokio::time::interval` and
//! watching a shutdown channel. [`PollLoop::stop`] signals shutdown and waits
//! for the task to exit; a tick already in progress runs to completion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, info_span, warn, Instrument};

/// One unit of periodic work.
#[async_trait]
pub trait PollTask: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one poll cycle. Errors are handled inside; a tick never fails.
    async fn tick(&self, now: DateTime<Utc>);
}

/// A running polling loop.
#[derive(Debug)]
pub struct PollLoop {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollLoop {
    /// Spawn `task`, ticking immediately and then every `period`.
    ///
    /// A tick that overruns `period` delays the next one rather than
    /// bunching missed ticks together.
    pub fn start(task: Arc<dyn PollTask>, period: Duration) -> Self {
        let name = task.name();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(task, period, shutdown_rx));
        info!(task = name, period_secs = period.as_secs(), "poll loop started");
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    /// Name of the task this loop drives.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop ticking and wait for an in-flight tick to finish.
    pub async fn stop(self) {
        // Err only means the loop already exited.
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "poll loop task ended abnormally");
        }
        info!(task = self.name, "poll loop stopped");
    }
}

async fn run_loop(task: Arc<dyn PollTask>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let span = info_span!("poll", task = task.name());
                task.tick(Utc::now()).instrument(span).await;
            }
        }
    }
}
