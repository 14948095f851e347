//! The dispatch engine: scheduler and dispatcher polling loops over a shared
//! store.
//!
//! The loops never call each other. The scheduler turns due runs into queue
//! entries; the dispatcher drains entries and runs the completion pass after
//! each batch. Any number of engines may share one database.

pub mod completion;
pub mod dispatcher;
pub mod lifecycle;
pub mod retry;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use self::completion::CompletionMonitor;
pub use self::dispatcher::{DispatchError, DispatchReport, QueueDispatcher};
pub use self::lifecycle::{PollLoop, PollTask};
pub use self::retry::RetryPolicy;
pub use self::scheduler::{CampaignScheduler, SchedulerReport};

use crate::config::Config;
use crate::events::EventSink;
use crate::provider::MessageProvider;
use crate::quota::QuotaTracker;
use crate::store::Store;

/// Both poll tasks, ready to start.
pub struct Engine {
    scheduler: Arc<CampaignScheduler>,
    dispatcher: Arc<QueueDispatcher>,
    scheduler_period: Duration,
    dispatcher_period: Duration,
}

impl Engine {
    /// Wire the engine from configuration and its collaborators.
    pub fn new(
        config: &Config,
        store: Store,
        provider: Arc<dyn MessageProvider>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let quota = QuotaTracker::new(store.clone(), config.quota.default_daily_limit);
        let scheduler = CampaignScheduler::new(
            store.clone(),
            quota,
            Arc::clone(&events),
            config.scheduler.batch_size,
        );
        let dispatcher = QueueDispatcher::new(
            store,
            provider,
            events,
            RetryPolicy::from_config(&config.dispatcher),
            config.dispatcher.batch_size,
        );
        Self {
            scheduler: Arc::new(scheduler),
            dispatcher: Arc::new(dispatcher),
            scheduler_period: config.scheduler.interval(),
            dispatcher_period: config.dispatcher.interval(),
        }
    }

    /// The scheduler, for one-off cycles.
    pub fn scheduler(&self) -> &CampaignScheduler {
        &self.scheduler
    }

    /// The dispatcher, for one-off cycles.
    pub fn dispatcher(&self) -> &QueueDispatcher {
        &self.dispatcher
    }

    /// Start both polling loops. Must be called inside a tokio runtime.
    pub fn start(&self) -> RunningEngine {
        let scheduler = PollLoop::start(
            Arc::clone(&self.scheduler) as Arc<dyn PollTask>,
            self.scheduler_period,
        );
        let dispatcher = PollLoop::start(
            Arc::clone(&self.dispatcher) as Arc<dyn PollTask>,
            self.dispatcher_period,
        );
        info!("dispatch engine started");
        RunningEngine {
            scheduler,
            dispatcher,
        }
    }
}

/// Handle to started loops.
#[derive(Debug)]
pub struct RunningEngine {
    scheduler: PollLoop,
    dispatcher: PollLoop,
}

impl RunningEngine {
    /// Stop both loops, letting in-flight ticks finish.
    pub async fn stop(self) {
        self.scheduler.stop().await;
        self.dispatcher.stop().await;
        info!("dispatch engine stopped");
    }
}
