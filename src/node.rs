use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::CoordinatorConfig;
use crate::scheduler::Scheduler;

/// Top-level coordinator process: one scheduler instance shared by the API
/// handlers and a timer-driven sweep loop. No ambient singletons; everything
/// hangs off this struct.
pub struct Coordinator {
    config: CoordinatorConfig,
    scheduler: Arc<Scheduler>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new(config.clone())),
            config,
        }
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Run the coordinator until the shutdown token fires.
    ///
    /// Spawns the staleness sweep loop, then serves the JSON API (blocking).
    /// The sweep is the only timer-driven operation; every other transition
    /// happens inside a request.
    pub async fn run(self, shutdown: CancellationToken) {
        let sweep_scheduler = self.scheduler.clone();
        let sweep_shutdown = shutdown.clone();
        let sweep_interval = std::time::Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            // The first tick fires immediately; skip it so a restart doesn't
            // time out tasks before machines have a chance to heartbeat.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = sweep_scheduler.sweep(Utc::now()).await;
                        if report.machines_offline > 0
                            || report.tasks_timed_out > 0
                            || report.tasks_purged > 0
                        {
                            tracing::info!(
                                machines_offline = report.machines_offline,
                                tasks_timed_out = report.tasks_timed_out,
                                tasks_purged = report.tasks_purged,
                                "Sweep finished"
                            );
                        }
                    }
                    _ = sweep_shutdown.cancelled() => break,
                }
            }
        });

        let state = ApiState {
            scheduler: self.scheduler.clone(),
        };
        run_api(self.config.listen_addr, state, shutdown).await;
    }
}
