use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::pipeline::config::{ConfigResolver, InvocationContext};
use crate::pipeline::{trigger, Frequency, Pipeline};
use crate::scheduler::Scheduler;

/// Main scheduler execution loop.
/// Sleeps until the next cron instant, then triggers every frequency due at
/// that instant on the blocking pool. Runs until the task is dropped.
pub async fn run_scheduler_loop(scheduler: Scheduler, pipeline: Pipeline, resolver: Arc<ConfigResolver>) {
    if scheduler.is_empty() {
        info!("no scheduled frequencies configured, scheduler idle");
        return;
    }
    info!(frequencies = ?scheduler.frequencies(), "scheduler engine started");

    loop {
        let now = Utc::now();
        let Some((next, due)) = scheduler.next_after(now) else {
            warn!("no upcoming runs, scheduler stopping");
            return;
        };

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        for freq in due {
            let pipeline = pipeline.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move {
                run_frequency(pipeline, resolver, freq).await;
            });
        }
    }
}

async fn run_frequency(pipeline: Pipeline, resolver: Arc<ConfigResolver>, freq: Frequency) {
    info!(%freq, "scheduled run due");
    let result = tokio::task::spawn_blocking(move || {
        trigger::trigger(&pipeline, &*resolver, InvocationContext::Webserver, freq)
    })
    .await;

    match result {
        Ok(Ok(report)) => {
            info!(%freq, submitted = report.submitted.len(), "scheduled run complete");
        }
        Ok(Err(e)) => {
            // Each error was already reported by the sentry scope.
            error!(%freq, submitted = e.submitted.len(), "{}", e);
        }
        Err(e) => {
            error!(%freq, "scheduled run panicked: {}", e);
        }
    }
}
