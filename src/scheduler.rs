use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::lifecycle;
use crate::materializer::{self, MaterializeReport};
use crate::store::ScheduleStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub materialized: MaterializeReport,
    /// Stale scans found this cycle.
    pub stale: usize,
    /// Stale scans moved to `error` (only with `force_stale_errors`).
    pub swept: usize,
}

/// One scheduler pass: materialize the configured horizon, then look for
/// started scans whose agent went quiet.
pub fn run_cycle<S: ScheduleStore + ?Sized>(store: &S, config: &Config, now: OffsetDateTime) -> Result<CycleReport> {
    let horizon = config.horizon(now)?;
    let materialized = materializer::materialize_all(store, &horizon, config.allow_private_ips)?;

    let policy = config.stale_policy();
    let (stale, swept) = if config.force_stale_errors {
        let swept = lifecycle::sweep_stale(store, now, &policy)?.len();
        (swept, swept)
    } else {
        let found = lifecycle::find_stale(store, now, &policy)?;
        for stale in &found {
            warn!(
                scheduled_scan = %stale.scheduled.id,
                agent = %stale.scheduled.snapshot.agent_name(),
                last_checkin = ?stale.last_checkin,
                "scan looks stale"
            );
        }
        (found.len(), 0)
    };

    Ok(CycleReport {
        materialized,
        stale,
        swept,
    })
}

/// Run [`run_cycle`] on the blocking pool every tick until `cancel` fires.
pub async fn run(store: Arc<dyn ScheduleStore>, config: Arc<Config>, cancel: CancellationToken) {
    let mut ticker = interval(config.materialize_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (cycle_store, cycle_config) = (Arc::clone(&store), Arc::clone(&config));
        let cycle = tokio::task::spawn_blocking(move || {
            run_cycle(&*cycle_store, &cycle_config, OffsetDateTime::now_utc())
        });
        match cycle.await {
            Ok(Ok(report)) => info!(
                created = report.materialized.created.len(),
                duplicates = report.materialized.duplicates,
                rejected = report.materialized.rejected.len(),
                stale = report.stale,
                swept = report.swept,
                "scheduler cycle"
            ),
            Ok(Err(e)) => error!(error = %e, "scheduler cycle failed"),
            Err(e) => error!(error = %e, "scheduler cycle panicked"),
        }
    }
    info!("scheduler stopped");
}
