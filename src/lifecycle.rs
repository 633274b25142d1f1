//! Scheduled scan lifecycle: claims, reports, cancellation and the stale sweep.
//!
//! ```text
//! pending --claim--> started --complete--> completed
//!    |                  |
//!    +--preflight/cancel+--error/cancel/stale--> error
//! ```
//!
//! Every status change goes through [`ScheduleStore::transition`], so two
//! agents racing for the same row can never both win.

use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{ScheduleStore, StatusChange};
use crate::types::{Agent, AgentId, ScanStatus, ScheduledScan, ScheduledScanId};
use crate::validate;

/// Result of a single claim attempt. Losing a race is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ScheduledScan),
    /// Someone else moved it first; carries the status found.
    AlreadyClaimed(ScanStatus),
    /// Still pending but its start time has not arrived.
    NotDue,
    NotFound,
}

/// Who is reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reporter {
    Agent(AgentId),
    Scheduler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalePolicy {
    /// How long a scan may stay `started` before it is suspicious.
    pub max_runtime: Duration,
    /// How recently the agent must have checked in to be considered alive.
    pub checkin_grace: Duration,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            max_runtime: Duration::hours(24),
            checkin_grace: Duration::hours(1),
        }
    }
}

/// A started scan whose agent appears to have gone away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleScan {
    pub scheduled: ScheduledScan,
    pub last_checkin: Option<OffsetDateTime>,
}

impl From<&StaleScan> for Error {
    fn from(stale: &StaleScan) -> Self {
        Error::StaleAgent {
            id: stale.scheduled.id,
            agent_id: stale.scheduled.snapshot.agent_id(),
        }
    }
}

pub fn check_in<S: ScheduleStore + ?Sized>(store: &S, agent_id: AgentId, now: OffsetDateTime) -> Result<Agent> {
    let agent = store.record_checkin(agent_id, now)?;
    debug!(agent = %agent.name, "agent checked in");
    Ok(agent)
}

/// Try to move one of `agent_id`'s scans from pending to started.
pub fn claim<S: ScheduleStore + ?Sized>(
    store: &S,
    agent_id: AgentId,
    id: ScheduledScanId,
    now: OffsetDateTime,
) -> Result<ClaimOutcome> {
    let row = match store.scheduled(id) {
        Ok(row) => row,
        Err(Error::NotFound { .. }) => return Ok(ClaimOutcome::NotFound),
        Err(e) => return Err(e),
    };
    let assigned = row.snapshot.agent_id();
    if assigned != agent_id {
        return Err(Error::AgentMismatch {
            id,
            assigned,
            reported_by: agent_id,
        });
    }
    if row.scan_status == ScanStatus::Pending && row.start_datetime > now {
        return Ok(ClaimOutcome::NotDue);
    }

    match store.transition(id, &[ScanStatus::Pending], StatusChange::started(now)) {
        Ok(row) => {
            info!(scheduled_scan = %id, agent = %row.snapshot.agent_name(), "scan claimed");
            Ok(ClaimOutcome::Claimed(row))
        }
        Err(Error::InvalidTransition { from, .. }) => {
            let conflict = Error::ClaimConflict { id, status: from };
            debug!(%conflict, "claim lost");
            Ok(ClaimOutcome::AlreadyClaimed(from))
        }
        Err(Error::NotFound { .. }) => Ok(ClaimOutcome::NotFound),
        Err(e) => Err(e),
    }
}

/// Check the agent in and claim every pending scan of theirs that is due.
pub fn claim_due<S: ScheduleStore + ?Sized>(
    store: &S,
    agent_id: AgentId,
    now: OffsetDateTime,
) -> Result<Vec<ScheduledScan>> {
    check_in(store, agent_id, now)?;

    let mut claimed = Vec::new();
    for row in store.scheduled_for_agent(agent_id, ScanStatus::Pending)? {
        if !row.is_due(now) {
            continue;
        }
        if let ClaimOutcome::Claimed(row) = claim(store, agent_id, row.id, now)? {
            claimed.push(row);
        }
    }
    Ok(claimed)
}

pub fn report_completion<S: ScheduleStore + ?Sized>(
    store: &S,
    agent_id: AgentId,
    id: ScheduledScanId,
    completed_time: OffsetDateTime,
    result_file_base_name: &str,
) -> Result<ScheduledScan> {
    validate::result_file_base_name(result_file_base_name)?;
    let row = store.scheduled(id)?;
    let assigned = row.snapshot.agent_id();
    if assigned != agent_id {
        return Err(Error::AgentMismatch {
            id,
            assigned,
            reported_by: agent_id,
        });
    }
    if let Some(started) = row.started_time.filter(|started| completed_time < *started) {
        return Err(Error::invalid_field(
            "completed_time",
            format!("{completed_time} is before started_time {started}"),
        ));
    }

    let row = store.transition(
        id,
        &[ScanStatus::Started],
        StatusChange::completed(completed_time, result_file_base_name.to_string()),
    )?;
    info!(scheduled_scan = %id, result = result_file_base_name, "scan completed");
    Ok(row)
}

/// Record a failure. Pending rows only accept pre-flight failures, i.e. the
/// agent never started the scan.
pub fn report_error<S: ScheduleStore + ?Sized>(
    store: &S,
    reporter: Reporter,
    id: ScheduledScanId,
    reason: &str,
    preflight: bool,
) -> Result<ScheduledScan> {
    if reason.trim().is_empty() {
        return Err(Error::invalid_field("reason", "must not be empty"));
    }
    let row = store.scheduled(id)?;
    if let Reporter::Agent(agent_id) = reporter {
        let assigned = row.snapshot.agent_id();
        if assigned != agent_id {
            return Err(Error::AgentMismatch {
                id,
                assigned,
                reported_by: agent_id,
            });
        }
    }

    let from: &[ScanStatus] = if preflight {
        &[ScanStatus::Pending, ScanStatus::Started]
    } else {
        &[ScanStatus::Started]
    };
    let row = store.transition(id, from, StatusChange::error(reason.to_string()))?;
    warn!(scheduled_scan = %id, ?reporter, reason, "scan errored");
    Ok(row)
}

/// Cancel a scan that has not finished. The row is kept and ends in `error`, so
/// a running scan on the agent is still accounted for and the occurrence is
/// not materialized again.
pub fn cancel<S: ScheduleStore + ?Sized>(store: &S, id: ScheduledScanId, reason: &str) -> Result<ScheduledScan> {
    let row = store.transition(
        id,
        &[ScanStatus::Pending, ScanStatus::Started],
        StatusChange::error(format!("cancelled: {reason}")),
    )?;
    info!(scheduled_scan = %id, reason, "scan cancelled");
    Ok(row)
}

fn is_stale(row: &ScheduledScan, agent: &Agent, now: OffsetDateTime, policy: &StalePolicy) -> bool {
    let started = row.started_time.unwrap_or(row.start_datetime);
    if now - started <= policy.max_runtime {
        return false;
    }
    match agent.last_checkin {
        Some(seen) => now - seen > policy.checkin_grace,
        None => true,
    }
}

/// Started scans that have outlived `policy` while their agent stayed silent.
pub fn find_stale<S: ScheduleStore + ?Sized>(
    store: &S,
    now: OffsetDateTime,
    policy: &StalePolicy,
) -> Result<Vec<StaleScan>> {
    let mut stale = Vec::new();
    for row in store.scheduled_with_status(ScanStatus::Started)? {
        let agent = match store.agent(row.snapshot.agent_id()) {
            Ok(agent) => agent,
            Err(Error::NotFound { .. }) => {
                stale.push(StaleScan {
                    scheduled: row,
                    last_checkin: None,
                });
                continue;
            }
            Err(e) => return Err(e),
        };
        if is_stale(&row, &agent, now, policy) {
            stale.push(StaleScan {
                scheduled: row,
                last_checkin: agent.last_checkin,
            });
        }
    }
    Ok(stale)
}

/// Force every stale scan into `error`. Rows that finished in the meantime are
/// left alone.
pub fn sweep_stale<S: ScheduleStore + ?Sized>(
    store: &S,
    now: OffsetDateTime,
    policy: &StalePolicy,
) -> Result<Vec<ScheduledScan>> {
    let mut swept = Vec::new();
    for stale in find_stale(store, now, policy)? {
        let advisory = Error::from(&stale);
        let reason = format!("stale: {advisory}");
        match store.transition(
            stale.scheduled.id,
            &[ScanStatus::Started],
            StatusChange::error(reason),
        ) {
            Ok(row) => {
                warn!(scheduled_scan = %row.id, agent = %row.snapshot.agent_name(), "stale scan forced to error");
                swept.push(row);
            }
            Err(Error::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(swept)
}
