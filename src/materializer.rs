//! Turns scan recurrences into pending [`ScheduledScan`] rows.

use serde::Serialize;
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::ScheduleStore;
use crate::types::{ScanId, ScanSnapshot, ScheduledScan};

/// Half-open UTC window `[start, end)` to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Horizon {
    #[serde(with = "time::serde::rfc3339")]
    start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    end: OffsetDateTime,
}

/// Longest window a single materialize pass may cover.
pub const MAX_HORIZON: Duration = Duration::days(366);

impl Horizon {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidHorizon(format!("start {start} is not before end {end}")));
        }
        if end - start > MAX_HORIZON {
            return Err(Error::InvalidHorizon(format!(
                "{start} to {end} is longer than {} days",
                MAX_HORIZON.whole_days()
            )));
        }
        Ok(Self {
            start: start.to_offset(UtcOffset::UTC),
            end: end.to_offset(UtcOffset::UTC),
        })
    }

    /// `[start, start + length)`. Fails instead of overflowing near the end of
    /// the representable range.
    pub fn starting_at(start: OffsetDateTime, length: Duration) -> Result<Self> {
        let end = start
            .checked_add(length)
            .ok_or_else(|| Error::InvalidHorizon(format!("{start} plus {}s is out of range", length.whole_seconds())))?;
        Self::new(start, end)
    }

    /// The whole UTC calendar day. The last representable day ends at its
    /// final instant.
    pub fn day(date: Date) -> Self {
        let start = date.with_time(Time::MIDNIGHT).assume_utc();
        let end = match date.next_day() {
            Some(next) => next.with_time(Time::MIDNIGHT).assume_utc(),
            None => date.with_time(Time::MAX).assume_utc(),
        };
        Self { start, end }
    }

    /// The next operating day after `now`.
    pub fn next_day(now: OffsetDateTime) -> Self {
        let today = now.to_offset(UtcOffset::UTC).date();
        Self::day(today.next_day().unwrap_or(today))
    }

    /// `[now, now + length)`, for a scheduler that runs more often than daily.
    pub fn rolling(now: OffsetDateTime, length: Duration) -> Result<Self> {
        Self::starting_at(now, length)
    }

    pub fn start(&self) -> OffsetDateTime {
        self.start
    }

    pub fn end(&self) -> OffsetDateTime {
        self.end
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start <= at && at < self.end
    }
}

/// An occurrence that could not be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedOccurrence {
    pub scan_id: ScanId,
    /// `None` when the whole scan could not be evaluated.
    #[serde(with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(serialize_with = "display")]
    pub error: Error,
}

fn display<S: serde::Serializer>(error: &Error, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub created: Vec<ScheduledScan>,
    /// Occurrences that were already materialized.
    pub duplicates: usize,
    pub rejected: Vec<RejectedOccurrence>,
}

impl MaterializeReport {
    fn merge(&mut self, other: MaterializeReport) {
        self.created.extend(other.created);
        self.duplicates += other.duplicates;
        self.rejected.extend(other.rejected);
    }
}

/// Materialize one scan over `horizon`.
///
/// The snapshot is taken once from the current site, agent and command, and
/// copied into every new row. An invalid snapshot rejects each occurrence
/// individually; occurrences that already exist are counted and skipped.
pub fn materialize<S: ScheduleStore + ?Sized>(
    store: &S,
    scan_id: ScanId,
    horizon: &Horizon,
    allow_private_ips: bool,
) -> Result<MaterializeReport> {
    let scan = store.scan(scan_id)?;
    scan.recurrence.validate()?;
    let site = store.site(scan.site_id)?;
    let agent = store.agent(site.agent_id)?;
    let command = store.scan_command(site.scan_command_id)?;
    let snapshot = ScanSnapshot::capture(&site, &scan, &agent, &command, allow_private_ips);

    let mut report = MaterializeReport::default();
    for start in scan
        .recurrence
        .occurrences(scan.start_time, horizon.start(), horizon.end())
    {
        let snapshot = match &snapshot {
            Ok(snapshot) => snapshot.clone(),
            Err(error) => {
                warn!(scan_id = %scan.id, site = %site.name, %start, %error, "occurrence rejected");
                report.rejected.push(RejectedOccurrence {
                    scan_id: scan.id,
                    start: Some(start),
                    error: error.clone(),
                });
                continue;
            }
        };

        match store.insert_scheduled(snapshot, start) {
            Ok(row) => report.created.push(row),
            Err(Error::DuplicateOccurrence { .. }) => {
                debug!(scan_id = %scan.id, %start, "occurrence already scheduled");
                report.duplicates += 1;
            }
            Err(error) => {
                warn!(scan_id = %scan.id, %start, %error, "occurrence rejected");
                report.rejected.push(RejectedOccurrence {
                    scan_id: scan.id,
                    start: Some(start),
                    error,
                });
            }
        }
    }

    info!(
        scan_id = %scan.id,
        site = %site.name,
        created = report.created.len(),
        duplicates = report.duplicates,
        rejected = report.rejected.len(),
        "materialized scan"
    );
    Ok(report)
}

/// Materialize every scan. A scan that cannot be evaluated at all is reported
/// and does not stop the others.
pub fn materialize_all<S: ScheduleStore + ?Sized>(
    store: &S,
    horizon: &Horizon,
    allow_private_ips: bool,
) -> Result<MaterializeReport> {
    let mut report = MaterializeReport::default();
    for scan in store.scans()? {
        match materialize(store, scan.id, horizon, allow_private_ips) {
            Ok(one) => report.merge(one),
            Err(error) => {
                warn!(scan_id = %scan.id, %error, "scan skipped");
                report.rejected.push(RejectedOccurrence {
                    scan_id: scan.id,
                    start: None,
                    error,
                });
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, time};

    use crate::recurrence::{Frequency, Recurrence, Rule};
    use crate::store::MemoryStore;
    use crate::types::{AgentIdentity, ScanBinary, ScanStatus, Site};
    use crate::validate::{self, NewAgent, NewScan, NewScanCommand, NewSite};

    fn store_with_scan(recurrence: Recurrence) -> (MemoryStore, ScanId, Site) {
        let store = MemoryStore::new();
        let agent = store
            .insert_agent(
                validate::agent(NewAgent {
                    identity: AgentIdentity {
                        name: "scanner 1".into(),
                        api_token: "abc".into(),
                    },
                    description: String::new(),
                })
                .unwrap(),
            )
            .unwrap();
        let command = store
            .insert_scan_command(NewScanCommand {
                binary: ScanBinary::Nmap,
                name: "quick".into(),
                command: "-F".into(),
            })
            .unwrap();
        let site = store
            .insert_site(
                validate::site(
                    NewSite {
                        name: "office".into(),
                        description: String::new(),
                        targets: "203.0.113.0/29 intranet.example.com".into(),
                        excluded_targets: "203.0.113.7".into(),
                        scan_command_id: command.id,
                        agent_id: agent.id,
                    },
                    true,
                )
                .unwrap(),
            )
            .unwrap();
        let scan = store
            .insert_scan(NewScan {
                site_id: site.id,
                name: "weekly".into(),
                start_time: time!(22:15),
                recurrence,
            })
            .unwrap();
        (store, scan.id, site)
    }

    fn weekly() -> Recurrence {
        Recurrence::new(date!(2024 - 01 - 01)).with_rule(Rule::new(Frequency::Weekly))
    }

    #[test]
    fn creates_pending_rows_per_occurrence() {
        let (store, scan_id, _) = store_with_scan(weekly());
        let horizon = Horizon::new(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-22 00:00 UTC)).unwrap();
        let report = materialize(&store, scan_id, &horizon, true).unwrap();

        let starts: Vec<_> = report.created.iter().map(|r| r.start_datetime).collect();
        assert_eq!(
            starts,
            vec![
                datetime!(2024-01-01 22:15 UTC),
                datetime!(2024-01-08 22:15 UTC),
                datetime!(2024-01-15 22:15 UTC),
            ]
        );
        let row = &report.created[0];
        assert_eq!(row.scan_status, ScanStatus::Pending);
        assert_eq!(row.completed_time, None);
        assert_eq!(row.result_file_base_name, None);
        assert_eq!(row.snapshot.targets(), "203.0.113.0/30 203.0.113.4/31 203.0.113.6 intranet.example.com");
        assert_eq!(row.snapshot.excluded_targets(), "203.0.113.7");
    }

    #[test]
    fn rerun_creates_no_duplicates() {
        let (store, scan_id, _) = store_with_scan(weekly());
        let horizon = Horizon::new(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-22 00:00 UTC)).unwrap();
        let first = materialize(&store, scan_id, &horizon, true).unwrap();
        let second = materialize(&store, scan_id, &horizon, true).unwrap();
        assert_eq!(first.created.len(), 3);
        assert!(second.created.is_empty());
        assert_eq!(second.duplicates, 3);
        assert_eq!(store.scheduled_with_status(ScanStatus::Pending).unwrap(), first.created);
    }

    #[test]
    fn later_edits_do_not_touch_materialized_rows() {
        let (store, scan_id, mut site) = store_with_scan(weekly());
        let report = materialize(&store, scan_id, &Horizon::day(date!(2024 - 01 - 01)), true).unwrap();
        let before = report.created[0].clone();

        site.targets = "198.51.100.1".into();
        store.update_site(site).unwrap();
        let mut command = store.scan_command(before.snapshot.scan_command_id()).unwrap();
        command.command = "-p-".into();
        store.update_scan_command(command).unwrap();

        let after = store.scheduled(before.id).unwrap();
        assert_eq!(after, before);
        assert_eq!(after.snapshot.scan_command(), "-F");

        let next = materialize(&store, scan_id, &Horizon::day(date!(2024 - 01 - 08)), true).unwrap();
        assert_eq!(next.created[0].snapshot.targets(), "198.51.100.1");
        assert_eq!(next.created[0].snapshot.scan_command(), "-p-");
    }

    #[test]
    fn tampered_site_rejects_occurrences_but_reports_them() {
        let (store, scan_id, mut site) = store_with_scan(weekly());
        site.targets = "203.0.113.300 ok.example.com".into();
        store.update_site(site).unwrap();

        let horizon = Horizon::new(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-15 00:00 UTC)).unwrap();
        let report = materialize(&store, scan_id, &horizon, true).unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(
            report.rejected[0].error,
            Error::InvalidTarget(vec!["203.0.113.300".into()])
        );
    }

    #[test]
    fn materialize_all_keeps_going_past_broken_scans() {
        let (store, _, site) = store_with_scan(weekly());
        store
            .insert_scan(NewScan {
                site_id: site.id,
                name: "broken".into(),
                start_time: time!(01:00),
                recurrence: Recurrence::new(date!(2024 - 01 - 01))
                    .with_rule(Rule::new(Frequency::Daily).every(0)),
            })
            .unwrap();

        let report = materialize_all(&store, &Horizon::day(date!(2024 - 01 - 01)), true).unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].start, None);
    }

    #[test]
    fn horizon_rejects_empty_window() {
        let at = datetime!(2024-01-01 00:00 UTC);
        assert!(matches!(Horizon::new(at, at), Err(Error::InvalidHorizon(_))));
        let next = Horizon::next_day(datetime!(2024-01-01 13:37 UTC));
        assert_eq!(next.start(), datetime!(2024-01-02 00:00 UTC));
        assert_eq!(next.end(), datetime!(2024-01-03 00:00 UTC));
        assert!(next.contains(datetime!(2024-01-02 23:59 UTC)));
    }

    #[test]
    fn horizon_bounds_are_checked() {
        let at = datetime!(2024-01-01 00:00 UTC);
        assert!(Horizon::starting_at(at, MAX_HORIZON).is_ok());
        assert!(matches!(
            Horizon::starting_at(at, MAX_HORIZON + Duration::seconds(1)),
            Err(Error::InvalidHorizon(_))
        ));

        let near_max = datetime!(9999-12-31 23:00 UTC);
        assert!(matches!(
            Horizon::rolling(near_max, Duration::hours(24)),
            Err(Error::InvalidHorizon(_))
        ));

        let last = Horizon::day(Date::MAX);
        assert!(last.start() < last.end());
        assert_eq!(last.end().date(), Date::MAX);
        assert_eq!(Horizon::next_day(Date::MAX.with_time(Time::MIDNIGHT).assume_utc()), last);
    }
}
