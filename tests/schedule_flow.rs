use time::macros::{date, datetime, time};
use time::{Duration, Weekday};

use recon_sched::error::Error;
use recon_sched::lifecycle::{self, Reporter, StalePolicy};
use recon_sched::materializer::{self, Horizon};
use recon_sched::recurrence::{Frequency, Recurrence, Rule};
use recon_sched::seed::Seed;
use recon_sched::store::{MemoryStore, ScheduleStore};
use recon_sched::types::{ScanStatus, SiteId};
use recon_sched::validate::{self, NewScan};

fn store() -> MemoryStore {
    let seed: Seed = serde_json::from_str(
        r#"{
            "agents": [{"name": "lab agent", "api_token": "lab"}],
            "scan_commands": [{"name": "quick", "command": "-T4 -F"}],
            "sites": [{
                "name": "lab",
                "targets": "192.0.2.0/28 2001:db8::/126 printer.example.com",
                "excluded_targets": "192.0.2.8/29 printer.example.com",
                "scan_command": "quick",
                "agent": "lab agent"
            }]
        }"#,
    )
    .unwrap();
    let store = MemoryStore::new();
    seed.apply(&store, true).unwrap();
    store
}

fn site_id(store: &MemoryStore) -> SiteId {
    // agent, command, site are created in that order from a shared id sequence
    let site = store.site(SiteId(3)).unwrap();
    assert_eq!(site.name, "lab");
    site.id
}

#[test]
fn weekday_schedule_with_exceptions() {
    let store = store();
    let recurrence = Recurrence::new(date!(2024 - 02 - 01))
        .with_rule(Rule::new(Frequency::Daily))
        .with_exclusion_rule(Rule::new(Frequency::Weekly).on_weekdays([Weekday::Saturday, Weekday::Sunday]))
        .with_exception(date!(2024 - 02 - 07))
        .with_date(date!(2024 - 02 - 10));
    let scan = store
        .insert_scan(
            validate::scan(NewScan {
                site_id: site_id(&store),
                name: "business days".into(),
                start_time: time!(19:30),
                recurrence,
            })
            .unwrap(),
        )
        .unwrap();

    let horizon = Horizon::new(datetime!(2024-02-05 00:00 UTC), datetime!(2024-02-12 00:00 UTC)).unwrap();
    let report = materializer::materialize(&store, scan.id, &horizon, true).unwrap();
    let days: Vec<_> = report
        .created
        .iter()
        .map(|r| r.start_datetime.date())
        .collect();
    // Feb 10 is a Saturday: explicit dates do not override exclusion rules.
    assert_eq!(
        days,
        vec![
            date!(2024 - 02 - 05),
            date!(2024 - 02 - 06),
            date!(2024 - 02 - 08),
            date!(2024 - 02 - 09),
        ]
    );
    assert!(report
        .created
        .iter()
        .all(|r| r.start_datetime.time() == time!(19:30)));
    assert_eq!(
        report.created[0].snapshot.targets(),
        "192.0.2.0/29 2001:db8::/126"
    );
}

#[test]
fn cancelled_occurrence_is_not_recreated() {
    let store = store();
    let scan = store
        .insert_scan(NewScan {
            site_id: site_id(&store),
            name: String::new(),
            start_time: time!(12:00),
            recurrence: Recurrence::new(date!(2024 - 02 - 01)).with_rule(Rule::new(Frequency::Daily)),
        })
        .unwrap();
    let day = Horizon::day(date!(2024 - 02 - 02));
    let row = materializer::materialize(&store, scan.id, &day, true).unwrap().created.remove(0);

    let cancelled = lifecycle::cancel(&store, row.id, "change freeze").unwrap();
    assert_eq!(cancelled.scan_status, ScanStatus::Error);

    let rerun = materializer::materialize(&store, scan.id, &day, true).unwrap();
    assert!(rerun.created.is_empty());
    assert_eq!(rerun.duplicates, 1);
}

#[test]
fn full_lifecycle_and_stale_recovery() {
    let store = store();
    let agent = store.agent_by_token("lab").unwrap().id;
    let scan = store
        .insert_scan(NewScan {
            site_id: site_id(&store),
            name: "twice".into(),
            start_time: time!(01:00),
            recurrence: Recurrence::new(date!(2024 - 02 - 01)).with_rule(Rule::new(Frequency::Daily).count(2)),
        })
        .unwrap();
    let horizon = Horizon::new(datetime!(2024-01-01 00:00 UTC), datetime!(2024-03-01 00:00 UTC)).unwrap();
    let report = materializer::materialize(&store, scan.id, &horizon, true).unwrap();
    assert_eq!(report.created.len(), 2);

    let first_start = datetime!(2024-02-01 01:00 UTC);
    let claimed = lifecycle::claim_due(&store, agent, first_start).unwrap();
    assert_eq!(claimed.len(), 1);
    let done = lifecycle::report_completion(&store, agent, claimed[0].id, first_start + Duration::minutes(20), "lab_0201")
        .unwrap();
    assert_eq!(done.scan_status, ScanStatus::Completed);

    let second_start = datetime!(2024-02-02 01:00 UTC);
    let claimed = lifecycle::claim_due(&store, agent, second_start).unwrap();
    assert_eq!(claimed.len(), 1);
    let second = claimed[0].id;

    // The agent disappears mid-scan.
    let policy = StalePolicy {
        max_runtime: Duration::hours(6),
        checkin_grace: Duration::hours(1),
    };
    let much_later = second_start + Duration::hours(12);
    let swept = lifecycle::sweep_stale(&store, much_later, &policy).unwrap();
    assert_eq!(swept.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second]);

    // A late report from the agent no longer applies.
    let late = lifecycle::report_completion(&store, agent, second, much_later, "lab_0202").unwrap_err();
    assert!(matches!(
        late,
        Error::InvalidTransition {
            from: ScanStatus::Error,
            to: ScanStatus::Completed,
            ..
        }
    ));
    assert!(lifecycle::report_error(&store, Reporter::Scheduler, second, "again", false).is_err());
}
