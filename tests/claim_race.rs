use std::sync::Barrier;
use std::thread;

use time::macros::{date, datetime};

use recon_sched::lifecycle::{self, ClaimOutcome};
use recon_sched::materializer::{self, Horizon};
use recon_sched::seed::Seed;
use recon_sched::store::{MemoryStore, ScheduleStore};
use recon_sched::types::{AgentId, ScanStatus};

fn store() -> (MemoryStore, AgentId) {
    let seed: Seed = serde_json::from_str(
        r#"{
            "agents": [{"name": "racer", "api_token": "racer-token"}],
            "scan_commands": [{"binary": "masscan", "name": "sweep", "command": "-p80,443 --rate 10000"}],
            "sites": [{"name": "dmz", "targets": "203.0.113.0/24", "scan_command": "sweep", "agent": "racer"}],
            "scans": [{
                "site": "dmz",
                "start_time": "06:00",
                "recurrence": {"dtstart": "2024-03-01", "rules": [{"frequency": "daily"}]}
            }]
        }"#,
    )
    .unwrap();
    let store = MemoryStore::new();
    seed.apply(&store, true).unwrap();
    let agent = store.agent_by_token("racer-token").unwrap().id;
    (store, agent)
}

#[test]
fn exactly_one_concurrent_claim_wins() {
    let (store, agent) = store();
    let report = materializer::materialize_all(&store, &Horizon::day(date!(2024 - 03 - 01)), true).unwrap();
    assert_eq!(report.created.len(), 1);
    let id = report.created[0].id;
    let now = datetime!(2024-03-01 06:00:01 UTC);

    const CONTENDERS: usize = 8;
    let barrier = &Barrier::new(CONTENDERS);
    let store = &store;
    let outcomes: Vec<ClaimOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..CONTENDERS)
            .map(|_| {
                s.spawn(move || {
                    barrier.wait();
                    lifecycle::claim(store, agent, id, now).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
        .count();
    assert_eq!(winners, 1);
    assert!(outcomes
        .iter()
        .filter(|o| !matches!(o, ClaimOutcome::Claimed(_)))
        .all(|o| *o == ClaimOutcome::AlreadyClaimed(ScanStatus::Started)));
    assert_eq!(store.scheduled(id).unwrap().started_time, Some(now));
}

#[test]
fn concurrent_claim_due_hands_each_row_out_once() {
    let (store, agent) = store();
    let horizon = Horizon::new(datetime!(2024-03-01 00:00 UTC), datetime!(2024-03-11 00:00 UTC)).unwrap();
    let report = materializer::materialize_all(&store, &horizon, true).unwrap();
    assert_eq!(report.created.len(), 10);
    let now = datetime!(2024-03-12 00:00 UTC);

    let barrier = &Barrier::new(4);
    let store = &store;
    let mut claimed: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(move || {
                    barrier.wait();
                    lifecycle::claim_due(store, agent, now).unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .map(|row| row.id)
            .collect()
    });

    claimed.sort();
    let before = claimed.len();
    claimed.dedup();
    assert_eq!(before, claimed.len());
    assert_eq!(claimed.len(), 10);
    assert!(store.scheduled_with_status(ScanStatus::Pending).unwrap().is_empty());
}

#[test]
fn concurrent_materialize_creates_each_occurrence_once() {
    let (store, _) = store();
    let horizon = Horizon::new(datetime!(2024-03-01 00:00 UTC), datetime!(2024-03-15 00:00 UTC)).unwrap();

    const WORKERS: usize = 6;
    let barrier = &Barrier::new(WORKERS);
    let store = &store;
    let horizon = &horizon;
    let reports: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                s.spawn(move || {
                    barrier.wait();
                    materializer::materialize_all(store, horizon, true).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let created: usize = reports.iter().map(|r| r.created.len()).sum();
    let duplicates: usize = reports.iter().map(|r| r.duplicates).sum();
    assert!(reports.iter().all(|r| r.rejected.is_empty()));
    assert_eq!(created, 14);
    assert_eq!(created + duplicates, 14 * WORKERS);

    let rows = store.scheduled_with_status(ScanStatus::Pending).unwrap();
    assert_eq!(rows.len(), 14);
    let mut occurrences: Vec<_> = rows
        .iter()
        .map(|r| (r.snapshot.scan_id(), r.start_datetime))
        .collect();
    occurrences.sort();
    occurrences.dedup();
    assert_eq!(occurrences.len(), 14);
}
