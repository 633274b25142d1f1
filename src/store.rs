//! Storage seam for sites, scans and scheduled scans.
//!
//! Durable storage is an external collaborator. [`ScheduleStore`] captures what
//! the scheduling core needs from it: uniqueness and reference checks on insert,
//! and a single atomic conditional status update. [`MemoryStore`] is the
//! in-process implementation used by the binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::types::{
    Agent, AgentId, Scan, ScanCommand, ScanCommandId, ScanId, ScanSnapshot, ScanStatus,
    ScheduledScan, ScheduledScanId, Site, SiteId,
};
use crate::validate::{NewAgent, NewScan, NewScanCommand, NewSite};

/// Field values written together with a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub to: ScanStatus,
    pub started_time: Option<OffsetDateTime>,
    pub completed_time: Option<OffsetDateTime>,
    pub result_file_base_name: Option<String>,
    pub error_reason: Option<String>,
}

impl StatusChange {
    pub fn started(at: OffsetDateTime) -> Self {
        Self {
            to: ScanStatus::Started,
            started_time: Some(at),
            completed_time: None,
            result_file_base_name: None,
            error_reason: None,
        }
    }

    pub fn completed(at: OffsetDateTime, result_file_base_name: String) -> Self {
        Self {
            to: ScanStatus::Completed,
            started_time: None,
            completed_time: Some(at),
            result_file_base_name: Some(result_file_base_name),
            error_reason: None,
        }
    }

    pub fn error(reason: String) -> Self {
        Self {
            to: ScanStatus::Error,
            started_time: None,
            completed_time: None,
            result_file_base_name: None,
            error_reason: Some(reason),
        }
    }
}

pub trait ScheduleStore: Send + Sync {
    fn insert_agent(&self, agent: NewAgent) -> Result<Agent>;
    fn agent(&self, id: AgentId) -> Result<Agent>;
    fn agent_by_token(&self, token: &str) -> Result<Agent>;
    fn record_checkin(&self, id: AgentId, at: OffsetDateTime) -> Result<Agent>;

    fn insert_scan_command(&self, command: NewScanCommand) -> Result<ScanCommand>;
    fn scan_command(&self, id: ScanCommandId) -> Result<ScanCommand>;
    fn update_scan_command(&self, command: ScanCommand) -> Result<()>;

    fn insert_site(&self, site: NewSite) -> Result<Site>;
    fn site(&self, id: SiteId) -> Result<Site>;
    /// Raw write; callers are expected to have run `validate::site` first.
    fn update_site(&self, site: Site) -> Result<()>;

    fn insert_scan(&self, scan: NewScan) -> Result<Scan>;
    fn scan(&self, id: ScanId) -> Result<Scan>;
    fn scans(&self) -> Result<Vec<Scan>>;

    /// Fails with [`Error::DuplicateOccurrence`] when `(scan, start)` exists.
    fn insert_scheduled(&self, snapshot: ScanSnapshot, start: OffsetDateTime) -> Result<ScheduledScan>;
    fn scheduled(&self, id: ScheduledScanId) -> Result<ScheduledScan>;
    /// Ordered by start time, then id.
    fn scheduled_with_status(&self, status: ScanStatus) -> Result<Vec<ScheduledScan>>;
    fn scheduled_for_agent(&self, agent: AgentId, status: ScanStatus) -> Result<Vec<ScheduledScan>>;

    /// Apply `change` only if the row's current status is one of `from`, as one
    /// atomic step. Otherwise fails with [`Error::InvalidTransition`] carrying
    /// the status actually found.
    fn transition(
        &self,
        id: ScheduledScanId,
        from: &[ScanStatus],
        change: StatusChange,
    ) -> Result<ScheduledScan>;
}

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    agents: BTreeMap<AgentId, Agent>,
    commands: BTreeMap<ScanCommandId, ScanCommand>,
    sites: BTreeMap<SiteId, Site>,
    scans: BTreeMap<ScanId, Scan>,
    scheduled: BTreeMap<ScheduledScanId, ScheduledScan>,
    occurrences: HashMap<(ScanId, OffsetDateTime), ScheduledScanId>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Thread-safe in-memory store. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sorted(mut rows: Vec<ScheduledScan>) -> Vec<ScheduledScan> {
    rows.sort_by_key(|s| (s.start_datetime, s.id));
    rows
}

impl ScheduleStore for MemoryStore {
    fn insert_agent(&self, agent: NewAgent) -> Result<Agent> {
        let mut t = self.write();
        if t.agents.values().any(|a| a.name == agent.identity.name) {
            return Err(Error::Constraint(format!(
                "agent name {:?} already exists",
                agent.identity.name
            )));
        }
        if t.agents.values().any(|a| a.api_token == agent.identity.api_token) {
            return Err(Error::Constraint("api token already in use".into()));
        }
        let id = AgentId(t.next_id());
        let row = Agent {
            id,
            name: agent.identity.name,
            description: agent.description,
            api_token: agent.identity.api_token,
            last_checkin: None,
        };
        t.agents.insert(id, row.clone());
        Ok(row)
    }

    fn agent(&self, id: AgentId) -> Result<Agent> {
        self.read()
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("agent", id))
    }

    fn agent_by_token(&self, token: &str) -> Result<Agent> {
        self.read()
            .agents
            .values()
            .find(|a| a.api_token == token)
            .cloned()
            .ok_or_else(|| Error::not_found("agent", "<token>"))
    }

    fn record_checkin(&self, id: AgentId, at: OffsetDateTime) -> Result<Agent> {
        let mut t = self.write();
        let agent = t
            .agents
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("agent", id))?;
        agent.last_checkin = Some(at);
        Ok(agent.clone())
    }

    fn insert_scan_command(&self, command: NewScanCommand) -> Result<ScanCommand> {
        let mut t = self.write();
        if t.commands.values().any(|c| c.name == command.name) {
            return Err(Error::Constraint(format!(
                "scan command name {:?} already exists",
                command.name
            )));
        }
        let id = ScanCommandId(t.next_id());
        let row = ScanCommand {
            id,
            binary: command.binary,
            name: command.name,
            command: command.command,
        };
        t.commands.insert(id, row.clone());
        Ok(row)
    }

    fn scan_command(&self, id: ScanCommandId) -> Result<ScanCommand> {
        self.read()
            .commands
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("scan command", id))
    }

    fn update_scan_command(&self, command: ScanCommand) -> Result<()> {
        let mut t = self.write();
        if t
            .commands
            .values()
            .any(|c| c.id != command.id && c.name == command.name)
        {
            return Err(Error::Constraint(format!(
                "scan command name {:?} already exists",
                command.name
            )));
        }
        let slot = t
            .commands
            .get_mut(&command.id)
            .ok_or_else(|| Error::not_found("scan command", command.id))?;
        *slot = command;
        Ok(())
    }

    fn insert_site(&self, site: NewSite) -> Result<Site> {
        let mut t = self.write();
        if t.sites.values().any(|s| s.name == site.name) {
            return Err(Error::Constraint(format!("site name {:?} already exists", site.name)));
        }
        if !t.commands.contains_key(&site.scan_command_id) {
            return Err(Error::not_found("scan command", site.scan_command_id));
        }
        if !t.agents.contains_key(&site.agent_id) {
            return Err(Error::not_found("agent", site.agent_id));
        }
        let id = SiteId(t.next_id());
        let row = Site {
            id,
            name: site.name,
            description: site.description,
            targets: site.targets,
            excluded_targets: site.excluded_targets,
            scan_command_id: site.scan_command_id,
            agent_id: site.agent_id,
        };
        t.sites.insert(id, row.clone());
        Ok(row)
    }

    fn site(&self, id: SiteId) -> Result<Site> {
        self.read()
            .sites
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("site", id))
    }

    fn update_site(&self, site: Site) -> Result<()> {
        let mut t = self.write();
        if t.sites.values().any(|s| s.id != site.id && s.name == site.name) {
            return Err(Error::Constraint(format!("site name {:?} already exists", site.name)));
        }
        if !t.commands.contains_key(&site.scan_command_id) {
            return Err(Error::not_found("scan command", site.scan_command_id));
        }
        if !t.agents.contains_key(&site.agent_id) {
            return Err(Error::not_found("agent", site.agent_id));
        }
        let slot = t
            .sites
            .get_mut(&site.id)
            .ok_or_else(|| Error::not_found("site", site.id))?;
        *slot = site;
        Ok(())
    }

    fn insert_scan(&self, scan: NewScan) -> Result<Scan> {
        let mut t = self.write();
        if !t.sites.contains_key(&scan.site_id) {
            return Err(Error::not_found("site", scan.site_id));
        }
        let id = ScanId(t.next_id());
        let row = Scan {
            id,
            site_id: scan.site_id,
            name: scan.name,
            start_time: scan.start_time,
            recurrence: scan.recurrence,
        };
        t.scans.insert(id, row.clone());
        Ok(row)
    }

    fn scan(&self, id: ScanId) -> Result<Scan> {
        self.read()
            .scans
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("scan", id))
    }

    fn scans(&self) -> Result<Vec<Scan>> {
        Ok(self.read().scans.values().cloned().collect())
    }

    fn insert_scheduled(&self, snapshot: ScanSnapshot, start: OffsetDateTime) -> Result<ScheduledScan> {
        let mut t = self.write();
        let key = (snapshot.scan_id(), start);
        if t.occurrences.contains_key(&key) {
            return Err(Error::DuplicateOccurrence {
                scan_id: key.0,
                start,
            });
        }
        let id = ScheduledScanId(t.next_id());
        let row = ScheduledScan::pending(id, snapshot, start);
        t.occurrences.insert(key, id);
        t.scheduled.insert(id, row.clone());
        Ok(row)
    }

    fn scheduled(&self, id: ScheduledScanId) -> Result<ScheduledScan> {
        self.read()
            .scheduled
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("scheduled scan", id))
    }

    fn scheduled_with_status(&self, status: ScanStatus) -> Result<Vec<ScheduledScan>> {
        let rows = self
            .read()
            .scheduled
            .values()
            .filter(|s| s.scan_status == status)
            .cloned()
            .collect();
        Ok(sorted(rows))
    }

    fn scheduled_for_agent(&self, agent: AgentId, status: ScanStatus) -> Result<Vec<ScheduledScan>> {
        let rows = self
            .read()
            .scheduled
            .values()
            .filter(|s| s.snapshot.agent_id() == agent && s.scan_status == status)
            .cloned()
            .collect();
        Ok(sorted(rows))
    }

    fn transition(
        &self,
        id: ScheduledScanId,
        from: &[ScanStatus],
        change: StatusChange,
    ) -> Result<ScheduledScan> {
        let mut t = self.write();
        let row = t
            .scheduled
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("scheduled scan", id))?;

        let current = row.scan_status;
        if !from.contains(&current) || !current.can_transition_to(change.to) {
            return Err(Error::InvalidTransition {
                id,
                from: current,
                to: change.to,
            });
        }

        row.scan_status = change.to;
        if change.started_time.is_some() {
            row.started_time = change.started_time;
        }
        if change.completed_time.is_some() {
            row.completed_time = change.completed_time;
        }
        if change.result_file_base_name.is_some() {
            row.result_file_base_name = change.result_file_base_name;
        }
        if change.error_reason.is_some() {
            row.error_reason = change.error_reason;
        }
        Ok(row.clone())
    }
}
