//! Fleet definition file: agents, scan commands, sites and scans referenced by name.
//!
//! Every record passes through the same write-time validation as any other
//! write, so a seed file with bad targets is rejected with the full list.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use time::Time;
use tracing::info;

use crate::error::{Error, Result};
use crate::recurrence::Recurrence;
use crate::store::ScheduleStore;
use crate::types::{AgentId, ScanCommandId, SiteId};
use crate::validate::{self, NewAgent, NewScan, NewScanCommand, NewSite};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub agents: Vec<NewAgent>,
    #[serde(default)]
    pub scan_commands: Vec<NewScanCommand>,
    #[serde(default)]
    pub sites: Vec<SeedSite>,
    #[serde(default)]
    pub scans: Vec<SeedScan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedSite {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub targets: String,
    #[serde(default)]
    pub excluded_targets: String,
    /// Scan command name.
    pub scan_command: String,
    /// Agent name.
    pub agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedScan {
    /// Site name.
    pub site: String,
    #[serde(default)]
    pub name: String,
    #[serde(with = "crate::types::time_of_day")]
    pub start_time: Time,
    pub recurrence: Recurrence,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub agents: usize,
    pub scan_commands: usize,
    pub sites: usize,
    pub scans: usize,
}

fn lookup<T: Copy>(map: &HashMap<String, T>, kind: &'static str, name: &str) -> Result<T> {
    map.get(name)
        .copied()
        .ok_or_else(|| Error::not_found(kind, name))
}

impl Seed {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse seed file: {}", path.display()))
    }

    /// Validate and insert everything, resolving references by name.
    pub fn apply<S: ScheduleStore + ?Sized>(self, store: &S, allow_private_ips: bool) -> Result<SeedSummary> {
        let mut agents: HashMap<String, AgentId> = HashMap::new();
        let mut commands: HashMap<String, ScanCommandId> = HashMap::new();
        let mut sites: HashMap<String, SiteId> = HashMap::new();
        let mut summary = SeedSummary::default();

        for agent in self.agents {
            let agent = store.insert_agent(validate::agent(agent)?)?;
            agents.insert(agent.name, agent.id);
            summary.agents += 1;
        }

        for command in self.scan_commands {
            let command = store.insert_scan_command(validate::scan_command(command)?)?;
            commands.insert(command.name, command.id);
            summary.scan_commands += 1;
        }

        for site in self.sites {
            let new = NewSite {
                scan_command_id: lookup(&commands, "scan command", &site.scan_command)?,
                agent_id: lookup(&agents, "agent", &site.agent)?,
                name: site.name,
                description: site.description,
                targets: site.targets,
                excluded_targets: site.excluded_targets,
            };
            let site = store.insert_site(validate::site(new, allow_private_ips)?)?;
            sites.insert(site.name, site.id);
            summary.sites += 1;
        }

        for scan in self.scans {
            let new = NewScan {
                site_id: lookup(&sites, "site", &scan.site)?,
                name: scan.name,
                start_time: scan.start_time,
                recurrence: scan.recurrence,
            };
            store.insert_scan(validate::scan(new)?)?;
            summary.scans += 1;
        }

        info!(
            agents = summary.agents,
            scan_commands = summary.scan_commands,
            sites = summary.sites,
            scans = summary.scans,
            "seed loaded"
        );
        Ok(summary)
    }
}
