use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time};

use crate::error::{Error, Result};
use crate::recurrence::Recurrence;
use crate::targets;

/// `HH:MM:SS` on the wire; `HH:MM` is accepted on input.
pub(crate) mod time_of_day {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::FormatItem;
    use time::macros::format_description;
    use time::Time;

    const FULL: &[FormatItem<'static>] = format_description!("[hour]:[minute]:[second]");
    const SHORT: &[FormatItem<'static>] = format_description!("[hour]:[minute]");

    pub fn serialize<S: Serializer>(value: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        let text = value.format(FULL).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let text = String::deserialize(deserializer)?;
        Time::parse(&text, FULL)
            .or_else(|_| Time::parse(&text, SHORT))
            .map_err(serde::de::Error::custom)
    }
}

macro_rules! record_id {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            #[serde(transparent)]
            pub struct $name(pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }
        )*
    };
}

record_id!(AgentId, ScanCommandId, SiteId, ScanId, ScheduledScanId);

/// Stable identity handed out by the external account provisioning step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub name: String,
    pub api_token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    /// Opaque credential, never regenerated.
    pub api_token: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_checkin: Option<OffsetDateTime>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanBinary {
    Masscan,
    #[default]
    Nmap,
}

impl ScanBinary {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanBinary::Masscan => "masscan",
            ScanBinary::Nmap => "nmap",
        }
    }
}

impl fmt::Display for ScanBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanBinary {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "masscan" => Ok(ScanBinary::Masscan),
            "nmap" => Ok(ScanBinary::Nmap),
            other => Err(Error::invalid_field(
                "scan_binary",
                format!("{other:?} is not one of masscan, nmap"),
            )),
        }
    }
}

/// A named, reusable invocation template for one scan binary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanCommand {
    pub id: ScanCommandId,
    pub binary: ScanBinary,
    pub name: String,
    pub command: String,
}

impl fmt::Display for ScanCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}||{}", self.binary, self.name)
    }
}

/// Target population owned by one agent. `targets` and `excluded_targets` are
/// always stored in canonical form.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub description: String,
    pub targets: String,
    pub excluded_targets: String,
    pub scan_command_id: ScanCommandId,
    pub agent_id: AgentId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub id: ScanId,
    pub site_id: SiteId,
    pub name: String,
    #[serde(with = "time_of_day")]
    pub start_time: Time,
    pub recurrence: Recurrence,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Started,
    Completed,
    Error,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Started => "started",
            ScanStatus::Completed => "completed",
            ScanStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Error)
    }

    /// Edges of the lifecycle graph. `pending -> error` covers pre-flight failures
    /// and cancellation before a claim.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (ScanStatus::Pending, ScanStatus::Started)
                | (ScanStatus::Pending, ScanStatus::Error)
                | (ScanStatus::Started, ScanStatus::Completed)
                | (ScanStatus::Started, ScanStatus::Error)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "started" => Ok(ScanStatus::Started),
            "completed" => Ok(ScanStatus::Completed),
            "error" => Ok(ScanStatus::Error),
            other => Err(Error::invalid_field(
                "scan_status",
                format!("{other:?} is not one of pending, started, completed, error"),
            )),
        }
    }
}

/// Everything an agent needs to run one occurrence, frozen when the occurrence is
/// materialized. Later edits to the site, agent or command never reach it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanSnapshot {
    site_name: String,
    site_id: SiteId,
    scan_id: ScanId,
    agent_name: String,
    agent_id: AgentId,
    scan_binary: ScanBinary,
    scan_command: String,
    scan_command_id: ScanCommandId,
    targets: String,
    excluded_targets: String,
}

impl ScanSnapshot {
    /// Re-validates the site's targets and copies the current state of every
    /// referenced record.
    pub fn capture(
        site: &Site,
        scan: &Scan,
        agent: &Agent,
        command: &ScanCommand,
        allow_private_ips: bool,
    ) -> Result<Self> {
        if scan.site_id != site.id {
            return Err(Error::Constraint(format!(
                "scan {} belongs to site {}, not {}",
                scan.id, scan.site_id, site.id
            )));
        }
        if site.agent_id != agent.id || site.scan_command_id != command.id {
            return Err(Error::Constraint(format!(
                "site {} does not reference agent {} and command {}",
                site.id, agent.id, command.id
            )));
        }

        let extraction = targets::extract(
            &site.targets,
            Some(&site.excluded_targets),
            allow_private_ips,
        );
        let extraction = extraction.into_result()?;
        if extraction.targets.is_empty() {
            return Err(Error::invalid_field("targets", "every target is excluded"));
        }

        Ok(Self {
            site_name: site.name.clone(),
            site_id: site.id,
            scan_id: scan.id,
            agent_name: agent.name.clone(),
            agent_id: agent.id,
            scan_binary: command.binary,
            scan_command: command.command.clone(),
            scan_command_id: command.id,
            targets: extraction.canonical,
            excluded_targets: extraction.excluded_canonical,
        })
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn scan_binary(&self) -> ScanBinary {
        self.scan_binary
    }

    pub fn scan_command(&self) -> &str {
        &self.scan_command
    }

    pub fn scan_command_id(&self) -> ScanCommandId {
        self.scan_command_id
    }

    /// Exclusions already subtracted.
    pub fn targets(&self) -> &str {
        &self.targets
    }

    pub fn excluded_targets(&self) -> &str {
        &self.excluded_targets
    }
}

/// One materialized occurrence of a scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScheduledScan {
    pub id: ScheduledScanId,
    #[serde(flatten)]
    pub snapshot: ScanSnapshot,
    #[serde(with = "time::serde::rfc3339")]
    pub start_datetime: OffsetDateTime,
    pub scan_status: ScanStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub result_file_base_name: Option<String>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl ScheduledScan {
    pub fn pending(id: ScheduledScanId, snapshot: ScanSnapshot, start: OffsetDateTime) -> Self {
        Self {
            id,
            snapshot,
            start_datetime: start,
            scan_status: ScanStatus::Pending,
            started_time: None,
            completed_time: None,
            result_file_base_name: None,
            error_reason: None,
        }
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.scan_status == ScanStatus::Pending && self.start_datetime <= now
    }
}
