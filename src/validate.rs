//! Write-time validation of the records an operator creates.
//!
//! Every check returns the full set of problems for a field at once so the
//! caller can fix everything in one round.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::Time;

use crate::error::{Error, Result};
use crate::recurrence::Recurrence;
use crate::targets;
use crate::types::{AgentId, AgentIdentity, ScanBinary, ScanCommandId, SiteId};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_API_TOKEN_LEN: usize = 40;
pub const MAX_TARGETS_LEN: usize = 1_048_576;
pub const MAX_RESULT_FILE_LEN: usize = 255;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9/()_\- ]*$").expect("name regex should compile"));

/// IPv4, IPv6 and FQDN characters only, space delimited.
static TARGET_CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9/.: ]*$").expect("target charset regex should compile"));

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewAgent {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewScanCommand {
    #[serde(default)]
    pub binary: ScanBinary,
    pub name: String,
    pub command: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewSite {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub targets: String,
    #[serde(default)]
    pub excluded_targets: String,
    pub scan_command_id: ScanCommandId,
    pub agent_id: AgentId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewScan {
    pub site_id: SiteId,
    #[serde(default)]
    pub name: String,
    #[serde(with = "crate::types::time_of_day")]
    pub start_time: Time,
    pub recurrence: Recurrence,
}

pub fn name(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_field(field, "must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(Error::invalid_field(
            field,
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }
    if !NAME_PATTERN.is_match(value) {
        return Err(Error::invalid_field(
            field,
            "can only contain alphanumeric characters, /, (), -, _, or spaces",
        ));
    }
    Ok(())
}

fn description(value: &str) -> Result<()> {
    if value.len() > MAX_NAME_LEN {
        return Err(Error::invalid_field(
            "description",
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

pub fn agent(new: NewAgent) -> Result<NewAgent> {
    name("scan_agent", &new.identity.name)?;
    description(&new.description)?;
    let token = &new.identity.api_token;
    if token.is_empty() || token.len() > MAX_API_TOKEN_LEN {
        return Err(Error::invalid_field(
            "api_token",
            format!("must be 1 to {MAX_API_TOKEN_LEN} characters"),
        ));
    }
    Ok(new)
}

pub fn scan_command(new: NewScanCommand) -> Result<NewScanCommand> {
    if new.name.trim().is_empty() || new.name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_field(
            "scan_command_name",
            format!("must be 1 to {MAX_NAME_LEN} characters"),
        ));
    }
    if new.command.trim().is_empty() {
        return Err(Error::invalid_field("scan_command", "must not be empty"));
    }
    Ok(new)
}

/// Canonical form of a site target field, or every offending token.
///
/// Tokens that are valid targets but fall outside the stored character set
/// (hyphenated host names) are reported alongside the unparseable ones.
pub fn target_field(raw: &str, allow_private_ips: bool) -> std::result::Result<String, Vec<String>> {
    if raw.len() > MAX_TARGETS_LEN {
        return Err(vec![format!("<{} characters>", raw.len())]);
    }
    let extraction = targets::extract(raw, None, allow_private_ips);
    let mut invalid = extraction.invalid;
    invalid.extend(
        extraction
            .targets
            .iter()
            .map(ToString::to_string)
            .filter(|t| !TARGET_CHARSET.is_match(t)),
    );
    if !invalid.is_empty() {
        return Err(invalid);
    }
    Ok(extraction.canonical)
}

/// Validates and canonicalizes both target fields.
pub fn site(mut new: NewSite, allow_private_ips: bool) -> Result<NewSite> {
    name("site_name", &new.name)?;
    description(&new.description)?;

    new.targets = target_field(&new.targets, allow_private_ips).map_err(Error::InvalidTarget)?;
    if new.targets.is_empty() {
        return Err(Error::invalid_field("targets", "at least one target is required"));
    }
    new.excluded_targets = target_field(&new.excluded_targets, allow_private_ips)
        .map_err(Error::InvalidExcludedTarget)?;
    if targets::extract(&new.targets, Some(&new.excluded_targets), allow_private_ips)
        .targets
        .is_empty()
    {
        return Err(Error::invalid_field("targets", "every target is excluded"));
    }
    Ok(new)
}

pub fn scan(new: NewScan) -> Result<NewScan> {
    if new.name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_field(
            "scan_name",
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }
    new.recurrence.validate()?;
    Ok(new)
}

pub fn result_file_base_name(value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_RESULT_FILE_LEN {
        return Err(Error::invalid_field(
            "result_file_base_name",
            format!("must be 1 to {MAX_RESULT_FILE_LEN} characters"),
        ));
    }
    if value.contains(['/', '\\']) {
        return Err(Error::invalid_field(
            "result_file_base_name",
            "must be a base name, not a path",
        ));
    }
    Ok(())
}
