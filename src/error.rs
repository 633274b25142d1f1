//! Error kinds shared by the scheduling core.

use thiserror::Error;
use time::OffsetDateTime;

use crate::types::{AgentId, ScanId, ScanStatus, ScheduledScanId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Every bad token of a target expression, never just the first one.
    #[error("invalid targets provided: {}", .0.join(","))]
    InvalidTarget(Vec<String>),

    #[error("invalid excluded targets provided: {}", .0.join(","))]
    InvalidExcludedTarget(Vec<String>),

    /// The (scan, start) pair is already materialized. Callers skip it.
    #[error("scan {scan_id} already scheduled at {start}")]
    DuplicateOccurrence {
        scan_id: ScanId,
        start: OffsetDateTime,
    },

    /// Another agent got there first. Not a failure; the caller just gets no work.
    #[error("scheduled scan {id} already {status}")]
    ClaimConflict {
        id: ScheduledScanId,
        status: ScanStatus,
    },

    #[error("scheduled scan {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ScheduledScanId,
        from: ScanStatus,
        to: ScanStatus,
    },

    /// Advisory only, produced by the stale sweep.
    #[error("agent {agent_id} has been silent while scheduled scan {id} is started")]
    StaleAgent {
        id: ScheduledScanId,
        agent_id: AgentId,
    },

    #[error("scheduled scan {id} is assigned to agent {assigned}, not {reported_by}")]
    AgentMismatch {
        id: ScheduledScanId,
        assigned: AgentId,
        reported_by: AgentId,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("invalid {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(String),

    #[error("invalid horizon: {0}")]
    InvalidHorizon(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_field(field: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidField {
            field,
            message: message.into(),
        }
    }

    /// Expected control-flow outcomes that callers should branch on rather than surface.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Error::DuplicateOccurrence { .. } | Error::ClaimConflict { .. } | Error::StaleAgent { .. }
        )
    }
}
