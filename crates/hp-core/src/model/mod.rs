//! Records the orchestration engine reads and mutates: sites with their
//! per-dimension deployment status, systemd units and deployment audit
//! records.

mod deployment;
mod outcome;
mod site;
mod status;
mod unit;

use thiserror::Error;

pub use deployment::{CommitInfo, Deployment, DeploymentError, DeploymentState};
pub use outcome::OperationResult;
pub use site::{
    CertificateMeta, DnsRecordState, NewSite, Site, SiteKind, SiteUpdate, WwwRedirect,
    DISABLE_FUNCTIONS_KEY,
};
pub use status::{DeployState, DeploymentStatus, StatusTrack, TransitionError};
pub use unit::{RestartPolicy, SystemUnit, UnitType, UnitUpdate};

/// Returned when a stored string does not name a known enum variant.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
