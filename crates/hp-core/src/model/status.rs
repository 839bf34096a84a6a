use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::{OperationResult, ParseEnumError};

/// Deployment state of one dimension (nginx, ssl, dns, pm2) of a site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    #[default]
    None,
    Pending,
    Active,
    Failed,
}

impl DeployState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    /// Transition table.
    ///
    /// Any state may re-enter `pending`. A pending operation resolves to
    /// `active` or `failed`, or to `none` when it was a teardown. Settled
    /// states may be cleared to `none`.
    pub fn can_transition_to(self, next: DeployState) -> bool {
        use DeployState::*;
        match (self, next) {
            (_, Pending) => true,
            (Pending, Active) | (Pending, Failed) | (Pending, None) => true,
            (Active, None) | (Failed, None) | (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("deploy state", other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: DeployState,
    pub to: DeployState,
}

/// State, last error and last successful sync time of one dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusTrack {
    pub state: DeployState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl StatusTrack {
    pub fn is_pending(&self) -> bool {
        self.state == DeployState::Pending
    }

    pub fn is_active(&self) -> bool {
        self.state == DeployState::Active
    }

    /// Move to `next`, rejecting transitions outside the table.
    pub fn transition(&mut self, next: DeployState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Mark an operation as started. Clears the previous error.
    pub fn begin(&mut self) {
        self.state = DeployState::Pending;
        self.error = None;
    }

    /// Resolve a deploy-style operation to `active` or `failed`.
    pub fn finish(&mut self, result: &OperationResult) {
        self.ensure_pending();
        if result.success {
            self.state = DeployState::Active;
            self.error = None;
            self.synced_at = Some(Utc::now());
        } else {
            self.state = DeployState::Failed;
            self.error = Some(result.error_text().to_string());
        }
    }

    /// Resolve a teardown-style operation to `none` or `failed`.
    pub fn finish_teardown(&mut self, result: &OperationResult) {
        self.ensure_pending();
        if result.success {
            self.state = DeployState::None;
            self.error = None;
            self.synced_at = None;
        } else {
            self.state = DeployState::Failed;
            self.error = Some(result.error_text().to_string());
        }
    }

    fn ensure_pending(&mut self) {
        if !self.is_pending() {
            warn!(state = %self.state, "Resolving a status that was never marked pending");
            self.begin();
        }
    }
}

/// Per-dimension status embedded on a site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub nginx: StatusTrack,
    pub ssl: StatusTrack,
    pub dns: StatusTrack,
    pub pm2: StatusTrack,
}
