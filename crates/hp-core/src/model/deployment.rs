use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("deployment state", other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeploymentError {
    #[error("Deployment is already {0}")]
    AlreadyFinished(DeploymentState),
    #[error("Cannot move deployment from {from} to {to}")]
    InvalidTransition {
        from: DeploymentState,
        to: DeploymentState,
    },
}

/// Commit that triggered a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: Option<String>,
    pub message: Option<String>,
    pub author: Option<String>,
}

/// Audit record of one webhook-triggered deployment. Never mutated once it
/// has completed or failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub webhook_id: i64,
    pub status: DeploymentState,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(webhook_id: i64, commit: CommitInfo) -> Self {
        Self {
            id: 0,
            webhook_id,
            status: DeploymentState::Pending,
            commit_hash: commit.hash,
            commit_message: commit.message,
            author: commit.author,
            output: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) -> Result<(), DeploymentError> {
        self.guard_open()?;
        if self.status != DeploymentState::Pending {
            return Err(DeploymentError::InvalidTransition {
                from: self.status,
                to: DeploymentState::Processing,
            });
        }
        self.status = DeploymentState::Processing;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, output: impl Into<String>) -> Result<(), DeploymentError> {
        self.guard_open()?;
        if self.status != DeploymentState::Processing {
            return Err(DeploymentError::InvalidTransition {
                from: self.status,
                to: DeploymentState::Completed,
            });
        }
        self.status = DeploymentState::Completed;
        self.output = Some(output.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Fail a pending or processing deployment.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        output: Option<String>,
    ) -> Result<(), DeploymentError> {
        self.guard_open()?;
        self.status = DeploymentState::Failed;
        self.error_message = Some(error.into());
        if output.is_some() {
            self.output = output;
        }
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// First seven characters of the commit hash.
    pub fn short_commit_hash(&self) -> Option<&str> {
        self.commit_hash
            .as_deref()
            .map(|h| h.get(..7).unwrap_or(h))
    }

    fn guard_open(&self) -> Result<(), DeploymentError> {
        if self.status.is_finished() {
            return Err(DeploymentError::AlreadyFinished(self.status));
        }
        Ok(())
    }
}
