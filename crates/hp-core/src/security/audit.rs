//! Audit trail of every state-changing panel operation.
//!
//! Each line in the audit log is a complete JSON object (JSON Lines), so the
//! file can be read with `jq` or shipped to a log aggregator as-is. The
//! [`FileAuditLogger`] rotates the file once it grows past its size limit.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::OperationResult;

/// Default path for the audit log file.
pub const AUDIT_LOG_PATH: &str = "/var/lib/hostpanel/audit.log";

/// Default size at which the log is rotated (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Operations recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ServiceControl,
    SiteCreate,
    SiteUpdate,
    SiteDelete,
    SiteDeploy,
    CertificateRequest,
    CertificateRenew,
    CertificateDelete,
    DnsSync,
    DnsRemove,
    ProcessControl,
    UnitDeploy,
    UnitUndeploy,
    UnitControl,
    GitDeploy,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ServiceControl => "service_control",
            Self::SiteCreate => "site_create",
            Self::SiteUpdate => "site_update",
            Self::SiteDelete => "site_delete",
            Self::SiteDeploy => "site_deploy",
            Self::CertificateRequest => "certificate_request",
            Self::CertificateRenew => "certificate_renew",
            Self::CertificateDelete => "certificate_delete",
            Self::DnsSync => "dns_sync",
            Self::DnsRemove => "dns_remove",
            Self::ProcessControl => "process_control",
            Self::UnitDeploy => "unit_deploy",
            Self::UnitUndeploy => "unit_undeploy",
            Self::UnitControl => "unit_control",
            Self::GitDeploy => "git_deploy",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Who triggered the action (username, "cli", "scheduler", ...).
    pub actor: String,
    /// Domain, unit or service the action was applied to.
    pub target: String,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        actor: impl Into<String>,
        target: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            actor: actor.into(),
            target: target.into(),
            result,
            details: None,
        }
    }

    pub fn success(action: AuditAction, actor: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(action, actor, target, AuditResult::Success)
    }

    pub fn failure(
        action: AuditAction,
        actor: impl Into<String>,
        target: impl Into<String>,
        error: impl fmt::Display,
    ) -> Self {
        let mut event = Self::new(action, actor, target, AuditResult::Failure);
        event.details = Some(error.to_string());
        event
    }

    /// Event mirroring an operation outcome.
    pub fn from_outcome(
        action: AuditAction,
        actor: impl Into<String>,
        target: impl Into<String>,
        outcome: &OperationResult,
    ) -> Self {
        if outcome.success {
            let mut event = Self::success(action, actor, target);
            event.details = outcome.message.clone();
            event
        } else {
            Self::failure(action, actor, target, outcome.error_text())
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} on {} ({})",
            self.timestamp.to_rfc3339(),
            self.actor,
            self.action,
            self.target,
            self.result,
        )?;
        if let Some(ref details) = self.details {
            write!(f, ": {}", details)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuditLogger trait
// ---------------------------------------------------------------------------

/// Audit log backend.
///
/// Persistence failures are logged and swallowed: auditing never fails the
/// audited operation.
pub trait AuditLogger: Send + Sync {
    fn log_event(&self, event: &AuditEvent);
}

// ---------------------------------------------------------------------------
// FileAuditLogger
// ---------------------------------------------------------------------------

/// JSON Lines audit log with size-based rotation.
pub struct FileAuditLogger {
    log_path: PathBuf,
    max_size: u64,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileAuditLogger {
    /// Open `log_path` in append mode, creating its parent directory.
    pub fn new(log_path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = log_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                info!(path = %parent.display(), "Created audit log directory");
            }
        }

        let file = Self::open_log_file(log_path)?;

        Ok(Self {
            log_path: log_path.to_path_buf(),
            max_size: MAX_LOG_SIZE,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Rename the current file to `<path>.<timestamp>` once it exceeds the
    /// size limit and start a fresh one.
    fn maybe_rotate(&self, guard: &mut Option<BufWriter<File>>) -> Result<bool, AuditError> {
        let metadata = match fs::metadata(&self.log_path) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };

        if metadata.len() < self.max_size {
            return Ok(false);
        }

        if let Some(ref mut w) = guard {
            let _ = w.flush();
        }
        *guard = None;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let rotated_path = PathBuf::from(format!("{}.{}", self.log_path.display(), timestamp));

        fs::rename(&self.log_path, &rotated_path).map_err(|e| {
            error!(
                from = %self.log_path.display(),
                to = %rotated_path.display(),
                error = %e,
                "Failed to rotate audit log"
            );
            e
        })?;

        info!(old = %rotated_path.display(), "Rotated audit log");

        let file = Self::open_log_file(&self.log_path)?;
        *guard = Some(BufWriter::new(file));

        Ok(true)
    }

    fn open_log_file(path: &Path) -> Result<File, AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(file)
    }

    fn write_event(writer: &mut BufWriter<File>, event: &AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(event)?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl AuditLogger for FileAuditLogger {
    fn log_event(&self, event: &AuditEvent) {
        let mut guard = match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                error!("Audit logger mutex poisoned, recovering");
                poisoned.into_inner()
            }
        };

        if let Err(e) = self.maybe_rotate(&mut guard) {
            warn!(error = %e, "Failed to check/rotate audit log");
        }

        if guard.is_none() {
            match Self::open_log_file(&self.log_path) {
                Ok(file) => *guard = Some(BufWriter::new(file)),
                Err(e) => {
                    error!(error = %e, event = %event, "Failed to open audit log, event lost");
                    return;
                }
            }
        }

        if let Some(ref mut writer) = *guard {
            if let Err(e) = Self::write_event(writer, event) {
                error!(error = %e, event = %event, "Failed to write audit event");
            }
        }
    }
}

impl fmt::Debug for FileAuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditLogger")
            .field("log_path", &self.log_path)
            .field("max_size", &self.max_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// NullAuditLogger
// ---------------------------------------------------------------------------

/// Discards every event.
#[derive(Debug, Clone)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn log_event(&self, _event: &AuditEvent) {}
}

// ---------------------------------------------------------------------------
// InMemoryAuditLogger
// ---------------------------------------------------------------------------

/// Keeps events in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct InMemoryAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Actions recorded so far, in order.
    pub fn actions(&self) -> Vec<AuditAction> {
        self.events().iter().map(|e| e.action).collect()
    }
}

impl AuditLogger for InMemoryAuditLogger {
    fn log_event(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
