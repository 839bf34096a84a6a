use std::sync::Arc;

use hp_core::model::OperationResult;
use hp_core::security::audit::{AuditAction, AuditEvent, AuditLogger, NullAuditLogger};

/// Records operation outcomes under a fixed actor name.
#[derive(Clone)]
pub struct Auditor {
    logger: Arc<dyn AuditLogger>,
    actor: String,
}

impl Auditor {
    pub fn new(logger: Arc<dyn AuditLogger>, actor: impl Into<String>) -> Self {
        Self {
            logger,
            actor: actor.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NullAuditLogger), "system")
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Log `outcome` and hand it back.
    pub fn record(&self, action: AuditAction, target: &str, outcome: OperationResult) -> OperationResult {
        self.logger
            .log_event(&AuditEvent::from_outcome(action, self.actor.as_str(), target, &outcome));
        outcome
    }
}
