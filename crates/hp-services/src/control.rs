use std::collections::BTreeMap;
use std::sync::Arc;

use hp_core::model::OperationResult;
use hp_core::security::audit::AuditAction;
use hp_core::service::{ServiceAction, ServiceError, ServiceManager, UnitStatus};
use tracing::info;

use crate::audit::Auditor;

/// Audited control of the catalog services.
pub struct ControlService {
    manager: Arc<dyn ServiceManager>,
    audit: Auditor,
}

impl ControlService {
    pub fn new(manager: Arc<dyn ServiceManager>, audit: Auditor) -> Self {
        Self { manager, audit }
    }

    /// Execute a service control action
    pub async fn control_service(&self, key: &str, action: ServiceAction) -> OperationResult {
        let result = self.manager.control(key, action).await;
        if result.success {
            info!("Service {} action {} completed", key, action);
        }
        self.audit.record(
            AuditAction::ServiceControl,
            &format!("{}:{}", key, action),
            result,
        )
    }

    /// List all installed catalog services with their status
    pub async fn list_services(&self) -> BTreeMap<String, UnitStatus> {
        self.manager.list_all_statuses().await
    }

    /// Get status of a single service
    pub async fn get_service(&self, key: &str) -> Result<UnitStatus, ServiceError> {
        self.manager.status(key).await
    }

    pub async fn logs(&self, key: &str, lines: u32) -> Result<String, ServiceError> {
        self.manager.logs(key, lines).await
    }
}
