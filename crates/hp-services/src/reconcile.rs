//! Shared render → install → validate → reload flow of the config
//! reconcilers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hp_core::render::RenderError;
use hp_core::shell::{CommandSpec, ShellExecutor};
use thiserror::Error;
use tracing::{error, warn};

use crate::installer::{ConfigInstaller, InstallError, InstallReceipt};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error("Configuration test failed: {0}")]
    Validation(String),
    #[error("Reload failed: {0}")]
    Reload(String),
    #[error("{0}")]
    NotApplicable(String),
}

/// A config file about to replace the live one, plus the command that
/// proves the result is loadable.
pub(crate) struct Candidate<'a> {
    pub path: PathBuf,
    pub content: String,
    /// Symlink to maintain alongside the file (Debian `sites-enabled`).
    pub link: Option<PathBuf>,
    pub validator: CommandSpec,
    pub installer: &'a ConfigInstaller,
}

impl Candidate<'_> {
    /// Install, link and validate. On a failed validation the previous live
    /// config is restored before returning.
    pub async fn apply(self, executor: &dyn ShellExecutor) -> Result<(), ReconcileError> {
        let receipt = self.installer.install(&self.path, &self.content).await?;

        let linked = match &self.link {
            Some(link) => {
                let fresh = !self.installer.exists(link).await;
                if let Err(e) = self.installer.link(&self.path, link).await {
                    self.restore(&receipt, None).await;
                    return Err(e.into());
                }
                fresh.then(|| link.clone())
            }
            None => None,
        };

        let out = executor.run(self.validator.clone()).await;
        if !out.success() {
            let detail = out.error_text();
            error!(path = %self.path.display(), error = %detail, "Config validation failed, restoring previous file");
            self.restore(&receipt, linked.as_deref()).await;
            return Err(ReconcileError::Validation(detail));
        }

        self.installer.commit(&receipt).await;
        Ok(())
    }

    async fn restore(&self, receipt: &InstallReceipt, new_link: Option<&Path>) {
        if let Err(e) = self.installer.rollback(receipt).await {
            error!(path = %self.path.display(), error = %e, "Failed to restore previous config");
        }
        if receipt.backup.is_none() {
            if let Some(link) = new_link {
                if let Err(e) = self.installer.remove(link).await {
                    warn!(link = %link.display(), error = %e, "Failed to remove config link");
                }
            }
        }
    }
}

/// Validator command run with elevation and the given timeout.
pub(crate) fn validator(program: impl Into<String>, timeout: Duration) -> CommandSpec {
    CommandSpec::new(program).arg("-t").elevated().timeout(timeout)
}
