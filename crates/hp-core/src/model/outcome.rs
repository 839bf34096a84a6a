use std::fmt;

use serde::{Deserialize, Serialize};

/// The uniform `{success, message, error}` shape every operation returns to
/// its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }

    /// A failure that still carries a summary of what did succeed.
    pub fn partial(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            error: Some(error.into()),
        }
    }

    pub fn from_result<E: fmt::Display>(result: Result<String, E>) -> Self {
        match result {
            Ok(message) => Self::ok(message),
            Err(e) => Self::failed(e.to_string()),
        }
    }

    /// The error text, or a generic placeholder for a failure without one.
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("operation failed")
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.success, &self.message, &self.error) {
            (true, Some(m), _) => write!(f, "ok: {}", m),
            (true, None, _) => write!(f, "ok"),
            (false, Some(m), Some(e)) => write!(f, "failed: {} ({})", e, m),
            (false, _, _) => write!(f, "failed: {}", self.error_text()),
        }
    }
}
