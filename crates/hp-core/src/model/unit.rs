use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ParseEnumError;

/// systemd `Type=`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    #[default]
    Simple,
    Forking,
    Oneshot,
    Notify,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Forking => "forking",
            Self::Oneshot => "oneshot",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "forking" => Ok(Self::Forking),
            "oneshot" => Ok(Self::Oneshot),
            "notify" => Ok(Self::Notify),
            other => Err(ParseEnumError::new("unit type", other)),
        }
    }
}

/// systemd `Restart=`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    Always,
    OnFailure,
    OnAbnormal,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::OnAbnormal => "on-abnormal",
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartPolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" => Ok(Self::No),
            "always" => Ok(Self::Always),
            "on-failure" => Ok(Self::OnFailure),
            "on-abnormal" => Ok(Self::OnAbnormal),
            other => Err(ParseEnumError::new("restart policy", other)),
        }
    }
}

/// A user-defined systemd service managed by the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemUnit {
    pub id: i64,
    /// Unit name without the `.service` suffix. Immutable once created.
    pub name: String,
    pub description: String,
    pub exec_start: String,
    pub working_directory: String,
    pub user: String,
    pub unit_type: UnitType,
    pub restart: RestartPolicy,
    pub restart_sec: u32,
    /// Newline separated `KEY=VALUE` pairs.
    pub environment: String,
    pub standard_output: String,
    pub standard_error: String,
    pub is_active: bool,
    /// Last text reported by `systemctl is-active`.
    pub status: Option<String>,
}

impl SystemUnit {
    pub fn new(
        name: impl Into<String>,
        exec_start: impl Into<String>,
        working_directory: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: 0,
            description: name.clone(),
            name,
            exec_start: exec_start.into(),
            working_directory: working_directory.into(),
            user: "www-data".to_string(),
            unit_type: UnitType::Simple,
            restart: RestartPolicy::Always,
            restart_sec: 10,
            environment: String::new(),
            standard_output: "journal".to_string(),
            standard_error: "journal".to_string(),
            is_active: false,
            status: None,
        }
    }

    /// `<name>.service`
    pub fn file_name(&self) -> String {
        format!("{}.service", self.name)
    }

    /// Non-empty, trimmed lines of the environment block.
    pub fn environment_vars(&self) -> Vec<&str> {
        self.environment
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Editable fields of a unit. The name is fixed once created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitUpdate {
    pub description: Option<String>,
    pub exec_start: Option<String>,
    pub working_directory: Option<String>,
    pub user: Option<String>,
    pub unit_type: Option<UnitType>,
    pub restart: Option<RestartPolicy>,
    pub restart_sec: Option<u32>,
    pub environment: Option<String>,
    pub standard_output: Option<String>,
    pub standard_error: Option<String>,
    pub is_active: Option<bool>,
}

impl UnitUpdate {
    pub fn apply(self, unit: &mut SystemUnit) {
        if let Some(v) = self.description {
            unit.description = v;
        }
        if let Some(v) = self.exec_start {
            unit.exec_start = v;
        }
        if let Some(v) = self.working_directory {
            unit.working_directory = v;
        }
        if let Some(v) = self.user {
            unit.user = v;
        }
        if let Some(v) = self.unit_type {
            unit.unit_type = v;
        }
        if let Some(v) = self.restart {
            unit.restart = v;
        }
        if let Some(v) = self.restart_sec {
            unit.restart_sec = v;
        }
        if let Some(v) = self.environment {
            unit.environment = v;
        }
        if let Some(v) = self.standard_output {
            unit.standard_output = v;
        }
        if let Some(v) = self.standard_error {
            unit.standard_error = v;
        }
        if let Some(v) = self.is_active {
            unit.is_active = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let unit = SystemUnit::new("queue-worker", "/usr/bin/php artisan queue:work", "/var/www/app");
        assert_eq!(unit.user, "www-data");
        assert_eq!(unit.unit_type, UnitType::Simple);
        assert_eq!(unit.restart, RestartPolicy::Always);
        assert_eq!(unit.restart_sec, 10);
        assert_eq!(unit.standard_output, "journal");
        assert_eq!(unit.file_name(), "queue-worker.service");
    }

    #[test]
    fn test_environment_vars_skip_blank_lines() {
        let mut unit = SystemUnit::new("api", "/usr/bin/node server.js", "/srv/api");
        unit.environment = "NODE_ENV=production\n\n   PORT=3000  \n".to_string();
        assert_eq!(unit.environment_vars(), vec!["NODE_ENV=production", "PORT=3000"]);
    }

    #[test]
    fn test_restart_policy_storage_names() {
        assert_eq!(RestartPolicy::OnAbnormal.as_str(), "on-abnormal");
        assert_eq!("on-failure".parse::<RestartPolicy>().unwrap(), RestartPolicy::OnFailure);
        assert_eq!(
            serde_json::to_string(&RestartPolicy::OnFailure).unwrap(),
            "\"on-failure\""
        );
    }
}
