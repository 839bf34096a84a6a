use crate::model::SystemUnit;

use super::{single_line, RenderError};

/// Render a unit file. One `Environment=` line per non-empty variable.
pub fn render_unit(unit: &SystemUnit) -> Result<String, RenderError> {
    let description = single_line("description", &unit.description)?;
    let exec_start = single_line("exec_start", &unit.exec_start)?;
    let working_directory = single_line("working_directory", &unit.working_directory)?;
    let user = single_line("user", &unit.user)?;
    let stdout = single_line("standard_output", &unit.standard_output)?;
    let stderr = single_line("standard_error", &unit.standard_error)?;

    let mut out = format!(
        "\
[Unit]
Description={description}
After=network.target

[Service]
Type={unit_type}
User={user}
WorkingDirectory={working_directory}
ExecStart={exec_start}
Restart={restart}
RestartSec={restart_sec}
",
        description = description,
        unit_type = unit.unit_type,
        user = user,
        working_directory = working_directory,
        exec_start = exec_start,
        restart = unit.restart,
        restart_sec = unit.restart_sec,
    );

    for var in unit.environment_vars() {
        out.push_str(&format!("Environment=\"{}\"\n", escape_env(var)));
    }

    out.push_str(&format!(
        "\
StandardOutput={stdout}
StandardError={stderr}

[Install]
WantedBy=multi-user.target
",
        stdout = stdout,
        stderr = stderr,
    ));

    Ok(out)
}

fn escape_env(var: &str) -> String {
    var.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RestartPolicy, UnitType};

    #[test]
    fn test_renders_all_sections() {
        let mut unit = SystemUnit::new("queue-worker", "/usr/bin/php artisan queue:work", "/var/www/app");
        unit.description = "Laravel queue worker".into();
        unit.unit_type = UnitType::Notify;
        unit.restart = RestartPolicy::OnFailure;
        unit.restart_sec = 5;
        let out = render_unit(&unit).unwrap();

        assert!(out.contains("[Unit]\nDescription=Laravel queue worker\nAfter=network.target\n"));
        assert!(out.contains("Type=notify\n"));
        assert!(out.contains("User=www-data\n"));
        assert!(out.contains("WorkingDirectory=/var/www/app\n"));
        assert!(out.contains("ExecStart=/usr/bin/php artisan queue:work\n"));
        assert!(out.contains("Restart=on-failure\nRestartSec=5\n"));
        assert!(out.contains("StandardOutput=journal\nStandardError=journal\n"));
        assert!(out.ends_with("[Install]\nWantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_environment_lines() {
        let mut unit = SystemUnit::new("api", "/usr/bin/node server.js", "/srv/api");
        unit.environment = "NODE_ENV=production\n\n  GREETING=say \"hi\"\n".into();
        let out = render_unit(&unit).unwrap();
        assert!(out.contains("Environment=\"NODE_ENV=production\"\n"));
        assert!(out.contains("Environment=\"GREETING=say \\\"hi\\\"\"\n"));
        assert_eq!(out.matches("Environment=").count(), 2);
    }

    #[test]
    fn test_rejects_multiline_exec_start() {
        let unit = SystemUnit::new("api", "/bin/true\nExecStartPre=/bin/rm -rf /", "/srv/api");
        assert!(render_unit(&unit).is_err());
    }
}
