//! PM2 control for Node.js sites. Every command runs as the web user so the
//! processes land in that user's PM2 daemon.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hp_core::layout::HostLayout;
use hp_core::model::{OperationResult, Site};
use hp_core::security::input::validate_unit_name;
use hp_core::shell::{CommandSpec, ShellExecutor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum Pm2Error {
    #[error("pm2 failed: {0}")]
    Command(String),
    #[error("Unexpected pm2 output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One row of `pm2 jlist`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pm2Process {
    pub name: String,
    pub pm_id: u32,
    pub status: String,
    pub pid: Option<u32>,
    /// Seconds since the process was last (re)started, while online.
    pub uptime_secs: Option<i64>,
    pub restarts: u32,
    pub cpu: f32,
    pub memory: u64,
    pub exec_mode: String,
    pub instances: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawProcess {
    name: String,
    pm_id: u32,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    monit: RawMonit,
    pm2_env: RawEnv,
}

#[derive(Debug, Default, Deserialize)]
struct RawMonit {
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    cpu: f32,
}

#[derive(Debug, Deserialize)]
struct RawEnv {
    status: String,
    #[serde(default)]
    pm_uptime: Option<i64>,
    #[serde(default)]
    restart_time: u32,
    #[serde(default)]
    exec_mode: String,
    #[serde(default)]
    instances: Option<serde_json::Value>,
}

/// Parse `pm2 jlist` output. Anything PM2 prints before the JSON array
/// (update notices and the like) is skipped.
pub fn parse_jlist(output: &str) -> Result<Vec<Pm2Process>, Pm2Error> {
    let json = output.find('[').map(|i| &output[i..]).unwrap_or("[]");
    let raw: Vec<RawProcess> = serde_json::from_str(json.trim())?;
    let now_ms = Utc::now().timestamp_millis();

    Ok(raw
        .into_iter()
        .map(|p| {
            let online = p.pm2_env.status == "online";
            Pm2Process {
                uptime_secs: p
                    .pm2_env
                    .pm_uptime
                    .filter(|_| online)
                    .map(|started| ((now_ms - started) / 1000).max(0)),
                pid: p.pid.filter(|&pid| pid > 0),
                name: p.name,
                pm_id: p.pm_id,
                status: p.pm2_env.status,
                restarts: p.pm2_env.restart_time,
                cpu: p.monit.cpu,
                memory: p.monit.memory,
                exec_mode: p.pm2_env.exec_mode.trim_end_matches("_mode").to_string(),
                // "max" is reported as a string in cluster mode.
                instances: p
                    .pm2_env
                    .instances
                    .and_then(|v| v.as_u64())
                    .map(|n| n as u32),
            }
        })
        .collect())
}

pub struct Pm2Controller {
    executor: Arc<dyn ShellExecutor>,
    layout: Arc<HostLayout>,
    timeout: Duration,
}

impl Pm2Controller {
    pub fn new(executor: Arc<dyn ShellExecutor>, layout: Arc<HostLayout>, timeout: Duration) -> Self {
        Self {
            executor,
            layout,
            timeout,
        }
    }

    fn pm2<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("pm2")
            .args(args)
            .as_user(self.layout.web_user.as_str())
            .timeout(self.timeout)
    }

    async fn run(&self, spec: CommandSpec) -> Result<String, Pm2Error> {
        let out = self.executor.run(spec).await;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(Pm2Error::Command(out.error_text()))
        }
    }

    fn guard(site: &Site) -> Result<(), OperationResult> {
        if site.is_node_app() {
            Ok(())
        } else {
            Err(OperationResult::failed(format!(
                "PM2 is only available for Node.js reverse-proxy sites ({})",
                site.domain
            )))
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Pm2Process>, Pm2Error> {
        let stdout = self.run(self.pm2(["jlist"])).await?;
        parse_jlist(&stdout)
    }

    async fn is_registered(&self, key: &str) -> Result<bool, Pm2Error> {
        Ok(self.list_all().await?.iter().any(|p| p.name == key))
    }

    /// Start the site's app, registering it with `npm start` in the web
    /// root the first time.
    pub async fn start(&self, site: &Site) -> OperationResult {
        if let Err(refused) = Self::guard(site) {
            return refused;
        }
        let key = site.app_key();
        let spec = match self.is_registered(&key).await {
            Ok(true) => self.pm2(["start", key.as_str()]),
            Ok(false) => self
                .pm2(["start", "npm", "--name", key.as_str(), "--", "start"])
                .current_dir(site.web_root()),
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        self.finish(&key, "started", self.run(spec).await).await
    }

    pub async fn stop(&self, site: &Site) -> OperationResult {
        if let Err(refused) = Self::guard(site) {
            return refused;
        }
        let key = site.app_key();
        let result = self.run(self.pm2(["stop", key.as_str()])).await;
        self.finish(&key, "stopped", result).await
    }

    /// Restart, or start when PM2 does not know the app yet.
    pub async fn restart(&self, site: &Site) -> OperationResult {
        if let Err(refused) = Self::guard(site) {
            return refused;
        }
        let key = site.app_key();
        match self.is_registered(&key).await {
            Ok(true) => {
                let result = self.run(self.pm2(["restart", key.as_str()])).await;
                self.finish(&key, "restarted", result).await
            }
            Ok(false) => self.start(site).await,
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    pub async fn delete(&self, app_key: &str) -> OperationResult {
        if let Err(e) = validate_unit_name(app_key) {
            return OperationResult::failed(e.to_string());
        }
        let result = self.run(self.pm2(["delete", app_key])).await;
        self.finish(app_key, "deleted", result).await
    }

    pub async fn logs(&self, app_key: &str, lines: u32) -> Result<String, Pm2Error> {
        validate_unit_name(app_key).map_err(|e| Pm2Error::Command(e.to_string()))?;
        let lines = lines.to_string();
        self.run(self.pm2(["logs", app_key, "--lines", lines.as_str(), "--nostream", "--raw"]))
            .await
    }

    async fn finish(&self, key: &str, verb: &str, result: Result<String, Pm2Error>) -> OperationResult {
        match result {
            Ok(_) => {
                // Persist the process list so it survives a reboot.
                if let Err(e) = self.run(self.pm2(["save"])).await {
                    warn!(app = %key, error = %e, "pm2 save failed");
                }
                info!(app = %key, "PM2 app {}", verb);
                OperationResult::ok(format!("Application {} {}", key, verb))
            }
            Err(e) => {
                warn!(app = %key, error = %e, "PM2 action failed");
                OperationResult::failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_core::model::SiteKind;
    use hp_core::service::OsFamily;
    use hp_core::shell::{Privilege, ScriptedExecutor};

    const JLIST: &str = r#"[{"pid":4242,"name":"app-example-com","pm_id":0,"monit":{"memory":52428800,"cpu":1.5},"pm2_env":{"status":"online","pm_uptime":1700000000000,"restart_time":3,"exec_mode":"fork_mode","instances":1}},{"pid":0,"name":"worker","pm_id":1,"monit":{"memory":0,"cpu":0},"pm2_env":{"status":"stopped","restart_time":0,"exec_mode":"cluster_mode","instances":"max"}}]"#;

    fn controller(exec: Arc<ScriptedExecutor>) -> Pm2Controller {
        Pm2Controller::new(
            exec,
            Arc::new(HostLayout::for_family(OsFamily::Debian)),
            Duration::from_secs(30),
        )
    }

    fn node_site() -> Site {
        let mut site = Site::new("app.example.com", SiteKind::ReverseProxy);
        site.runtime = Some("Node 20".into());
        site.port = Some(3000);
        site
    }

    #[test]
    fn test_parse_jlist() {
        let procs = parse_jlist(JLIST).unwrap();
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, Some(4242));
        assert_eq!(procs[0].restarts, 3);
        assert_eq!(procs[0].exec_mode, "fork");
        assert!(procs[0].uptime_secs.unwrap() > 0);
        assert_eq!(procs[1].pid, None);
        assert_eq!(procs[1].uptime_secs, None);
        assert_eq!(procs[1].instances, None);
    }

    #[test]
    fn test_parse_jlist_skips_banner() {
        let out = format!(">>>> In-memory PM2 is out-of-date, do:\n>>>> $ pm2 update\n{}", JLIST);
        assert_eq!(parse_jlist(&out).unwrap().len(), 2);
        assert!(parse_jlist("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_start_registers_npm_app() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.succeed("pm2 jlist", "[]");
        let res = controller(exec.clone()).start(&node_site()).await;
        assert!(res.success, "{:?}", res);

        let specs = exec.specs();
        let start = specs.iter().find(|s| s.command_line().starts_with("pm2 start")).unwrap();
        assert_eq!(start.command_line(), "pm2 start npm --name app-example-com -- start");
        assert_eq!(start.working_dir.as_deref(), Some(std::path::Path::new("/var/www/app_example_com")));
        assert_eq!(start.privilege, Privilege::AsUser("www-data".into()));
        assert_eq!(exec.count("pm2 save"), 1);
    }

    #[tokio::test]
    async fn test_known_app_starts_by_name() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.succeed("pm2 jlist", JLIST);
        controller(exec.clone()).start(&node_site()).await;
        assert!(exec.calls().contains(&"pm2 start app-example-com".to_string()));
    }

    #[tokio::test]
    async fn test_non_node_site_is_refused() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut site = node_site();
        site.runtime = Some("python".into());
        assert!(!controller(exec.clone()).restart(&site).await.success);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_rejects_unsafe_key() {
        let exec = Arc::new(ScriptedExecutor::new());
        assert!(!controller(exec.clone()).delete("app; rm -rf /").await.success);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stop_reports_stderr() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("pm2 stop", 1, "[PM2][ERROR] Process or Namespace app-example-com not found");
        let res = controller(exec.clone()).stop(&node_site()).await;
        assert!(res.error_text().contains("not found"));
        assert_eq!(exec.count("pm2 save"), 0);
    }
}
