//! Service control through the snap daemon wrappers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use muster_common::ClusterError;
use muster_common::api::ServiceStatus;

use crate::exec::CommandRunner;
use crate::paths::Paths;
use crate::store::LockFiles;

/// Daemon prefix used by snapctl
const DAEMON_PREFIX: &str = "microk8s.daemon-";

/// Services folded into the kubelite daemon
const KUBELITE_SERVICES: &[&str] = &[
    "apiserver",
    "proxy",
    "kubelet",
    "scheduler",
    "controller-manager",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Restart,
    Start,
    Stop,
    Enable,
    Disable,
}

impl FromStr for ServiceAction {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(Self::Restart),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "enable" => Ok(Self::Enable),
            "disable" => Ok(Self::Disable),
            other => Err(ClusterError::NotFound(format!("unknown service action {other:?}"))),
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Restart => "restart",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Enable => "enable",
            Self::Disable => "disable",
        })
    }
}

/// Starts, stops and inspects node services
#[derive(Clone)]
pub struct ServiceManager {
    runner: Arc<dyn CommandRunner>,
    paths: Paths,
    locks: LockFiles,
}

impl ServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: Paths) -> Self {
        let locks = LockFiles::new(paths.clone());
        Self { runner, paths, locks }
    }

    /// Daemon name for a service or args file name
    pub fn daemon_name(&self, service: &str) -> String {
        let name = service.strip_prefix("kube-").unwrap_or(service);
        if self.locks.is_kubelite() && KUBELITE_SERVICES.contains(&name) {
            return "kubelite".to_string();
        }
        name.to_string()
    }

    pub async fn apply(&self, action: ServiceAction, service: &str) -> Result<(), ClusterError> {
        let unit = format!("{DAEMON_PREFIX}{}", self.daemon_name(service));
        let argv: Vec<&str> = match action {
            ServiceAction::Restart => vec!["snapctl", "restart", unit.as_str()],
            ServiceAction::Start => vec!["snapctl", "start", unit.as_str()],
            ServiceAction::Stop => vec!["snapctl", "stop", unit.as_str()],
            ServiceAction::Enable => vec!["snapctl", "start", "--enable", unit.as_str()],
            ServiceAction::Disable => vec!["snapctl", "stop", "--disable", unit.as_str()],
        };
        self.runner.output(&argv).await?;
        tracing::info!(service = %unit, action = %action, "Service action applied");
        Ok(())
    }

    pub async fn restart(&self, service: &str) -> Result<(), ClusterError> {
        self.apply(ServiceAction::Restart, service).await
    }

    pub async fn start(&self, service: &str) -> Result<(), ClusterError> {
        self.apply(ServiceAction::Start, service).await
    }

    pub async fn stop(&self, service: &str) -> Result<(), ClusterError> {
        self.apply(ServiceAction::Stop, service).await
    }

    /// Restart each service once, collapsing names that share a daemon
    pub async fn restart_each(&self, services: &[&str]) -> Result<(), ClusterError> {
        let mut seen: Vec<String> = Vec::new();
        for service in services {
            let daemon = self.daemon_name(service);
            if seen.contains(&daemon) {
                continue;
            }
            self.restart(service).await?;
            seen.push(daemon);
        }
        Ok(())
    }

    /// Stop then start everything through the install wrappers
    pub async fn restart_all(&self) -> Result<(), ClusterError> {
        let stop = self.paths.snap("microk8s-stop.wrapper");
        let start = self.paths.snap("microk8s-start.wrapper");
        self.runner.output(&[stop.to_string_lossy().as_ref()]).await?;
        self.runner.output(&[start.to_string_lossy().as_ref()]).await?;
        Ok(())
    }

    /// Last lines of a service journal
    pub async fn logs(&self, service: &str) -> Result<String, ClusterError> {
        let unit = format!("snap.{DAEMON_PREFIX}{}", self.daemon_name(service));
        self.runner
            .output(&["journalctl", "-n", "100", "--no-pager", "-u", unit.as_str()])
            .await
    }

    /// Status of every daemon of the snap
    pub async fn list(&self) -> Result<Vec<ServiceStatus>, ClusterError> {
        let out = self.runner.output(&["snapctl", "services", "microk8s"]).await?;
        Ok(parse_service_table(&out))
    }

    /// Enable or disable an addon
    pub async fn set_addon(&self, addon: &str, enable: bool) -> Result<(), ClusterError> {
        let wrapper = if enable {
            "microk8s-enable.wrapper"
        } else {
            "microk8s-disable.wrapper"
        };
        let wrapper = self.paths.snap(wrapper);
        self.runner.output(&[wrapper.to_string_lossy().as_ref(), addon]).await?;
        tracing::info!(addon, enable, "Addon state changed");
        Ok(())
    }
}

/// Parse `snapctl services` output (`Service  Startup  Current  Notes`)
fn parse_service_table(out: &str) -> Vec<ServiceStatus> {
    out.lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let name = name
                .strip_prefix(DAEMON_PREFIX)
                .or_else(|| name.strip_prefix("microk8s."))
                .unwrap_or(name);
            Some(ServiceStatus {
                name: name.to_string(),
                enabled: cols.next()? == "enabled",
                active: cols.next()? == "active",
            })
        })
        .collect()
}
