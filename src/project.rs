//! Fans a command out over the selected instances of a project.

use std::fmt;

use crate::config::{ContainerSpec, Project};
use crate::error::{Error, Result};
use crate::lifecycle::{Controller, Host, Settings, StatusRow};

/// One entry point per user command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Create,
    Start,
    Stop,
    Reboot,
    Remove,
    Status,
    Ports,
    RmPorts,
    Links,
    RmLinks,
    Cgroup,
    Cleanup,
    Freeze,
    Unfreeze,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
            Self::Remove => "rm",
            Self::Status => "status",
            Self::Ports => "ports",
            Self::RmPorts => "rmports",
            Self::Links => "links",
            Self::RmLinks => "rmlinks",
            Self::Cgroup => "cgroup",
            Self::Cleanup => "cleanup",
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
        })
    }
}

/// Outcome of one command over a batch of instances.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Error)>,
    /// Filled by `status` only.
    pub rows: Vec<StatusRow>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Orchestrator<'a> {
    project: &'a Project,
    controller: Controller<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(project: &'a Project, settings: &'a Settings, host: Host<'a>) -> Self {
        Self {
            project,
            controller: Controller::new(project, settings, host),
        }
    }

    /// Runs `command` on the named instances, or on all of them. Instance
    /// failures are collected; fatal errors abort the batch.
    pub fn run(&self, command: Command, names: &[String]) -> Result<BatchReport> {
        let specs = self.project.select(names)?;
        let mut report = BatchReport::default();

        if command == Command::Cleanup {
            if !names.is_empty() {
                tracing::warn!("cleanup always applies to the whole project");
            }
            self.controller.cleanup()?;
            report.succeeded.push(self.project.name.clone());
            return Ok(report);
        }

        for spec in specs {
            let span = tracing::info_span!("instance", name = %spec.name);
            let _guard = span.enter();

            match self.dispatch(command, spec, &mut report) {
                Ok(()) => report.succeeded.push(spec.name.clone()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!("{} failed: {}", command, e);
                    report.failed.push((spec.name.clone(), e));
                }
            }
        }

        // leftovers of instances dropped from the project file
        if command == Command::Status && names.is_empty() {
            match self.controller.stray_status() {
                Ok(rows) => report.rows.extend(rows),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("cannot list undeclared instances: {}", e),
            }
        }
        Ok(report)
    }

    fn dispatch(&self, command: Command, spec: &ContainerSpec, report: &mut BatchReport) -> Result<()> {
        let ctl = &self.controller;
        match command {
            Command::Create => ctl.create(spec),
            Command::Start => ctl.start(spec),
            Command::Stop => ctl.stop(spec),
            Command::Reboot => ctl.reboot(spec),
            Command::Remove => ctl.remove(spec),
            Command::Ports => ctl.ports(spec),
            Command::RmPorts => ctl.remove_ports(spec),
            Command::Links => ctl.links(spec),
            Command::RmLinks => ctl.remove_links(spec),
            Command::Cgroup => ctl.cgroup(spec),
            Command::Freeze => ctl.freeze(spec),
            Command::Unfreeze => ctl.unfreeze(spec),
            Command::Status => {
                report.rows.push(ctl.status(spec)?);
                Ok(())
            }
            Command::Cleanup => ctl.cleanup(),
        }
    }
}

/// Plain-text table of status rows.
pub fn render_status(rows: &[StatusRow]) -> String {
    let header = ["NAME", "FQDN", "STATE", "IPV4", "PORTS", "LINKS"];
    let cells: Vec<[String; 6]> = rows
        .iter()
        .map(|r| {
            [
                r.name.clone(),
                r.fqdn.clone().unwrap_or_else(|| "-".into()),
                r.state.to_string(),
                joined(r.addresses.iter()),
                joined(r.ports.iter()),
                joined(r.links.iter()),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut line = |fields: Vec<&str>| {
        let padded: Vec<String> = fields
            .iter()
            .zip(widths)
            .map(|(f, w)| format!("{:<w$}", f, w = w))
            .collect();
        out.push_str(padded.join("  ").trim_end());
        out.push('\n');
    };
    line(header.to_vec());
    for row in &cells {
        line(row.iter().map(String::as_str).collect());
    }
    out
}

fn joined<T: fmt::Display>(items: impl Iterator<Item = T>) -> String {
    let parts: Vec<String> = items.map(|i| i.to_string()).collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRule;
    use crate::rules::{InstanceNet, RuleEngine};
    use crate::runtime::{InstanceState, Runtime};
    use crate::testing::{TestHost, bridge};
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Duration;

    const PROJECT: &str = r#"
containers:
  db:
    template: {name: ubuntu}
    ports: ["8000:8000"]
  broken:
    template: {name: missing}
  web:
    clone: base
"#;

    fn settings() -> Settings {
        Settings {
            address_timeout: Duration::ZERO,
            poll_interval: Duration::ZERO,
            host_resolv: PathBuf::from("/nonexistent/resolv.conf"),
            ..Settings::default()
        }
    }

    fn host(t: &TestHost) -> Host<'_> {
        Host {
            runtime: &t.runtime,
            netfilter: &t.netfilter,
            network: &t.network,
        }
    }

    #[test]
    fn test_batch_continues_after_instance_failure() {
        let project = Project::from_yaml(PROJECT, "shop").unwrap();
        let (settings, t) = (settings(), TestHost::new());
        t.runtime.add("base");
        let orchestrator = Orchestrator::new(&project, &settings, host(&t));

        let report = orchestrator.run(Command::Create, &[]).unwrap();
        assert!(!report.is_success());
        assert_eq!(report.succeeded, vec!["db", "web"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(matches!(report.failed[0].1, Error::Create { .. }));
        assert_eq!(t.runtime.state("shop_web").unwrap(), InstanceState::Stopped);
    }

    #[test]
    fn test_selection() {
        let project = Project::from_yaml(PROJECT, "shop").unwrap();
        let (settings, t) = (settings(), TestHost::new());
        let orchestrator = Orchestrator::new(&project, &settings, host(&t));

        let report = orchestrator.run(Command::Create, &["db".to_string()]).unwrap();
        assert!(report.is_success());
        assert_eq!(t.runtime.state("shop_web").unwrap(), InstanceState::Absent);

        let err = orchestrator.run(Command::Start, &["nope".to_string()]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_error_aborts_batch() {
        let project = Project::from_yaml(PROJECT, "shop").unwrap();
        let (settings, t) = (settings(), TestHost::new());
        t.runtime.add("shop_db");
        t.runtime.add("shop_web");
        t.netfilter.deny_chain_creation();
        let orchestrator = Orchestrator::new(&project, &settings, host(&t));

        let err = orchestrator
            .run(Command::Start, &["db".to_string(), "web".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Netfilter(_)));
        assert_eq!(t.journal.count("runtime start shop_web"), 0);
    }

    #[test]
    fn test_status_rows() {
        let project = Project::from_yaml(PROJECT, "shop").unwrap();
        let (settings, t) = (settings(), TestHost::new());
        t.runtime.add("shop_db");
        let orchestrator = Orchestrator::new(&project, &settings, host(&t));
        orchestrator.run(Command::Start, &["db".to_string()]).unwrap();

        let report = orchestrator.run(Command::Status, &[]).unwrap();
        assert_eq!(report.rows.len(), 3);
        let table = render_status(&report.rows);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("NAME"));
        assert!(lines.iter().any(|l| l.contains("shop_db")
            && l.contains("RUNNING")
            && l.contains("0.0.0.0:8000->10.1.1.2:8000/tcp")));
        assert!(lines.iter().any(|l| l.starts_with("shop_web") && l.contains("ABSENT")));
    }

    #[test]
    fn test_status_shows_undeclared_leftovers() {
        let project = Project::from_yaml(PROJECT, "shop").unwrap();
        let (settings, t) = (settings(), TestHost::new());

        // rules of an instance that was removed from the project file
        let engine = RuleEngine::new(&t.netfilter);
        engine.ensure_project_chains().unwrap();
        let bridge = bridge("shop", "10.1.1.0/24");
        let addresses = [Ipv4Addr::new(10, 1, 1, 9)];
        let old = InstanceNet {
            project: "shop",
            instance: "old",
            bridge: &bridge,
            addresses: &addresses,
        };
        engine
            .apply_ports(&old, &["8080:80".parse::<PortRule>().unwrap()])
            .unwrap();
        engine.apply_links(&old, &[Ipv4Addr::new(10, 1, 1, 2)]).unwrap();

        let orchestrator = Orchestrator::new(&project, &settings, host(&t));
        let report = orchestrator.run(Command::Status, &[]).unwrap();
        assert_eq!(report.rows.len(), 4);
        let stray = report.rows.iter().find(|r| r.name == "shop_old").unwrap();
        assert_eq!(stray.state, InstanceState::Absent);
        assert_eq!(stray.ports.len(), 1);
        assert_eq!(stray.links.len(), 2);

        let table = render_status(&report.rows);
        assert!(table.lines().any(|l| l.starts_with("shop_old")
            && l.contains("ABSENT")
            && l.contains("->10.1.1.9:80/tcp")
            && l.contains("accept 10.1.1.9")));

        // a selection only reports what was asked for
        let report = orchestrator.run(Command::Status, &["db".to_string()]).unwrap();
        assert_eq!(report.rows.len(), 1);
    }

    #[test]
    fn test_cleanup_runs_once() {
        let project = Project::from_yaml(PROJECT, "shop").unwrap();
        let (settings, t) = (settings(), TestHost::new());
        t.runtime.add("shop_db");
        let orchestrator = Orchestrator::new(&project, &settings, host(&t));
        orchestrator.run(Command::Start, &["db".to_string()]).unwrap();
        orchestrator.run(Command::Stop, &[]).unwrap();

        let report = orchestrator.run(Command::Cleanup, &[]).unwrap();
        assert_eq!(report.succeeded, vec!["shop"]);
        assert!(!t.network.is_up("locker_shop"));
        assert_eq!(t.netfilter.tagged_count("locker:*:*:jump"), 0);
    }
}
