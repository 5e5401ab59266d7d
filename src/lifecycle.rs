//! Per-instance state machine: `ABSENT`, `STOPPED`, `RUNNING`, `FROZEN`.
//!
//! Every transition reads the live state first and drives the runtime, the
//! bridge, the firewall, the hosts files and the cgroup settings in a fixed
//! order. Rules and links are always removed before an instance is stopped.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use cidr::Ipv4Inet;

use crate::cgroups::CgroupApplier;
use crate::config::{ContainerSpec, CreationMode, Project};
use crate::dns;
use crate::error::{Error, Result};
use crate::links::{self, LinkRegistry};
use crate::net::{Bridge, BridgeManager, HostNetwork};
use crate::netfilter::Netfilter;
use crate::rules::{InstanceNet, PortForward, RuleEngine};
use crate::runtime::{InstanceState, NetworkParams, Runtime, StartOptions};
use crate::subnet;

/// Knobs of one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `start` on a running instance stops it first.
    pub restart: bool,
    pub no_ports: bool,
    pub no_links: bool,
    /// `rm` stops running instances instead of refusing.
    pub force: bool,
    pub stop_timeout: Duration,
    pub address_timeout: Duration,
    pub poll_interval: Duration,
    /// Source of `$copy` nameservers.
    pub host_resolv: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            restart: false,
            no_ports: false,
            no_links: false,
            force: false,
            stop_timeout: Duration::from_secs(30),
            address_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            host_resolv: PathBuf::from(dns::HOST_RESOLV_CONF),
        }
    }
}

/// The host capabilities a controller works against.
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub runtime: &'a dyn Runtime,
    pub netfilter: &'a dyn Netfilter,
    pub network: &'a dyn HostNetwork,
}

/// Which derived state a transition touches.
#[derive(Debug, Clone, Copy)]
struct Steps {
    ports: bool,
    links: bool,
}

impl Steps {
    const ALL: Steps = Steps {
        ports: true,
        links: true,
    };
}

/// Live view of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub name: String,
    pub fqdn: Option<String>,
    pub state: InstanceState,
    pub addresses: Vec<Ipv4Addr>,
    pub ports: Vec<PortForward>,
    pub links: Vec<String>,
}

pub struct Controller<'a> {
    project: &'a Project,
    settings: &'a Settings,
    runtime: &'a dyn Runtime,
    bridges: BridgeManager<'a>,
    rules: RuleEngine<'a>,
    links: LinkRegistry<'a>,
    cgroups: CgroupApplier<'a>,
}

impl<'a> Controller<'a> {
    pub fn new(project: &'a Project, settings: &'a Settings, host: Host<'a>) -> Self {
        Self {
            project,
            settings,
            runtime: host.runtime,
            bridges: BridgeManager::new(host.network),
            rules: RuleEngine::new(host.netfilter),
            links: LinkRegistry::new(host.runtime),
            cgroups: CgroupApplier::new(host.runtime),
        }
    }

    fn steps(&self) -> Steps {
        Steps {
            ports: !self.settings.no_ports,
            links: !self.settings.no_links,
        }
    }

    /// ABSENT -> STOPPED.
    pub fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        if self.runtime.state(name)? != InstanceState::Absent {
            return Err(Error::Create {
                name: name.clone(),
                reason: "container already exists".into(),
            });
        }

        match &spec.creation {
            CreationMode::Template { name: template, args } => {
                tracing::info!("creating {} from template {}", name, template);
                self.runtime
                    .create(name, template, args)
                    .map_err(|e| create_error(name, e))?;
            }
            CreationMode::Clone { source } => {
                if self.runtime.state(source)? == InstanceState::Absent {
                    return Err(Error::Create {
                        name: name.clone(),
                        reason: format!("clone source '{}' does not exist", source),
                    });
                }
                tracing::info!("cloning {} from {}", name, source);
                self.runtime
                    .clone_from(source, name)
                    .map_err(|e| create_error(name, e))?;
            }
        }

        if self.runtime.state(name)? != InstanceState::Stopped {
            return Err(Error::Create {
                name: name.clone(),
                reason: "runtime did not report the new container".into(),
            });
        }
        if let Some(fqdn) = &spec.fqdn {
            links::set_hostname(&self.runtime.rootfs(name)?, fqdn)?;
        }
        tracing::info!("{} created", name);
        Ok(())
    }

    /// STOPPED -> RUNNING. On a running instance this only reconciles the
    /// derived state, unless `restart` is set.
    pub fn start(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        match self.runtime.state(name)? {
            InstanceState::Absent => Err(missing("start", name)),
            state if state.is_active() && self.settings.restart => {
                tracing::info!("restarting {}", name);
                self.stop_with(spec, Steps::ALL)?;
                self.boot(spec)
            }
            state if state.is_active() => {
                tracing::info!("{} is already {}", name, state);
                let bridge = self.bridges.ensure(&self.project.name)?;
                let addresses = self.wait_for_address(name)?;
                self.reconcile(spec, &bridge, &addresses)
            }
            _ => self.boot(spec),
        }
    }

    /// RUNNING/FROZEN -> STOPPED.
    pub fn stop(&self, spec: &ContainerSpec) -> Result<()> {
        self.stop_with(spec, self.steps())
    }

    pub fn reboot(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        match self.runtime.state(name)? {
            InstanceState::Absent => Err(missing("reboot", name)),
            state if state.is_active() => {
                self.stop_with(spec, Steps::ALL)?;
                self.boot(spec)
            }
            _ => self.boot(spec),
        }
    }

    pub fn freeze(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        match self.runtime.state(name)? {
            InstanceState::Running => {
                self.runtime.freeze(name)?;
                tracing::info!("{} frozen", name);
                Ok(())
            }
            InstanceState::Frozen => {
                tracing::info!("{} is already frozen", name);
                Ok(())
            }
            _ => Err(Error::Runtime {
                op: "freeze",
                name: name.clone(),
                reason: "container is not running".into(),
            }),
        }
    }

    pub fn unfreeze(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        match self.runtime.state(name)? {
            InstanceState::Frozen => {
                self.runtime.unfreeze(name)?;
                tracing::info!("{} unfrozen", name);
                Ok(())
            }
            InstanceState::Running => {
                tracing::info!("{} is not frozen", name);
                Ok(())
            }
            _ => Err(Error::Runtime {
                op: "unfreeze",
                name: name.clone(),
                reason: "container is not running".into(),
            }),
        }
    }

    /// STOPPED -> ABSENT. Running instances are refused unless `force` is
    /// set.
    pub fn remove(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        match self.runtime.state(name)? {
            InstanceState::Absent => {
                tracing::info!("{} does not exist", name);
                return Ok(());
            }
            state if state.is_active() => {
                if !self.settings.force {
                    return Err(Error::StillRunning(name.clone()));
                }
                self.stop_with(spec, Steps::ALL)?;
            }
            _ => {}
        }

        self.rules.remove_ports(&self.project.name, &spec.name)?;
        self.rules.remove_links(&self.project.name, &spec.name)?;
        self.links.remove(self.project, spec)?;
        self.runtime.destroy(name)?;
        tracing::info!("{} removed", name);
        Ok(())
    }

    /// Converges the port forwards of a running instance.
    pub fn ports(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        if !self.runtime.state(name)?.is_active() {
            tracing::warn!("{} is not running, no ports to forward", name);
            return Ok(());
        }
        let bridge = self.bridges.ensure(&self.project.name)?;
        let addresses = self.wait_for_address(name)?;
        self.rules.ensure_project_chains()?;
        self.rules.apply_masquerade(&self.project.name, &bridge)?;
        self.apply_ports(spec, &bridge, &addresses)
    }

    pub fn remove_ports(&self, spec: &ContainerSpec) -> Result<()> {
        self.rules.remove_ports(&self.project.name, &spec.name)?;
        Ok(())
    }

    /// Rewrites the links of a running instance.
    pub fn links(&self, spec: &ContainerSpec) -> Result<()> {
        if !self.runtime.state(&spec.system_name)?.is_active() {
            tracing::warn!("{} is not running, not linking", spec.system_name);
            return Ok(());
        }
        self.rules.ensure_project_chains()?;
        self.apply_links(spec)
    }

    pub fn remove_links(&self, spec: &ContainerSpec) -> Result<()> {
        if self.runtime.state(&spec.system_name)? != InstanceState::Absent {
            self.links.remove(self.project, spec)?;
        }
        self.rules.remove_links(&self.project.name, &spec.name)?;
        Ok(())
    }

    pub fn cgroup(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        let state = self.runtime.state(name)?;
        if state == InstanceState::Absent {
            return Err(missing("cgroup", name));
        }
        self.apply_cgroup(spec, state.is_active())
    }

    pub fn status(&self, spec: &ContainerSpec) -> Result<StatusRow> {
        let name = &spec.system_name;
        let state = self.runtime.state(name)?;
        let addresses = if state.is_active() {
            self.runtime.addresses(name)?
        } else {
            Vec::new()
        };
        let links = if state == InstanceState::Absent {
            Vec::new()
        } else {
            self.links.linked(self.project, spec)?
        };
        Ok(StatusRow {
            name: name.clone(),
            fqdn: spec.fqdn.clone(),
            state,
            addresses,
            ports: self.rules.port_forwards(&self.project.name, &spec.name)?,
            links,
        })
    }

    /// Rows for instances that still own tagged rules of this project but
    /// are no longer declared.
    pub fn stray_status(&self) -> Result<Vec<StatusRow>> {
        let project = &self.project.name;
        let mut rows = Vec::new();
        for instance in self.rules.tagged_instances(project)? {
            if self.project.containers.contains_key(&instance) {
                continue;
            }
            let name = format!("{}_{}", project, instance);
            let state = self.runtime.state(&name)?;
            let addresses = if state.is_active() {
                self.runtime.addresses(&name)?
            } else {
                Vec::new()
            };
            tracing::warn!("{} is not declared but still has firewall rules", name);
            rows.push(StatusRow {
                ports: self.rules.port_forwards(project, &instance)?,
                links: self.rules.link_rules(project, &instance)?,
                name,
                fqdn: None,
                state,
                addresses,
            });
        }
        Ok(rows)
    }

    /// Removes every rule of the project and its bridge. The shared jump
    /// rules go only if no other project is left on the host.
    pub fn cleanup(&self) -> Result<()> {
        let project = &self.project.name;
        for spec in self.project.containers.values() {
            if self.runtime.state(&spec.system_name)?.is_active() {
                tracing::warn!(
                    "{} is still running and loses its network forwarding",
                    spec.system_name
                );
            }
        }

        let mut others = self.bridges.other_projects(project)?;
        others.extend(self.rules.active_projects()?);
        others.retain(|p| p != project);
        if !others.is_empty() {
            others.sort();
            others.dedup();
            tracing::debug!("projects still active: {}", others.join(", "));
        }

        let conv = self.rules.cleanup_project(project, others.is_empty())?;
        tracing::info!("removed {} rules of project {}", conv.removed, project);
        self.bridges.teardown(project)?;
        Ok(())
    }

    /// Fresh start of a stopped instance.
    fn boot(&self, spec: &ContainerSpec) -> Result<()> {
        let name = &spec.system_name;
        let bridge = self.bridges.ensure(&self.project.name)?;
        let address = self.pick_address(&bridge, name)?;

        let servers = dns::resolve(&spec.dns, bridge.gateway.address(), &self.settings.host_resolv)?;
        if !servers.is_empty() {
            dns::write(&self.runtime.rootfs(name)?, &servers)?;
        }

        tracing::info!("starting {} on {} with {}", name, bridge.name, address);
        let options = StartOptions {
            network: Some(NetworkParams {
                bridge: bridge.name.clone(),
                address,
                gateway: bridge.gateway.address(),
            }),
            volumes: &spec.volumes,
        };
        self.runtime.start(name, &options)?;

        let addresses = self.wait_for_address(name)?;
        tracing::info!("{} is running", name);
        self.reconcile(spec, &bridge, &addresses)
    }

    /// Brings rules, links and cgroup settings of a running instance in
    /// line with its declaration.
    fn reconcile(&self, spec: &ContainerSpec, bridge: &Bridge, addresses: &[Ipv4Addr]) -> Result<()> {
        self.rules.ensure_project_chains()?;
        self.rules.apply_masquerade(&self.project.name, bridge)?;
        if self.steps().ports {
            self.apply_ports(spec, bridge, addresses)?;
        }
        if self.steps().links {
            self.relink(None)?;
        }
        self.apply_cgroup(spec, true)
    }

    fn apply_cgroup(&self, spec: &ContainerSpec, running: bool) -> Result<()> {
        if spec.cgroup.is_empty() {
            return Ok(());
        }
        let report = self.cgroups.apply(&spec.system_name, running, &spec.cgroup)?;
        tracing::debug!(
            "cgroup of {}: {} live, {} persisted",
            spec.name,
            report.live.len(),
            report.persisted.len()
        );
        if !report.failed.is_empty() {
            tracing::warn!("cgroup settings not applied to {}: {}", spec.name, report.failed.join(", "));
        }
        Ok(())
    }

    fn stop_with(&self, spec: &ContainerSpec, steps: Steps) -> Result<()> {
        let name = &spec.system_name;
        let state = self.runtime.state(name)?;
        if state == InstanceState::Absent {
            tracing::info!("{} does not exist", name);
            return Ok(());
        }

        // traffic is cut before the instance goes down
        if steps.ports {
            self.rules.remove_ports(&self.project.name, &spec.name)?;
        }
        if steps.links {
            self.links.remove(self.project, spec)?;
            self.rules.remove_links(&self.project.name, &spec.name)?;
        }

        if !state.is_active() {
            tracing::info!("{} is already stopped", name);
            return Ok(());
        }
        if state == InstanceState::Frozen {
            self.runtime.unfreeze(name)?;
        }

        tracing::info!("stopping {}", name);
        if !self.runtime.shutdown(name, self.settings.stop_timeout)? {
            tracing::warn!(
                "{} did not shut down within {}s, forcing it",
                name,
                self.settings.stop_timeout.as_secs()
            );
            self.runtime.kill(name)?;
        }
        if self.runtime.state(name)?.is_active() {
            return Err(Error::Runtime {
                op: "stop",
                name: name.clone(),
                reason: "container is still running after a forced stop".into(),
            });
        }
        tracing::info!("{} stopped", name);

        if steps.links {
            self.relink(Some(&spec.name))?;
        }
        Ok(())
    }

    fn apply_ports(&self, spec: &ContainerSpec, bridge: &Bridge, addresses: &[Ipv4Addr]) -> Result<()> {
        let net = InstanceNet {
            project: &self.project.name,
            instance: &spec.name,
            bridge,
            addresses,
        };
        let conv = self.rules.apply_ports(&net, &spec.ports)?;
        tracing::debug!(
            "port rules of {}: {} added, {} removed",
            spec.name,
            conv.inserted,
            conv.removed
        );
        if conv.failed > 0 {
            tracing::warn!("{} port forwards of {} could not be installed", conv.failed, spec.name);
        }
        Ok(())
    }

    /// Rewrites the hosts block and link rules of one running instance.
    fn apply_links(&self, spec: &ContainerSpec) -> Result<()> {
        let entries = self.links.apply(self.project, spec)?;
        let Some(bridge) = self.bridges.find(&self.project.name)? else {
            tracing::debug!("project {} has no bridge, no link rules", self.project.name);
            return Ok(());
        };
        let own = self.runtime.addresses(&spec.system_name)?;
        let mut peers: Vec<Ipv4Addr> = entries.iter().map(|e| e.address).collect();
        peers.sort();
        peers.dedup();
        let net = InstanceNet {
            project: &self.project.name,
            instance: &spec.name,
            bridge: &bridge,
            addresses: &own,
        };
        self.rules.apply_links(&net, &peers)?;
        Ok(())
    }

    /// Re-applies links of every running instance of the project, skipping
    /// `except`. A peer that cannot be updated is only logged.
    fn relink(&self, except: Option<&str>) -> Result<()> {
        for spec in self.project.containers.values() {
            if Some(spec.name.as_str()) == except {
                continue;
            }
            if !self.runtime.state(&spec.system_name)?.is_active() {
                continue;
            }
            if let Err(e) = self.apply_links(spec) {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!("cannot update links of {}: {}", spec.name, e);
            }
        }
        Ok(())
    }

    /// First free address on the bridge not held by a running instance of
    /// the project.
    fn pick_address(&self, bridge: &Bridge, name: &str) -> Result<Ipv4Inet> {
        let mut used = Vec::new();
        for other in self.project.containers.values() {
            if other.system_name != name && self.runtime.state(&other.system_name)?.is_active() {
                used.extend(self.runtime.addresses(&other.system_name)?);
            }
        }
        subnet::free_address(&bridge.subnet, &used).ok_or_else(|| Error::Runtime {
            op: "start",
            name: name.to_string(),
            reason: format!("no free address left in {}", bridge.subnet),
        })
    }

    /// Polls until the instance reports an address or the deadline passes.
    fn wait_for_address(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let deadline = Instant::now() + self.settings.address_timeout;
        loop {
            let addresses = self.runtime.addresses(name)?;
            if !addresses.is_empty() {
                return Ok(addresses);
            }
            if Instant::now() >= deadline {
                return Err(Error::NoAddress {
                    name: name.to_string(),
                    seconds: self.settings.address_timeout.as_secs(),
                });
            }
            tracing::debug!("waiting for {} to get an address", name);
            thread::sleep(self.settings.poll_interval);
        }
    }
}

fn missing(op: &'static str, name: &str) -> Error {
    Error::Runtime {
        op,
        name: name.to_string(),
        reason: "container does not exist, create it first".into(),
    }
}

/// Runtime failures during creation become creation errors; an unreachable
/// runtime stays fatal.
fn create_error(name: &str, e: Error) -> Error {
    match e {
        Error::Runtime { reason, .. } => Error::Create {
            name: name.to_string(),
            reason,
        },
        other => other,
    }
}
