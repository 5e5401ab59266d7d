//! Diff-based convergence of the managed netfilter rules.
//!
//! Every operation lists the live rules carrying a matching tag, computes
//! `desired - existing` and `existing - desired`, and inserts or deletes
//! individual rules. Nothing is remembered between calls.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::config::{PortRule, Protocol};
use crate::error::{Error, Result};
use crate::net::Bridge;
use crate::netfilter::{
    LOCKER_FORWARD, LOCKER_PREROUTING, Neg, Netfilter, NetfilterRule, RuleKind, RuleTag, Table,
    Target, host, tokenize,
};

const PREROUTING: &str = "PREROUTING";
const POSTROUTING: &str = "POSTROUTING";
const FORWARD: &str = "FORWARD";

/// Chains holding per-instance rules.
const INSTANCE_CHAINS: [(Table, &str); 2] =
    [(Table::Nat, LOCKER_PREROUTING), (Table::Filter, LOCKER_FORWARD)];

/// Chains holding per-project rules.
const PROJECT_CHAINS: [(Table, &str); 2] =
    [(Table::Nat, POSTROUTING), (Table::Filter, LOCKER_FORWARD)];

/// Built-in chains holding the shared jump rules.
const JUMP_CHAINS: [(Table, &str); 2] = [(Table::Nat, PREROUTING), (Table::Filter, FORWARD)];

/// What one converge pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Convergence {
    pub inserted: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Network facts of one running instance needed to build its rules.
#[derive(Debug, Clone, Copy)]
pub struct InstanceNet<'b> {
    pub project: &'b str,
    pub instance: &'b str,
    pub bridge: &'b Bridge,
    pub addresses: &'b [Ipv4Addr],
}

/// A live port forward reconstructed from a DNAT rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub host_ip: Option<Ipv4Addr>,
    pub host_port: u16,
    pub to: SocketAddrV4,
    pub protocol: Protocol,
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host_ip = self.host_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        write!(
            f,
            "{}:{}->{}/{}",
            host_ip, self.host_port, self.to, self.protocol
        )
    }
}

/// A tagged rule found in a chain.
#[derive(Debug, Clone)]
struct Installed {
    table: Table,
    chain: String,
    tag: RuleTag,
    /// Arguments exactly as listed, usable for `-D`.
    args: Vec<String>,
    /// `None` if the rule carries our tag but could not be understood.
    rule: Option<NetfilterRule>,
}

pub struct RuleEngine<'a> {
    backend: &'a dyn Netfilter,
}

impl<'a> RuleEngine<'a> {
    pub fn new(backend: &'a dyn Netfilter) -> Self {
        Self { backend }
    }

    /// Creates the locker chains and the shared jump rules if missing.
    /// Any failure here is fatal for the invocation.
    pub fn ensure_project_chains(&self) -> Result<()> {
        for (table, chain) in INSTANCE_CHAINS {
            if self.backend.list(table, chain)?.is_none() {
                tracing::info!("creating chain {} in {} table", chain, table.as_str());
                self.backend
                    .create_chain(table, chain)
                    .map_err(|e| Error::Netfilter(format!("cannot create {}: {}", chain, e)))?;
            }
        }

        let existing = self.installed(&JUMP_CHAINS, |t| t.kind == RuleKind::Jump)?;
        for rule in jump_rules() {
            if !existing.iter().any(|i| i.rule.as_ref() == Some(&rule)) {
                tracing::info!("adding jump {} -> {}", rule.chain, target_chain(&rule));
                self.backend
                    .insert(rule.table, &rule.chain, &rule.to_args())
                    .map_err(|e| Error::Netfilter(format!("cannot add jump rule: {}", e)))?;
            }
        }
        Ok(())
    }

    /// Converges the masquerade and bridge forwarding rules of a project.
    pub fn apply_masquerade(&self, project: &str, bridge: &Bridge) -> Result<Convergence> {
        let desired = project_rules(project, bridge)
            .into_iter()
            .map(|r| vec![r])
            .collect();
        let conv = self.converge(&PROJECT_CHAINS, |t| is_project_scoped(t, project), desired)?;
        if conv.failed > 0 {
            return Err(Error::Netfilter(format!(
                "could not install forwarding rules for project {}",
                project
            )));
        }
        Ok(conv)
    }

    /// Converges the port forwards of one instance. A rule pair that cannot
    /// be installed is logged and skipped.
    pub fn apply_ports(&self, net: &InstanceNet<'_>, ports: &[PortRule]) -> Result<Convergence> {
        let mut desired = Vec::new();
        for port in ports {
            for addr in net.addresses {
                desired.push(port_pair(net, *addr, port).to_vec());
            }
        }
        let (project, instance) = (net.project, net.instance);
        self.converge(
            &INSTANCE_CHAINS,
            |t| t.is_instance(project, instance) && matches!(t.kind, RuleKind::Dnat | RuleKind::Forward),
            desired,
        )
    }

    pub fn remove_ports(&self, project: &str, instance: &str) -> Result<Convergence> {
        self.converge(
            &INSTANCE_CHAINS,
            |t| t.is_instance(project, instance) && matches!(t.kind, RuleKind::Dnat | RuleKind::Forward),
            Vec::new(),
        )
    }

    /// Converges the accept rules between an instance and its linked peers.
    pub fn apply_links(&self, net: &InstanceNet<'_>, peers: &[Ipv4Addr]) -> Result<Convergence> {
        let mut desired = Vec::new();
        for own in net.addresses {
            for peer in peers {
                desired.push(link_pair(net, *own, *peer).to_vec());
            }
        }
        let (project, instance) = (net.project, net.instance);
        self.converge(
            &[(Table::Filter, LOCKER_FORWARD)],
            |t| t.is_instance(project, instance) && t.kind == RuleKind::Link,
            desired,
        )
    }

    pub fn remove_links(&self, project: &str, instance: &str) -> Result<Convergence> {
        self.converge(
            &[(Table::Filter, LOCKER_FORWARD)],
            |t| t.is_instance(project, instance) && t.kind == RuleKind::Link,
            Vec::new(),
        )
    }

    /// Removes every rule tagged with the project. The shared chains stay;
    /// the shared jump rules are removed only when `last_project` is set.
    pub fn cleanup_project(&self, project: &str, last_project: bool) -> Result<Convergence> {
        let mut conv = self.converge(
            &[
                (Table::Nat, LOCKER_PREROUTING),
                (Table::Nat, POSTROUTING),
                (Table::Filter, LOCKER_FORWARD),
            ],
            |t| t.is_project(project),
            Vec::new(),
        )?;
        if last_project {
            let jumps = self.converge(&JUMP_CHAINS, |t| t.kind == RuleKind::Jump, Vec::new())?;
            conv.removed += jumps.removed;
            conv.failed += jumps.failed;
        }
        if conv.failed > 0 {
            return Err(Error::Netfilter(format!(
                "could not remove all rules of project {}",
                project
            )));
        }
        Ok(conv)
    }

    /// Projects owning at least one tagged rule.
    pub fn active_projects(&self) -> Result<Vec<String>> {
        let mut projects: Vec<String> = self
            .installed(
                &[
                    (Table::Nat, LOCKER_PREROUTING),
                    (Table::Nat, POSTROUTING),
                    (Table::Filter, LOCKER_FORWARD),
                ],
                |t| t.project.is_some(),
            )?
            .into_iter()
            .filter_map(|i| i.tag.project)
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    /// Live port forwards of an instance, read back from its DNAT rules.
    pub fn port_forwards(&self, project: &str, instance: &str) -> Result<Vec<PortForward>> {
        let installed = self.installed(&[(Table::Nat, LOCKER_PREROUTING)], |t| {
            t.is_instance(project, instance) && t.kind == RuleKind::Dnat
        })?;
        Ok(installed
            .into_iter()
            .filter_map(|i| i.rule)
            .filter_map(|rule| match (&rule.target, rule.protocol, rule.dport) {
                (Target::Dnat(to), Some(protocol), Some(host_port)) => Some(PortForward {
                    host_ip: rule.destination.as_ref().map(|d| d.value.first_address()),
                    host_port,
                    to: *to,
                    protocol,
                }),
                _ => None,
            })
            .collect())
    }

    /// Live link rules of an instance, described as `accept <src> -> <dst>`.
    pub fn link_rules(&self, project: &str, instance: &str) -> Result<Vec<String>> {
        let installed = self.installed(&[(Table::Filter, LOCKER_FORWARD)], |t| {
            t.is_instance(project, instance) && t.kind == RuleKind::Link
        })?;
        Ok(installed
            .iter()
            .filter_map(|i| i.rule.as_ref())
            .map(describe)
            .collect())
    }

    /// Instances of `project` that own at least one tagged rule, sorted.
    pub fn tagged_instances(&self, project: &str) -> Result<Vec<String>> {
        let installed = self.installed(&INSTANCE_CHAINS, |t| {
            t.is_project(project) && t.instance.is_some()
        })?;
        let mut instances: Vec<String> = installed
            .into_iter()
            .filter_map(|i| i.tag.instance)
            .collect();
        instances.sort();
        instances.dedup();
        Ok(instances)
    }

    /// Lists tagged rules in `chains` whose tag satisfies `wanted`. Chains
    /// that do not exist contribute nothing.
    fn installed(
        &self,
        chains: &[(Table, &str)],
        wanted: impl Fn(&RuleTag) -> bool,
    ) -> Result<Vec<Installed>> {
        let mut found = Vec::new();
        for (table, chain) in chains {
            let Some(lines) = self.backend.list(*table, chain)? else {
                continue;
            };
            for line in lines {
                let tokens = tokenize(&line);
                if tokens.len() < 2 || tokens[0] != "-A" || tokens[1] != *chain {
                    continue;
                }
                let args = tokens[2..].to_vec();
                let Some(tag) = comment_tag(&args) else {
                    continue;
                };
                if !wanted(&tag) {
                    continue;
                }
                let rule = match NetfilterRule::from_args(*table, chain, &args) {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        tracing::warn!("{}; treating rule as stale", e);
                        None
                    }
                };
                found.push(Installed {
                    table: *table,
                    chain: chain.to_string(),
                    tag,
                    args,
                    rule,
                });
            }
        }
        Ok(found)
    }

    /// Core diff. `desired` is a list of groups; a group is installed
    /// completely or not at all.
    fn converge(
        &self,
        chains: &[(Table, &str)],
        wanted: impl Fn(&RuleTag) -> bool,
        desired: Vec<Vec<NetfilterRule>>,
    ) -> Result<Convergence> {
        let existing = self.installed(chains, wanted)?;
        let mut conv = Convergence::default();
        let mut present: Vec<NetfilterRule> = Vec::new();

        // existing - desired; a second copy of a desired rule is stale too
        for stale in &existing {
            if let Some(rule) = &stale.rule {
                if !present.contains(rule) && desired.iter().flatten().any(|d| d == rule) {
                    present.push(rule.clone());
                    continue;
                }
            }
            match self.backend.delete(stale.table, &stale.chain, &stale.args) {
                Ok(()) => {
                    tracing::info!("removed rule {} from {}", stale.tag, stale.chain);
                    conv.removed += 1;
                }
                Err(e) => {
                    tracing::warn!("could not remove rule {}: {}", stale.tag, e);
                    conv.failed += 1;
                }
            }
        }

        // desired - existing, group by group
        for group in desired {
            let missing: Vec<&NetfilterRule> = group.iter().filter(|d| !present.contains(*d)).collect();
            let mut done: Vec<&NetfilterRule> = Vec::new();
            let mut group_failed = false;
            for rule in missing {
                match self.backend.insert(rule.table, &rule.chain, &rule.to_args()) {
                    Ok(()) => done.push(rule),
                    Err(e) => {
                        tracing::warn!("could not add rule {} to {}: {}", rule.tag, rule.chain, e);
                        group_failed = true;
                        break;
                    }
                }
            }
            if group_failed {
                for rule in done.into_iter().rev() {
                    if let Err(e) = self.backend.delete(rule.table, &rule.chain, &rule.to_args()) {
                        tracing::warn!("could not roll back rule {}: {}", rule.tag, e);
                    }
                }
                // members that were already live must not stay as a lone half
                let live: Vec<&NetfilterRule> = group.iter().filter(|r| present.contains(*r)).collect();
                for rule in live {
                    let installed = existing.iter().find(|i| i.rule.as_ref() == Some(rule));
                    let (table, chain, args) = match installed {
                        Some(i) => (i.table, i.chain.as_str(), i.args.clone()),
                        None => (rule.table, rule.chain.as_str(), rule.to_args()),
                    };
                    match self.backend.delete(table, chain, &args) {
                        Ok(()) => {
                            tracing::info!("removed rule {} from {}, its group is incomplete", rule.tag, chain);
                            conv.removed += 1;
                        }
                        Err(e) => tracing::warn!("could not remove rule {}: {}", rule.tag, e),
                    }
                    present.retain(|p| p != rule);
                }
                conv.failed += 1;
                continue;
            }
            for rule in done {
                tracing::info!("added rule {} to {}: {}", rule.tag, rule.chain, describe(rule));
                present.push(rule.clone());
                conv.inserted += 1;
            }
        }
        Ok(conv)
    }
}

fn comment_tag(args: &[String]) -> Option<RuleTag> {
    args.windows(2)
        .find(|w| w[0] == "--comment")
        .and_then(|w| w[1].parse().ok())
}

fn is_project_scoped(tag: &RuleTag, project: &str) -> bool {
    tag.is_project(project)
        && tag.instance.is_none()
        && matches!(tag.kind, RuleKind::Masquerade | RuleKind::Bridge)
}

fn target_chain(rule: &NetfilterRule) -> &str {
    match &rule.target {
        Target::Jump(chain) => chain,
        _ => "",
    }
}

fn describe(rule: &NetfilterRule) -> String {
    match (&rule.target, rule.protocol, rule.dport) {
        (Target::Dnat(to), Some(p), Some(port)) => format!("{}/{} -> {}", port, p, to),
        (Target::Accept, Some(p), Some(port)) => format!("accept {}/{}", port, p),
        (Target::Accept, _, _) => match (&rule.source, &rule.destination) {
            (Some(s), Some(d)) => format!("accept {} -> {}", s.value, d.value),
            _ => "accept".to_string(),
        },
        (Target::Masquerade, _, _) => "masquerade".to_string(),
        (Target::Jump(chain), _, _) => format!("jump {}", chain),
        (Target::Dnat(to), _, _) => format!("dnat {}", to),
    }
}

fn jump_rules() -> [NetfilterRule; 2] {
    let mut prerouting = NetfilterRule::new(
        Table::Nat,
        PREROUTING,
        Target::Jump(LOCKER_PREROUTING.into()),
        RuleTag::shared(RuleKind::Jump),
    );
    prerouting.local_destination = true;
    let forward = NetfilterRule::new(
        Table::Filter,
        FORWARD,
        Target::Jump(LOCKER_FORWARD.into()),
        RuleTag::shared(RuleKind::Jump),
    );
    [prerouting, forward]
}

fn project_rules(project: &str, bridge: &Bridge) -> [NetfilterRule; 3] {
    let mut masquerade = NetfilterRule::new(
        Table::Nat,
        POSTROUTING,
        Target::Masquerade,
        RuleTag::project(project, RuleKind::Masquerade),
    );
    masquerade.source = Some(Neg::is(bridge.subnet));
    masquerade.destination = Some(Neg::not(bridge.subnet));

    // outbound from the bridge
    let mut outbound = NetfilterRule::new(
        Table::Filter,
        LOCKER_FORWARD,
        Target::Accept,
        RuleTag::project(project, RuleKind::Bridge),
    );
    outbound.in_interface = Some(Neg::is(bridge.name.clone()));
    outbound.out_interface = Some(Neg::not(bridge.name.clone()));

    // inbound to the bridge
    let mut inbound = outbound.clone();
    inbound.in_interface = Some(Neg::not(bridge.name.clone()));
    inbound.out_interface = Some(Neg::is(bridge.name.clone()));

    [masquerade, outbound, inbound]
}

fn port_pair(net: &InstanceNet<'_>, addr: Ipv4Addr, port: &PortRule) -> [NetfilterRule; 2] {
    let mut dnat = NetfilterRule::new(
        Table::Nat,
        LOCKER_PREROUTING,
        Target::Dnat(SocketAddrV4::new(addr, port.container_port)),
        RuleTag::instance(net.project, net.instance, RuleKind::Dnat),
    );
    dnat.protocol = Some(port.protocol);
    dnat.destination = port.host_ip.map(|ip| Neg::is(host(ip)));
    dnat.in_interface = Some(Neg::not(net.bridge.name.clone()));
    dnat.dport = Some(port.host_port);

    let mut forward = NetfilterRule::new(
        Table::Filter,
        LOCKER_FORWARD,
        Target::Accept,
        RuleTag::instance(net.project, net.instance, RuleKind::Forward),
    );
    forward.protocol = Some(port.protocol);
    forward.destination = Some(Neg::is(host(addr)));
    forward.in_interface = Some(Neg::not(net.bridge.name.clone()));
    forward.out_interface = Some(Neg::is(net.bridge.name.clone()));
    forward.dport = Some(port.container_port);

    [dnat, forward]
}

fn link_pair(net: &InstanceNet<'_>, own: Ipv4Addr, peer: Ipv4Addr) -> [NetfilterRule; 2] {
    let tag = RuleTag::instance(net.project, net.instance, RuleKind::Link);
    let accept = |src: Ipv4Addr, dst: Ipv4Addr| {
        let mut rule = NetfilterRule::new(Table::Filter, LOCKER_FORWARD, Target::Accept, tag.clone());
        rule.source = Some(Neg::is(host(src)));
        rule.destination = Some(Neg::is(host(dst)));
        rule.in_interface = Some(Neg::is(net.bridge.name.clone()));
        rule.out_interface = Some(Neg::is(net.bridge.name.clone()));
        rule
    };
    [accept(own, peer), accept(peer, own)]
}
