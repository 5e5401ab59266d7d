//! Name resolution between instances of a project.
//!
//! Each linking instance owns a block of rows in its own `/etc/hosts`, tagged
//! `locker:<project>:<instance>:link`. The block is recomputed from live
//! target addresses and replaced wholesale on every apply.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use crate::config::{ContainerSpec, Project};
use crate::error::{Error, Result};
use crate::hosts::{HostsEntry, HostsFile, LOCAL_HOSTNAME_ADDRESS};
use crate::netfilter::{RuleKind, RuleTag};
use crate::runtime::Runtime;

/// A link resolved against the live host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub address: Ipv4Addr,
    pub fqdn: Option<String>,
    /// Declared name of the target.
    pub name: String,
    pub alias: Option<String>,
}

impl LinkEntry {
    /// Host names in hosts-file order: fqdn, name, alias.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        names.extend(self.fqdn.clone());
        names.push(self.name.clone());
        if let Some(alias) = &self.alias {
            if !names.contains(alias) {
                names.push(alias.clone());
            }
        }
        names
    }
}

pub struct LinkRegistry<'a> {
    runtime: &'a dyn Runtime,
}

impl<'a> LinkRegistry<'a> {
    pub fn new(runtime: &'a dyn Runtime) -> Self {
        Self { runtime }
    }

    fn tag(project: &Project, spec: &ContainerSpec) -> String {
        RuleTag::instance(&project.name, &spec.name, RuleKind::Link).to_string()
    }

    /// Resolves every declared link of `spec`. Targets that are not running
    /// or have no address yet are skipped with a warning.
    pub fn resolve(&self, project: &Project, spec: &ContainerSpec) -> Result<Vec<LinkEntry>> {
        let mut entries = Vec::new();
        for link in &spec.links {
            let Some(target) = project.get(&link.target) else {
                tracing::warn!(
                    "{} links to '{}' which is not declared in project {}",
                    spec.name,
                    link.target,
                    project.name
                );
                continue;
            };
            let addresses = if self.runtime.state(&target.system_name)?.is_active() {
                self.runtime.addresses(&target.system_name)?
            } else {
                Vec::new()
            };
            if addresses.is_empty() {
                tracing::warn!(
                    "skipping link {} -> {}: target has no address",
                    spec.name,
                    link.target
                );
                continue;
            }
            for address in addresses {
                entries.push(LinkEntry {
                    address,
                    fqdn: target.fqdn.clone(),
                    name: target.name.clone(),
                    alias: link.alias.clone(),
                });
            }
        }
        Ok(entries)
    }

    /// Rewrites the link block in the instance's hosts file and returns the
    /// entries written.
    pub fn apply(&self, project: &Project, spec: &ContainerSpec) -> Result<Vec<LinkEntry>> {
        let entries = self.resolve(project, spec)?;
        let path = self.hosts_path(spec)?;
        let tag = Self::tag(project, spec);

        let mut hosts = HostsFile::load(&path)?;
        let before: Vec<HostsEntry> = hosts.tagged(&tag).cloned().collect();
        hosts.replace_tagged(
            &tag,
            entries
                .iter()
                .map(|e| HostsEntry::new(IpAddr::V4(e.address), e.names(), None))
                .collect(),
        );
        let after: Vec<HostsEntry> = hosts.tagged(&tag).cloned().collect();
        if before == after {
            tracing::debug!("links of {} are up to date", spec.name);
            return Ok(entries);
        }

        for gone in before.iter().filter(|e| !after.contains(e)) {
            tracing::info!("unlinked {} from {}", gone.names.join(" "), spec.name);
        }
        for added in after.iter().filter(|e| !before.contains(e)) {
            tracing::info!("linked {} ({}) into {}", added.names.join(" "), added.address, spec.name);
        }
        hosts.save(&path)?;
        Ok(entries)
    }

    /// Drops the link block of the instance. Returns how many rows went.
    pub fn remove(&self, project: &Project, spec: &ContainerSpec) -> Result<usize> {
        let path = self.hosts_path(spec)?;
        let mut hosts = HostsFile::load(&path)?;
        let removed = hosts.remove_tagged(&Self::tag(project, spec));
        if removed > 0 {
            hosts.save(&path)?;
            tracing::info!("removed {} link entries from {}", removed, spec.name);
        }
        Ok(removed)
    }

    /// Live links of the instance as `name (address)` strings, read from its
    /// hosts file.
    pub fn linked(&self, project: &Project, spec: &ContainerSpec) -> Result<Vec<String>> {
        let hosts = HostsFile::load(&self.hosts_path(spec)?)?;
        let tag = Self::tag(project, spec);
        Ok(hosts
            .tagged(&tag)
            .map(|e| format!("{} ({})", e.names.join(" "), e.address))
            .collect())
    }

    fn hosts_path(&self, spec: &ContainerSpec) -> Result<std::path::PathBuf> {
        Ok(self.runtime.rootfs(&spec.system_name)?.join("etc/hosts"))
    }
}

/// Writes `fqdn` as the instance host name: the short name goes to
/// `/etc/hostname`, the `127.0.1.1` row lists `fqdn shortname`.
pub fn set_hostname(rootfs: &Path, fqdn: &str) -> Result<()> {
    let short = fqdn.split('.').next().unwrap_or(fqdn);
    let hostname = rootfs.join("etc/hostname");
    fs::write(&hostname, format!("{}\n", short)).map_err(|e| Error::io(&hostname, e))?;

    let path = rootfs.join("etc/hosts");
    let mut hosts = HostsFile::load(&path)?;
    let local: IpAddr = LOCAL_HOSTNAME_ADDRESS
        .parse()
        .map_err(|_| Error::Config(format!("invalid address {}", LOCAL_HOSTNAME_ADDRESS)))?;
    let mut names = vec![fqdn.to_string()];
    if short != fqdn {
        names.push(short.to_string());
    }
    hosts.set_names(local, names);
    hosts.save(&path)?;
    tracing::info!("hostname set to {}", fqdn);
    Ok(())
}
