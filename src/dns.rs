//! Nameserver configuration written into instance root filesystems.

use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::config::DnsEntry;
use crate::error::{Error, Result};

pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Files inside the instance root that receive the nameserver list.
const RESOLV_FILES: [&str; 2] = ["etc/resolv.conf", "etc/resolvconf/resolv.conf.d/base"];

/// Non-loopback `nameserver` entries of a resolv.conf. A missing file has
/// none.
pub fn host_resolvers(path: &Path) -> Result<Vec<Ipv4Addr>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(path, e)),
    };
    Ok(text
        .lines()
        .filter_map(|l| {
            let mut fields = l.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse::<Ipv4Addr>().ok(),
                _ => None,
            }
        })
        .filter(|a| !a.is_loopback())
        .collect())
}

/// Turns the declared entries into concrete addresses, in order and without
/// duplicates.
pub fn resolve(entries: &[DnsEntry], gateway: Ipv4Addr, host_resolv: &Path) -> Result<Vec<Ipv4Addr>> {
    let mut servers = Vec::new();
    for entry in entries {
        let found = match entry {
            DnsEntry::Address(addr) => vec![*addr],
            DnsEntry::BridgeGateway => vec![gateway],
            DnsEntry::CopyHost => host_resolvers(host_resolv)?,
        };
        for server in found {
            if !servers.contains(&server) {
                servers.push(server);
            }
        }
    }
    Ok(servers)
}

/// Writes the nameserver list into the instance. The resolvconf base file
/// is only touched if the instance has one.
pub fn write(rootfs: &Path, servers: &[Ipv4Addr]) -> Result<()> {
    let content: String = servers
        .iter()
        .map(|s| format!("nameserver {}\n", s))
        .collect();
    for (i, file) in RESOLV_FILES.iter().enumerate() {
        let path = rootfs.join(file);
        if i > 0 && !path.exists() {
            continue;
        }
        // resolv.conf is commonly a dangling symlink into /run
        if path.is_symlink() {
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        }
        fs::write(&path, &content).map_err(|e| Error::io(&path, e))?;
    }
    tracing::info!(
        "nameservers: {}",
        servers
            .iter()
            .map(Ipv4Addr::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}
