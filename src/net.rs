use std::process::Command;

use cidr::{Ipv4Cidr, Ipv4Inet};
use regex::Regex;

use crate::config::BRIDGE_PREFIX;
use crate::error::{Error, Result};
use crate::subnet;

/// Longest interface name the kernel accepts.
const IFNAMSIZ_MAX: usize = 15;

/// The host's view of network interfaces. Every call reads live state.
pub trait HostNetwork {
    /// IPv4 addresses bound to any host interface, with their prefix.
    fn interface_addresses(&self) -> Result<Vec<(String, Ipv4Inet)>>;

    /// Names of all bridge devices.
    fn bridges(&self) -> Result<Vec<String>>;

    fn link_exists(&self, name: &str) -> Result<bool>;

    fn create_bridge(&self, name: &str) -> Result<()>;

    fn add_address(&self, name: &str, address: &Ipv4Inet) -> Result<()>;

    fn set_up(&self, name: &str) -> Result<()>;

    fn delete_link(&self, name: &str) -> Result<()>;
}

/// [`HostNetwork`] backed by iproute2.
#[derive(Debug, Default)]
pub struct IpCommand;

impl IpCommand {
    /// executes ip command with arguments and returns its stdout
    fn ip(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("/sbin/ip")
            .args(args)
            .output()
            .map_err(|e| Error::Bridge {
                bridge: args.last().copied().unwrap_or_default().to_string(),
                reason: format!("failed to execute ip {:?}: {}", args, e),
            })?;
        if !output.status.success() {
            return Err(Error::Bridge {
                bridge: args.last().copied().unwrap_or_default().to_string(),
                reason: format!(
                    "ip {:?}: {}",
                    args,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl HostNetwork for IpCommand {
    fn interface_addresses(&self) -> Result<Vec<(String, Ipv4Inet)>> {
        let out = self.ip(&["-o", "-4", "addr", "show"])?;
        parse_addr_show(&out)
    }

    fn bridges(&self) -> Result<Vec<String>> {
        let out = self.ip(&["-o", "link", "show", "type", "bridge"])?;
        parse_link_names(&out)
    }

    fn link_exists(&self, name: &str) -> Result<bool> {
        let status = Command::new("/sbin/ip")
            .args(["link", "show", "dev", name])
            .output()
            .map_err(|e| Error::Bridge {
                bridge: name.to_string(),
                reason: format!("failed to execute ip: {}", e),
            })?
            .status;
        Ok(status.success())
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        self.ip(&["link", "add", "name", name, "type", "bridge"])?;
        Ok(())
    }

    fn add_address(&self, name: &str, address: &Ipv4Inet) -> Result<()> {
        self.ip(&["addr", "add", address.to_string().as_str(), "dev", name])?;
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.ip(&["link", "delete", name])?;
        Ok(())
    }
}

/// parses `ip -o -4 addr show` output into (interface, address/prefix) pairs
fn parse_addr_show(out: &str) -> Result<Vec<(String, Ipv4Inet)>> {
    let re = line_regex(r"^\d+:\s+([^\s@]+)\S*\s+inet\s+(\d+\.\d+\.\d+\.\d+/\d+)")?;
    let mut found = Vec::new();
    for caps in out.lines().filter_map(|l| re.captures(l)) {
        match caps[2].parse::<Ipv4Inet>() {
            Ok(inet) => found.push((caps[1].to_string(), inet)),
            Err(_) => tracing::warn!("ignoring unparsable address {}", &caps[2]),
        }
    }
    Ok(found)
}

/// parses `ip -o link show` output into interface names
fn parse_link_names(out: &str) -> Result<Vec<String>> {
    let re = line_regex(r"^\d+:\s+([^\s:@]+)")?;
    Ok(out
        .lines()
        .filter_map(|l| re.captures(l))
        .map(|c| c[1].to_string())
        .collect())
}

fn line_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Bridge {
        bridge: String::new(),
        reason: e.to_string(),
    })
}

/// A project bridge and the subnet bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub name: String,
    pub subnet: Ipv4Cidr,
    /// Address carried by the bridge itself.
    pub gateway: Ipv4Inet,
}

/// Keeps one `locker_<project>` bridge per project. Holds no state: the bridge
/// and its subnet are rediscovered from the host on every call.
pub struct BridgeManager<'a> {
    host: &'a dyn HostNetwork,
}

impl<'a> BridgeManager<'a> {
    pub fn new(host: &'a dyn HostNetwork) -> Self {
        Self { host }
    }

    pub fn bridge_name(project: &str) -> String {
        format!("{}{}", BRIDGE_PREFIX, project)
    }

    /// Every subnet currently reachable through a host interface.
    pub fn host_subnets(&self) -> Result<Vec<Ipv4Cidr>> {
        Ok(self
            .host
            .interface_addresses()?
            .into_iter()
            .map(|(_, inet)| inet.network())
            .collect())
    }

    /// Looks up the project's bridge; `None` if it does not exist or carries
    /// no IPv4 address.
    pub fn find(&self, project: &str) -> Result<Option<Bridge>> {
        let name = Self::bridge_name(project);
        Ok(self
            .host
            .interface_addresses()?
            .into_iter()
            .find(|(ifname, _)| *ifname == name)
            .map(|(_, gateway)| Bridge {
                name,
                subnet: gateway.network(),
                gateway,
            }))
    }

    /// Returns the existing bridge unchanged, or creates, addresses and brings
    /// up a new one on the first free subnet.
    pub fn ensure(&self, project: &str) -> Result<Bridge> {
        if let Some(bridge) = self.find(project)? {
            tracing::debug!("bridge exists: {} ({})", bridge.name, bridge.subnet);
            return Ok(bridge);
        }

        let name = Self::bridge_name(project);
        if name.len() > IFNAMSIZ_MAX {
            return Err(Error::Bridge {
                bridge: name,
                reason: format!("interface names are limited to {} characters", IFNAMSIZ_MAX),
            });
        }

        // a bridge left without an address by an interrupted run is reused
        if !self.host.link_exists(&name)? {
            tracing::info!("creating bridge {}", name);
            self.host.create_bridge(&name)?;
        }

        let subnet = subnet::allocate(&self.host_subnets()?)?;
        let gateway = subnet::gateway(&subnet)?;
        self.host.add_address(&name, &gateway)?;
        self.host.set_up(&name)?;
        tracing::info!("bridge {} is up with {}", name, gateway);

        Ok(Bridge {
            name,
            subnet,
            gateway,
        })
    }

    /// Deletes the bridge if present. Returns whether anything was removed.
    pub fn teardown(&self, project: &str) -> Result<bool> {
        let name = Self::bridge_name(project);
        if !self.host.link_exists(&name)? {
            tracing::debug!("bridge {} does not exist", name);
            return Ok(false);
        }
        tracing::info!("deleting bridge {}", name);
        self.host.delete_link(&name)?;
        Ok(true)
    }

    /// Projects other than `project` that still own a bridge.
    pub fn other_projects(&self, project: &str) -> Result<Vec<String>> {
        let own = Self::bridge_name(project);
        Ok(self
            .host
            .bridges()?
            .into_iter()
            .filter(|b| *b != own)
            .filter_map(|b| b.strip_prefix(BRIDGE_PREFIX).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    #[test]
    fn test_parse_addr_show() {
        let out = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 10.1.1.5/24 brd 10.1.1.255 scope global eth0\\       valid_lft forever
7: locker_web    inet 10.1.2.1/24 brd 10.1.2.255 scope global locker_web\\       valid_lft forever
";
        let parsed = parse_addr_show(out).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].0, "eth0");
        assert_eq!(parsed[2].1.network(), "10.1.2.0/24".parse().unwrap());
    }

    #[test]
    fn test_parse_link_names() {
        let out = "\
4: docker0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc noqueue state DOWN
7: locker_web: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP
";
        assert_eq!(parse_link_names(out).unwrap(), vec!["docker0", "locker_web"]);
    }

    #[test]
    fn test_ensure_creates_first_subnet() {
        let host = FakeHost::new(&[("eth0", "192.168.1.20/24")]);
        let bridges = BridgeManager::new(&host);

        let bridge = bridges.ensure("web").unwrap();
        assert_eq!(bridge.name, "locker_web");
        assert_eq!(bridge.subnet, "10.1.1.0/24".parse().unwrap());
        assert_eq!(bridge.gateway.to_string(), "10.1.1.1/24");
        assert!(host.is_up("locker_web"));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let host = FakeHost::new(&[("eth0", "10.1.1.20/24")]);
        let bridges = BridgeManager::new(&host);

        let first = bridges.ensure("web").unwrap();
        let second = bridges.ensure("web").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.subnet, "10.1.2.0/24".parse().unwrap());

        // another project gets the next free subnet
        let other = bridges.ensure("api").unwrap();
        assert_eq!(other.subnet, "10.1.3.0/24".parse().unwrap());
        assert_eq!(bridges.other_projects("web").unwrap(), vec!["api"]);
    }

    #[test]
    fn test_ensure_repairs_bridge_without_address() {
        let host = FakeHost::new(&[]);
        host.create_bridge("locker_web").unwrap();
        let bridge = BridgeManager::new(&host).ensure("web").unwrap();
        assert_eq!(bridge.subnet, "10.1.1.0/24".parse().unwrap());
    }

    #[test]
    fn test_ensure_rejects_long_names() {
        let host = FakeHost::new(&[]);
        let err = BridgeManager::new(&host).ensure("averylongproject").unwrap_err();
        assert!(matches!(err, Error::Bridge { .. }));
    }

    #[test]
    fn test_teardown() {
        let host = FakeHost::new(&[]);
        let bridges = BridgeManager::new(&host);
        bridges.ensure("web").unwrap();

        assert!(bridges.teardown("web").unwrap());
        assert!(!bridges.teardown("web").unwrap());
        assert!(bridges.find("web").unwrap().is_none());
        // the freed subnet is handed out again
        assert_eq!(
            bridges.ensure("api").unwrap().subnet,
            "10.1.1.0/24".parse().unwrap()
        );
    }
}
