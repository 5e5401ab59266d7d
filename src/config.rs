//! Project declaration: YAML file, string grammars and defaults merging.
//!
//! Everything the rest of the crate sees is fully materialised here: port,
//! link, cgroup and dns strings are parsed into typed values, the `$bridge`
//! and `$copy` sentinels become [`DnsEntry`] variants and volume placeholders
//! are expanded.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Prefix of every project bridge device.
pub const BRIDGE_PREFIX: &str = "locker_";

/// Transport protocol of a port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(Error::Config(format!("unsupported protocol '{}'", other))),
        }
    }
}

/// `[HOST_IP:]HOST_PORT:CONTAINER_PORT[/PROTOCOL]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRule {
    pub host_ip: Option<Ipv4Addr>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl FromStr for PortRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let re = regex(
            r"^(?:(?P<ip>\d{1,3}(?:\.\d{1,3}){3}):)?(?P<host>\d{1,5}):(?P<container>\d{1,5})(?:/(?P<proto>[a-z]+))?$",
        )?;
        let caps = re
            .captures(s.trim())
            .ok_or_else(|| Error::Config(format!("invalid port rule '{}'", s)))?;

        let host_ip = match caps.name("ip") {
            Some(ip) => Some(
                ip.as_str()
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid host address in '{}'", s)))?,
            ),
            None => None,
        };
        let protocol = match caps.name("proto") {
            Some(p) => p.as_str().parse()?,
            None => Protocol::Tcp,
        };

        Ok(Self {
            host_ip,
            host_port: parse_port(&caps["host"], s)?,
            container_port: parse_port(&caps["container"], s)?,
            protocol,
        })
    }
}

impl fmt::Display for PortRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = self.host_ip {
            write!(f, "{}:", ip)?;
        }
        write!(
            f,
            "{}:{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

fn parse_port(value: &str, rule: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::Config(format!(
            "port '{}' out of range in '{}'",
            value, rule
        ))),
    }
}

/// `target_name[:alias]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub target: String,
    pub alias: Option<String>,
}

impl FromStr for LinkSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let re = regex(
            r"^(?P<name>[a-zA-Z0-9][a-zA-Z0-9_.-]*)(?::(?P<alias>[a-zA-Z0-9][a-zA-Z0-9.-]*))?$",
        )?;
        let caps = re
            .captures(s.trim())
            .ok_or_else(|| Error::Config(format!("invalid link '{}'", s)))?;
        Ok(Self {
            target: caps["name"].to_string(),
            alias: caps.name("alias").map(|a| a.as_str().to_string()),
        })
    }
}

/// `key=value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupSetting {
    pub key: String,
    pub value: String,
}

impl FromStr for CgroupSetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let re = regex(r"^\s*([a-zA-Z0-9_.]+)\s*=\s*(\S(?:.*\S)?)\s*$")?;
        let caps = re
            .captures(s)
            .ok_or_else(|| Error::Config(format!("malformed cgroup setting '{}'", s)))?;
        Ok(Self {
            key: caps[1].to_string(),
            value: caps[2].to_string(),
        })
    }
}

/// A nameserver declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsEntry {
    Address(Ipv4Addr),
    /// `$bridge`: the project gateway.
    BridgeGateway,
    /// `$copy`: the host's non-loopback resolvers.
    CopyHost,
}

impl FromStr for DnsEntry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "$bridge" => Ok(Self::BridgeGateway),
            "$copy" => Ok(Self::CopyHost),
            other => other
                .parse()
                .map(Self::Address)
                .map_err(|_| Error::Config(format!("invalid dns entry '{}'", s))),
        }
    }
}

/// How an absent instance comes into existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationMode {
    /// Runtime template plus its `--key value` arguments.
    Template {
        name: String,
        args: Vec<(String, String)>,
    },
    /// Copy of an existing instance.
    Clone { source: String },
}

/// A bind mount with placeholders already expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub host: PathBuf,
    pub container: PathBuf,
}

/// One declared instance.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Name as declared in the project file.
    pub name: String,
    /// `<project>_<name>`, unique on the host.
    pub system_name: String,
    pub creation: CreationMode,
    pub ports: Vec<PortRule>,
    pub links: Vec<LinkSpec>,
    pub cgroup: Vec<CgroupSetting>,
    pub dns: Vec<DnsEntry>,
    pub fqdn: Option<String>,
    pub volumes: Vec<Volume>,
}

/// A named group of declared instances sharing one bridge.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub containers: BTreeMap<String, ContainerSpec>,
}

impl Project {
    /// Reads and materialises a project file.
    pub fn load(path: &Path, name: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text, name)
    }

    pub fn from_yaml(text: &str, name: &str) -> Result<Self> {
        validate_project_name(name)?;
        let raw: RawFile = serde_yaml::from_str(text)
            .map_err(|e| Error::Config(format!("invalid project file: {}", e)))?;

        let mut containers = BTreeMap::new();
        for (declared, body) in &raw.containers {
            let spec = materialize(name, declared, body, &raw.defaults)?;
            containers.insert(declared.clone(), spec);
        }
        if containers.is_empty() {
            return Err(Error::Config("project declares no containers".into()));
        }

        Ok(Self {
            name: name.to_string(),
            containers,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.get(name)
    }

    /// Resolves a command-line selection; an empty selection means all.
    pub fn select(&self, names: &[String]) -> Result<Vec<&ContainerSpec>> {
        if names.is_empty() {
            return Ok(self.containers.values().collect());
        }
        names
            .iter()
            .map(|n| {
                self.containers
                    .get(n)
                    .ok_or_else(|| Error::Config(format!("unknown container '{}'", n)))
            })
            .collect()
    }
}

// =============================================================================
// Raw YAML shape
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    containers: BTreeMap<String, RawContainer>,
    #[serde(default)]
    defaults: RawDefaults,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaults {
    #[serde(default)]
    dns: Vec<String>,
    #[serde(default)]
    cgroup: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawContainer {
    template: Option<BTreeMap<String, serde_yaml::Value>>,
    clone: Option<String>,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    cgroup: Vec<String>,
    #[serde(default)]
    dns: Vec<String>,
    fqdn: Option<String>,
}

fn materialize(
    project: &str,
    declared: &str,
    raw: &RawContainer,
    defaults: &RawDefaults,
) -> Result<ContainerSpec> {
    validate_container_name(declared)?;
    let system_name = format!("{}_{}", project, declared);

    let creation = match (&raw.template, &raw.clone) {
        (Some(template), None) => template_mode(declared, template)?,
        (None, Some(source)) => CreationMode::Clone {
            source: source.clone(),
        },
        _ => {
            return Err(Error::Config(format!(
                "'{}' must declare exactly one of 'template' or 'clone'",
                declared
            )));
        }
    };

    let ports = raw
        .ports
        .iter()
        .map(|p| p.parse())
        .collect::<Result<Vec<PortRule>>>()?;
    let links = raw
        .links
        .iter()
        .map(|l| l.parse())
        .collect::<Result<Vec<LinkSpec>>>()?;

    // defaults go first, instance keys override them in place
    let mut cgroup: Vec<CgroupSetting> = Vec::new();
    for entry in defaults.cgroup.iter().chain(&raw.cgroup) {
        let setting: CgroupSetting = entry.parse()?;
        match cgroup.iter_mut().find(|c| c.key == setting.key) {
            Some(existing) => existing.value = setting.value,
            None => cgroup.push(setting),
        }
    }

    let mut dns = Vec::new();
    for entry in raw.dns.iter().chain(&defaults.dns) {
        let entry: DnsEntry = entry.parse()?;
        if !dns.contains(&entry) {
            dns.push(entry);
        }
    }

    let volumes = raw
        .volumes
        .iter()
        .map(|v| parse_volume(v, project, &system_name, raw.fqdn.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    Ok(ContainerSpec {
        name: declared.to_string(),
        system_name,
        creation,
        ports,
        links,
        cgroup,
        dns,
        fqdn: raw.fqdn.clone(),
        volumes,
    })
}

fn template_mode(
    declared: &str,
    template: &BTreeMap<String, serde_yaml::Value>,
) -> Result<CreationMode> {
    let mut name = None;
    let mut args = Vec::new();
    for (key, value) in template {
        let value = match value {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            _ => {
                return Err(Error::Config(format!(
                    "template argument '{}' of '{}' must be a scalar",
                    key, declared
                )));
            }
        };
        if key == "name" {
            name = Some(value);
        } else {
            args.push((key.clone(), value));
        }
    }
    let name = name
        .ok_or_else(|| Error::Config(format!("template of '{}' has no 'name'", declared)))?;
    Ok(CreationMode::Template { name, args })
}

fn parse_volume(spec: &str, project: &str, system_name: &str, fqdn: Option<&str>) -> Result<Volume> {
    let expand = |s: &str| {
        s.trim()
            .replace("$project", project)
            .replace("$name", system_name)
            .replace("$fqdn", fqdn.unwrap_or(""))
    };
    match spec.split_once(':') {
        Some((host, container)) if !host.trim().is_empty() && !container.trim().is_empty() => {
            Ok(Volume {
                host: PathBuf::from(expand(host)),
                container: PathBuf::from(expand(container)),
            })
        }
        _ => Err(Error::Config(format!("invalid volume '{}'", spec))),
    }
}

fn validate_project_name(name: &str) -> Result<()> {
    if !regex(r"^[a-zA-Z][a-zA-Z0-9]*$")?.is_match(name) {
        return Err(Error::Config(format!(
            "invalid project name '{}': alphanumeric, not starting with a digit",
            name
        )));
    }
    Ok(())
}

fn validate_container_name(name: &str) -> Result<()> {
    if !regex(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$")?.is_match(name) {
        return Err(Error::Config(format!("invalid container name '{}'", name)));
    }
    Ok(())
}

pub(crate) fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("bad pattern {}: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
defaults:
  dns: ["$bridge", "8.8.8.8"]
  cgroup: ["memory.limit_in_bytes=256M", "cpu.shares=512"]
containers:
  db:
    template:
      name: ubuntu
      release: trusty
    fqdn: db.example.net
    cgroup: ["cpu.shares=1024"]
    volumes: ["/srv/$project/$name/data:/var/lib/data"]
  web:
    clone: base
    ports: ["8000:8000", "80:80/udp", "127.0.0.1:2222:22"]
    links: ["db:database"]
    dns: ["$copy", "8.8.8.8"]
"#;

    #[test]
    fn test_parse_port_rule() {
        let rule: PortRule = "8000:80".parse().unwrap();
        assert_eq!(rule.host_ip, None);
        assert_eq!(rule.host_port, 8000);
        assert_eq!(rule.container_port, 80);
        assert_eq!(rule.protocol, Protocol::Tcp);

        let rule: PortRule = "192.168.1.10:53:5353/udp".parse().unwrap();
        assert_eq!(rule.host_ip, Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(rule.protocol, Protocol::Udp);
        assert_eq!(rule.to_string(), "192.168.1.10:53:5353/udp");
    }

    #[test]
    fn test_parse_port_rule_invalid() {
        assert!("80".parse::<PortRule>().is_err());
        assert!("0:80".parse::<PortRule>().is_err());
        assert!("70000:80".parse::<PortRule>().is_err());
        assert!("80:80/sctp".parse::<PortRule>().is_err());
        assert!("300.1.1.1:80:80".parse::<PortRule>().is_err());
    }

    #[test]
    fn test_parse_link_and_cgroup() {
        let link: LinkSpec = "db:database".parse().unwrap();
        assert_eq!(link.target, "db");
        assert_eq!(link.alias.as_deref(), Some("database"));
        assert_eq!("db".parse::<LinkSpec>().unwrap().alias, None);
        assert!("db:".parse::<LinkSpec>().is_err());

        let setting: CgroupSetting = "memory.limit_in_bytes = 512M".parse().unwrap();
        assert_eq!(setting.key, "memory.limit_in_bytes");
        assert_eq!(setting.value, "512M");
        assert!("noequals".parse::<CgroupSetting>().is_err());
    }

    #[test]
    fn test_parse_dns_entry() {
        assert_eq!("$bridge".parse::<DnsEntry>().unwrap(), DnsEntry::BridgeGateway);
        assert_eq!("$copy".parse::<DnsEntry>().unwrap(), DnsEntry::CopyHost);
        assert_eq!(
            "1.1.1.1".parse::<DnsEntry>().unwrap(),
            DnsEntry::Address(Ipv4Addr::new(1, 1, 1, 1))
        );
        assert!("resolver.local".parse::<DnsEntry>().is_err());
    }

    #[test]
    fn test_load_project() {
        let project = Project::from_yaml(PROJECT, "web").unwrap();
        assert_eq!(project.name, "web");

        let db = project.get("db").unwrap();
        assert_eq!(db.system_name, "web_db");
        assert_eq!(
            db.creation,
            CreationMode::Template {
                name: "ubuntu".into(),
                args: vec![("release".into(), "trusty".into())],
            }
        );
        // defaults first, overridden in place
        assert_eq!(db.cgroup.len(), 2);
        assert_eq!(db.cgroup[1].key, "cpu.shares");
        assert_eq!(db.cgroup[1].value, "1024");
        assert_eq!(
            db.volumes[0].host,
            PathBuf::from("/srv/web/web_db/data")
        );

        let web = project.get("web").unwrap();
        assert_eq!(web.ports.len(), 3);
        assert_eq!(
            web.dns,
            vec![
                DnsEntry::CopyHost,
                DnsEntry::Address(Ipv4Addr::new(8, 8, 8, 8)),
                DnsEntry::BridgeGateway
            ]
        );
    }

    #[test]
    fn test_load_project_rejects_bad_input() {
        assert!(Project::from_yaml(PROJECT, "1web").is_err());
        assert!(Project::from_yaml(PROJECT, "my-web").is_err());

        let both = "containers:\n  a:\n    clone: x\n    template: {name: y}\n";
        assert!(matches!(
            Project::from_yaml(both, "p"),
            Err(Error::Config(_))
        ));

        let bad_port = "containers:\n  a:\n    clone: x\n    ports: [\"abc\"]\n";
        assert!(Project::from_yaml(bad_port, "p").is_err());
    }

    #[test]
    fn test_select() {
        let project = Project::from_yaml(PROJECT, "web").unwrap();
        assert_eq!(project.select(&[]).unwrap().len(), 2);
        let picked = project.select(&["web".to_string()]).unwrap();
        assert_eq!(picked[0].system_name, "web_web");
        assert!(project.select(&["nope".to_string()]).is_err());
    }
}
