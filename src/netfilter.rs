//! Netfilter rule model.
//!
//! Managed rules are identified only by their comment tag
//! `locker:<project>:<instance>:<kind>`; `*` stands for "any" in the project
//! and instance fields. Rules are rendered to and parsed back from the
//! `iptables -S` argument syntax so that live state can be diffed against the
//! desired state field by field rather than by string or position.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use cidr::Ipv4Cidr;

use crate::config::Protocol;
use crate::error::{Error, Result};

/// Custom chain in the filter table, jumped to from `FORWARD`.
pub const LOCKER_FORWARD: &str = "LOCKER_FORWARD";
/// Custom chain in the nat table, jumped to from `PREROUTING`.
pub const LOCKER_PREROUTING: &str = "LOCKER_PREROUTING";

const TAG_PREFIX: &str = "locker";
const ANY: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

/// What a managed rule is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Port forward, nat half.
    Dnat,
    /// Port forward, filter half.
    Forward,
    /// Instance-to-instance accept.
    Link,
    /// Outbound source NAT for a project subnet.
    Masquerade,
    /// Traffic in and out of a project bridge.
    Bridge,
    /// Shared jump from a built-in chain into a locker chain.
    Jump,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dnat => "dnat",
            Self::Forward => "forward",
            Self::Link => "link",
            Self::Masquerade => "masquerade",
            Self::Bridge => "bridge",
            Self::Jump => "jump",
        }
    }
}

impl FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "dnat" => Self::Dnat,
            "forward" => Self::Forward,
            "link" => Self::Link,
            "masquerade" => Self::Masquerade,
            "bridge" => Self::Bridge,
            "jump" => Self::Jump,
            other => return Err(Error::RuleConflict(format!("unknown rule kind '{}'", other))),
        })
    }
}

/// Structured comment identifying a managed rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleTag {
    pub project: Option<String>,
    pub instance: Option<String>,
    pub kind: RuleKind,
}

impl RuleTag {
    pub fn instance(project: &str, instance: &str, kind: RuleKind) -> Self {
        Self {
            project: Some(project.to_string()),
            instance: Some(instance.to_string()),
            kind,
        }
    }

    pub fn project(project: &str, kind: RuleKind) -> Self {
        Self {
            project: Some(project.to_string()),
            instance: None,
            kind,
        }
    }

    pub fn shared(kind: RuleKind) -> Self {
        Self {
            project: None,
            instance: None,
            kind,
        }
    }

    pub fn is_instance(&self, project: &str, instance: &str) -> bool {
        self.project.as_deref() == Some(project) && self.instance.as_deref() == Some(instance)
    }

    pub fn is_project(&self, project: &str) -> bool {
        self.project.as_deref() == Some(project)
    }
}

impl fmt::Display for RuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            TAG_PREFIX,
            self.project.as_deref().unwrap_or(ANY),
            self.instance.as_deref().unwrap_or(ANY),
            self.kind.as_str()
        )
    }
}

impl FromStr for RuleTag {
    type Err = Error;

    /// Fails for comments that are not locker tags.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [TAG_PREFIX, project, instance, kind] if !project.is_empty() && !instance.is_empty() => {
                let field = |v: &str| (v != ANY).then(|| v.to_string());
                Ok(Self {
                    project: field(project),
                    instance: field(instance),
                    kind: kind.parse()?,
                })
            }
            _ => Err(Error::RuleConflict(format!("not a locker tag: '{}'", s))),
        }
    }
}

/// A match value that may be inverted with `!`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Neg<T> {
    pub value: T,
    pub negated: bool,
}

impl<T> Neg<T> {
    pub fn is(value: T) -> Self {
        Self {
            value,
            negated: false,
        }
    }

    pub fn not(value: T) -> Self {
        Self {
            value,
            negated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Accept,
    Masquerade,
    Dnat(SocketAddrV4),
    Jump(String),
}

/// One managed rule, as far as locker cares about its fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetfilterRule {
    pub table: Table,
    pub chain: String,
    pub protocol: Option<Protocol>,
    pub source: Option<Neg<Ipv4Cidr>>,
    pub destination: Option<Neg<Ipv4Cidr>>,
    pub in_interface: Option<Neg<String>>,
    pub out_interface: Option<Neg<String>>,
    pub dport: Option<u16>,
    /// `-m addrtype --dst-type LOCAL`
    pub local_destination: bool,
    pub target: Target,
    pub tag: RuleTag,
}

impl NetfilterRule {
    pub fn new(table: Table, chain: &str, target: Target, tag: RuleTag) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            protocol: None,
            source: None,
            destination: None,
            in_interface: None,
            out_interface: None,
            dport: None,
            local_destination: false,
            target,
            tag,
        }
    }

    /// Renders the rule specification, without table and chain, in the
    /// option order `iptables -S` uses.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |negated: bool, flag: &str, value: String| {
            if negated {
                args.push("!".into());
            }
            args.push(flag.into());
            args.push(value);
        };
        if let Some(src) = &self.source {
            push(src.negated, "-s", src.value.to_string());
        }
        if let Some(dst) = &self.destination {
            push(dst.negated, "-d", dst.value.to_string());
        }
        if let Some(i) = &self.in_interface {
            push(i.negated, "-i", i.value.clone());
        }
        if let Some(o) = &self.out_interface {
            push(o.negated, "-o", o.value.clone());
        }
        if let Some(proto) = self.protocol {
            push(false, "-p", proto.as_str().into());
        }
        if self.local_destination {
            args.extend(["-m", "addrtype", "--dst-type", "LOCAL"].map(String::from));
        }
        if let (Some(proto), Some(port)) = (self.protocol, self.dport) {
            args.extend(["-m".to_string(), proto.as_str().to_string()]);
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        args.extend(["-m", "comment", "--comment"].map(String::from));
        args.push(self.tag.to_string());
        match &self.target {
            Target::Accept => args.extend(["-j", "ACCEPT"].map(String::from)),
            Target::Masquerade => args.extend(["-j", "MASQUERADE"].map(String::from)),
            Target::Dnat(to) => {
                args.extend(["-j", "DNAT", "--to-destination"].map(String::from));
                args.push(to.to_string());
            }
            Target::Jump(chain) => {
                args.push("-j".into());
                args.push(chain.clone());
            }
        }
        args
    }

    /// Parses the arguments following `-A <chain>` in `iptables -S` output.
    pub fn from_args(table: Table, chain: &str, args: &[String]) -> Result<Self> {
        let conflict = |what: String| Error::RuleConflict(format!("{} in {}: {}", what, chain, args.join(" ")));

        let mut rule = NetfilterRule::new(table, chain, Target::Accept, RuleTag::shared(RuleKind::Jump));
        let mut tag = None;
        let mut target = None;
        let mut negated = false;
        let mut it = args.iter();

        while let Some(arg) = it.next() {
            let mut value = || it.next().cloned().ok_or_else(|| conflict(format!("'{}' without value", arg)));
            match arg.as_str() {
                "!" => {
                    negated = true;
                    continue;
                }
                "-s" => rule.source = Some(neg(parse_cidr(&value()?)?, negated)),
                "-d" => rule.destination = Some(neg(parse_cidr(&value()?)?, negated)),
                "-i" => rule.in_interface = Some(neg(value()?, negated)),
                "-o" => rule.out_interface = Some(neg(value()?, negated)),
                "-p" => rule.protocol = Some(value()?.parse().map_err(|_| conflict("protocol".into()))?),
                "-m" => {
                    value()?;
                }
                "--dport" => {
                    rule.dport = Some(value()?.parse().map_err(|_| conflict("port".into()))?)
                }
                "--dst-type" => {
                    let kind = value()?;
                    if kind != "LOCAL" {
                        return Err(conflict(format!("address type {}", kind)));
                    }
                    rule.local_destination = true;
                }
                "--comment" => tag = Some(value()?.parse::<RuleTag>()?),
                "-j" => {
                    target = Some(match value()?.as_str() {
                        "ACCEPT" => Target::Accept,
                        "MASQUERADE" => Target::Masquerade,
                        "DNAT" => Target::Dnat(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
                        other => Target::Jump(other.to_string()),
                    })
                }
                "--to-destination" => {
                    let to = value()?
                        .parse()
                        .map_err(|_| conflict("DNAT destination".into()))?;
                    target = Some(Target::Dnat(to));
                }
                other => return Err(conflict(format!("unsupported option '{}'", other))),
            }
            negated = false;
        }

        rule.tag = tag.ok_or_else(|| conflict("missing comment".into()))?;
        rule.target = match target {
            Some(Target::Dnat(to)) if to.port() == 0 => {
                return Err(conflict("DNAT without destination".into()));
            }
            Some(t) => t,
            None => return Err(conflict("missing target".into())),
        };
        Ok(rule)
    }
}

fn neg<T>(value: T, negated: bool) -> Neg<T> {
    Neg { value, negated }
}

/// Parses `a.b.c.d[/len]`; a bare address is a /32.
pub fn parse_cidr(s: &str) -> Result<Ipv4Cidr> {
    let (addr, len) = match s.split_once('/') {
        Some((addr, len)) => (addr, len.parse::<u8>().ok()),
        None => (s, Some(32)),
    };
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::RuleConflict(format!("invalid address '{}'", s)))?;
    len.and_then(|len| Ipv4Cidr::new(addr, len).ok())
        .ok_or_else(|| Error::RuleConflict(format!("invalid network '{}'", s)))
}

pub fn host(addr: Ipv4Addr) -> Ipv4Cidr {
    Ipv4Cidr::new_host(addr)
}

/// Splits an `iptables -S` line into arguments, honouring double quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut started = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                started = true;
            }
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        tokens.push(current);
    }
    tokens
}

/// Access to the live rule set. Implementations never cache.
pub trait Netfilter {
    /// `-S` lines of one chain, `None` if the chain does not exist.
    fn list(&self, table: Table, chain: &str) -> Result<Option<Vec<String>>>;

    fn create_chain(&self, table: Table, chain: &str) -> Result<()>;

    /// Inserts at the head of the chain.
    fn insert(&self, table: Table, chain: &str, args: &[String]) -> Result<()>;

    fn delete(&self, table: Table, chain: &str, args: &[String]) -> Result<()>;
}
