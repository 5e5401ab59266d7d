//! In-memory stand-ins for the host capabilities, used by unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use cidr::{Ipv4Cidr, Ipv4Inet};
use tempfile::TempDir;

use crate::error::{Error, Result};
use crate::net::{Bridge, HostNetwork};
use crate::netfilter::{LOCKER_FORWARD, LOCKER_PREROUTING, Netfilter, Table, tokenize};
use crate::runtime::{InstanceState, NetworkParams, Runtime, StartOptions};

const BUILTIN_CHAINS: [&str; 5] = ["PREROUTING", "POSTROUTING", "FORWARD", "INPUT", "OUTPUT"];

/// Ordered record of side effects, shared between fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.0.borrow().iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.borrow().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

/// Builds the bridge a project would get on `cidr`.
pub fn bridge(project: &str, cidr: &str) -> Bridge {
    let subnet: Ipv4Cidr = cidr.parse().unwrap();
    Bridge {
        name: format!("locker_{}", project),
        subnet,
        gateway: crate::subnet::gateway(&subnet).unwrap(),
    }
}

#[derive(Debug, Default)]
struct Link {
    up: bool,
    bridge: bool,
}

/// Interfaces and bridges of a pretend host.
#[derive(Debug, Default)]
pub struct FakeHost {
    links: RefCell<BTreeMap<String, Link>>,
    addresses: RefCell<Vec<(String, Ipv4Inet)>>,
}

impl FakeHost {
    pub fn new(interfaces: &[(&str, &str)]) -> Self {
        let host = Self::default();
        for (name, inet) in interfaces {
            host.links
                .borrow_mut()
                .insert(name.to_string(), Link { up: true, bridge: false });
            host.addresses
                .borrow_mut()
                .push((name.to_string(), inet.parse().unwrap()));
        }
        host
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.links.borrow().get(name).is_some_and(|l| l.up)
    }
}

impl HostNetwork for FakeHost {
    fn interface_addresses(&self) -> Result<Vec<(String, Ipv4Inet)>> {
        Ok(self.addresses.borrow().clone())
    }

    fn bridges(&self) -> Result<Vec<String>> {
        Ok(self
            .links
            .borrow()
            .iter()
            .filter(|(_, l)| l.bridge)
            .map(|(n, _)| n.clone())
            .collect())
    }

    fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.links.borrow().contains_key(name))
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        let mut links = self.links.borrow_mut();
        if links.contains_key(name) {
            return Err(Error::Bridge {
                bridge: name.to_string(),
                reason: "File exists".into(),
            });
        }
        links.insert(name.to_string(), Link { up: false, bridge: true });
        Ok(())
    }

    fn add_address(&self, name: &str, address: &Ipv4Inet) -> Result<()> {
        self.addresses.borrow_mut().push((name.to_string(), *address));
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        match self.links.borrow_mut().get_mut(name) {
            Some(link) => {
                link.up = true;
                Ok(())
            }
            None => Err(Error::Bridge {
                bridge: name.to_string(),
                reason: "Cannot find device".into(),
            }),
        }
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.links.borrow_mut().remove(name);
        self.addresses.borrow_mut().retain(|(n, _)| n != name);
        Ok(())
    }
}

/// Chains and rules of a pretend netfilter, stored as `-S` arguments.
#[derive(Debug, Default)]
pub struct FakeNetfilter {
    chains: RefCell<BTreeMap<(String, String), Vec<Vec<String>>>>,
    deny_chains: RefCell<bool>,
    failing: RefCell<BTreeSet<(String, String)>>,
    journal: Journal,
}

fn key(table: Table, chain: &str) -> (String, String) {
    (table.as_str().to_string(), chain.to_string())
}

fn comment_of(args: &[String]) -> Option<&str> {
    args.windows(2)
        .find(|w| w[0] == "--comment")
        .map(|w| w[1].as_str())
}

impl FakeNetfilter {
    pub fn recording(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn with_locker_chains() -> Self {
        let fw = Self::default();
        fw.create_chain(Table::Nat, LOCKER_PREROUTING).unwrap();
        fw.create_chain(Table::Filter, LOCKER_FORWARD).unwrap();
        fw
    }

    fn exists(&self, table: Table, chain: &str) -> bool {
        BUILTIN_CHAINS.contains(&chain) || self.chains.borrow().contains_key(&key(table, chain))
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.exists(table, chain)
    }

    pub fn rules(&self, table: Table, chain: &str) -> Vec<Vec<String>> {
        self.chains
            .borrow()
            .get(&key(table, chain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn deny_chain_creation(&self) {
        *self.deny_chains.borrow_mut() = true;
    }

    pub fn fail_inserts_in(&self, table: Table, chain: &str) {
        self.failing.borrow_mut().insert(key(table, chain));
    }

    /// Number of rules in any chain whose comment is exactly `tag`.
    pub fn tagged_count(&self, tag: &str) -> usize {
        self.chains
            .borrow()
            .values()
            .flatten()
            .filter(|args| comment_of(args) == Some(tag))
            .count()
    }

    /// Deletes rules behind locker's back.
    pub fn drop_tagged(&self, tag: &str) {
        for rules in self.chains.borrow_mut().values_mut() {
            rules.retain(|args| comment_of(args) != Some(tag));
        }
    }

    /// Appends a rule given as an `-A <chain> ...` line.
    pub fn push_raw(&self, table: Table, chain: &str, line: &str) {
        let tokens = tokenize(line);
        assert_eq!(tokens[1], chain);
        self.chains
            .borrow_mut()
            .entry(key(table, chain))
            .or_default()
            .push(tokens[2..].to_vec());
    }
}

impl Netfilter for FakeNetfilter {
    fn list(&self, table: Table, chain: &str) -> Result<Option<Vec<String>>> {
        if !self.exists(table, chain) {
            return Ok(None);
        }
        let lines = self
            .rules(table, chain)
            .into_iter()
            .map(|args| {
                let rendered: Vec<String> = args
                    .iter()
                    .enumerate()
                    .map(|(i, a)| {
                        if i > 0 && args[i - 1] == "--comment" {
                            format!("\"{}\"", a)
                        } else {
                            a.clone()
                        }
                    })
                    .collect();
                format!("-A {} {}", chain, rendered.join(" "))
            })
            .collect();
        Ok(Some(lines))
    }

    fn create_chain(&self, table: Table, chain: &str) -> Result<()> {
        if *self.deny_chains.borrow() {
            return Err(Error::Netfilter("Permission denied (you must be root)".into()));
        }
        if self.exists(table, chain) {
            return Err(Error::Netfilter("Chain already exists".into()));
        }
        self.chains.borrow_mut().insert(key(table, chain), Vec::new());
        Ok(())
    }

    fn insert(&self, table: Table, chain: &str, args: &[String]) -> Result<()> {
        if !self.exists(table, chain) || self.failing.borrow().contains(&key(table, chain)) {
            return Err(Error::Netfilter(format!("cannot insert into {}", chain)));
        }
        self.journal.record(format!(
            "netfilter insert {}",
            comment_of(args).unwrap_or_default()
        ));
        self.chains
            .borrow_mut()
            .entry(key(table, chain))
            .or_default()
            .insert(0, args.to_vec());
        Ok(())
    }

    fn delete(&self, table: Table, chain: &str, args: &[String]) -> Result<()> {
        let mut chains = self.chains.borrow_mut();
        let rules = chains.entry(key(table, chain)).or_default();
        let Some(index) = rules.iter().position(|r| r == args) else {
            return Err(Error::Netfilter("Bad rule (does a matching rule exist in that chain?)".into()));
        };
        rules.remove(index);
        self.journal.record(format!(
            "netfilter delete {}",
            comment_of(args).unwrap_or_default()
        ));
        Ok(())
    }
}

#[derive(Debug)]
struct FakeInstance {
    state: InstanceState,
    addresses: Vec<Ipv4Addr>,
    network: Option<NetworkParams>,
    cgroup: BTreeMap<String, String>,
}

/// Instances of a pretend LXC host. Root filesystems live in a temporary
/// directory so file edits can be inspected.
#[derive(Debug)]
pub struct FakeRuntime {
    root: TempDir,
    journal: Journal,
    instances: RefCell<BTreeMap<String, FakeInstance>>,
    stubborn: RefCell<BTreeSet<String>>,
    silent: RefCell<BTreeSet<String>>,
}

impl FakeRuntime {
    pub fn new(journal: Journal) -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            journal,
            instances: RefCell::new(BTreeMap::new()),
            stubborn: RefCell::new(BTreeSet::new()),
            silent: RefCell::new(BTreeSet::new()),
        }
    }

    /// Adds a stopped instance with a minimal root filesystem.
    pub fn add(&self, name: &str) {
        let etc = self.root.path().join(name).join("rootfs/etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(
            etc.join("hosts"),
            format!("127.0.0.1\tlocalhost\n127.0.1.1\t{}\n", name),
        )
        .unwrap();
        fs::write(etc.join("hostname"), format!("{}\n", name)).unwrap();
        fs::write(
            self.config_file(name),
            format!("lxc.uts.name = {}\nlxc.cgroup.cpu.shares = 1024\n", name),
        )
        .unwrap();
        self.instances.borrow_mut().insert(
            name.to_string(),
            FakeInstance {
                state: InstanceState::Stopped,
                addresses: Vec::new(),
                network: None,
                cgroup: BTreeMap::new(),
            },
        );
    }

    /// Adds an instance that is already running with `address`.
    pub fn add_running(&self, name: &str, address: Ipv4Addr) {
        self.add(name);
        let mut instances = self.instances.borrow_mut();
        let instance = instances.get_mut(name).unwrap();
        instance.state = InstanceState::Running;
        instance.addresses = vec![address];
    }

    /// The instance ignores clean shutdown requests.
    pub fn stubborn(&self, name: &str) {
        self.stubborn.borrow_mut().insert(name.to_string());
    }

    /// The instance never reports an address.
    pub fn silent(&self, name: &str) {
        self.silent.borrow_mut().insert(name.to_string());
    }

    pub fn network(&self, name: &str) -> Option<NetworkParams> {
        self.instances.borrow().get(name).and_then(|i| i.network.clone())
    }

    pub fn live_cgroup(&self, name: &str, key: &str) -> Option<String> {
        self.instances
            .borrow()
            .get(name)
            .and_then(|i| i.cgroup.get(key).cloned())
    }

    pub fn read(&self, name: &str, path: &str) -> String {
        fs::read_to_string(self.root.path().join(name).join("rootfs").join(path)).unwrap_or_default()
    }

    fn with<T>(&self, name: &str, op: &'static str, f: impl FnOnce(&mut FakeInstance) -> Result<T>) -> Result<T> {
        let mut instances = self.instances.borrow_mut();
        match instances.get_mut(name) {
            Some(instance) => f(instance),
            None => Err(Error::Runtime {
                op,
                name: name.to_string(),
                reason: "no such container".into(),
            }),
        }
    }
}

fn refuse(op: &'static str, name: &str, reason: &str) -> Error {
    Error::Runtime {
        op,
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

impl Runtime for FakeRuntime {
    fn state(&self, name: &str) -> Result<InstanceState> {
        Ok(self
            .instances
            .borrow()
            .get(name)
            .map_or(InstanceState::Absent, |i| i.state))
    }

    fn create(&self, name: &str, template: &str, _args: &[(String, String)]) -> Result<()> {
        self.journal.record(format!("runtime create {}", name));
        if template == "missing" {
            return Err(refuse("create", name, "template not found"));
        }
        self.add(name);
        Ok(())
    }

    fn clone_from(&self, source: &str, name: &str) -> Result<()> {
        self.journal.record(format!("runtime clone {} {}", source, name));
        if !self.instances.borrow().contains_key(source) {
            return Err(refuse("clone", source, "no such container"));
        }
        self.add(name);
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.journal.record(format!("runtime destroy {}", name));
        self.instances.borrow_mut().remove(name);
        let _ = fs::remove_dir_all(self.root.path().join(name));
        Ok(())
    }

    fn start(&self, name: &str, options: &StartOptions<'_>) -> Result<()> {
        self.journal.record(format!("runtime start {}", name));
        let silent = self.silent.borrow().contains(name);
        self.with(name, "start", |i| {
            if i.state != InstanceState::Stopped {
                return Err(refuse("start", name, "container is not stopped"));
            }
            i.state = InstanceState::Running;
            i.network = options.network.clone();
            if !silent {
                i.addresses = options.network.iter().map(|n| n.address.address()).collect();
            }
            Ok(())
        })
    }

    fn shutdown(&self, name: &str, _timeout: Duration) -> Result<bool> {
        self.journal.record(format!("runtime shutdown {}", name));
        if self.stubborn.borrow().contains(name) {
            return Ok(false);
        }
        self.with(name, "shutdown", |i| {
            i.state = InstanceState::Stopped;
            i.addresses.clear();
            Ok(true)
        })
    }

    fn kill(&self, name: &str) -> Result<()> {
        self.journal.record(format!("runtime kill {}", name));
        self.with(name, "kill", |i| {
            i.state = InstanceState::Stopped;
            i.addresses.clear();
            Ok(())
        })
    }

    fn freeze(&self, name: &str) -> Result<()> {
        self.journal.record(format!("runtime freeze {}", name));
        self.with(name, "freeze", |i| {
            i.state = InstanceState::Frozen;
            Ok(())
        })
    }

    fn unfreeze(&self, name: &str) -> Result<()> {
        self.journal.record(format!("runtime unfreeze {}", name));
        self.with(name, "unfreeze", |i| {
            i.state = InstanceState::Running;
            Ok(())
        })
    }

    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        Ok(self
            .instances
            .borrow()
            .get(name)
            .filter(|i| i.state.is_active())
            .map(|i| i.addresses.clone())
            .unwrap_or_default())
    }

    fn rootfs(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.path().join(name).join("rootfs"))
    }

    fn config_file(&self, name: &str) -> PathBuf {
        self.root.path().join(name).join("config")
    }

    fn set_cgroup(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.journal.record(format!("runtime cgroup {} {}", name, key));
        self.with(name, "cgroup", |i| {
            if !i.state.is_active() {
                return Err(refuse("cgroup", name, "container is not running"));
            }
            if key.starts_with("bogus") {
                return Err(refuse("cgroup", name, "invalid key"));
            }
            i.cgroup.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }
}

/// Every fake capability of one pretend host, sharing a journal.
pub struct TestHost {
    pub journal: Journal,
    pub runtime: FakeRuntime,
    pub netfilter: FakeNetfilter,
    pub network: FakeHost,
}

impl TestHost {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            runtime: FakeRuntime::new(journal.clone()),
            netfilter: FakeNetfilter::recording(journal.clone()),
            network: FakeHost::new(&[("eth0", "192.168.1.20/24")]),
            journal,
        }
    }
}
