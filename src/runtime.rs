//! The container runtime capability.
//!
//! The lifecycle controller only ever talks to [`Runtime`]; [`LxcRuntime`]
//! implements it on top of the `lxc-*` command line tools.

use std::fmt;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use cidr::Ipv4Inet;

use crate::config::Volume;
use crate::error::{Error, Result};

/// Run state of an instance as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Absent,
    Stopped,
    Running,
    Frozen,
}

impl InstanceState {
    /// Running or frozen: the instance holds its address.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Frozen)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "ABSENT",
            Self::Stopped => "STOPPED",
            Self::Running => "RUNNING",
            Self::Frozen => "FROZEN",
        })
    }
}

/// Bridge attachment handed to the runtime at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub bridge: String,
    pub address: Ipv4Inet,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions<'s> {
    pub network: Option<NetworkParams>,
    pub volumes: &'s [Volume],
}

/// Low-level operations on a single instance, addressed by system name.
pub trait Runtime {
    fn state(&self, name: &str) -> Result<InstanceState>;

    fn create(&self, name: &str, template: &str, args: &[(String, String)]) -> Result<()>;

    fn clone_from(&self, source: &str, name: &str) -> Result<()>;

    fn destroy(&self, name: &str) -> Result<()>;

    fn start(&self, name: &str, options: &StartOptions<'_>) -> Result<()>;

    /// Requests a clean shutdown. Returns `false` if the instance is still
    /// up after `timeout`.
    fn shutdown(&self, name: &str, timeout: Duration) -> Result<bool>;

    /// Forced stop.
    fn kill(&self, name: &str) -> Result<()>;

    fn freeze(&self, name: &str) -> Result<()>;

    fn unfreeze(&self, name: &str) -> Result<()>;

    /// IPv4 addresses currently reported by the instance.
    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>>;

    /// Host path of the instance's root filesystem.
    fn rootfs(&self, name: &str) -> Result<PathBuf>;

    /// Persistent configuration file of the instance.
    fn config_file(&self, name: &str) -> PathBuf;

    /// Writes one key of the live resource controller.
    fn set_cgroup(&self, name: &str, key: &str, value: &str) -> Result<()>;
}

/// [`Runtime`] backed by the LXC tools.
#[derive(Debug, Clone)]
pub struct LxcRuntime {
    lxcpath: PathBuf,
}

impl LxcRuntime {
    pub fn new(lxcpath: impl Into<PathBuf>) -> Self {
        Self {
            lxcpath: lxcpath.into(),
        }
    }

    /// Fails with [`Error::RuntimeUnavailable`] if the tools are missing.
    pub fn probe(&self) -> Result<()> {
        self.lxc("lxc-info", "probe", "", &["--version"]).map(|_| ())
    }

    /// executes one lxc tool against the configured lxcpath
    fn lxc(&self, tool: &str, op: &'static str, name: &str, args: &[&str]) -> Result<String> {
        let mut command = Command::new(tool);
        if !name.is_empty() {
            command.arg("-P").arg(&self.lxcpath).arg("-n").arg(name);
        }
        command.args(args);
        tracing::trace!("running {:?}", command);

        let output = command.output().map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::RuntimeUnavailable(format!("{} not found", tool)),
            _ => Error::Runtime {
                op,
                name: name.to_string(),
                reason: format!("failed to execute {}: {}", tool, e),
            },
        })?;
        if !output.status.success() {
            return Err(Error::Runtime {
                op,
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.lxcpath.join(name)
    }
}

impl Runtime for LxcRuntime {
    fn state(&self, name: &str) -> Result<InstanceState> {
        if !self.config_file(name).exists() {
            return Ok(InstanceState::Absent);
        }
        let out = self.lxc("lxc-info", "state", name, &["-s", "-H"])?;
        match out.trim() {
            "RUNNING" | "STARTING" | "STOPPING" | "ABORTING" => Ok(InstanceState::Running),
            "FROZEN" | "FREEZING" | "THAWED" => Ok(InstanceState::Frozen),
            "STOPPED" => Ok(InstanceState::Stopped),
            other => Err(Error::Runtime {
                op: "state",
                name: name.to_string(),
                reason: format!("unknown state '{}'", other),
            }),
        }
    }

    fn create(&self, name: &str, template: &str, args: &[(String, String)]) -> Result<()> {
        let mut full = vec!["-t".to_string(), template.to_string(), "--".to_string()];
        for (key, value) in args {
            full.push(format!("--{}", key));
            full.push(value.clone());
        }
        let full: Vec<&str> = full.iter().map(String::as_str).collect();
        self.lxc("lxc-create", "create", name, &full)?;
        Ok(())
    }

    fn clone_from(&self, source: &str, name: &str) -> Result<()> {
        self.lxc("lxc-copy", "clone", source, &["-N", name])?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.lxc("lxc-destroy", "destroy", name, &[])?;
        Ok(())
    }

    fn start(&self, name: &str, options: &StartOptions<'_>) -> Result<()> {
        let mut defines = Vec::new();
        if let Some(net) = &options.network {
            defines.push("lxc.net.0.type=veth".to_string());
            defines.push(format!("lxc.net.0.link={}", net.bridge));
            defines.push("lxc.net.0.flags=up".to_string());
            defines.push(format!("lxc.net.0.ipv4.address={}", net.address));
            defines.push(format!("lxc.net.0.ipv4.gateway={}", net.gateway));
        }
        for volume in options.volumes {
            let inside = volume
                .container
                .strip_prefix("/")
                .unwrap_or(&volume.container);
            defines.push(format!(
                "lxc.mount.entry={} {} none bind,create=dir 0 0",
                volume.host.display(),
                inside.display()
            ));
        }

        let mut args = vec!["-d"];
        for define in &defines {
            args.push("-s");
            args.push(define);
        }
        self.lxc("lxc-start", "start", name, &args)?;
        Ok(())
    }

    fn shutdown(&self, name: &str, timeout: Duration) -> Result<bool> {
        let secs = timeout.as_secs().to_string();
        match self.lxc("lxc-stop", "shutdown", name, &["--nokill", "-t", &secs]) {
            Ok(_) => Ok(self.state(name)? == InstanceState::Stopped),
            Err(Error::Runtime { reason, .. }) => {
                tracing::debug!("clean shutdown of {} failed: {}", name, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn kill(&self, name: &str) -> Result<()> {
        self.lxc("lxc-stop", "kill", name, &["-k"])?;
        Ok(())
    }

    fn freeze(&self, name: &str) -> Result<()> {
        self.lxc("lxc-freeze", "freeze", name, &[])?;
        Ok(())
    }

    fn unfreeze(&self, name: &str) -> Result<()> {
        self.lxc("lxc-unfreeze", "unfreeze", name, &[])?;
        Ok(())
    }

    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let out = self.lxc("lxc-info", "addresses", name, &["-i", "-H"])?;
        Ok(out
            .split_whitespace()
            .filter_map(|a| a.parse::<Ipv4Addr>().ok())
            .collect())
    }

    fn rootfs(&self, name: &str) -> Result<PathBuf> {
        let config = self.config_file(name);
        let text = std::fs::read_to_string(&config).map_err(|e| Error::io(&config, e))?;
        Ok(rootfs_from_config(&text).unwrap_or_else(|| self.instance_dir(name).join("rootfs")))
    }

    fn config_file(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join("config")
    }

    fn set_cgroup(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.lxc("lxc-cgroup", "cgroup", name, &[key, value])?;
        Ok(())
    }
}

/// Extracts the rootfs directory from an LXC config file.
fn rootfs_from_config(text: &str) -> Option<PathBuf> {
    text.lines()
        .filter_map(|l| l.split_once('='))
        .find(|(key, _)| matches!(key.trim(), "lxc.rootfs.path" | "lxc.rootfs"))
        .map(|(_, value)| {
            let value = value.trim();
            // backing store prefix, e.g. "dir:" or "overlay:lower:upper"
            let path = match value.split_once(':') {
                Some((_, rest)) if !value.starts_with('/') => rest.rsplit(':').next().unwrap_or(rest),
                _ => value,
            };
            Path::new(path).to_path_buf()
        })
}
