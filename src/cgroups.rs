use std::fs;

use regex::Regex;

use crate::config::CgroupSetting;
use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// Keys that only exist on the unified (v2) hierarchy.
const UNIFIED_ONLY: &[&str] = &[
    "memory.max",
    "memory.high",
    "memory.low",
    "memory.min",
    "memory.swap.max",
    "cpu.max",
    "cpu.weight",
    "io.max",
    "io.weight",
];

/// Memory keys whose value must be a byte size.
const MEMORY_LIMITS: &[&str] = &[
    "memory.max",
    "memory.high",
    "memory.limit_in_bytes",
    "memory.memsw.limit_in_bytes",
    "memory.soft_limit_in_bytes",
];

/// What one apply did, key by key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CgroupReport {
    pub live: Vec<String>,
    pub persisted: Vec<String>,
    pub failed: Vec<String>,
}

/// Writes resource limits to the live controller of an instance and to its
/// configuration file. Every key is handled on its own; nothing is rolled
/// back.
pub struct CgroupApplier<'a> {
    runtime: &'a dyn Runtime,
}

impl<'a> CgroupApplier<'a> {
    pub fn new(runtime: &'a dyn Runtime) -> Self {
        Self { runtime }
    }

    /// Applies `settings` to instance `name`. The live write is only
    /// attempted when `running` is set.
    pub fn apply(&self, name: &str, running: bool, settings: &[CgroupSetting]) -> Result<CgroupReport> {
        let mut report = CgroupReport::default();
        let config = self.runtime.config_file(name);

        for setting in settings {
            if let Err(e) = validate(setting) {
                tracing::warn!("skipping cgroup {}: {}", setting.key, e);
                report.failed.push(setting.key.clone());
                continue;
            }

            if running {
                match self.runtime.set_cgroup(name, &setting.key, &setting.value) {
                    Ok(()) => {
                        tracing::info!("cgroup {} = {}", setting.key, setting.value);
                        report.live.push(setting.key.clone());
                    }
                    Err(e) => tracing::warn!("cannot set cgroup {} live: {}", setting.key, e),
                }
            }

            let text = match fs::read_to_string(&config) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("{}", Error::io(&config, e));
                    report.failed.push(setting.key.clone());
                    continue;
                }
            };
            let updated = persist(&text, &config_key(&setting.key), &setting.value);
            if updated != text {
                if let Err(e) = fs::write(&config, updated) {
                    tracing::warn!("{}", Error::io(&config, e));
                    report.failed.push(setting.key.clone());
                    continue;
                }
                tracing::debug!("persisted {} in {}", setting.key, config.display());
            }
            report.persisted.push(setting.key.clone());
        }
        Ok(report)
    }
}

/// Configuration key for a controller file.
fn config_key(key: &str) -> String {
    if UNIFIED_ONLY.contains(&key) {
        format!("lxc.cgroup2.{}", key)
    } else {
        format!("lxc.cgroup.{}", key)
    }
}

/// Replaces the first `key = ...` line, dropping later duplicates, or
/// appends one.
fn persist(text: &str, key: &str, value: &str) -> String {
    let line = format!("{} = {}", key, value);
    let mut out = Vec::new();
    let mut written = false;
    for existing in text.lines() {
        let matches = existing
            .split_once('=')
            .is_some_and(|(k, _)| k.trim() == key);
        if !matches {
            out.push(existing.to_string());
        } else if !written {
            out.push(line.clone());
            written = true;
        }
    }
    if !written {
        out.push(line);
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

fn validate(setting: &CgroupSetting) -> Result<()> {
    if MEMORY_LIMITS.contains(&setting.key.as_str()) {
        validate_memory_limit(&setting.value)?;
    }
    Ok(())
}

/// Validates a memory limit string.
///
/// Supported formats:
/// - "max" (no limit, unified hierarchy), or "-1" (no limit, legacy)
/// - Decimal number of bytes (e.g., "1048576")
/// - Number with unit suffix: K, M, G
/// - Number with IEC unit suffix: Ki, Mi, Gi
fn validate_memory_limit(limit: &str) -> Result<()> {
    let re = Regex::new(r"^(?i:max|-1|[1-9]\d*(?:k|m|g|ki|mi|gi)?)$")
        .map_err(|e| Error::Config(e.to_string()))?;
    if !re.is_match(limit) {
        return Err(Error::Config(format!(
            "unsupported memory limit '{}'. Use: max, bytes, or units K/M/G/Ki/Mi/Gi",
            limit
        )));
    }
    Ok(())
}
