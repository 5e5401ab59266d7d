use std::process::{Command, Output};

use crate::error::{Error, Result};
use crate::netfilter::{Netfilter, Table};

/// [`Netfilter`] backed by the `iptables` binary.
#[derive(Debug)]
pub struct Iptables {
    binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }
}

impl Iptables {
    /// executes iptables on a table with arguments
    fn run(&self, table: Table, args: &[&str]) -> Result<Output> {
        let mut command = Command::new(&self.binary);
        command.arg("-w").arg("-t").arg(table.as_str()).args(args);
        tracing::trace!("running {:?}", command);
        command
            .output()
            .map_err(|e| Error::Netfilter(format!("failed to execute {}: {}", self.binary, e)))
    }

    fn run_checked(&self, table: Table, args: &[&str]) -> Result<Output> {
        let output = self.run(table, args)?;
        if !output.status.success() {
            return Err(Error::Netfilter(format!(
                "{} -t {} {}: {}",
                self.binary,
                table.as_str(),
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

impl Netfilter for Iptables {
    fn list(&self, table: Table, chain: &str) -> Result<Option<Vec<String>>> {
        let output = self.run(table, &["-S", chain])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No chain/target/match by that name") {
                return Ok(None);
            }
            return Err(Error::Netfilter(format!(
                "cannot list {} {}: {}",
                table.as_str(),
                chain,
                stderr.trim()
            )));
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect(),
        ))
    }

    fn create_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.run_checked(table, &["-N", chain])?;
        Ok(())
    }

    fn insert(&self, table: Table, chain: &str, args: &[String]) -> Result<()> {
        let mut full = vec!["-I", chain];
        full.extend(args.iter().map(String::as_str));
        self.run_checked(table, &full)?;
        Ok(())
    }

    fn delete(&self, table: Table, chain: &str, args: &[String]) -> Result<()> {
        let mut full = vec!["-D", chain];
        full.extend(args.iter().map(String::as_str));
        self.run_checked(table, &full)?;
        Ok(())
    }
}
