//! Line-preserving editor for `/etc/hosts`.
//!
//! Entries written by locker carry a `# locker:<project>:<instance>:link`
//! comment. Rows locker does not rewrite are kept byte for byte.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::Path;

use crate::error::{Error, Result};

/// Address the Debian family binds the local hostname to.
pub const LOCAL_HOSTNAME_ADDRESS: &str = "127.0.1.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostsEntry {
    pub address: IpAddr,
    pub names: Vec<String>,
    pub comment: Option<String>,
}

impl HostsEntry {
    pub fn new(address: IpAddr, names: Vec<String>, comment: Option<String>) -> Self {
        Self {
            address,
            names,
            comment,
        }
    }
}

impl fmt::Display for HostsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.address, self.names.join(" "))?;
        if let Some(comment) = &self.comment {
            write!(f, " # {}", comment)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// A parsed row and, while it is unmodified, the text it was read from.
    Entry(HostsEntry, Option<String>),
    /// Blank lines, comments and anything that does not parse.
    Verbatim(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostsFile {
    lines: Vec<Line>,
}

impl HostsFile {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(parse_line).collect(),
        }
    }

    /// Reads `path`; a missing file is an empty hosts file.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::write(path, self.to_string()).map_err(|e| Error::io(path, e))
    }

    pub fn entries(&self) -> impl Iterator<Item = &HostsEntry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e, _) => Some(e),
            Line::Verbatim(_) => None,
        })
    }

    /// Entries whose comment is exactly `tag`.
    pub fn tagged<'s>(&'s self, tag: &'s str) -> impl Iterator<Item = &'s HostsEntry> + 's {
        self.entries()
            .filter(move |e| e.comment.as_deref() == Some(tag))
    }

    /// Drops every entry tagged `tag`. Returns how many went.
    pub fn remove_tagged(&mut self, tag: &str) -> usize {
        let before = self.lines.len();
        self.lines.retain(|l| !is_tagged(l, tag));
        before - self.lines.len()
    }

    /// Replaces the entries tagged `tag` with `entries`, which get the tag.
    /// New entries take the position of the first old one, or go last.
    pub fn replace_tagged(&mut self, tag: &str, entries: Vec<HostsEntry>) {
        let at = self
            .lines
            .iter()
            .position(|l| is_tagged(l, tag))
            .unwrap_or(self.lines.len());
        self.remove_tagged(tag);
        let tagged = entries.into_iter().map(|mut e| {
            e.comment = Some(tag.to_string());
            Line::Entry(e, None)
        });
        let tail = self.lines.split_off(at);
        self.lines.extend(tagged);
        self.lines.extend(tail);
    }

    /// Sets the names of the first entry for `address`, appending one if
    /// there is none.
    pub fn set_names(&mut self, address: IpAddr, names: Vec<String>) {
        for line in &mut self.lines {
            if let Line::Entry(entry, raw) = line {
                if entry.address == address {
                    entry.names = names;
                    *raw = None;
                    return;
                }
            }
        }
        self.lines
            .push(Line::Entry(HostsEntry::new(address, names, None), None));
    }
}

impl fmt::Display for HostsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            match line {
                Line::Entry(_, Some(raw)) | Line::Verbatim(raw) => writeln!(f, "{}", raw)?,
                Line::Entry(e, None) => writeln!(f, "{}", e)?,
            }
        }
        Ok(())
    }
}

fn is_tagged(line: &Line, tag: &str) -> bool {
    matches!(line, Line::Entry(e, _) if e.comment.as_deref() == Some(tag))
}

fn parse_line(raw: &str) -> Line {
    let (body, comment) = match raw.split_once('#') {
        Some((body, comment)) => (body, Some(comment.trim().to_string())),
        None => (raw, None),
    };
    let mut fields = body.split_whitespace();
    let Some(address) = fields.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
        return Line::Verbatim(raw.to_string());
    };
    let names: Vec<String> = fields.map(str::to_string).collect();
    if names.is_empty() {
        return Line::Verbatim(raw.to_string());
    }
    Line::Entry(
        HostsEntry::new(address, names, comment.filter(|c| !c.is_empty())),
        Some(raw.to_string()),
    )
}
