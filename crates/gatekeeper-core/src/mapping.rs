//! Secret-digest → endpoint mapping table.
//!
//! File format, one mapping per line:
//!
//! ```text
//! # redis on the private network
//! edeaaff3f1774ad2888673770c6d64097e391bc362d7d6fb34982ddf0efd18cb = 10.0.0.5:6379
//! ```
//!
//! `#` starts a comment. Tabs count as spaces. Digests are normalised to
//! lowercase so they match the listener's computed digests regardless of how
//! the operator wrote them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::crypto::is_digest;

/// Where a digest routes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.contains(':') {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// Immutable digest → endpoint table.
///
/// One digest maps to exactly one endpoint; many digests may share one.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: HashMap<String, Endpoint>,
}

impl MappingTable {
    /// Build a table from already-validated entries.
    ///
    /// Digests are lowercased. Fails on a malformed or repeated digest.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = (S, Endpoint)>,
        S: AsRef<str>,
    {
        let mut table = Self::default();
        for (line, (digest, endpoint)) in entries.into_iter().enumerate() {
            table.insert(line + 1, digest.as_ref(), endpoint)?;
        }
        Ok(table)
    }

    /// Parse mapping text.
    pub fn parse(contents: &str) -> Result<Self, MappingError> {
        let mut table = Self::default();

        for (idx, raw) in contents.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw).replace('\t', " ");
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (digest, target) = line
                .split_once('=')
                .ok_or_else(|| MappingError::Syntax(line_no, line.to_string()))?;
            let digest = digest.trim();
            let target = target.trim();

            let (addr, port) = target
                .rsplit_once(':')
                .ok_or_else(|| MappingError::Syntax(line_no, line.to_string()))?;
            let addr = addr.trim().trim_start_matches('[').trim_end_matches(']');
            if addr.is_empty() {
                return Err(MappingError::Syntax(line_no, line.to_string()));
            }

            let port = parse_port(line_no, port.trim())?;
            table.insert(line_no, digest, Endpoint::new(addr, port))?;
        }

        Ok(table)
    }

    /// Read and parse a mapping file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MappingError::ReadFailed(path.to_path_buf(), e))?;
        Self::parse(&text)
    }

    /// Look up a digest. The digest is expected in lowercase hex.
    pub fn lookup(&self, digest: &str) -> Option<&Endpoint> {
        self.entries.get(digest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Endpoint)> {
        self.entries.iter().map(|(d, e)| (d.as_str(), e))
    }

    fn insert(&mut self, line_no: usize, digest: &str, endpoint: Endpoint) -> Result<(), MappingError> {
        if !is_digest(digest) {
            return Err(MappingError::BadDigest(line_no, digest.to_string()));
        }
        let digest = digest.to_ascii_lowercase();
        if self.entries.contains_key(&digest) {
            return Err(MappingError::Duplicate(line_no, digest));
        }
        self.entries.insert(digest, endpoint);
        Ok(())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

fn parse_port(line_no: usize, port: &str) -> Result<u16, MappingError> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MappingError::BadPort(line_no, port.to_string()));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(MappingError::BadPort(line_no, port.to_string())),
        Ok(p) => Ok(p),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("line {0}: cannot parse \"{1}\", expected sha256sum = addr:port")]
    Syntax(usize, String),
    #[error("line {0}: \"{1}\" is not a 64-character hex SHA-256 digest")]
    BadDigest(usize, String),
    #[error("line {0}: digest {1} is defined more than once")]
    Duplicate(usize, String),
    #[error("line {0}: port \"{1}\" must be an integer in 1..=65535")]
    BadPort(usize, String),
}
