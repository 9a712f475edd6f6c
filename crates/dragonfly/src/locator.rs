//! Weighted list of supernodes.
use std::{fmt::Display, str::FromStr};

use rand::seq::SliceRandom;

use crate::{
    constants::{DEFAULT_SUPERNODE_PORT, DEFAULT_SUPERNODE_WEIGHT},
    error::Error,
};

/// One supernode, parsed from `host[:port][=weight]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupernodeEntry {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl SupernodeEntry {
    /// `host:port`, the form used in every request.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for SupernodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}={}", self.host, self.port, self.weight)
    }
}

impl FromStr for SupernodeEntry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            |why: &str| Error::InvalidValue(s.to_owned(), why.to_owned());

        let s = s.trim();
        let (addr, weight) = match s.split_once('=') {
            Some((addr, weight)) => {
                let weight: u32 =
                    weight.trim().parse().map_err(|_| invalid("bad weight"))?;
                if weight == 0 {
                    return Err(invalid("weight must be positive"));
                }
                (addr, weight)
            }
            None => (s, DEFAULT_SUPERNODE_WEIGHT),
        };

        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
                (host, port)
            }
            None => (addr, DEFAULT_SUPERNODE_PORT),
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self { host: host.to_owned(), port, weight })
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Parse the configured nodes, divide the weights by their greatest common
/// divisor and repeat every entry `weight` times, in random order.
pub fn weighted_nodes(nodes: &[String]) -> Result<Vec<SupernodeEntry>, Error> {
    let entries = nodes
        .iter()
        .map(|n| n.parse::<SupernodeEntry>())
        .collect::<Result<Vec<_>, _>>()?;

    let divisor = entries.iter().fold(0, |acc, e| gcd(acc, e.weight)).max(1);

    let mut weighted = Vec::new();
    for mut entry in entries {
        entry.weight /= divisor;
        for _ in 0..entry.weight {
            weighted.push(entry.clone());
        }
    }

    weighted.shuffle(&mut rand::thread_rng());
    Ok(weighted)
}

/// Cursor over the weighted supernode list. Entries already handed out are
/// never visited again, so whatever is left after a successful registration
/// is the pool used to migrate.
#[derive(Debug, Clone, Default)]
pub struct Locator {
    nodes: Vec<SupernodeEntry>,
    cursor: usize,
}

impl Locator {
    pub fn new(mut nodes: Vec<SupernodeEntry>) -> Self {
        // a lone supernode gets a second chance on migration
        if nodes.len() == 1 {
            nodes.push(nodes[0].clone());
        }
        Self { nodes, cursor: 0 }
    }

    pub fn from_config(nodes: &[String]) -> Result<Self, Error> {
        Ok(Self::new(weighted_nodes(nodes)?))
    }

    pub fn next(&mut self) -> Option<SupernodeEntry> {
        let node = self.nodes.get(self.cursor).cloned();
        if node.is_some() {
            self.cursor += 1;
        }
        node
    }

    /// Entries not handed out yet.
    pub fn remainder(&self) -> &[SupernodeEntry] {
        &self.nodes[self.cursor.min(self.nodes.len())..]
    }

    pub fn all(&self) -> &[SupernodeEntry] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
