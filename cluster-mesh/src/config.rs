//! Peer-list loading.
//!
//! The peer list is a line-oriented text file with one `id,address` record
//! per line. Whitespace around each field is ignored, and blank lines or
//! lines starting with `#` are skipped:
//!
//! ```text
//! # id, address
//! 1, 127.0.0.1:5001
//! 2, 127.0.0.1:5002
//! ```
//!
//! Addresses written in the `tcp://host:port` form are accepted and stored
//! without the scheme. The resulting [`PeerTable`] is immutable and is shared
//! behind an `Arc` by every component that needs it.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;

/// Identity of a cluster member.
pub type NodeId = i64;

/// Logical target meaning "every node in the table, including the sender".
///
/// Never valid as a real node id and never written to the wire.
pub const BROADCAST: NodeId = -1;

const TCP_SCHEME: &str = "tcp://";

/// Errors produced while reading or validating a peer list.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read peer list {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("line {line}: node id '{value}' is not an integer")]
    MalformedId { line: usize, value: String },

    #[error("line {line}: expected a record of the form 'id,address'")]
    MissingAddress { line: usize },

    #[error("line {line}: node id {id} is reserved for broadcast", id = BROADCAST)]
    ReservedId { line: usize },

    #[error("line {line}: {id}: duplicate node id, node ids must be unique")]
    DuplicateId { line: usize, id: NodeId },

    #[error("line {line}: {address}: duplicate address, addresses must be unique")]
    DuplicateAddress { line: usize, address: String },

    #[error("peer list contains no nodes")]
    Empty,
}

/// One record of the peer list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub address: String,
}

/// Immutable mapping from node id to address, in file order.
///
/// File order matters: broadcast fan-out and the load harness's unicast ring
/// both walk the table front to back.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: Vec<Peer>,
    index: HashMap<NodeId, usize>,
}

impl PeerTable {
    /// Reads and parses the peer list at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses peer-list text.
    ///
    /// Every record is checked against all previously accepted records for
    /// both a repeated id and a repeated address.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut table = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let record = raw.trim();
            if record.is_empty() || record.starts_with('#') {
                continue;
            }
            let peer = parse_record(record, line)?;
            table.insert(peer, line)?;
        }

        if table.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(table)
    }

    /// Builds a table from already-split records, applying the same
    /// validation as [`PeerTable::parse`]. Record `n` reports as line `n + 1`.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (NodeId, S)>,
        S: AsRef<str>,
    {
        let mut table = Self::default();
        for (index, (id, address)) in entries.into_iter().enumerate() {
            let line = index + 1;
            let peer = build_peer(id, address.as_ref(), line)?;
            table.insert(peer, line)?;
        }

        if table.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Node ids in file order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.peers.iter().map(|peer| peer.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.iter()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Peer> {
        self.index.get(&id).map(|&position| &self.peers[position])
    }

    pub fn address_of(&self, id: NodeId) -> Option<&str> {
        self.get(id).map(|peer| peer.address.as_str())
    }

    fn insert(&mut self, peer: Peer, line: usize) -> Result<(), ConfigError> {
        if self.index.contains_key(&peer.id) {
            return Err(ConfigError::DuplicateId { line, id: peer.id });
        }
        if self.peers.iter().any(|known| known.address == peer.address) {
            return Err(ConfigError::DuplicateAddress {
                line,
                address: peer.address,
            });
        }

        self.index.insert(peer.id, self.peers.len());
        self.peers.push(peer);
        Ok(())
    }
}

impl FromStr for PeerTable {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::parse(text)
    }
}

fn parse_record(record: &str, line: usize) -> Result<Peer, ConfigError> {
    let Some((id, address)) = record.split_once(',') else {
        return Err(ConfigError::MissingAddress { line });
    };

    let id = id.trim();
    let id: NodeId = id.parse().map_err(|_| ConfigError::MalformedId {
        line,
        value: id.to_string(),
    })?;
    build_peer(id, address, line)
}

fn build_peer(id: NodeId, address: &str, line: usize) -> Result<Peer, ConfigError> {
    if id == BROADCAST {
        return Err(ConfigError::ReservedId { line });
    }

    let address = address.trim();
    let address = address.strip_prefix(TCP_SCHEME).unwrap_or(address).trim();
    if address.is_empty() {
        return Err(ConfigError::MissingAddress { line });
    }

    Ok(Peer {
        id,
        address: address.to_string(),
    })
}
