//! Node-table records and slot ownership.
//!
//! `CLUSTER NODES` output is one whitespace-delimited record per line:
//!
//! ```text
//! <id> <ip:port@cport[,hostname]> <flags> <master|-> <ping> <pong> <epoch> <link> [<slot>...]
//! ```
//!
//! Records keep their raw fields. Anything with fewer than eight fields is
//! malformed; accessors for optional fields return `None` instead of panicking
//! and the health predicates skip such records.

use std::collections::BTreeMap;

use super::transport::Reply;

/// Total number of hash slots in a cluster.
pub const SLOT_COUNT: u32 = 16384;

/// Fields a well-formed record carries before its slot tokens.
const FIXED_FIELDS: usize = 8;

// ============================================================================
// NodeRecord
// ============================================================================

/// One line of the node table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    fields: Vec<String>,
}

impl NodeRecord {
    /// Tokenize a node-table line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if fields.is_empty() {
            None
        } else {
            Some(Self { fields })
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// At least the eight fixed fields are present.
    pub fn is_well_formed(&self) -> bool {
        self.fields.len() >= FIXED_FIELDS
    }

    pub fn id(&self) -> &str {
        &self.fields[0]
    }

    pub fn address(&self) -> Option<NodeAddress> {
        self.fields.get(1).map(|raw| NodeAddress::parse(raw))
    }

    /// Comma-separated flags, e.g. `myself,master`.
    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.fields
            .get(2)
            .map(|f| f.as_str())
            .unwrap_or_default()
            .split(',')
            .filter(|f| !f.is_empty())
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags().any(|f| f == flag)
    }

    pub fn has_any_flag(&self, flags: &[&str]) -> bool {
        self.flags().any(|f| flags.contains(&f))
    }

    pub fn is_master(&self) -> bool {
        self.has_flag("master")
    }

    pub fn is_replica(&self) -> bool {
        self.has_flag("slave")
    }

    pub fn is_myself(&self) -> bool {
        self.has_flag("myself")
    }

    /// Master this node replicates, if it is a replica.
    pub fn master_id(&self) -> Option<&str> {
        match self.fields.get(3).map(String::as_str) {
            None | Some("-") => None,
            Some(id) => Some(id),
        }
    }

    pub fn link_state(&self) -> Option<&str> {
        self.fields.get(7).map(String::as_str)
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == Some("connected")
    }

    /// Raw slot tokens after the fixed fields.
    pub fn slot_tokens(&self) -> &[String] {
        self.fields.get(FIXED_FIELDS..).unwrap_or_default()
    }

    /// Slot tokens that parse.
    pub fn slots(&self) -> impl Iterator<Item = SlotToken> + '_ {
        self.slot_tokens().iter().filter_map(|t| SlotToken::parse(t))
    }

    /// Any slot token announces a migration in either direction.
    pub fn has_open_slots(&self) -> bool {
        self.slot_tokens()
            .iter()
            .any(|t| t.contains("->-") || t.contains("-<-"))
    }
}

/// Parse the full node-table text. Blank lines are dropped; short lines are
/// kept as-is.
pub fn parse_node_table(text: &str) -> Vec<NodeRecord> {
    text.lines().filter_map(NodeRecord::parse).collect()
}

// ============================================================================
// Address
// ============================================================================

/// Advertised address of a node: `ip:port@cport[,hostname]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeAddress {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub bus_port: Option<u16>,
    pub hostname: Option<String>,
}

impl NodeAddress {
    pub fn parse(raw: &str) -> Self {
        let (endpoint, hostname) = match raw.split_once(',') {
            Some((endpoint, host)) => (endpoint, Some(host)),
            None => (raw, None),
        };
        let (hostport, bus_port) = match endpoint.split_once('@') {
            Some((hostport, bus)) => (hostport, bus.parse().ok()),
            None => (endpoint, None),
        };
        let (ip, port) = match hostport.rsplit_once(':') {
            Some((ip, port)) => (ip, port.parse().ok()),
            None => (hostport, None),
        };
        let ip = ip.trim_start_matches('[').trim_end_matches(']');

        Self {
            ip: (!ip.is_empty()).then(|| ip.to_string()),
            port,
            bus_port,
            hostname: hostname
                .filter(|h| !h.is_empty())
                .map(str::to_string),
        }
    }
}

// ============================================================================
// Slots
// ============================================================================

/// One slot token of a node-table record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotToken {
    /// Inclusive range; a single slot has `start == end`.
    Range { start: u32, end: u32 },
    /// `[slot->-target]`
    Migrating { slot: u32, to: String },
    /// `[slot-<-source]`
    Importing { slot: u32, from: String },
}

impl SlotToken {
    pub fn parse(token: &str) -> Option<Self> {
        if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if let Some((slot, to)) = inner.split_once("->-") {
                return Some(SlotToken::Migrating {
                    slot: slot.parse().ok()?,
                    to: to.to_string(),
                });
            }
            if let Some((slot, from)) = inner.split_once("-<-") {
                return Some(SlotToken::Importing {
                    slot: slot.parse().ok()?,
                    from: from.to_string(),
                });
            }
            return None;
        }

        let (start, end) = match token.split_once('-') {
            Some((start, end)) => (start.parse().ok()?, end.parse().ok()?),
            None => {
                let slot = token.parse().ok()?;
                (slot, slot)
            }
        };
        (start <= end && end < SLOT_COUNT).then_some(SlotToken::Range { start, end })
    }

    /// Slots owned outright by this token.
    pub fn owned(&self) -> u32 {
        match self {
            SlotToken::Range { start, end } => end - start + 1,
            _ => 0,
        }
    }
}

/// Loose check used for empty-master detection: anything that starts like a
/// slot number, a bracketed slot, or carries a migration marker counts.
pub fn looks_like_slot_token(token: &str) -> bool {
    if token.contains("->-") || token.contains("-<-") {
        return true;
    }
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('[') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// Owned slot count per node id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotOwnership {
    counts: BTreeMap<String, u32>,
}

impl SlotOwnership {
    /// Attribute an inclusive range to every listed node, once per node.
    pub fn add_range<'a>(&mut self, start: u32, end: u32, nodes: impl IntoIterator<Item = &'a str>) {
        if end < start {
            return;
        }
        let mut seen: Vec<&str> = Vec::new();
        for node in nodes {
            if seen.contains(&node) {
                continue;
            }
            seen.push(node);
            *self.counts.entry(node.to_string()).or_default() += end - start + 1;
        }
    }

    /// Build from a `CLUSTER SLOTS` reply:
    /// `[[start, end, [ip, port, id, ...], [ip, port, id, ...]...], ...]`.
    /// Returns `None` when the reply does not have that shape.
    pub fn from_slots_reply(reply: &Reply) -> Option<Self> {
        let Reply::Array(ranges) = reply else {
            return None;
        };

        let mut ownership = Self::default();
        for range in ranges {
            let Reply::Array(parts) = range else {
                return None;
            };
            let start = parts.first()?.as_integer()?;
            let end = parts.get(1)?.as_integer()?;
            let ids: Vec<&str> = parts[2..]
                .iter()
                .filter_map(|node| match node {
                    Reply::Array(info) => info.get(2).and_then(Reply::as_text),
                    _ => None,
                })
                .collect();
            ownership.add_range(
                u32::try_from(start).ok()?,
                u32::try_from(end).ok()?,
                ids,
            );
        }
        Some(ownership)
    }

    /// Sum fully owned ranges from well-formed node-table records.
    pub fn from_records(records: &[NodeRecord]) -> Self {
        let mut ownership = Self::default();
        for record in records.iter().filter(|r| r.is_well_formed()) {
            let owned: u32 = record.slots().map(|s| s.owned()).sum();
            if owned > 0 {
                *ownership.counts.entry(record.id().to_string()).or_default() += owned;
            }
        }
        ownership
    }

    /// Slots owned by `node_id`; zero when unknown.
    pub fn slots_of(&self, node_id: &str) -> u32 {
        self.counts.get(node_id).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(id, n)| (id.as_str(), *n))
    }
}

// ============================================================================
// INFO parsing
// ============================================================================

/// Replication role reported by `INFO replication`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Replica,
    Unknown,
}

impl NodeRole {
    /// Read the `role:` line; a missing line is `Unknown`.
    pub fn from_info(info: &str) -> Self {
        let role = info
            .lines()
            .map(str::trim)
            .find_map(|line| line.strip_prefix("role:"));
        match role {
            Some("master") => NodeRole::Master,
            Some("slave") => NodeRole::Replica,
            _ => NodeRole::Unknown,
        }
    }

    /// Value written to the pod role label.
    pub fn label_value(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Replica | NodeRole::Unknown => "slave",
        }
    }
}

/// `key:value` pairs of an INFO-style reply. Section headers and blank lines
/// are skipped.
pub fn parse_info_fields(info: &str) -> BTreeMap<String, String> {
    info.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.trim().to_string()))
        .collect()
}
