//! Broker node registry and connection order
//!
//! Nodes are tried trusted-first, then open. Within a trust level they are
//! ordered by priority using a natural ordering ("2" before "10"); nodes
//! without a priority go last, and ties keep registration order.

use crate::broker::BrokerError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use url::Url;

pub const DEFAULT_AMQP_PORT: u16 = 5672;
pub const DEFAULT_AMQPS_PORT: u16 = 5671;
pub const DEFAULT_VHOST: &str = "/";

/// Whether a node belongs to the preferred or the fallback tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Trusted,
    Open,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustLevel::Trusted => f.write_str("trusted"),
            TrustLevel::Open => f.write_str("open"),
        }
    }
}

/// Username and password for one node
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything needed to connect and publish to one broker node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerNode {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub credentials: Credentials,
    pub exchange: String,
    pub trust: TrustLevel,
    pub priority: Option<String>,
    pub tls: bool,
}

impl BrokerNode {
    pub fn new<H, E>(credentials: Credentials, host: H, exchange: E, trust: TrustLevel) -> Self
    where
        H: Into<String>,
        E: Into<String>,
    {
        Self {
            host: host.into(),
            port: DEFAULT_AMQP_PORT,
            vhost: DEFAULT_VHOST.to_string(),
            credentials,
            exchange: exchange.into(),
            trust,
            priority: None,
            tls: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_vhost<S: Into<String>>(mut self, vhost: S) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_priority<S: Into<String>>(mut self, priority: S) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Enable TLS; switches the default port to 5671 if it was left at 5672
    pub fn with_tls(mut self, tls: bool) -> Self {
        if tls && self.port == DEFAULT_AMQP_PORT {
            self.port = DEFAULT_AMQPS_PORT;
        }
        self.tls = tls;
        self
    }

    /// `host:port`, safe for logs
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection URI including credentials and vhost
    pub fn amqp_uri(&self) -> Result<Url, BrokerError> {
        let invalid = |reason: &str| BrokerError::InvalidNode(format!("{}: {}", self.display_name(), reason));

        if self.host.trim().is_empty() {
            return Err(invalid("host is empty"));
        }

        let scheme = if self.tls { "amqps" } else { "amqp" };
        let mut uri = Url::parse(&format!("{}://{}:{}", scheme, self.host, self.port))
            .map_err(|e| invalid(&e.to_string()))?;

        uri.set_username(&self.credentials.username)
            .map_err(|_| invalid("username cannot be encoded"))?;
        uri.set_password(Some(&self.credentials.password))
            .map_err(|_| invalid("password cannot be encoded"))?;

        // An empty path selects the default vhost "/"
        if self.vhost != DEFAULT_VHOST {
            let encoded: String = url::form_urlencoded::byte_serialize(self.vhost.as_bytes()).collect();
            uri.set_path(&format!("/{}", encoded));
        }

        Ok(uri)
    }
}

/// Natural string ordering: digit runs compare by numeric value
pub fn natural_cmp(left: &str, right: &str) -> Ordering {
    let left_chunks = chunks(left);
    let right_chunks = chunks(right);

    for (l, r) in left_chunks.iter().zip(right_chunks.iter()) {
        let ordering = compare_chunk(l, r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    left_chunks.len().cmp(&right_chunks.len())
}

fn chunks(value: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    let mut in_digits = None;

    for (index, ch) in value.char_indices() {
        let is_digit = ch.is_ascii_digit();
        match in_digits {
            Some(previous) if previous != is_digit => {
                result.push(&value[start..index]);
                start = index;
            }
            _ => {}
        }
        in_digits = Some(is_digit);
    }
    if start < value.len() {
        result.push(&value[start..]);
    }

    result
}

fn is_number(chunk: &str) -> bool {
    chunk.bytes().all(|b| b.is_ascii_digit())
}

fn compare_chunk(left: &str, right: &str) -> Ordering {
    match (is_number(left), is_number(right)) {
        (true, true) => {
            let l = left.trim_start_matches('0');
            let r = right.trim_start_matches('0');
            l.len()
                .cmp(&r.len())
                .then_with(|| l.cmp(r))
                .then_with(|| left.len().cmp(&right.len()))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.cmp(right),
    }
}

/// Priority order; nodes without priority sort after all prioritized ones
pub fn priority_cmp(left: Option<&str>, right: Option<&str>) -> Ordering {
    match (left, right) {
        (Some(l), Some(r)) => natural_cmp(l, r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    node: BrokerNode,
    tried: bool,
}

/// Ordered node lists with per-sweep "already tried" bookkeeping
#[derive(Debug, Clone, Default)]
pub struct NodeManager {
    trusted: Vec<NodeEntry>,
    open: Vec<NodeEntry>,
    current: Option<BrokerNode>,
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; its list is re-sorted by priority, keeping registration order on ties
    pub fn add_node(&mut self, node: BrokerNode) {
        let list = match node.trust {
            TrustLevel::Trusted => &mut self.trusted,
            TrustLevel::Open => &mut self.open,
        };
        list.push(NodeEntry { node, tried: false });
        // sort_by is stable
        list.sort_by(|a, b| priority_cmp(a.node.priority.as_deref(), b.node.priority.as_deref()));
    }

    pub fn add_trusted_node(&mut self, node: BrokerNode) {
        self.add_node(BrokerNode {
            trust: TrustLevel::Trusted,
            ..node
        });
    }

    pub fn add_open_node(&mut self, node: BrokerNode) {
        self.add_node(BrokerNode {
            trust: TrustLevel::Open,
            ..node
        });
    }

    /// Next untried node of the current sweep, marking it tried
    pub fn next_node(&mut self) -> Option<BrokerNode> {
        let entry = self
            .trusted
            .iter_mut()
            .chain(self.open.iter_mut())
            .find(|entry| !entry.tried)?;

        entry.tried = true;
        self.current = Some(entry.node.clone());
        self.current.clone()
    }

    /// Start a new sweep over all nodes
    pub fn reset_tried(&mut self) {
        for entry in self.trusted.iter_mut().chain(self.open.iter_mut()) {
            entry.tried = false;
        }
    }

    pub fn has_untried(&self) -> bool {
        self.iter_entries().any(|entry| !entry.tried)
    }

    /// Node of the most recent [`NodeManager::next_node`] call
    pub fn current_node(&self) -> Option<&BrokerNode> {
        self.current.as_ref()
    }

    /// All nodes in connection order
    pub fn nodes(&self) -> impl Iterator<Item = &BrokerNode> {
        self.iter_entries().map(|entry| &entry.node)
    }

    pub fn node_count(&self) -> usize {
        self.trusted.len() + self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }

    fn iter_entries(&self) -> impl Iterator<Item = &NodeEntry> {
        self.trusted.iter().chain(self.open.iter())
    }
}
