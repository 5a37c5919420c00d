use std::{fmt, io, net::SocketAddr};

use async_trait::async_trait;
use hashbrown::HashMap;
use tracing::debug;

/// Turns a logical node name into the address of its broker.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<SocketAddr, ResolveError>;
}

#[derive(Debug)]
pub enum ResolveError {
    UnknownNode(String),
    Lookup { name: String, error: io::Error },
    /// The start node isn't part of the roster.
    NotInRoster(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::UnknownNode(name) => write!(f, "no address known for node {name}"),
            ResolveError::Lookup { name, error } => write!(f, "could not resolve {name}: {error}"),
            ResolveError::NotInRoster(name) => write!(f, "node {name} is not in the roster"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Fixed name to address map.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    addrs: HashMap<String, SocketAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, addr: SocketAddr) -> Self {
        self.insert(name, addr);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, addr: SocketAddr) {
        self.addrs.insert(name.into(), addr);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<SocketAddr, ResolveError> {
        self.addrs
            .get(name)
            .copied()
            .ok_or_else(|| ResolveError::UnknownNode(name.to_owned()))
    }
}

/// Host lookup through the system resolver. Names without a port get
/// `default_port`.
#[derive(Clone, Debug)]
pub struct DnsResolver {
    default_port: u16,
}

impl DnsResolver {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, name: &str) -> Result<SocketAddr, ResolveError> {
        let first = if name.contains(':') {
            tokio::net::lookup_host(name).await.map(|mut addrs| addrs.next())
        } else {
            tokio::net::lookup_host((name, self.default_port))
                .await
                .map(|mut addrs| addrs.next())
        };
        first
            .map_err(|error| ResolveError::Lookup {
                name: name.to_owned(),
                error,
            })?
            .ok_or_else(|| ResolveError::UnknownNode(name.to_owned()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
}

/// Broker nodes in the order the supervisor tries them. Resolved once and
/// kept for the whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRoster {
    nodes: Vec<Node>,
}

impl NodeRoster {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub async fn resolve<R: Resolver + ?Sized>(
        resolver: &R,
        names: &[String],
    ) -> Result<Self, ResolveError> {
        let mut nodes = Vec::with_capacity(names.len());
        for name in names {
            let addr = resolver.resolve(name).await?;
            debug!("node {} is at {}", name, addr);
            nodes.push(Node {
                name: name.clone(),
                addr,
            });
        }
        Ok(Self { nodes })
    }

    /// `node1` through `node{count}`.
    pub fn default_names(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("node{i}")).collect()
    }

    pub fn index_of(&self, name: &str) -> Result<usize, ResolveError> {
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .ok_or_else(|| ResolveError::NotInRoster(name.to_owned()))
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
