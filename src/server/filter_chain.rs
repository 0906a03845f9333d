//! Filter chain matching for inbound connections.
//!
//! # Responsibilities
//! - Hold the ordered filter chains of one listener generation
//! - Select the first chain whose predicates all accept a connection
//! - Report the dynamic route names the chains depend on
//!
//! # Design Decisions
//! - Declared order is match order; overlapping predicates are allowed, first wins
//! - An empty predicate list means "any"
//! - Built once per listener update and shared immutably afterwards

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;

use crate::discovery::RouteConfigUpdate;
use crate::server::cidr::CidrRange;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterChainError {
    #[error("filter chain '{0}' references a dynamic route with an empty name")]
    EmptyRouteName(String),
}

/// Relationship between the peer and the local address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceType {
    #[default]
    Any,
    /// Peer is loopback or shares the local IP.
    SameIpOrLoopback,
    /// Anything that is not `SameIpOrLoopback`.
    External,
}

impl SourceType {
    fn matches(self, local: IpAddr, remote: IpAddr) -> bool {
        let same = remote.is_loopback() || local.to_canonical() == remote.to_canonical();
        match self {
            SourceType::Any => true,
            SourceType::SameIpOrLoopback => same,
            SourceType::External => !same,
        }
    }
}

/// Connection predicates of a filter chain. `Default` matches every connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterChainMatch {
    pub destination_prefix_ranges: Vec<CidrRange>,
    pub destination_port: Option<u16>,
    pub source_type: SourceType,
    pub source_prefix_ranges: Vec<CidrRange>,
    pub source_ports: Vec<u16>,
}

impl FilterChainMatch {
    pub fn matches(&self, local: SocketAddr, remote: SocketAddr) -> bool {
        in_ranges(&self.destination_prefix_ranges, local.ip())
            && self.destination_port.map_or(true, |p| p == local.port())
            && self.source_type.matches(local.ip(), remote.ip())
            && in_ranges(&self.source_prefix_ranges, remote.ip())
            && (self.source_ports.is_empty() || self.source_ports.contains(&remote.port()))
    }
}

fn in_ranges(ranges: &[CidrRange], ip: IpAddr) -> bool {
    ranges.is_empty() || ranges.iter().any(|r| r.contains(ip))
}

/// Where a chain's route configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSource {
    /// Inlined in the listener resource.
    Static(Arc<RouteConfigUpdate>),
    /// Named route configuration resolved through a route watch.
    Dynamic(String),
}

/// Transport security parameters carried by a chain. Handshakes happen elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSecurity {
    pub identity_certificate_provider: Option<String>,
    pub root_certificate_provider: Option<String>,
    pub require_client_cert: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChain {
    pub name: String,
    pub filter_match: FilterChainMatch,
    pub route: RouteSource,
    pub security: Option<TransportSecurity>,
}

impl FilterChain {
    /// A chain that matches everything and routes through `route`.
    pub fn new(name: impl Into<String>, route: RouteSource) -> Self {
        Self {
            name: name.into(),
            filter_match: FilterChainMatch::default(),
            route,
            security: None,
        }
    }

    #[must_use]
    pub fn with_match(mut self, filter_match: FilterChainMatch) -> Self {
        self.filter_match = filter_match;
        self
    }

    #[must_use]
    pub fn with_security(mut self, security: TransportSecurity) -> Self {
        self.security = Some(security);
        self
    }

    pub fn dynamic_route_name(&self) -> Option<&str> {
        match &self.route {
            RouteSource::Dynamic(name) => Some(name),
            RouteSource::Static(_) => None,
        }
    }
}

/// Immutable matcher for one listener generation.
#[derive(Debug, Clone)]
pub struct FilterChainManager {
    chains: Vec<Arc<FilterChain>>,
    default_chain: Option<Arc<FilterChain>>,
    route_names: BTreeSet<String>,
}

impl FilterChainManager {
    pub fn new(
        chains: Vec<FilterChain>,
        default_chain: Option<FilterChain>,
    ) -> Result<Self, FilterChainError> {
        let mut route_names = BTreeSet::new();
        for chain in chains.iter().chain(default_chain.iter()) {
            if let Some(name) = chain.dynamic_route_name() {
                if name.is_empty() {
                    return Err(FilterChainError::EmptyRouteName(chain.name.clone()));
                }
                route_names.insert(name.to_string());
            }
        }

        Ok(Self {
            chains: chains.into_iter().map(Arc::new).collect(),
            default_chain: default_chain.map(Arc::new),
            route_names,
        })
    }

    /// First declared chain accepting the connection, else the default chain.
    pub fn lookup(&self, local: SocketAddr, remote: SocketAddr) -> Option<Arc<FilterChain>> {
        self.chains
            .iter()
            .find(|c| c.filter_match.matches(local, remote))
            .or(self.default_chain.as_ref())
            .cloned()
    }

    /// Distinct dynamic route names referenced by any chain.
    pub fn route_config_names(&self) -> &BTreeSet<String> {
        &self.route_names
    }

    pub fn len(&self) -> usize {
        self.chains.len() + usize::from(self.default_chain.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
