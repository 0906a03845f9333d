//! Parsed resource payloads delivered by the discovery client.

use std::net::IpAddr;

use crate::server::filter_chain::FilterChain;

/// Path predicate of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    /// Full method path starts with the prefix.
    Prefix(String),
    /// Full method path equals the path.
    Path(String),
}

/// Target of a matched route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    Cluster(String),
    WeightedClusters(Vec<WeightedCluster>),
    /// Server-side only: handle the RPC locally.
    NonForwarding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

impl WeightedCluster {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: RouteMatch,
    pub case_insensitive: bool,
    pub action: RouteAction,
}

impl Route {
    pub fn prefix(prefix: impl Into<String>, action: RouteAction) -> Self {
        Self {
            path: RouteMatch::Prefix(prefix.into()),
            case_insensitive: false,
            action,
        }
    }

    pub fn path(path: impl Into<String>, action: RouteAction) -> Self {
        Self {
            path: RouteMatch::Path(path.into()),
            case_insensitive: false,
            action,
        }
    }

    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Returns true if the full method name (`/package.Service/Method`) matches.
    pub fn matches(&self, method: &str) -> bool {
        let (expected, exact) = match &self.path {
            RouteMatch::Prefix(p) => (p.as_str(), false),
            RouteMatch::Path(p) => (p.as_str(), true),
        };

        if self.case_insensitive {
            let method = method.to_lowercase();
            let expected = expected.to_lowercase();
            if exact {
                method == expected
            } else {
                method.starts_with(&expected)
            }
        } else if exact {
            method == expected
        } else {
            method.starts_with(expected)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualHost {
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

/// The client-side view of a service: the virtual host chosen for the dial target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceUpdate {
    pub virtual_host: VirtualHost,
}

impl ServiceUpdate {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            virtual_host: VirtualHost {
                domains: vec!["*".to_string()],
                routes,
            },
        }
    }
}

/// A route configuration resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteConfigUpdate {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

/// An inbound listener resource.
#[derive(Debug, Clone)]
pub struct ListenerUpdate {
    pub address: IpAddr,
    pub port: u16,
    /// Declared order is match order.
    pub filter_chains: Vec<FilterChain>,
    pub default_filter_chain: Option<FilterChain>,
}
