//! Upstream destinations and how a cluster name resolves to one.

use std::collections::HashMap;
use std::fmt;

use crate::config::ClusterConfig;

/// A resolved upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub cluster: String,
    pub address: String,
}

impl Destination {
    pub fn new(cluster: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            address: address.into(),
        }
    }

    /// Prefix for per-destination stats.
    pub fn stat_prefix(&self) -> &str {
        &self.cluster
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.cluster, self.address)
    }
}

/// Picks the destination for a cluster. Selection policy lives outside the
/// pool; the pool only asks.
pub trait DestinationSelector: Send + Sync + fmt::Debug {
    fn select(&self, cluster: &str) -> Option<Destination>;
}

/// Fixed cluster → address mapping.
#[derive(Debug, Default, Clone)]
pub struct StaticSelector {
    clusters: HashMap<String, String>,
}

impl StaticSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(clusters: &[ClusterConfig]) -> Self {
        clusters
            .iter()
            .fold(Self::new(), |selector, c| selector.with(&c.name, &c.address))
    }

    pub fn with(mut self, cluster: &str, address: &str) -> Self {
        self.clusters.insert(cluster.to_string(), address.to_string());
        self
    }
}

impl DestinationSelector for StaticSelector {
    fn select(&self, cluster: &str) -> Option<Destination> {
        self.clusters
            .get(cluster)
            .map(|address| Destination::new(cluster, address.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_selection() {
        let selector = StaticSelector::from_config(&[ClusterConfig {
            name: "cluster_0".into(),
            address: "127.0.0.1:8080".into(),
        }]);
        let dest = selector.select("cluster_0").unwrap();
        assert_eq!(dest.address, "127.0.0.1:8080");
        assert_eq!(dest.stat_prefix(), "cluster_0");
        assert_eq!(dest.to_string(), "cluster_0@127.0.0.1:8080");
        assert!(selector.select("missing").is_none());
    }
}
