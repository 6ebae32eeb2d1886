//! The L2 topology model: switches and hosts discovered from the SDN
//! controller, with per-node port/peer maps and shortest-path queries.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use itertools::Itertools;
use petgraph::graph::{NodeIndex, UnGraph};
use rustc_hash::FxHashMap;

use crate::naming::{NamingError, NodeTier};

/// A host address record from the controller's host tracker.
#[derive(Debug, Clone)]
pub struct HostAddress {
    pub mac: String,
    pub ip: String,
}

/// An active (not link-down, not LOCAL) switch port.
#[derive(Debug, Clone)]
pub struct SwitchPort {
    pub switch: String,
    pub port: u32,
}

/// One endpoint of a discovered link. `port` is `None` on the host side.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub node: String,
    pub port: Option<u32>,
}

/// A discovered link between two termination points.
#[derive(Debug, Clone)]
pub struct TopologyLink {
    pub source: Endpoint,
    pub dest: Endpoint,
}

/// The controller-side topology listing, already filtered of LOCAL and
/// link-down ports.
#[derive(Debug, Clone, Default)]
pub struct TopologyInput {
    pub addresses: Vec<HostAddress>,
    pub switch_ports: Vec<SwitchPort>,
    pub links: Vec<TopologyLink>,
}

/// A switch or host in the topology.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub tier: NodeTier,
    port_to_peer: BTreeMap<u32, String>,
    peer_to_port: FxHashMap<String, u32>,
    ports: BTreeSet<u32>,
    attached_switch: Option<String>,
}

impl Node {
    fn new(id: String, tier: NodeTier) -> Self {
        Self {
            id,
            tier,
            port_to_peer: BTreeMap::new(),
            peer_to_port: FxHashMap::default(),
            ports: BTreeSet::new(),
            attached_switch: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.tier.is_host()
    }

    /// The node reachable through `port`, if the port has a discovered peer.
    pub fn peer_via_port(&self, port: u32) -> Option<&str> {
        self.port_to_peer.get(&port).map(String::as_str)
    }

    /// The port leading to `peer`. Always `None` on hosts.
    pub fn port_to(&self, peer: &str) -> Option<u32> {
        self.peer_to_port.get(peer).copied()
    }

    /// All known ports, peered or not, in ascending order.
    pub fn ports(&self) -> impl Iterator<Item = u32> + '_ {
        self.ports.iter().copied()
    }

    /// All peers in ascending port order.
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.port_to_peer.values().map(String::as_str)
    }

    /// For hosts: the edge switch this host hangs off.
    pub fn attached_switch(&self) -> Option<&str> {
        self.attached_switch.as_deref()
    }
}

/// One switch traversal of a path: the packet enters on `inport` and must
/// leave on `outport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHop {
    pub inport: u32,
    pub switch: String,
    pub outport: u32,
}

/// The discovered L2 topology.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: FxHashMap<String, Node>,
    graph: UnGraph<String, ()>,
    id2idx: FxHashMap<String, NodeIndex>,
    mac_to_ip: FxHashMap<String, String>,
    ip_to_mac: FxHashMap<String, String>,
}

impl Topology {
    /// Builds a topology from the controller listing.
    ///
    /// Correctness properties:
    ///
    /// - Every node id must classify to a tier.
    /// - Adjacency is symmetric: a link sets port->peer on both ends.
    /// - Every host is attached to exactly one switch.
    pub fn from_input(input: &TopologyInput) -> Result<Self, TopologyError> {
        let mut topo = Self {
            nodes: FxHashMap::default(),
            graph: UnGraph::new_undirected(),
            id2idx: FxHashMap::default(),
            mac_to_ip: FxHashMap::default(),
            ip_to_mac: FxHashMap::default(),
        };
        for addr in &input.addresses {
            topo.mac_to_ip.insert(addr.mac.clone(), addr.ip.clone());
            topo.ip_to_mac.insert(addr.ip.clone(), addr.mac.clone());
        }
        for sp in &input.switch_ports {
            let idx = topo.ensure_node(&sp.switch)?;
            topo.node_mut(idx).ports.insert(sp.port);
        }
        for link in &input.links {
            topo.add_link(link)?;
        }
        Ok(topo)
    }

    fn ensure_node(&mut self, id: &str) -> Result<NodeIndex, TopologyError> {
        if let Some(&idx) = self.id2idx.get(id) {
            return Ok(idx);
        }
        let tier = NodeTier::classify(id)?;
        let idx = self.graph.add_node(id.to_owned());
        self.id2idx.insert(id.to_owned(), idx);
        self.nodes.insert(id.to_owned(), Node::new(id.to_owned(), tier));
        Ok(idx)
    }

    fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        let id = &self.graph[idx];
        self.nodes.get_mut(id).expect("node map out of sync")
    }

    fn add_link(&mut self, link: &TopologyLink) -> Result<(), TopologyError> {
        let src_idx = self.ensure_node(&link.source.node)?;
        let dst_idx = self.ensure_node(&link.dest.node)?;
        self.attach(&link.source, &link.dest.node)?;
        self.attach(&link.dest, &link.source.node)?;
        if self.graph.find_edge(src_idx, dst_idx).is_none() {
            self.graph.add_edge(src_idx, dst_idx, ());
        }
        Ok(())
    }

    fn attach(&mut self, end: &Endpoint, peer: &str) -> Result<(), TopologyError> {
        let node = self
            .nodes
            .get_mut(&end.node)
            .expect("endpoint node was just ensured");
        if node.is_host() {
            if let Some(prev) = &node.attached_switch {
                if prev != peer {
                    return Err(TopologyError::HostMultiplyAttached {
                        host: end.node.clone(),
                    });
                }
            }
            node.attached_switch = Some(peer.to_owned());
            return Ok(());
        }
        let port = end.port.ok_or_else(|| TopologyError::PortlessSwitchLink {
            switch: end.node.clone(),
        })?;
        node.ports.insert(port);
        node.port_to_peer.insert(port, peer.to_owned());
        node.peer_to_port.insert(peer.to_owned(), port);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All switches, ordered by id.
    pub fn switches(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| n.tier.is_switch())
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }

    /// All tracked host IPs, ordered.
    pub fn host_ips(&self) -> Vec<String> {
        self.ip_to_mac.keys().cloned().sorted().collect()
    }

    pub fn mac_of(&self, ip: &str) -> Option<&str> {
        self.ip_to_mac.get(ip).map(String::as_str)
    }

    pub fn ip_of(&self, mac: &str) -> Option<&str> {
        self.mac_to_ip.get(mac).map(String::as_str)
    }

    /// The edge switch a host is attached to.
    pub fn connected_switch(&self, host_ip: &str) -> Option<&str> {
        let mac = self.mac_of(host_ip)?;
        self.nodes.get(mac)?.attached_switch()
    }

    /// The node reachable from `node` through `port`. A known port with no
    /// discovered peer resolves to `None` rather than an error.
    pub fn peer(&self, node: &str, port: u32) -> Option<&str> {
        self.nodes.get(node)?.peer_via_port(port)
    }

    /// The port on `node` leading to `peer`. Host-IP peers are resolved
    /// through their MAC.
    pub fn port_between(&self, node: &str, peer: &str) -> Option<u32> {
        let n = self.nodes.get(node)?;
        if let Some(port) = n.port_to(peer) {
            return Some(port);
        }
        let mac = self.ip_to_mac.get(peer)?;
        n.port_to(mac)
    }

    /// All shortest paths between two host IPs, as node-id sequences with the
    /// host MACs at both ends. Paths are returned in lexicographic order.
    pub fn all_shortest_paths(
        &self,
        src_ip: &str,
        dst_ip: &str,
    ) -> Result<Vec<Vec<String>>, TopologyError> {
        let src_mac = self
            .mac_of(src_ip)
            .ok_or_else(|| TopologyError::UnknownHost(src_ip.to_owned()))?;
        let dst_mac = self
            .mac_of(dst_ip)
            .ok_or_else(|| TopologyError::UnknownHost(dst_ip.to_owned()))?;
        let &src_idx = self
            .id2idx
            .get(src_mac)
            .ok_or_else(|| TopologyError::UnknownHost(src_ip.to_owned()))?;
        let &dst_idx = self
            .id2idx
            .get(dst_mac)
            .ok_or_else(|| TopologyError::UnknownHost(dst_ip.to_owned()))?;

        // BFS from the source, recording every predecessor that lies on some
        // shortest path.
        let mut dist: FxHashMap<NodeIndex, usize> = [(src_idx, 0)].into_iter().collect();
        let mut preds: FxHashMap<NodeIndex, Vec<NodeIndex>> = FxHashMap::default();
        let mut queue = VecDeque::from([src_idx]);
        while let Some(n) = queue.pop_front() {
            let d = dist[&n];
            for succ in self.graph.neighbors(n) {
                match dist.get(&succ) {
                    None => {
                        dist.insert(succ, d + 1);
                        preds.entry(succ).or_default().push(n);
                        queue.push_back(succ);
                    }
                    Some(&sd) if sd == d + 1 => {
                        preds.entry(succ).or_default().push(n);
                    }
                    Some(_) => {}
                }
            }
        }
        if !dist.contains_key(&dst_idx) {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut stack = vec![dst_idx];
        self.unwind_paths(src_idx, &preds, &mut stack, &mut paths);
        paths.sort();
        Ok(paths)
    }

    fn unwind_paths(
        &self,
        src: NodeIndex,
        preds: &FxHashMap<NodeIndex, Vec<NodeIndex>>,
        stack: &mut Vec<NodeIndex>,
        out: &mut Vec<Vec<String>>,
    ) {
        let &last = stack.last().expect("stack never empty");
        if last == src {
            out.push(stack.iter().rev().map(|&i| self.graph[i].clone()).collect());
            return;
        }
        let Some(parents) = preds.get(&last) else {
            return;
        };
        for &p in parents {
            stack.push(p);
            self.unwind_paths(src, preds, stack, out);
            stack.pop();
        }
    }

    /// Converts a path into its switch traversals, endpoints excluded.
    pub fn switch_port_map(&self, path: &[String]) -> Result<Vec<PathHop>, TopologyError> {
        let mut hops = Vec::new();
        for i in 1..path.len().saturating_sub(1) {
            let this = &path[i];
            let inport = self.port_between(this, &path[i - 1]).ok_or_else(|| {
                TopologyError::MissingAdjacency {
                    node: this.clone(),
                    peer: path[i - 1].clone(),
                }
            })?;
            let outport = self.port_between(this, &path[i + 1]).ok_or_else(|| {
                TopologyError::MissingAdjacency {
                    node: this.clone(),
                    peer: path[i + 1].clone(),
                }
            })?;
            hops.push(PathHop {
                inport,
                switch: this.clone(),
                outport,
            });
        }
        Ok(hops)
    }
}

/// An error type listing the reasons a topology listing is unusable.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// A node id does not classify to any tier.
    #[error("invalid node id")]
    InvalidNodeId(#[from] NamingError),

    /// A host appears at both ends of links to different switches.
    #[error("host {host} is attached to more than one switch")]
    HostMultiplyAttached {
        /// The offending host id.
        host: String,
    },

    /// A switch-side link endpoint carries no port number.
    #[error("link endpoint on switch {switch} has no port")]
    PortlessSwitchLink {
        /// The offending switch id.
        switch: String,
    },

    /// No tracked host owns this address.
    #[error("unknown host {0}")]
    UnknownHost(String),

    /// Two consecutive path nodes share no discovered adjacency.
    #[error("no adjacency between {node} and {peer}")]
    MissingAdjacency {
        /// The node whose port table was probed.
        node: String,
        /// The neighbor the path claims.
        peer: String,
    },
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::testing;

    #[test]
    fn adjacency_is_symmetric() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        for sw in topo.switches() {
            for port in sw.ports() {
                let Some(peer) = sw.peer_via_port(port) else {
                    continue;
                };
                let peer_node = topo.node(peer).context("peer must exist")?;
                if peer_node.is_host() {
                    assert_eq!(peer_node.attached_switch(), Some(sw.id.as_str()));
                } else {
                    assert_eq!(
                        peer_node.peer_via_port(peer_node.port_to(&sw.id).unwrap()),
                        Some(sw.id.as_str())
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn peerless_port_resolves_to_none() {
        let topo = testing::fat_tree();
        // Port 9 is declared on the core switch but never linked.
        assert_eq!(topo.peer("40960001", 9), None);
    }

    #[test]
    fn same_edge_hosts_have_two_hop_path() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        let paths = topo.all_shortest_paths("192.168.0.2", "192.168.0.3")?;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 3); // host, edge, host
        assert_eq!(paths[0][1], "40960021");
        Ok(())
    }

    #[test]
    fn cross_pod_path_traverses_core() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        let paths = topo.all_shortest_paths("192.168.0.2", "192.168.0.8")?;
        assert_eq!(paths.len(), 1);
        let switches: Vec<&str> = paths[0][1..paths[0].len() - 1]
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(
            switches,
            ["40960021", "40960011", "40960001", "40960012", "40960024"]
        );
        Ok(())
    }

    #[test]
    fn switch_port_map_excludes_endpoints() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        let paths = topo.all_shortest_paths("192.168.0.2", "192.168.0.4")?;
        let hops = topo.switch_port_map(&paths[0])?;
        assert_eq!(hops.len(), 3); // edge, aggregation, edge
        assert_eq!(hops[0].switch, "40960021");
        assert_eq!(hops[1].switch, "40960011");
        assert_eq!(hops[2].switch, "40960022");
        // Edge inport faces the source host, outport faces up.
        assert_eq!(
            topo.peer(&hops[0].switch, hops[0].outport),
            Some("40960011")
        );
        Ok(())
    }

    #[test]
    fn unknown_host_is_an_error() {
        let topo = testing::fat_tree();
        let res = topo.all_shortest_paths("10.0.0.1", "192.168.0.2");
        assert!(matches!(res, Err(TopologyError::UnknownHost(..))));
    }
}
