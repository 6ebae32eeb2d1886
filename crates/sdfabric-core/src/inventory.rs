//! The tiered compute inventory: the physical topology reduced to a
//! root -> pod -> edge -> host tree, with per-node resource counters copied
//! from the compute controller's hypervisor records.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::naming::{ip_to_hostname, NodeTier};
use crate::topology::Topology;
use crate::units::Megabytes;
use crate::vtopo::VmSpec;

/// A hypervisor record as reported by the compute controller.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub name: String,
    pub vcpus: u64,
    pub vcpus_used: u64,
    pub memory_size: Megabytes,
    pub memory_used: Megabytes,
    pub memory_free: Megabytes,
    pub running_vms: u64,
}

/// Aggregate resource counters carried by every tree node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub vcpus: u64,
    pub vcpus_used: u64,
    pub memory_size: Megabytes,
    pub memory_used: Megabytes,
    pub memory_free: Megabytes,
    pub running_vms: u64,
}

impl Resources {
    pub fn free_cpu(&self) -> u64 {
        self.vcpus.saturating_sub(self.vcpus_used)
    }

    fn add(&mut self, other: &Resources) {
        self.vcpus += other.vcpus;
        self.vcpus_used += other.vcpus_used;
        self.memory_size += other.memory_size;
        self.memory_used += other.memory_used;
        self.memory_free += other.memory_free;
        self.running_vms += other.running_vms;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Root,
    Pod,
    Edge,
    Host,
}

/// A node of the inventory tree.
#[derive(Debug, Clone)]
pub struct TierNode {
    pub name: String,
    pub tier: Tier,
    pub res: Resources,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// The hosts hanging off one edge switch, as derived from the L2 topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeHosts {
    pub edge: String,
    pub host_ips: Vec<String>,
}

/// Pods, each a list of edges, each a list of compute-host IPs.
pub type PodLayout = Vec<Vec<EdgeHosts>>;

/// Derives the pod/edge/host grouping from the L2 topology: every edge switch
/// with its attached compute hosts, and one pod per distinct set of edge
/// switches reachable from an aggregation switch.
pub fn pod_layout(topo: &Topology, records: &[HostRecord]) -> PodLayout {
    let known: std::collections::BTreeSet<&str> =
        records.iter().map(|r| r.name.as_str()).collect();

    let mut edge_hosts: FxHashMap<&str, Vec<String>> = FxHashMap::default();
    for sw in topo.switches() {
        if sw.tier != NodeTier::Edge {
            continue;
        }
        let mut ips: Vec<String> = sw
            .peers()
            .filter_map(|peer| topo.ip_of(peer))
            .filter(|ip| known.contains(ip_to_hostname(ip).as_str()))
            .map(str::to_owned)
            .collect();
        ips.sort();
        edge_hosts.insert(&sw.id, ips);
    }

    // Pods are deduplicated by their frozen edge-member sets; BTreeSet keeps
    // the result order independent of discovery order.
    let mut pods: std::collections::BTreeSet<std::collections::BTreeSet<String>> =
        std::collections::BTreeSet::new();
    for sw in topo.switches() {
        if sw.tier != NodeTier::Aggregation {
            continue;
        }
        let edges: std::collections::BTreeSet<String> = sw
            .peers()
            .filter(|peer| {
                topo.node(peer)
                    .map(|n| n.tier == NodeTier::Edge)
                    .unwrap_or(false)
            })
            .map(str::to_owned)
            .collect();
        if !edges.is_empty() {
            pods.insert(edges);
        }
    }

    pods.into_iter()
        .map(|edges| {
            edges
                .into_iter()
                .map(|edge| EdgeHosts {
                    host_ips: edge_hosts.get(edge.as_str()).cloned().unwrap_or_default(),
                    edge,
                })
                .collect()
        })
        .collect()
}

/// The inventory tree. Nodes live in an arena; parents always precede their
/// children, which [`aggregate`](TopologyInventory::aggregate) relies on.
#[derive(Debug, Clone)]
pub struct TopologyInventory {
    nodes: Vec<TierNode>,
}

impl TopologyInventory {
    /// Builds the tree from a pod layout, copying host counters from the
    /// hypervisor records (matched by hostname), then aggregates.
    pub fn build(layout: &PodLayout, records: &[HostRecord]) -> Result<Self, InventoryError> {
        let by_name: FxHashMap<&str, &HostRecord> =
            records.iter().map(|r| (r.name.as_str(), r)).collect();
        let mut inv = Self {
            nodes: vec![TierNode {
                name: "root".to_owned(),
                tier: Tier::Root,
                res: Resources::default(),
                parent: None,
                children: Vec::new(),
            }],
        };
        for (i, pod) in layout.iter().enumerate() {
            let pod_idx = inv.push(format!("pod{i}"), Tier::Pod, 0);
            for edge in pod {
                let edge_idx = inv.push(edge.edge.clone(), Tier::Edge, pod_idx);
                for ip in &edge.host_ips {
                    let hostname = ip_to_hostname(ip);
                    let record = by_name.get(hostname.as_str()).ok_or_else(|| {
                        InventoryError::UnknownHypervisor {
                            host: hostname.clone(),
                        }
                    })?;
                    let host_idx = inv.push(hostname, Tier::Host, edge_idx);
                    inv.nodes[host_idx].res = Resources {
                        vcpus: record.vcpus,
                        vcpus_used: record.vcpus_used,
                        memory_size: record.memory_size,
                        memory_used: record.memory_used,
                        memory_free: record.memory_free,
                        running_vms: record.running_vms,
                    };
                }
            }
        }
        inv.aggregate();
        Ok(inv)
    }

    fn push(&mut self, name: String, tier: Tier, parent: usize) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(TierNode {
            name,
            tier,
            res: Resources::default(),
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(idx);
        idx
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn node(&self, idx: usize) -> &TierNode {
        &self.nodes[idx]
    }

    /// Recomputes every internal counter as the sum over its descendants'
    /// leaf values. Idempotent: internal counters are zeroed first.
    pub fn aggregate(&mut self) {
        for idx in 0..self.nodes.len() {
            if !self.nodes[idx].children.is_empty() {
                self.nodes[idx].res = Resources::default();
            }
        }
        // Children always have larger indices than their parents, so a
        // reverse sweep sums each subtree before it is folded upward.
        for idx in (1..self.nodes.len()).rev() {
            let res = self.nodes[idx].res;
            let parent = self.nodes[idx].parent.expect("non-root has a parent");
            self.nodes[parent].res.add(&res);
        }
    }

    /// Consumes a VM's resources on a host and every ancestor. This is how
    /// trial placements tentatively reserve capacity during planning.
    pub fn assign_vm(&mut self, host: usize, vm: &VmSpec) {
        let mut cursor = Some(host);
        while let Some(idx) = cursor {
            let res = &mut self.nodes[idx].res;
            res.vcpus_used += vm.cores;
            res.memory_used += vm.memory;
            res.memory_free = res.memory_free.saturating_sub(vm.memory);
            res.running_vms += 1;
            cursor = self.nodes[idx].parent;
        }
    }

    fn indices_of(&self, tier: Tier) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].tier == tier)
            .collect()
    }

    pub fn pods(&self) -> Vec<usize> {
        self.indices_of(Tier::Pod)
    }

    pub fn edges(&self) -> Vec<usize> {
        self.indices_of(Tier::Edge)
    }

    pub fn hosts(&self) -> Vec<usize> {
        self.indices_of(Tier::Host)
    }

    /// All host leaves under `idx` (inclusive when `idx` is itself a host).
    pub fn hosts_under(&self, idx: usize) -> Vec<usize> {
        if self.nodes[idx].tier == Tier::Host {
            return vec![idx];
        }
        let mut hosts = Vec::new();
        for &child in &self.nodes[idx].children {
            hosts.extend(self.hosts_under(child));
        }
        hosts
    }

    pub fn find_host(&self, name: &str) -> Option<usize> {
        (0..self.nodes.len())
            .find(|&i| self.nodes[i].tier == Tier::Host && self.nodes[i].name == name)
    }

    /// The edge (or, with `pod = true`, the pod) a host belongs to.
    pub fn group_of_host(&self, host: usize, pod: bool) -> usize {
        let edge = self.nodes[host].parent.expect("hosts have parents");
        if pod {
            self.nodes[edge].parent.expect("edges have parents")
        } else {
            edge
        }
    }
}

impl fmt::Display for TopologyInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(
            inv: &TopologyInventory,
            idx: usize,
            depth: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            let n = &inv.nodes[idx];
            writeln!(
                f,
                "{}{:?} {} cpu:{}/{} mem:{}/{} vms:{}",
                "  ".repeat(depth),
                n.tier,
                n.name,
                n.res.free_cpu(),
                n.res.vcpus,
                n.res.memory_free,
                n.res.memory_size,
                n.res.running_vms,
            )?;
            for &child in &n.children {
                walk(inv, child, depth + 1, f)?;
            }
            Ok(())
        }
        walk(self, 0, 0, f)
    }
}

/// An error building the inventory tree.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    /// A host appears in the topology but not in the hypervisor listing.
    #[error("no hypervisor record for host {host}")]
    UnknownHypervisor {
        /// The hostname derived from the host's IP.
        host: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn layout_groups_hosts_by_edge_and_pod() {
        let topo = testing::fat_tree();
        let records = testing::host_records(8, 16_384);
        let layout = pod_layout(&topo, &records);
        assert_eq!(layout.len(), 2);
        for pod in &layout {
            assert_eq!(pod.len(), 2);
            for edge in pod {
                assert_eq!(edge.host_ips.len(), 2);
            }
        }
        // Pods are disjoint edge sets.
        assert_ne!(layout[0][0].edge, layout[1][0].edge);
    }

    #[test]
    fn layout_skips_hosts_without_records() {
        let topo = testing::fat_tree();
        let records: Vec<HostRecord> = testing::host_records(8, 16_384)
            .into_iter()
            .filter(|r| r.name != "compute2")
            .collect();
        let layout = pod_layout(&topo, &records);
        let total: usize = layout
            .iter()
            .flatten()
            .map(|edge| edge.host_ips.len())
            .sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn aggregate_sums_descendants() -> anyhow::Result<()> {
        let mut inv = testing::inventory(8, 16_384);
        let root = inv.node(inv.root()).res;
        assert_eq!(root.vcpus, 8 * 8);
        assert_eq!(root.memory_size, Megabytes::new(8 * 16_384));
        for pod in inv.pods() {
            let sum: u64 = inv
                .hosts_under(pod)
                .iter()
                .map(|&h| inv.node(h).res.vcpus)
                .sum();
            assert_eq!(inv.node(pod).res.vcpus, sum);
        }
        // Re-aggregation does not double-count.
        inv.aggregate();
        assert_eq!(inv.node(inv.root()).res, root);
        Ok(())
    }

    #[test]
    fn assign_vm_propagates_to_ancestors() {
        let mut inv = testing::inventory(8, 16_384);
        let host = inv.find_host("compute2").unwrap();
        let vm = testing::vm("web", 2, 4_096);
        inv.assign_vm(host, &vm);

        let edge = inv.group_of_host(host, false);
        let pod = inv.group_of_host(host, true);
        for idx in [host, edge, pod, inv.root()] {
            assert_eq!(inv.node(idx).res.vcpus_used, 2, "at {}", inv.node(idx).name);
            assert_eq!(inv.node(idx).res.running_vms, 1);
            assert_eq!(inv.node(idx).res.memory_used, Megabytes::new(4_096));
        }
        assert_eq!(inv.node(host).res.memory_free, Megabytes::new(12_288));
    }

    #[test]
    fn missing_hypervisor_record_fails_build() {
        let topo = testing::fat_tree();
        let records = testing::host_records(8, 16_384);
        let layout = pod_layout(&topo, &records);
        let one_short: Vec<HostRecord> = records
            .into_iter()
            .filter(|r| r.name != "compute5")
            .collect();
        let res = TopologyInventory::build(&layout, &one_short);
        assert!(matches!(
            res,
            Err(InventoryError::UnknownHypervisor { .. })
        ));
    }
}
