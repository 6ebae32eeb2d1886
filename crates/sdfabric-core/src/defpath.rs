//! Default-path planning: every aggregation and edge switch pairs its
//! down-facing ports with up-facing ports modulo their counts, yielding
//! ECMP-like baseline routing keyed solely on the ingress port.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::naming::NodeTier;
use crate::topology::{Node, Topology};

/// Splits a switch's peered ports into (up, down) by the peer's tier,
/// both sorted ascending.
pub fn up_down_ports(topo: &Topology, switch: &Node) -> (Vec<u32>, Vec<u32>) {
    let mut up = Vec::new();
    let mut down = Vec::new();
    for port in switch.ports() {
        let Some(peer) = switch.peer_via_port(port) else {
            continue;
        };
        let Some(peer_node) = topo.node(peer) else {
            continue;
        };
        if peer_node.tier.rank() > switch.tier.rank() {
            up.push(port);
        } else {
            down.push(port);
        }
    }
    (up, down)
}

/// The per-switch inport -> outport pairing for baseline forwarding.
#[derive(Debug, Clone, Default)]
pub struct PortPairing {
    map: FxHashMap<String, BTreeMap<u32, u32>>,
}

impl PortPairing {
    /// Pairs `down[i mod |down|] -> up[i mod |up|]` on every aggregation and
    /// edge switch that has both kinds of ports.
    pub fn build(topo: &Topology) -> Self {
        let mut map: FxHashMap<String, BTreeMap<u32, u32>> = FxHashMap::default();
        for switch in topo.switches() {
            if !matches!(switch.tier, NodeTier::Aggregation | NodeTier::Edge) {
                continue;
            }
            let (up, down) = up_down_ports(topo, switch);
            if up.is_empty() || down.is_empty() {
                continue;
            }
            let pairs = map.entry(switch.id.clone()).or_default();
            for i in 0..up.len().max(down.len()) {
                pairs.insert(down[i % down.len()], up[i % up.len()]);
            }
        }
        Self { map }
    }

    /// The baseline egress for a packet entering `switch` on `inport`.
    pub fn outport(&self, switch: &str, inport: u32) -> Option<u32> {
        self.map.get(switch)?.get(&inport).copied()
    }

    /// Per-switch pairings in switch-id order, for rule installation.
    pub fn switch_pairs(&self) -> Vec<(&str, &BTreeMap<u32, u32>)> {
        let mut pairs: Vec<(&str, &BTreeMap<u32, u32>)> = self
            .map
            .iter()
            .map(|(sw, m)| (sw.as_str(), m))
            .collect();
        pairs.sort_by_key(|(sw, _)| *sw);
        pairs
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Resolves the path baseline forwarding would take between two hosts: the
/// first shortest path whose upward hops agree with the port pairing, or the
/// first shortest path if none does.
pub fn default_path(
    topo: &Topology,
    pairing: &PortPairing,
    src_ip: &str,
    dst_ip: &str,
) -> Option<Vec<String>> {
    let paths = topo.all_shortest_paths(src_ip, dst_ip).ok()?;
    let first = paths.first()?.clone();
    for path in paths {
        if path_matches_pairing(topo, pairing, &path) {
            return Some(path);
        }
    }
    Some(first)
}

fn path_matches_pairing(topo: &Topology, pairing: &PortPairing, path: &[String]) -> bool {
    let Ok(hops) = topo.switch_port_map(path) else {
        return false;
    };
    for hop in hops {
        let switch = topo.node(&hop.switch).expect("path nodes exist");
        let upward = switch
            .peer_via_port(hop.outport)
            .and_then(|peer| topo.node(peer))
            .map(|peer| peer.tier.rank() > switch.tier.rank())
            .unwrap_or(false);
        if upward && pairing.outport(&hop.switch, hop.inport) != Some(hop.outport) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn ports_split_by_peer_tier() {
        let topo = testing::fat_tree();
        let edge = topo.node("40960021").unwrap();
        let (up, down) = up_down_ports(&topo, edge);
        assert_eq!(up, vec![1]);
        assert_eq!(down, vec![2, 3]);

        let aggr = topo.node("40960011").unwrap();
        let (up, down) = up_down_ports(&topo, aggr);
        assert_eq!(up, vec![1]);
        assert_eq!(down, vec![2, 3]);
    }

    #[test]
    fn pairing_covers_every_down_port() {
        let topo = testing::fat_tree();
        let pairing = PortPairing::build(&topo);
        for switch in topo.switches() {
            if !matches!(switch.tier, NodeTier::Aggregation | NodeTier::Edge) {
                continue;
            }
            let (up, down) = up_down_ports(&topo, switch);
            let mut used_ups = std::collections::BTreeSet::new();
            for &port in &down {
                let out = pairing
                    .outport(&switch.id, port)
                    .expect("every down port is paired");
                assert!(up.contains(&out));
                used_ups.insert(out);
            }
            // With |down| >= |up|, every up port carries some inport.
            if down.len() >= up.len() {
                assert_eq!(used_ups.len(), up.len());
            }
        }
    }

    #[test]
    fn core_switch_gets_no_pairing() {
        let topo = testing::fat_tree();
        let pairing = PortPairing::build(&topo);
        assert_eq!(pairing.outport("40960001", 1), None);
    }

    #[test]
    fn default_path_resolves_and_respects_pairing() {
        let topo = testing::fat_tree();
        let pairing = PortPairing::build(&topo);
        let path = default_path(&topo, &pairing, "192.168.0.2", "192.168.0.8").unwrap();
        assert_eq!(path.len(), 7);
        let hops = topo.switch_port_map(&path).unwrap();
        // Upward hops follow the pairing.
        assert_eq!(
            pairing.outport(&hops[0].switch, hops[0].inport),
            Some(hops[0].outport)
        );
    }
}
