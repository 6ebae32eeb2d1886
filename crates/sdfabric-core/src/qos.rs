//! The QoS/queue planner: turns per-flow `(src, dst, min, max)` bandwidth
//! requirements into per-switch, per-port HTB queue configurations along each
//! flow's path.
//!
//! Queue numbers are assigned per switch in insertion order and published
//! with a +10 offset: number 0 is the OVS default class and the per-port
//! `QUEUE-DEF-<port>` queue backs unclassified traffic.

use std::collections::BTreeMap;

use log::debug;
use rustc_hash::FxHashMap;

use crate::topology::{Topology, TopologyError};
use crate::units::BitsPerSec;

/// Externally visible queue numbers start here; 0-9 are reserved.
pub const QUEUE_NO_OFFSET: u32 = 10;

/// A path resolver capability: given the topology and a host-IP pair,
/// produce the node-id path the flow will take. Injected so callers can
/// substitute monitored or pinned routes for the default-path resolver.
pub type PathResolver<'a> = dyn Fn(&Topology, &str, &str) -> Option<Vec<String>> + 'a;

#[derive(Debug, Clone)]
struct QosRequest {
    src_ip: String,
    dst_ip: String,
    min_rate: BitsPerSec,
    max_rate: BitsPerSec,
    pinned_path: Option<Vec<String>>,
}

/// One queue on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    /// The published queue number (offset already applied).
    pub queue_no: u32,
    pub min_rate: BitsPerSec,
    pub max_rate: BitsPerSec,
}

/// A flow keyed by its endpoint IPs.
pub type FlowKey = (String, String);

/// The planner's output: per-switch port-queue layouts, the flows each port
/// must enqueue, and a per-switch reverse index from flow to queue.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    port_queues: FxHashMap<String, BTreeMap<u32, Vec<QueueSpec>>>,
    port_flows: FxHashMap<String, BTreeMap<u32, Vec<FlowKey>>>,
    queue_index: FxHashMap<String, FxHashMap<FlowKey, u32>>,
}

impl QueueConfig {
    /// Switches with at least one planned queue, in id order.
    pub fn switches(&self) -> Vec<&str> {
        let mut switches: Vec<&str> = self.port_queues.keys().map(String::as_str).collect();
        switches.sort_unstable();
        switches
    }

    /// Ports of a switch with planned queues, ascending.
    pub fn ports(&self, switch: &str) -> Vec<u32> {
        self.port_queues
            .get(switch)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn queues(&self, switch: &str, port: u32) -> &[QueueSpec] {
        self.port_queues
            .get(switch)
            .and_then(|m| m.get(&port))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The flows that must be enqueued on a port, in queue order.
    pub fn flows(&self, switch: &str, port: u32) -> &[FlowKey] {
        self.port_flows
            .get(switch)
            .and_then(|m| m.get(&port))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The raw per-switch queue index of a flow (0-based insertion order).
    pub fn queue_index(&self, switch: &str, src_ip: &str, dst_ip: &str) -> Option<u32> {
        self.queue_index
            .get(switch)?
            .get(&(src_ip.to_owned(), dst_ip.to_owned()))
            .copied()
    }

    /// The published queue number of a flow on a switch.
    pub fn queue_no(&self, switch: &str, src_ip: &str, dst_ip: &str) -> Option<u32> {
        self.queue_index(switch, src_ip, dst_ip)
            .map(|i| i + QUEUE_NO_OFFSET)
    }

    pub fn is_empty(&self) -> bool {
        self.port_queues.is_empty()
    }
}

/// Accumulates flow bandwidth requirements and materializes a
/// [`QueueConfig`] along each flow's path.
#[derive(Debug)]
pub struct QueuePlanner {
    total_rate: BitsPerSec,
    requests: Vec<QosRequest>,
}

impl QueuePlanner {
    pub fn new(total_rate: BitsPerSec) -> Self {
        Self {
            total_rate,
            requests: Vec::new(),
        }
    }

    /// The physical port rate every HTB hierarchy is capped at.
    pub fn total_rate(&self) -> BitsPerSec {
        self.total_rate
    }

    /// Adds (or replaces) the requirement for a flow. A pinned path overrides
    /// the resolver for that flow only.
    pub fn add_entry(
        &mut self,
        src_ip: &str,
        dst_ip: &str,
        min_rate: BitsPerSec,
        max_rate: BitsPerSec,
        pinned_path: Option<Vec<String>>,
    ) {
        self.requests
            .retain(|r| !(r.src_ip == src_ip && r.dst_ip == dst_ip));
        self.requests.push(QosRequest {
            src_ip: src_ip.to_owned(),
            dst_ip: dst_ip.to_owned(),
            min_rate,
            max_rate,
            pinned_path,
        });
    }

    pub fn remove_entry(&mut self, src_ip: &str, dst_ip: &str) {
        self.requests
            .retain(|r| !(r.src_ip == src_ip && r.dst_ip == dst_ip));
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Builds the queue configuration from scratch: resolve each flow's
    /// path, hand out per-switch queue numbers in insertion order, then
    /// regroup per port.
    pub fn build(
        &self,
        topo: &Topology,
        resolver: &PathResolver<'_>,
    ) -> Result<QueueConfig, QosError> {
        // switch -> ordered (outport, flow) in queue-number order
        let mut switch_queues: FxHashMap<String, Vec<(u32, FlowKey)>> = FxHashMap::default();
        let mut config = QueueConfig::default();

        for req in &self.requests {
            let path = match &req.pinned_path {
                Some(path) => path.clone(),
                None => resolver(topo, &req.src_ip, &req.dst_ip).ok_or_else(|| {
                    QosError::NoPath {
                        src_ip: req.src_ip.clone(),
                        dst_ip: req.dst_ip.clone(),
                    }
                })?,
            };
            debug!(
                "queue plan {}->{} along {path:?}",
                req.src_ip, req.dst_ip
            );
            let flow = (req.src_ip.clone(), req.dst_ip.clone());
            for hop in topo.switch_port_map(&path)? {
                let queues = switch_queues.entry(hop.switch.clone()).or_default();
                config
                    .queue_index
                    .entry(hop.switch.clone())
                    .or_default()
                    .insert(flow.clone(), queues.len() as u32);
                queues.push((hop.outport, flow.clone()));
            }
        }

        for (switch, queues) in switch_queues {
            let port_queues = config.port_queues.entry(switch.clone()).or_default();
            let port_flows = config.port_flows.entry(switch.clone()).or_default();
            for (raw_no, (outport, flow)) in queues.into_iter().enumerate() {
                let req = self
                    .requests
                    .iter()
                    .find(|r| r.src_ip == flow.0 && r.dst_ip == flow.1)
                    .expect("queued flows come from requests");
                port_queues.entry(outport).or_default().push(QueueSpec {
                    queue_no: raw_no as u32 + QUEUE_NO_OFFSET,
                    min_rate: req.min_rate,
                    max_rate: req.max_rate,
                });
                port_flows.entry(outport).or_default().push(flow);
            }
        }
        Ok(config)
    }
}

/// An error planning queues.
#[derive(Debug, thiserror::Error)]
pub enum QosError {
    /// The resolver produced no path for a flow.
    #[error("no path from {src_ip} to {dst_ip}")]
    NoPath {
        /// Flow source IP.
        src_ip: String,
        /// Flow destination IP.
        dst_ip: String,
    },

    /// A resolved or pinned path does not traverse the topology.
    #[error("unusable path")]
    Path(#[from] TopologyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defpath::{self, PortPairing};
    use crate::testing;
    use crate::units::Mbps;

    fn resolver(pairing: &PortPairing) -> impl Fn(&Topology, &str, &str) -> Option<Vec<String>> + '_ {
        move |topo, src, dst| defpath::default_path(topo, pairing, src, dst)
    }

    #[test]
    fn single_flow_gets_queue_ten_on_every_path_switch() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        let pairing = PortPairing::build(&topo);
        let mut planner = QueuePlanner::new(Mbps::new(95).into());
        planner.add_entry(
            "192.168.0.2",
            "192.168.0.4",
            Mbps::new(50).into(),
            Mbps::new(95).into(),
            None,
        );
        let config = planner.build(&topo, &resolver(&pairing))?;

        // The path crosses edge, aggregation, edge.
        assert_eq!(config.switches(), ["40960011", "40960021", "40960022"]);
        for switch in config.switches() {
            assert_eq!(
                config.queue_index(switch, "192.168.0.2", "192.168.0.4"),
                Some(0)
            );
            assert_eq!(
                config.queue_no(switch, "192.168.0.2", "192.168.0.4"),
                Some(QUEUE_NO_OFFSET)
            );
            let ports = config.ports(switch);
            assert_eq!(ports.len(), 1);
            let queues = config.queues(switch, ports[0]);
            assert_eq!(queues.len(), 1);
            assert_eq!(queues[0].queue_no, QUEUE_NO_OFFSET);
            assert_eq!(queues[0].min_rate, Mbps::new(50).into());
        }
        // Off-path switches carry nothing for the flow.
        assert_eq!(config.queue_no("40960023", "192.168.0.2", "192.168.0.4"), None);
        Ok(())
    }

    #[test]
    fn queue_numbers_are_contiguous_per_switch() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        let pairing = PortPairing::build(&topo);
        let mut planner = QueuePlanner::new(Mbps::new(95).into());
        // Three flows out of the same source rack share the edge switch.
        planner.add_entry("192.168.0.2", "192.168.0.4", Mbps::new(60).into(), Mbps::new(95).into(), None);
        planner.add_entry("192.168.0.2", "192.168.0.6", Mbps::new(10).into(), Mbps::new(20).into(), None);
        planner.add_entry("192.168.0.3", "192.168.0.4", Mbps::new(50).into(), Mbps::new(95).into(), None);
        let config = planner.build(&topo, &resolver(&pairing))?;

        for switch in config.switches() {
            let mut numbers: Vec<u32> = config
                .ports(switch)
                .into_iter()
                .flat_map(|p| config.queues(switch, p).iter().map(|q| q.queue_no))
                .collect();
            numbers.sort_unstable();
            let expect: Vec<u32> =
                (0..numbers.len() as u32).map(|i| i + QUEUE_NO_OFFSET).collect();
            assert_eq!(numbers, expect, "at {switch}");
        }
        // The shared edge switch numbered its two flows in insertion order.
        assert_eq!(config.queue_no("40960021", "192.168.0.2", "192.168.0.4"), Some(10));
        assert_eq!(config.queue_no("40960021", "192.168.0.2", "192.168.0.6"), Some(11));
        Ok(())
    }

    #[test]
    fn every_path_switch_carries_the_flow_exactly_once() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        let pairing = PortPairing::build(&topo);
        let mut planner = QueuePlanner::new(Mbps::new(95).into());
        planner.add_entry("192.168.0.2", "192.168.0.8", Mbps::new(30).into(), Mbps::new(95).into(), None);
        planner.add_entry("192.168.0.5", "192.168.0.3", Mbps::new(30).into(), Mbps::new(95).into(), None);
        let config = planner.build(&topo, &resolver(&pairing))?;

        for (src, dst) in [("192.168.0.2", "192.168.0.8"), ("192.168.0.5", "192.168.0.3")] {
            let path = defpath::default_path(&topo, &pairing, src, dst).unwrap();
            let on_path: std::collections::BTreeSet<String> = topo
                .switch_port_map(&path)?
                .into_iter()
                .map(|h| h.switch)
                .collect();
            for switch in topo.switches() {
                let entries = config
                    .ports(&switch.id)
                    .into_iter()
                    .flat_map(|p| config.flows(&switch.id, p))
                    .filter(|(s, d)| s == src && d == dst)
                    .count();
                let expected = usize::from(on_path.contains(&switch.id));
                assert_eq!(entries, expected, "{src}->{dst} at {}", switch.id);
            }
        }
        Ok(())
    }

    #[test]
    fn pinned_path_overrides_resolver() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        let mut planner = QueuePlanner::new(Mbps::new(95).into());
        let pinned = vec![
            testing::host_mac(2),
            "40960021".to_owned(),
            testing::host_mac(3),
        ];
        planner.add_entry(
            "192.168.0.2",
            "192.168.0.3",
            Mbps::new(40).into(),
            Mbps::new(95).into(),
            Some(pinned),
        );
        // A resolver that would panic if consulted.
        let no_resolver = |_: &Topology, _: &str, _: &str| -> Option<Vec<String>> {
            panic!("pinned flows must not consult the resolver")
        };
        let config = planner.build(&topo, &no_resolver)?;
        assert_eq!(config.switches(), ["40960021"]);
        Ok(())
    }

    #[test]
    fn re_adding_a_flow_replaces_it() -> anyhow::Result<()> {
        let topo = testing::fat_tree();
        let pairing = PortPairing::build(&topo);
        let mut planner = QueuePlanner::new(Mbps::new(95).into());
        planner.add_entry("192.168.0.2", "192.168.0.4", Mbps::new(10).into(), Mbps::new(20).into(), None);
        planner.add_entry("192.168.0.2", "192.168.0.4", Mbps::new(70).into(), Mbps::new(95).into(), None);
        assert_eq!(planner.len(), 1);
        let config = planner.build(&topo, &resolver(&pairing))?;
        let queues = config.queues("40960021", config.ports("40960021")[0]);
        assert_eq!(queues[0].min_rate, Mbps::new(70).into());
        Ok(())
    }
}
