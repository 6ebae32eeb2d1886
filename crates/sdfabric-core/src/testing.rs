//! Utilities for writing tests.

use crate::inventory::{pod_layout, HostRecord, TopologyInventory};
use crate::topology::{Endpoint, HostAddress, SwitchPort, Topology, TopologyInput, TopologyLink};
use crate::units::{BitsPerSec, Megabytes};
use crate::vtopo::VmSpec;

fn link(a: &str, a_port: Option<u32>, b: &str, b_port: Option<u32>) -> TopologyLink {
    TopologyLink {
        source: Endpoint {
            node: a.to_owned(),
            port: a_port,
        },
        dest: Endpoint {
            node: b.to_owned(),
            port: b_port,
        },
    }
}

pub(crate) fn host_mac(n: u32) -> String {
    format!("ab:cd:ef:00:00:0{n}")
}

pub(crate) fn host_ip(n: u32) -> String {
    format!("192.168.0.{n}")
}

/// A two-pod fat tree: one core switch, one aggregation switch and two edge
/// switches per pod, two hosts per edge (IPs 192.168.0.2 through .9).
///
/// Port conventions: port 1 on every aggregation/edge switch faces upward;
/// ports 2 and 3 face downward. The core carries one port per pod plus an
/// unlinked port 9.
pub(crate) fn fat_tree_input() -> TopologyInput {
    let core = "40960001";
    let aggrs = ["40960011", "40960012"];
    let edges = ["40960021", "40960022", "40960023", "40960024"];

    let mut input = TopologyInput::default();
    for n in 2..=9 {
        input.addresses.push(HostAddress {
            mac: host_mac(n),
            ip: host_ip(n),
        });
    }
    input.switch_ports.push(SwitchPort {
        switch: core.to_owned(),
        port: 9,
    });

    for (i, aggr) in aggrs.iter().enumerate() {
        input
            .links
            .push(link(core, Some(i as u32 + 1), aggr, Some(1)));
        for j in 0..2u32 {
            let edge = edges[i * 2 + j as usize];
            input.links.push(link(aggr, Some(j + 2), edge, Some(1)));
            for k in 0..2u32 {
                let host = host_mac(2 + (i as u32 * 2 + j) * 2 + k);
                input.links.push(link(edge, Some(k + 2), &host, None));
            }
        }
    }
    input
}

pub(crate) fn fat_tree() -> Topology {
    Topology::from_input(&fat_tree_input()).expect("fixture topology is valid")
}

/// Uniform hypervisor records for the eight fixture hosts, all empty.
pub(crate) fn host_records(vcpus: u64, memory_mb: u64) -> Vec<HostRecord> {
    (2..=9)
        .map(|n| HostRecord {
            name: format!("compute{n}"),
            vcpus,
            vcpus_used: 0,
            memory_size: Megabytes::new(memory_mb),
            memory_used: Megabytes::ZERO,
            memory_free: Megabytes::new(memory_mb),
            running_vms: 0,
        })
        .collect()
}

pub(crate) fn inventory(vcpus: u64, memory_mb: u64) -> TopologyInventory {
    let topo = fat_tree();
    let records = host_records(vcpus, memory_mb);
    let layout = pod_layout(&topo, &records);
    TopologyInventory::build(&layout, &records).expect("fixture inventory is valid")
}

pub(crate) fn vm(name: &str, cores: u64, memory_mb: u64) -> VmSpec {
    VmSpec {
        name: name.to_owned(),
        flavor_name: format!("m1.test{cores}"),
        cores,
        memory: Megabytes::new(memory_mb),
        bandwidth: BitsPerSec::ZERO,
        mips: 0,
        storage_size: 0,
        image_name: "cirros".to_owned(),
        network_name: "flat".to_owned(),
    }
}
