//! The placement planner: maps a batch of VM requirements onto inventory
//! hosts under one of two policies, with a locality-first search and a
//! most-full-first refinement.

use log::{debug, warn};

use crate::inventory::{Resources, Tier, TopologyInventory};
use crate::units::BitsPerSec;
use crate::vtopo::VmSpec;

/// The closed set of placement policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Pack each VM onto the fullest host that still fits it.
    MostFullFirst,
    /// Keep the batch close together in the tree (host, then edge, then pod),
    /// falling back to most-full-first within each candidate set.
    TopologyAware,
}

impl std::str::FromStr for PlacementPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mff" => Ok(PlacementPolicy::MostFullFirst),
            "topo" => Ok(PlacementPolicy::TopologyAware),
            other => Err(UnknownPolicy(other.to_owned())),
        }
    }
}

/// An unrecognized policy name.
#[derive(Debug, thiserror::Error)]
#[error("unknown vm policy {0:?} (expected \"mff\" or \"topo\")")]
pub struct UnknownPolicy(String);

/// The host free-bandwidth model. The reference deployment treats free
/// bandwidth as advisory, so enforcement is off by default; when enforced, a
/// host's share is `capacity * oversubscription / (running_vms + 1)`.
#[derive(Debug, Clone)]
pub struct BandwidthModel {
    pub link_capacity: BitsPerSec,
    pub oversubscription: u64,
    pub enforced: bool,
}

impl Default for BandwidthModel {
    fn default() -> Self {
        Self {
            link_capacity: BitsPerSec::new(100_000_000),
            oversubscription: 4,
            enforced: false,
        }
    }
}

impl BandwidthModel {
    pub fn free_bandwidth(&self, res: &Resources) -> BitsPerSec {
        if !self.enforced {
            return BitsPerSec::MAX;
        }
        let share = self.link_capacity.into_u64() * self.oversubscription / (res.running_vms + 1);
        BitsPerSec::new(share)
    }
}

/// Planner knobs.
#[derive(Debug, Clone, Default)]
pub struct PlannerConfig {
    pub bandwidth: BandwidthModel,
}

/// The planner's output: an ordered VM -> host map plus the VMs no host
/// could take. A partial plan is not an error.
#[derive(Debug, Clone, Default)]
pub struct PlacementPlan {
    pub assignments: Vec<(String, String)>,
    pub unplaced: Vec<String>,
}

impl PlacementPlan {
    pub fn host_of(&self, vm: &str) -> Option<&str> {
        self.assignments
            .iter()
            .find(|(name, _)| name == vm)
            .map(|(_, host)| host.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.unplaced.is_empty()
    }
}

fn fits(cfg: &PlannerConfig, res: &Resources, vm: &VmSpec) -> bool {
    res.free_cpu() >= vm.cores
        && res.memory_free >= vm.memory
        && cfg.bandwidth.free_bandwidth(res) >= vm.bandwidth
}

/// Most-full-first selection within a candidate host set: of the hosts that
/// fit, the one with the least free CPU wins, with completely empty hosts
/// pushed to the back of the order. Ties break on host name so plans are
/// reproducible.
fn most_full_host(
    inv: &TopologyInventory,
    cfg: &PlannerConfig,
    vm: &VmSpec,
    candidates: &[usize],
) -> Option<usize> {
    let mut fitting: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&h| fits(cfg, &inv.node(h).res, vm))
        .collect();
    fitting.sort_by_key(|&h| {
        let res = &inv.node(h).res;
        let free = res.free_cpu();
        let untouched = if res.vcpus == 0 { 0 } else { free / res.vcpus };
        (free + untouched * 100, inv.node(h).name.clone())
    });
    fitting.first().copied()
}

fn assign(
    inv: &mut TopologyInventory,
    plan: &mut PlacementPlan,
    host: usize,
    vm: &VmSpec,
) {
    let host_name = inv.node(host).name.clone();
    debug!("placing VM {} on {host_name}", vm.name);
    inv.assign_vm(host, vm);
    plan.assignments.push((vm.name.clone(), host_name));
}

/// Computes a VM -> host map under `policy`, consuming resources on
/// `inventory` as it goes. `placed_hosts` names the hosts already running
/// VMs of the same batch, which the topology-aware policy gravitates toward.
pub fn plan(
    policy: PlacementPolicy,
    inventory: &mut TopologyInventory,
    cfg: &PlannerConfig,
    vms: &[VmSpec],
    placed_hosts: &[String],
) -> PlacementPlan {
    let mut plan = PlacementPlan::default();
    let mut remaining: Vec<&VmSpec> = Vec::new();

    match policy {
        PlacementPolicy::MostFullFirst => {
            for vm in vms {
                let hosts = inventory.hosts();
                match most_full_host(inventory, cfg, vm, &hosts) {
                    Some(h) => assign(inventory, &mut plan, h, vm),
                    None => remaining.push(vm),
                }
            }
        }
        PlacementPolicy::TopologyAware => {
            if placed_hosts.is_empty() {
                plan_cold(inventory, cfg, vms, &mut plan, &mut remaining);
            } else {
                plan_incremental(inventory, cfg, vms, placed_hosts, &mut plan, &mut remaining);
            }
        }
    }

    fallback(inventory, cfg, &mut plan, &mut remaining);

    plan.unplaced = remaining.iter().map(|vm| vm.name.clone()).collect();
    if !plan.unplaced.is_empty() {
        warn!("no suitable host for: {:?}", plan.unplaced);
    }
    plan
}

/// Incremental topology-aware placement: for each VM, try the hosts already
/// running this batch, then hosts under the same edges, then the same pods,
/// then anywhere.
fn plan_incremental<'a>(
    inv: &mut TopologyInventory,
    cfg: &PlannerConfig,
    vms: &'a [VmSpec],
    placed_hosts: &[String],
    plan: &mut PlacementPlan,
    remaining: &mut Vec<&'a VmSpec>,
) {
    let anchors: Vec<usize> = placed_hosts
        .iter()
        .filter_map(|name| {
            let found = inv.find_host(name);
            if found.is_none() {
                warn!("placed VM host {name} is not in the inventory");
            }
            found
        })
        .collect();

    'vms: for vm in vms {
        for candidates in [
            anchors.clone(),
            hosts_under_groups(inv, &anchors, false),
            hosts_under_groups(inv, &anchors, true),
            inv.hosts(),
        ] {
            if let Some(h) = most_full_host(inv, cfg, vm, &candidates) {
                assign(inv, plan, h, vm);
                continue 'vms;
            }
        }
        remaining.push(vm);
    }
}

fn hosts_under_groups(inv: &TopologyInventory, anchors: &[usize], pod: bool) -> Vec<usize> {
    let mut groups: Vec<usize> = anchors
        .iter()
        .map(|&h| inv.group_of_host(h, pod))
        .collect();
    groups.sort_unstable();
    groups.dedup();
    groups
        .into_iter()
        .flat_map(|g| inv.hosts_under(g))
        .collect()
}

/// Cold topology-aware placement: find the smallest subtree (host, edge,
/// pod) whose aggregate capacity fits the whole batch, then verify by a
/// trial placement on a clone before committing.
fn plan_cold<'a>(
    inv: &mut TopologyInventory,
    cfg: &PlannerConfig,
    vms: &'a [VmSpec],
    plan: &mut PlacementPlan,
    remaining: &mut Vec<&'a VmSpec>,
) {
    let aggregate = aggregate_vms(vms);
    let candidates = subtree_candidates(inv, cfg, &aggregate);
    debug!(
        "cold placement: {} candidate subtrees for aggregate {}c/{}",
        candidates.len(),
        aggregate.cores,
        aggregate.memory,
    );

    'subtrees: for root in candidates {
        // Trial assignments go to a clone so a failed subtree leaves the
        // authoritative counters untouched. Arena indices survive the clone.
        let mut trial = inv.clone();
        let mut picks: Vec<usize> = Vec::with_capacity(vms.len());
        for vm in vms {
            let hosts = trial.hosts_under(root);
            match most_full_host(&trial, cfg, vm, &hosts) {
                Some(h) => {
                    trial.assign_vm(h, vm);
                    picks.push(h);
                }
                None => continue 'subtrees,
            }
        }
        for (vm, &host) in vms.iter().zip(&picks) {
            assign(inv, plan, host, vm);
        }
        return;
    }

    remaining.extend(vms);
}

fn subtree_candidates(
    inv: &TopologyInventory,
    cfg: &PlannerConfig,
    aggregate: &VmSpec,
) -> Vec<usize> {
    let mut out = Vec::new();
    for tier in [inv.hosts(), inv.edges(), inv.pods()] {
        let mut fitting: Vec<usize> = tier
            .into_iter()
            .filter(|&i| fits(cfg, &inv.node(i).res, aggregate))
            .collect();
        fitting.sort_by_key(|&i| (inv.node(i).res.running_vms, inv.node(i).name.clone()));
        out.extend(fitting);
    }
    out
}

fn aggregate_vms(vms: &[VmSpec]) -> VmSpec {
    let mut aggregate = VmSpec {
        name: "<aggregate>".to_owned(),
        flavor_name: String::new(),
        cores: 0,
        memory: crate::units::Megabytes::ZERO,
        bandwidth: BitsPerSec::ZERO,
        mips: 0,
        storage_size: 0,
        image_name: String::new(),
        network_name: String::new(),
    };
    for vm in vms {
        aggregate.cores += vm.cores;
        aggregate.memory += vm.memory;
        aggregate.bandwidth += vm.bandwidth;
    }
    aggregate
}

/// Last-resort sweep for VMs the policy could not place: walk pods, edges,
/// and hosts in descending free-CPU order (computed once), packing as many
/// of the stragglers as fit onto each host before advancing.
fn fallback<'a>(
    inv: &mut TopologyInventory,
    cfg: &PlannerConfig,
    plan: &mut PlacementPlan,
    remaining: &mut Vec<&'a VmSpec>,
) {
    if remaining.is_empty() {
        return;
    }
    debug!("fallback sweep for {} remaining VMs", remaining.len());
    for pod in sorted_desc_free(inv, inv.pods()) {
        for edge in sorted_desc_free(inv, children_of(inv, pod)) {
            for host in sorted_desc_free(inv, children_of(inv, edge)) {
                let mut i = 0;
                while i < remaining.len() {
                    let vm = remaining[i];
                    if fits(cfg, &inv.node(host).res, vm) {
                        assign(inv, plan, host, vm);
                        remaining.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
        }
    }
}

fn children_of(inv: &TopologyInventory, idx: usize) -> Vec<usize> {
    inv.hosts_under(idx)
        .iter()
        .map(|&h| {
            if inv.node(idx).tier == Tier::Pod {
                inv.group_of_host(h, false)
            } else {
                h
            }
        })
        .collect::<std::collections::BTreeSet<usize>>()
        .into_iter()
        .collect()
}

fn sorted_desc_free(inv: &TopologyInventory, mut indices: Vec<usize>) -> Vec<usize> {
    indices.sort_by(|&a, &b| {
        inv.node(b)
            .res
            .free_cpu()
            .cmp(&inv.node(a).res.free_cpu())
            .then_with(|| inv.node(a).name.cmp(&inv.node(b).name))
    });
    indices
}
