//! The dynamic-flow loop: evenly divides the rotation budget across the
//! batch's links and, on each tick, re-installs one pair's special path —
//! the least-loaded shortest path between the two hosts — displacing
//! whatever special path that pair had before.
//!
//! The loop runs until cancelled. Cancellation is observed between
//! rotations (not only inside the sleep), and installed special paths are
//! deliberately left behind for the supervisor to clean up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use sdfabric_controllers::sdn::{FLOWNAME_SPECIAL_PATH, PRIORITY_SPECIAL_PATH};
use sdfabric_controllers::{SdnClient, SflowClient};
use sdfabric_core::topology::Topology;

/// One rotated pair: the VM addresses the rules match on, and the hosts the
/// path runs between.
#[derive(Debug, Clone)]
pub struct DynamicLink {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_host_ip: Option<String>,
    pub dst_host_ip: Option<String>,
}

pub fn run(
    sdn: &SdnClient,
    sflow: Option<&SflowClient>,
    topo: &Topology,
    links: &[DynamicLink],
    budget: Duration,
    cancel: &AtomicBool,
) -> anyhow::Result<()> {
    if links.is_empty() {
        return Ok(());
    }
    let interval = budget / links.len() as u32;
    info!(
        "dynamic flows: rotating {} link(s), one every {interval:?}",
        links.len()
    );
    while !cancel.load(Ordering::SeqCst) {
        for link in links {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = rotate_one(sdn, sflow, topo, link) {
                warn!(
                    "special path {} -> {} not rotated: {e:#}",
                    link.src_ip, link.dst_ip
                );
            }
            sleep_cancellable(interval, cancel);
        }
    }
    info!("dynamic-flow loop cancelled; installed special paths left in place");
    Ok(())
}

fn rotate_one(
    sdn: &SdnClient,
    sflow: Option<&SflowClient>,
    topo: &Topology,
    link: &DynamicLink,
) -> anyhow::Result<()> {
    let (Some(src_host), Some(dst_host)) = (&link.src_host_ip, &link.dst_host_ip) else {
        anyhow::bail!("host of {} or {} unknown", link.src_ip, link.dst_ip);
    };
    if src_host == dst_host {
        debug!(
            "{} -> {} share host {src_host}; nothing to route",
            link.src_ip, link.dst_ip
        );
        return Ok(());
    }

    let paths = topo.all_shortest_paths(src_host, dst_host)?;
    let path = choose_path(sflow, topo, paths)
        .with_context(|| format!("no path between {src_host} and {dst_host}"))?;
    info!(
        "special path {} -> {} via {path:?}",
        link.src_ip, link.dst_ip
    );

    // Displace the pair's previous special path before installing the new
    // one; stale rules on other switches would shadow it.
    for switch in topo.switches() {
        if let Err(e) =
            sdn.del_flows_by_name_match(&switch.id, FLOWNAME_SPECIAL_PATH, &link.src_ip, &link.dst_ip)
        {
            warn!("stale special-path sweep at {} failed: {e}", switch.id);
        }
    }
    for hop in topo.switch_port_map(&path)? {
        sdn.add_flow_match_output(
            &hop.switch,
            hop.outport,
            &link.src_ip,
            &link.dst_ip,
            FLOWNAME_SPECIAL_PATH,
            PRIORITY_SPECIAL_PATH,
        )?;
    }
    Ok(())
}

/// The least-loaded candidate path according to the collector's per-port
/// rates; the first candidate when the collector is absent or unreachable.
fn choose_path(
    sflow: Option<&SflowClient>,
    topo: &Topology,
    paths: Vec<Vec<String>>,
) -> Option<Vec<String>> {
    let loads = sflow.and_then(|c| match c.port_loads(None) {
        Ok(loads) => Some(loads),
        Err(e) => {
            warn!("collector unreachable, falling back to first path: {e}");
            None
        }
    });
    match loads {
        Some(loads) => best_path(topo, paths, &loads),
        None => paths.into_iter().next(),
    }
}

/// The candidate with the least summed inbound load along its hops; ties go
/// to the earlier candidate, which keeps rotations deterministic.
fn best_path(
    topo: &Topology,
    paths: Vec<Vec<String>>,
    loads: &FxHashMap<(String, u32), f64>,
) -> Option<Vec<String>> {
    let mut best: Option<(f64, Vec<String>)> = None;
    for path in paths {
        let load = path_load(topo, &path, loads);
        let better = match &best {
            Some((best_load, _)) => load < *best_load,
            None => true,
        };
        if better {
            best = Some((load, path));
        }
    }
    best.map(|(_, path)| path)
}

fn path_load(topo: &Topology, path: &[String], loads: &FxHashMap<(String, u32), f64>) -> f64 {
    let Ok(hops) = topo.switch_port_map(path) else {
        return f64::INFINITY;
    };
    hops.iter()
        .map(|hop| {
            loads
                .get(&(hop.switch.clone(), hop.inport))
                .copied()
                .unwrap_or(0.0)
        })
        .sum()
}

fn sleep_cancellable(total: Duration, cancel: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total && !cancel.load(Ordering::SeqCst) {
        let chunk = step.min(total - slept);
        std::thread::sleep(chunk);
        slept += chunk;
    }
}
