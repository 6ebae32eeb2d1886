//! The provisioning orchestrator: the end-to-end pipeline from
//! virtual-topology documents to created VMs and programmed network state.
//!
//! Pipeline order is fixed: per document, load -> partition placed/new ->
//! plan -> create VMs; then baseline forwarding for the whole batch; then
//! the selected network policy over every document's links. Components that
//! create controller state own their rollback; the orchestrator stops at the
//! first fatal error and reports what was planned.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{bail, Context};
use log::{info, warn};

use sdfabric_controllers::http::{Session, SessionOpts};
use sdfabric_controllers::sdn::FLOWNAME_SPECIAL_QUEUE;
use sdfabric_controllers::{
    ComputeClient, QueueInstaller, SdnClient, SflowClient, TelemetryClient,
};
use sdfabric_core::defpath::{self, PortPairing};
use sdfabric_core::inventory::{pod_layout, TopologyInventory};
use sdfabric_core::placement::{self, PlacementPolicy, PlannerConfig};
use sdfabric_core::qos::{QueuePlanner, QUEUE_NO_OFFSET};
use sdfabric_core::topology::Topology;
use sdfabric_core::units::BitsPerSec;
use sdfabric_core::vtopo::{VirtualTopology, VmSpec};

use crate::config::Config;
use crate::dynflow::{self, DynamicLink};

/// The closed set of network policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetPolicy {
    /// Skip network programming.
    None,
    /// Rotate per-pair special paths forever.
    DynamicFlows,
    /// Install guaranteed-bandwidth queues and enqueue rules.
    Bandwidth,
}

impl std::str::FromStr for NetPolicy {
    type Err = UnknownNetPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(NetPolicy::None),
            "df" => Ok(NetPolicy::DynamicFlows),
            "bw" => Ok(NetPolicy::Bandwidth),
            other => Err(UnknownNetPolicy(other.to_owned())),
        }
    }
}

/// An unrecognized network policy name.
#[derive(Debug, thiserror::Error)]
#[error("unknown net policy {0:?} (expected \"none\", \"df\" or \"bw\")")]
pub struct UnknownNetPolicy(String);

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    /// Plan only; create nothing, program nothing.
    pub simulate: bool,
    /// Skip VM deployment, program the network only.
    pub net_only: bool,
}

/// A document link resolved to concrete addresses.
#[derive(Debug, Clone)]
struct ResolvedLink {
    src_ip: String,
    dst_ip: String,
    src_host_ip: Option<String>,
    dst_host_ip: Option<String>,
    bandwidth: BitsPerSec,
}

/// One orchestrator invocation's context: the controller sessions and the
/// deployment constants. Nothing here outlives the invocation.
#[derive(Debug)]
pub struct Orchestrator {
    config: Config,
    compute: ComputeClient,
    sdn: SdnClient,
    sflow: Option<SflowClient>,
    telemetry: Option<TelemetryClient>,
}

impl Orchestrator {
    pub fn connect(config: Config) -> anyhow::Result<Self> {
        let opts = SessionOpts {
            timeout: config.http_timeout(),
            ..SessionOpts::default()
        };
        let compute = ComputeClient::new(
            Session::with_opts(config.compute.endpoint(), opts.clone())?,
            &config.availability_zone,
            config.create_timeout(),
        );
        let sdn = SdnClient::new(Session::with_opts(config.sdn.endpoint(), opts.clone())?);
        let sflow = match &config.sflow {
            Some(e) => Some(SflowClient::new(Session::with_opts(
                e.endpoint(),
                opts.clone(),
            )?)),
            None => None,
        };
        let telemetry = match &config.telemetry {
            Some(e) => Some(TelemetryClient::new(Session::with_opts(
                e.endpoint(),
                opts,
            )?)),
            None => None,
        };
        Ok(Self {
            config,
            compute,
            sdn,
            sflow,
            telemetry,
        })
    }

    fn total_rate(&self) -> BitsPerSec {
        BitsPerSec::new(self.config.qos_total_rate_bps)
    }

    fn load_topology(&self) -> anyhow::Result<Topology> {
        let input = self
            .sdn
            .fetch_topology()
            .context("reading the SDN topology")?;
        Ok(Topology::from_input(&input)?)
    }

    fn load_documents(&self, files: &[PathBuf]) -> anyhow::Result<Vec<VirtualTopology>> {
        let flavors = self.compute.flavors().context("reading flavor catalog")?;
        files
            .iter()
            .map(|file| {
                let raw = std::fs::read_to_string(file)
                    .with_context(|| format!("reading {}", file.display()))?;
                VirtualTopology::from_json(&raw, &flavors)
                    .with_context(|| format!("resolving {}", file.display()))
            })
            .collect()
    }

    /// The full pipeline. Fails (after finishing what it can) when any VM
    /// stays unplaceable, so the process exits non-zero.
    pub fn deploy(
        &self,
        files: &[PathBuf],
        vm_policy: PlacementPolicy,
        net_policy: NetPolicy,
        opts: DeployOptions,
        cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        let topo = self.load_topology()?;
        let vtopos = self.load_documents(files)?;

        let mut unplaced = Vec::new();
        if !opts.net_only {
            unplaced = self.deploy_vms(&topo, &vtopos, vm_policy, opts.simulate)?;
        }

        if !opts.simulate {
            let pairing = PortPairing::build(&topo);
            self.sdn
                .install_default_paths(&pairing)
                .context("installing default paths")?;
            self.deploy_network(&topo, &pairing, &vtopos, net_policy, cancel)?;
        }

        if !unplaced.is_empty() {
            bail!("{} VM(s) could not be placed: {unplaced:?}", unplaced.len());
        }
        Ok(())
    }

    fn deploy_vms(
        &self,
        topo: &Topology,
        vtopos: &[VirtualTopology],
        policy: PlacementPolicy,
        simulate: bool,
    ) -> anyhow::Result<Vec<String>> {
        let records = self.compute.hypervisors().context("listing hypervisors")?;
        let layout = pod_layout(topo, &records);
        let mut inventory = TopologyInventory::build(&layout, &records)?;
        info!("physical topology before deployment:\n{inventory}");

        let planner_cfg = PlannerConfig::default();
        let mut all_unplaced = Vec::new();
        for vtopo in vtopos {
            let (placed, new_vms) = self.partition_placed(vtopo)?;
            let placed_hosts = self.hosts_of(&placed)?;

            let plan = placement::plan(policy, &mut inventory, &planner_cfg, &new_vms, &placed_hosts);
            info!("VM placement map:");
            for (vm, host) in &plan.assignments {
                info!("  {vm} -> {host}");
            }
            for vm in &plan.unplaced {
                warn!("  {vm} -> (unplaceable)");
            }
            all_unplaced.extend(plan.unplaced.iter().cloned());

            if !simulate {
                for (vm_name, host) in &plan.assignments {
                    let vm = vtopo.vm(vm_name).expect("assignments come from the document");
                    self.compute
                        .create_server(vm, host)
                        .with_context(|| format!("creating VM {vm_name}"))?;
                }
            }
        }
        info!("physical topology after planning:\n{inventory}");
        Ok(all_unplaced)
    }

    /// Splits a document's VMs into those the controller already runs and
    /// the new ones, the latter sorted by descending core count.
    fn partition_placed(
        &self,
        vtopo: &VirtualTopology,
    ) -> anyhow::Result<(Vec<VmSpec>, Vec<VmSpec>)> {
        let mut placed = Vec::new();
        let mut new_vms = Vec::new();
        for vm in vtopo.vms() {
            if self.compute.find_server(&vm.name)?.is_some() {
                placed.push(vm.clone());
            } else {
                new_vms.push(vm.clone());
            }
        }
        new_vms.sort_by(|a, b| b.cores.cmp(&a.cores).then_with(|| a.name.cmp(&b.name)));
        Ok((placed, new_vms))
    }

    fn hosts_of(&self, vms: &[VmSpec]) -> anyhow::Result<Vec<String>> {
        let mut hosts = Vec::new();
        for vm in vms {
            if let Some(host) = self.compute.hostname_of_vm(&vm.name)? {
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
        }
        Ok(hosts)
    }

    fn resolve_links(&self, vtopos: &[VirtualTopology]) -> anyhow::Result<Vec<ResolvedLink>> {
        let mut resolved = Vec::new();
        for vtopo in vtopos {
            for link in vtopo.links() {
                let src_ip = self
                    .compute
                    .server_ip(&link.source)?
                    .with_context(|| format!("VM {} has no address yet", link.source))?;
                let dst_ip = self
                    .compute
                    .server_ip(&link.destination)?
                    .with_context(|| format!("VM {} has no address yet", link.destination))?;
                let src_host_ip = self.compute.host_ip_of_vm_ip(&src_ip)?;
                let dst_host_ip = self.compute.host_ip_of_vm_ip(&dst_ip)?;
                resolved.push(ResolvedLink {
                    src_ip,
                    dst_ip,
                    src_host_ip,
                    dst_host_ip,
                    bandwidth: link.bandwidth,
                });
            }
        }
        Ok(resolved)
    }

    fn deploy_network(
        &self,
        topo: &Topology,
        pairing: &PortPairing,
        vtopos: &[VirtualTopology],
        policy: NetPolicy,
        cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        match policy {
            NetPolicy::None => Ok(()),
            NetPolicy::Bandwidth => {
                let links = self.resolve_links(vtopos)?;
                self.apply_bandwidth(topo, pairing, &links)
            }
            NetPolicy::DynamicFlows => {
                let links: Vec<DynamicLink> = self
                    .resolve_links(vtopos)?
                    .into_iter()
                    .map(|l| DynamicLink {
                        src_ip: l.src_ip,
                        dst_ip: l.dst_ip,
                        src_host_ip: l.src_host_ip,
                        dst_host_ip: l.dst_host_ip,
                    })
                    .collect();
                dynflow::run(
                    &self.sdn,
                    self.sflow.as_ref(),
                    topo,
                    &links,
                    std::time::Duration::from_secs(self.config.dynamic_flow_interval_secs),
                    cancel,
                )
            }
        }
    }

    fn apply_bandwidth(
        &self,
        topo: &Topology,
        pairing: &PortPairing,
        links: &[ResolvedLink],
    ) -> anyhow::Result<()> {
        let total = self.total_rate();
        let mut planner = QueuePlanner::new(total);
        for link in links {
            if link.src_host_ip.is_some() && link.src_host_ip == link.dst_host_ip {
                info!(
                    "{} -> {} share a host; no bandwidth allocation",
                    link.src_ip, link.dst_ip
                );
                continue;
            }
            info!(
                "bandwidth {} from {} to {}",
                link.bandwidth, link.src_ip, link.dst_ip
            );
            planner.add_entry(&link.src_ip, &link.dst_ip, link.bandwidth, total, None);
        }
        if planner.is_empty() {
            return Ok(());
        }
        let resolver =
            |t: &Topology, s: &str, d: &str| defpath::default_path(t, pairing, s, d);
        let queue_config = planner.build(topo, &resolver)?;
        for switch in queue_config.switches() {
            for port in queue_config.ports(switch) {
                info!(
                    "queue config {switch}:{port}: {:?}",
                    queue_config.queues(switch, port)
                );
            }
        }
        QueueInstaller::new(&self.sdn)
            .install(&queue_config, total)
            .context("installing queue configuration")?;
        Ok(())
    }

    /// Delete mode: tear down every VM the document names.
    pub fn delete(&self, file: &PathBuf) -> anyhow::Result<()> {
        let vtopos = self.load_documents(std::slice::from_ref(file))?;
        for vm in vtopos[0].vms() {
            info!("deleting VM {}", vm.name);
            self.compute
                .delete_server(&vm.name)
                .with_context(|| format!("deleting VM {}", vm.name))?;
        }
        Ok(())
    }

    /// Maintenance sweep: remove every queue-related flow rule, then the
    /// queue and QoS state from every switch port.
    pub fn clear_qos(&self) -> anyhow::Result<()> {
        let topo = self.load_topology()?;
        let removed = self
            .sdn
            .del_all_flows_by_name(&topo, FLOWNAME_SPECIAL_QUEUE)?;
        info!("removed {removed} queue flow rule(s)");
        let installer = QueueInstaller::new(&self.sdn);
        let queue_nos: Vec<u32> = (QUEUE_NO_OFFSET..QUEUE_NO_OFFSET + 10).collect();
        for switch in topo.switches() {
            for port in switch.ports() {
                installer.delete_port_queues(&switch.id, port, &queue_nos);
            }
        }
        Ok(())
    }

    /// Live-migration passthrough.
    pub fn migrate(&self, vm: &str, host: &str) -> anyhow::Result<()> {
        self.compute
            .live_migrate(vm, host)
            .with_context(|| format!("migrating {vm} to {host}"))?;
        info!("migration of {vm} to {host} requested");
        Ok(())
    }

    fn sflow(&self) -> anyhow::Result<&SflowClient> {
        self.sflow
            .as_ref()
            .context("no sflow collector configured")
    }

    fn telemetry(&self) -> anyhow::Result<&TelemetryClient> {
        self.telemetry
            .as_ref()
            .context("no telemetry backend configured")
    }

    pub fn monitor_flow(&self, src_ip: &str, dst_ip: &str) -> anyhow::Result<()> {
        let sflow = self.sflow()?;
        sflow.define_ip_flows()?;
        match sflow.flow_rate(src_ip, dst_ip, "ALL")? {
            Some(rate) => println!("{src_ip} -> {dst_ip}: {rate} bytes/s"),
            None => println!("{src_ip} -> {dst_ip}: no active flow"),
        }
        Ok(())
    }

    pub fn monitor_links(&self) -> anyhow::Result<()> {
        let sflow = self.sflow()?;
        sflow.define_ip_flows()?;
        let loads = sflow.port_loads(None)?;
        let mut rows: Vec<(&(String, u32), &f64)> = loads.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        for ((node, port), rate) in rows {
            println!("{node}:{port} {rate} bytes/s");
        }
        Ok(())
    }

    pub fn monitor_host(&self, hostname: &str) -> anyhow::Result<()> {
        let util = self.telemetry()?.host_utilization(hostname)?;
        println!("{hostname}: {:.1}% cpu", util * 100.0);
        Ok(())
    }

    pub fn monitor_vm(&self, name: &str) -> anyhow::Result<()> {
        let util = self.telemetry()?.vm_utilization(name)?;
        println!("{name}: {util:.1}% cpu");
        Ok(())
    }
}
