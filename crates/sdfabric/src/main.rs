use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use sdfabric_core::placement::PlacementPolicy;

mod config;
mod dynflow;
mod orchestrator;

use config::Config;
use orchestrator::{DeployOptions, NetPolicy, Orchestrator};

#[derive(Parser, Debug)]
#[command(
    name = "sdfabric",
    about = "Joint VM and network provisioner for a software-defined cloud"
)]
struct Args {
    /// Controller configuration file.
    #[arg(short, long, default_value = "sdfabric.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy VMs and network guarantees from virtual-topology documents.
    Deploy {
        /// VM placement policy: mff or topo.
        vm_policy: PlacementPolicy,
        /// Network policy: none, df or bw.
        net_policy: NetPolicy,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Plan VM placements only; nothing is created or programmed.
    DeploySim {
        /// VM placement policy: mff or topo.
        vm_policy: PlacementPolicy,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Program the network for already-deployed VMs.
    DeployNet {
        /// Network policy: none, df or bw.
        net_policy: NetPolicy,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Delete the VMs a document describes.
    Delete { file: PathBuf },
    /// Remove every queue flow rule and queue/QoS setting from the fabric.
    ClearQos,
    /// Live-migrate one VM to a named host.
    Migrate { vm: String, host: String },
    /// Read the monitoring collaborators.
    Monitor {
        #[command(subcommand)]
        what: MonitorCommand,
    },
}

#[derive(Subcommand, Debug)]
enum MonitorCommand {
    /// Byte rate of one (src, dst) pair as seen by the sFlow collector.
    Flow { src_ip: String, dst_ip: String },
    /// Incoming byte rate per switch port.
    Links,
    /// Mean CPU utilization of a hypervisor.
    Host { hostname: String },
    /// Mean CPU utilization of a VM.
    Vm { name: String },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let orchestrator = Orchestrator::connect(config)?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
            .context("installing the interrupt handler")?;
    }

    match args.command {
        Command::Deploy {
            vm_policy,
            net_policy,
            files,
        } => orchestrator.deploy(
            &files,
            vm_policy,
            net_policy,
            DeployOptions::default(),
            &cancel,
        ),
        Command::DeploySim { vm_policy, files } => orchestrator.deploy(
            &files,
            vm_policy,
            NetPolicy::None,
            DeployOptions {
                simulate: true,
                net_only: false,
            },
            &cancel,
        ),
        Command::DeployNet { net_policy, files } => orchestrator.deploy(
            &files,
            PlacementPolicy::MostFullFirst,
            net_policy,
            DeployOptions {
                simulate: false,
                net_only: true,
            },
            &cancel,
        ),
        Command::Delete { file } => orchestrator.delete(&file),
        Command::ClearQos => orchestrator.clear_qos(),
        Command::Migrate { vm, host } => orchestrator.migrate(&vm, &host),
        Command::Monitor { what } => match what {
            MonitorCommand::Flow { src_ip, dst_ip } => orchestrator.monitor_flow(&src_ip, &dst_ip),
            MonitorCommand::Links => orchestrator.monitor_links(),
            MonitorCommand::Host { hostname } => orchestrator.monitor_host(&hostname),
            MonitorCommand::Vm { name } => orchestrator.monitor_vm(&name),
        },
    }
}
