//! The compute-controller client: hypervisor inventory, the flavor/image/
//! network catalogs, and the server lifecycle (create pinned to a host,
//! await-active, delete, live-migrate, address lookups).

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use sdfabric_core::inventory::HostRecord;
use sdfabric_core::naming::hostname_to_ip;
use sdfabric_core::units::Megabytes;
use sdfabric_core::vtopo::{Flavor, VmSpec};

use crate::http::{ClientError, Session};

/// Address kind tag on server addresses; `fixed` is the tenant-internal one.
pub const ADDRESS_TYPE_FIXED: &str = "fixed";

#[derive(Debug, Deserialize)]
struct HypervisorListDoc {
    hypervisors: Vec<HypervisorDoc>,
}

#[derive(Debug, Deserialize)]
struct HypervisorDoc {
    hypervisor_hostname: String,
    status: String,
    state: String,
    vcpus: u64,
    vcpus_used: u64,
    memory_mb: u64,
    memory_mb_used: u64,
    free_ram_mb: u64,
    running_vms: u64,
}

#[derive(Debug, Deserialize)]
struct FlavorListDoc {
    flavors: Vec<FlavorDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct FlavorDoc {
    id: String,
    name: String,
    vcpus: u64,
    ram: u64,
}

#[derive(Debug, Deserialize)]
struct NamedListDoc {
    #[serde(alias = "images", alias = "networks")]
    items: Vec<NamedDoc>,
}

#[derive(Debug, Deserialize)]
struct NamedDoc {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ServerListDoc {
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct ServerDoc {
    server: Server,
}

/// A server as reported by the compute controller.
#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "OS-EXT-SRV-ATTR:hypervisor_hostname", default)]
    pub hypervisor_hostname: Option<String>,
    #[serde(default)]
    pub addresses: std::collections::BTreeMap<String, Vec<ServerAddress>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerAddress {
    pub addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    pub kind: String,
}

impl Server {
    /// The server's tenant-internal IP, if one is attached yet.
    pub fn fixed_ip(&self) -> Option<&str> {
        self.addresses
            .values()
            .flatten()
            .find(|a| a.kind == ADDRESS_TYPE_FIXED)
            .map(|a| a.addr.as_str())
    }
}

/// The compute-controller collaborator.
#[derive(Debug)]
pub struct ComputeClient {
    session: Session,
    availability_zone: String,
    create_timeout: Duration,
    poll_interval: Duration,
}

impl ComputeClient {
    pub fn new(session: Session, availability_zone: &str, create_timeout: Duration) -> Self {
        Self {
            session,
            availability_zone: availability_zone.to_owned(),
            create_timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enabled, up hypervisors as inventory host records, sorted by name.
    pub fn hypervisors(&self) -> Result<Vec<HostRecord>, ClientError> {
        let doc: HypervisorListDoc =
            serde_json::from_value(self.session.get_json("/os-hypervisors/detail")?)?;
        let mut records: Vec<HostRecord> = doc
            .hypervisors
            .into_iter()
            .filter(|h| h.status == "enabled" && h.state == "up")
            .map(|h| HostRecord {
                name: h.hypervisor_hostname,
                vcpus: h.vcpus,
                vcpus_used: h.vcpus_used,
                memory_size: Megabytes::new(h.memory_mb),
                memory_used: Megabytes::new(h.memory_mb_used),
                memory_free: Megabytes::new(h.free_ram_mb),
                running_vms: h.running_vms,
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// The flavor catalog.
    pub fn flavors(&self) -> Result<Vec<Flavor>, ClientError> {
        Ok(self
            .flavor_docs()?
            .into_iter()
            .map(|f| Flavor {
                name: f.name,
                vcpus: f.vcpus,
                ram: Megabytes::new(f.ram),
            })
            .collect())
    }

    fn flavor_docs(&self) -> Result<Vec<FlavorDoc>, ClientError> {
        let doc: FlavorListDoc =
            serde_json::from_value(self.session.get_json("/flavors/detail")?)?;
        Ok(doc.flavors)
    }

    fn find_named(&self, path: &str, name: &str) -> Result<String, ClientError> {
        let doc: NamedListDoc = serde_json::from_value(self.session.get_json(path)?)?;
        doc.items
            .into_iter()
            .find(|i| i.name == name)
            .map(|i| i.id)
            .ok_or_else(|| ClientError::NotFound(format!("{path}: {name}")))
    }

    pub fn find_image(&self, name: &str) -> Result<String, ClientError> {
        self.find_named("/images", name)
    }

    pub fn find_network(&self, name: &str) -> Result<String, ClientError> {
        self.find_named("/networks", name)
    }

    pub fn servers(&self) -> Result<Vec<Server>, ClientError> {
        let doc: ServerListDoc =
            serde_json::from_value(self.session.get_json("/servers/detail")?)?;
        Ok(doc.servers)
    }

    pub fn find_server(&self, name: &str) -> Result<Option<Server>, ClientError> {
        Ok(self.servers()?.into_iter().find(|s| s.name == name))
    }

    fn server_by_id(&self, id: &str) -> Result<Server, ClientError> {
        let doc: ServerDoc =
            serde_json::from_value(self.session.get_json(&format!("/servers/{id}"))?)?;
        Ok(doc.server)
    }

    /// Creates a server for `vm` pinned to `host` via availability-zone
    /// placement, then waits for it to become active. A wait that exceeds
    /// the timeout is logged and tolerated; the controller keeps building.
    pub fn create_server(&self, vm: &VmSpec, host: &str) -> Result<Server, ClientError> {
        info!("creating VM {} on {host}", vm.name);
        let image = self.find_image(&vm.image_name)?;
        let network = self.find_network(&vm.network_name)?;
        let flavor = self
            .flavor_docs()?
            .into_iter()
            .find(|f| f.name == vm.flavor_name)
            .ok_or_else(|| ClientError::NotFound(format!("flavor {}", vm.flavor_name)))?;
        let body = json!({
            "server": {
                "name": vm.name,
                "imageRef": image,
                "flavorRef": flavor.id,
                "networks": [{"uuid": network}],
                "availability_zone": format!("{}:{host}", self.availability_zone),
            }
        });
        let created = self.session.post_json("/servers", &body)?;
        let id = created["server"]["id"]
            .as_str()
            .ok_or_else(|| ClientError::NotFound("created server id".to_owned()))?
            .to_owned();
        self.wait_active(&id)
    }

    fn wait_active(&self, id: &str) -> Result<Server, ClientError> {
        let started = Instant::now();
        loop {
            let server = self.server_by_id(id)?;
            if server.status == "ACTIVE" {
                return Ok(server);
            }
            if started.elapsed() >= self.create_timeout {
                warn!(
                    "server {id} still {} after {:?}; continuing",
                    server.status, self.create_timeout
                );
                return Ok(server);
            }
            debug!("server {id} is {}, waiting", server.status);
            thread::sleep(self.poll_interval);
        }
    }

    /// Deletes a server by name; a server that is already gone is fine.
    pub fn delete_server(&self, name: &str) -> Result<(), ClientError> {
        match self.find_server(name)? {
            Some(server) => self.session.delete(&format!("/servers/{}", server.id)),
            None => {
                warn!("server {name} not found; nothing to delete");
                Ok(())
            }
        }
    }

    /// Live-migrates a server to a host. Primitive passthrough only; the
    /// planner never drives this.
    pub fn live_migrate(&self, name: &str, host: &str) -> Result<(), ClientError> {
        let server = self
            .find_server(name)?
            .ok_or_else(|| ClientError::NotFound(format!("server {name}")))?;
        let body = json!({"os-migrateLive": {"host": host, "block_migration": false}});
        self.session
            .post_json(&format!("/servers/{}/action", server.id), &body)?;
        Ok(())
    }

    pub fn server_ip(&self, name: &str) -> Result<Option<String>, ClientError> {
        Ok(self
            .find_server(name)?
            .and_then(|s| s.fixed_ip().map(str::to_owned)))
    }

    pub fn hostname_of_vm(&self, name: &str) -> Result<Option<String>, ClientError> {
        Ok(self.find_server(name)?.and_then(|s| s.hypervisor_hostname))
    }

    /// Resolves a VM IP to the data-plane IP of the host running it.
    pub fn host_ip_of_vm_ip(&self, vm_ip: &str) -> Result<Option<String>, ClientError> {
        let servers = self.servers()?;
        let server = servers
            .iter()
            .find(|s| s.addresses.values().flatten().any(|a| a.addr == vm_ip));
        Ok(server
            .and_then(|s| s.hypervisor_hostname.as_deref())
            .and_then(hostname_to_ip))
    }
}
