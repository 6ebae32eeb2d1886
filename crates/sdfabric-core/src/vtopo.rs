//! Virtual-topology documents: a declarative VM graph with
//! bandwidth-annotated links, resolved against the compute controller's
//! flavor catalog.

use rustc_hash::FxHashMap;

use crate::units::{BitsPerSec, Megabytes};

/// The on-disk document: a `nodes` array and a `links` array.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct VirtualTopologyDoc {
    pub nodes: Vec<VmDoc>,
    #[serde(default)]
    pub links: Vec<LinkDoc>,
}

/// One VM declaration. Either a pre-chosen `flavor` or raw requirements
/// (`pes` cores, `ram` MB, plus `size`/`bw`/`mips`).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct VmDoc {
    pub name: String,
    #[serde(default)]
    pub flavor: Option<String>,
    pub image: String,
    pub network: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub bw: Option<u64>,
    #[serde(default)]
    pub mips: Option<u64>,
    #[serde(default)]
    pub pes: Option<u64>,
    #[serde(default)]
    pub ram: Option<u64>,
}

/// One directed link declaration; zero-bandwidth links are ignored.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LinkDoc {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub bandwidth: u64,
}

/// A named (cores, memory) tuple understood by the compute controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flavor {
    pub name: String,
    pub vcpus: u64,
    pub ram: Megabytes,
}

/// The smallest flavor satisfying the minimum requirements, ordered by
/// (vcpus, ram, name).
pub fn choose_flavor<'a>(
    flavors: &'a [Flavor],
    min_cores: u64,
    min_ram: Megabytes,
) -> Option<&'a Flavor> {
    flavors
        .iter()
        .filter(|f| f.vcpus >= min_cores && f.ram >= min_ram)
        .min_by(|a, b| {
            (a.vcpus, a.ram, &a.name).cmp(&(b.vcpus, b.ram, &b.name))
        })
}

/// A fully resolved VM requirement.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub flavor_name: String,
    pub cores: u64,
    pub memory: Megabytes,
    pub bandwidth: BitsPerSec,
    pub mips: u64,
    pub storage_size: u64,
    pub image_name: String,
    pub network_name: String,
}

/// A resolved inter-VM link with a positive bandwidth requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualLink {
    pub source: String,
    pub destination: String,
    pub bandwidth: BitsPerSec,
}

/// A parsed and flavor-resolved virtual topology. Read-only after parse.
#[derive(Debug, Clone)]
pub struct VirtualTopology {
    vms: Vec<VmSpec>,
    index: FxHashMap<String, usize>,
    links: Vec<VirtualLink>,
}

impl VirtualTopology {
    /// Resolves a document against the flavor catalog.
    ///
    /// Correctness properties:
    ///
    /// - VM names are unique within the document.
    /// - Every link endpoint names a VM in the document.
    pub fn from_doc(
        doc: &VirtualTopologyDoc,
        flavors: &[Flavor],
    ) -> Result<Self, VirtualTopologyError> {
        let mut vms = Vec::with_capacity(doc.nodes.len());
        let mut index = FxHashMap::default();
        for node in &doc.nodes {
            let flavor = match &node.flavor {
                Some(name) => flavors.iter().find(|f| &f.name == name).ok_or_else(|| {
                    VirtualTopologyError::UnknownFlavor {
                        vm: node.name.clone(),
                        flavor: name.clone(),
                    }
                })?,
                None => {
                    let cores = node.pes.unwrap_or(0);
                    let ram = Megabytes::new(node.ram.unwrap_or(0));
                    choose_flavor(flavors, cores, ram).ok_or(
                        VirtualTopologyError::NoFlavorFits {
                            vm: node.name.clone(),
                            cores,
                            ram,
                        },
                    )?
                }
            };
            let spec = VmSpec {
                name: node.name.clone(),
                flavor_name: flavor.name.clone(),
                cores: flavor.vcpus,
                memory: flavor.ram,
                bandwidth: BitsPerSec::new(node.bw.unwrap_or(0)),
                mips: node.mips.unwrap_or(0),
                storage_size: node.size.unwrap_or(0),
                image_name: node.image.clone(),
                network_name: node.network.clone(),
            };
            if index.insert(spec.name.clone(), vms.len()).is_some() {
                return Err(VirtualTopologyError::DuplicateVm(spec.name));
            }
            vms.push(spec);
        }

        let mut links = Vec::new();
        for link in &doc.links {
            if link.bandwidth == 0 {
                continue;
            }
            for endpoint in [&link.source, &link.destination] {
                if !index.contains_key(endpoint) {
                    return Err(VirtualTopologyError::UnknownLinkEndpoint {
                        endpoint: endpoint.clone(),
                    });
                }
            }
            let bandwidth = BitsPerSec::new(link.bandwidth);
            links.push(VirtualLink {
                source: link.source.clone(),
                destination: link.destination.clone(),
                bandwidth,
            });
            // The source VM carries its latest outgoing link requirement.
            let src = index[&link.source];
            vms[src].bandwidth = bandwidth;
        }

        Ok(Self { vms, index, links })
    }

    /// Parses and resolves a JSON document.
    pub fn from_json(json: &str, flavors: &[Flavor]) -> Result<Self, VirtualTopologyError> {
        let doc: VirtualTopologyDoc = serde_json::from_str(json)?;
        Self::from_doc(&doc, flavors)
    }

    pub fn vms(&self) -> &[VmSpec] {
        &self.vms
    }

    pub fn links(&self) -> &[VirtualLink] {
        &self.links
    }

    pub fn vm(&self, name: &str) -> Option<&VmSpec> {
        self.index.get(name).map(|&i| &self.vms[i])
    }
}

/// An error resolving a virtual-topology document.
#[derive(Debug, thiserror::Error)]
pub enum VirtualTopologyError {
    /// The document is not valid JSON.
    #[error("malformed virtual-topology document")]
    Json(#[from] serde_json::Error),

    /// Two VMs share a name.
    #[error("duplicate VM name {0:?}")]
    DuplicateVm(String),

    /// A named flavor does not exist in the catalog.
    #[error("VM {vm:?} references unknown flavor {flavor:?}")]
    UnknownFlavor {
        /// The VM declaring the flavor.
        vm: String,
        /// The missing flavor name.
        flavor: String,
    },

    /// No catalog flavor satisfies the raw requirements.
    #[error("no flavor fits VM {vm:?} (cores >= {cores}, ram >= {ram})")]
    NoFlavorFits {
        /// The VM declaring the requirements.
        vm: String,
        /// Requested minimum cores.
        cores: u64,
        /// Requested minimum memory.
        ram: Megabytes,
    },

    /// A link references a VM not declared in the document.
    #[error("link endpoint {endpoint:?} is not a declared VM")]
    UnknownLinkEndpoint {
        /// The undeclared endpoint name.
        endpoint: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Flavor> {
        vec![
            Flavor {
                name: "m1.small".to_owned(),
                vcpus: 1,
                ram: Megabytes::new(2_048),
            },
            Flavor {
                name: "m1.medium".to_owned(),
                vcpus: 2,
                ram: Megabytes::new(4_096),
            },
            Flavor {
                name: "m1.large".to_owned(),
                vcpus: 4,
                ram: Megabytes::new(8_192),
            },
        ]
    }

    const DOC: &str = r#"{
        "nodes": [
            {"name": "db", "flavor": "m1.large", "image": "wiki-db", "network": "flat"},
            {"name": "web", "size": 10, "bw": 0, "mips": 1000, "pes": 2, "ram": 3000,
             "image": "wiki-web", "network": "flat"}
        ],
        "links": [
            {"source": "web", "destination": "db", "bandwidth": 50000000},
            {"source": "db", "destination": "web", "bandwidth": 0}
        ]
    }"#;

    #[test]
    fn named_flavor_is_looked_up() -> anyhow::Result<()> {
        let vtopo = VirtualTopology::from_json(DOC, &catalog())?;
        let db = vtopo.vm("db").unwrap();
        assert_eq!(db.flavor_name, "m1.large");
        assert_eq!(db.cores, 4);
        assert_eq!(db.memory, Megabytes::new(8_192));
        Ok(())
    }

    #[test]
    fn raw_requirements_pick_smallest_fitting_flavor() -> anyhow::Result<()> {
        let vtopo = VirtualTopology::from_json(DOC, &catalog())?;
        let web = vtopo.vm("web").unwrap();
        // 2 cores fit m1.medium, but 3000 MB pushes it to m1.large.
        assert_eq!(web.flavor_name, "m1.large");
        Ok(())
    }

    #[test]
    fn zero_bandwidth_links_are_dropped() -> anyhow::Result<()> {
        let vtopo = VirtualTopology::from_json(DOC, &catalog())?;
        assert_eq!(vtopo.links().len(), 1);
        assert_eq!(vtopo.links()[0].source, "web");
        Ok(())
    }

    #[test]
    fn link_updates_source_vm_bandwidth() -> anyhow::Result<()> {
        let vtopo = VirtualTopology::from_json(DOC, &catalog())?;
        assert_eq!(
            vtopo.vm("web").unwrap().bandwidth,
            BitsPerSec::new(50_000_000)
        );
        assert_eq!(vtopo.vm("db").unwrap().bandwidth, BitsPerSec::ZERO);
        Ok(())
    }

    #[test]
    fn link_endpoints_must_be_declared() {
        let doc = r#"{
            "nodes": [{"name": "a", "flavor": "m1.small", "image": "i", "network": "n"}],
            "links": [{"source": "a", "destination": "ghost", "bandwidth": 1000}]
        }"#;
        let res = VirtualTopology::from_json(doc, &catalog());
        assert!(matches!(
            res,
            Err(VirtualTopologyError::UnknownLinkEndpoint { .. })
        ));
    }

    #[test]
    fn unknown_flavor_fails() {
        let doc = r#"{
            "nodes": [{"name": "a", "flavor": "m9.huge", "image": "i", "network": "n"}],
            "links": []
        }"#;
        let res = VirtualTopology::from_json(doc, &catalog());
        assert!(matches!(
            res,
            Err(VirtualTopologyError::UnknownFlavor { .. })
        ));
    }

    #[test]
    fn oversized_requirements_fail() {
        let doc = r#"{
            "nodes": [{"name": "a", "size": 1, "bw": 0, "mips": 1, "pes": 64, "ram": 1,
                       "image": "i", "network": "n"}],
            "links": []
        }"#;
        let res = VirtualTopology::from_json(doc, &catalog());
        assert!(matches!(res, Err(VirtualTopologyError::NoFlavorFits { .. })));
    }
}
