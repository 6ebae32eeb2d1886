//! The SDN-controller client: reads the operational topology (filtering
//! LOCAL and link-down ports), resolves OVS interface names, and programs
//! OpenFlow rules — baseline ingress-port forwarding, special paths, and
//! enqueue rules — all tagged with flow-name markers so related rules can be
//! mass-cleared.

use log::{debug, info, warn};
use serde_json::{json, Value};

use sdfabric_core::defpath::PortPairing;
use sdfabric_core::topology::{Endpoint as LinkEndpoint, SwitchPort, Topology, TopologyInput, TopologyLink};

use crate::http::{ClientError, Session};

/// Marker on queue-enqueue rules installed for guaranteed-bandwidth flows.
pub const FLOWNAME_SPECIAL_QUEUE: &str = "SPECIAL_QUEUE";
/// Marker on per-pair path rules installed by the dynamic-flow mode.
pub const FLOWNAME_SPECIAL_PATH: &str = "SPECIAL_PATH";
/// Marker on baseline ingress-port forwarding rules.
pub const FLOWNAME_DEFAULT_PATH: &str = "DEFAULT_PATH";

pub const PRIORITY_DEFAULT_PATH: u32 = 10;
pub const PRIORITY_SPECIAL_PATH: u32 = 500;
pub const PRIORITY_SPECIAL_QUEUE: u32 = 1000;

/// All rules live in table 0.
pub const DEFAULT_TABLE: u32 = 0;

const TOPOLOGY_PATH: &str =
    "/restconf/operational/network-topology:network-topology/topology/flow:1/";

/// A flow rule as read back from the controller.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub id: String,
    pub name: Option<String>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
}

/// The SDN-controller collaborator.
#[derive(Debug)]
pub struct SdnClient {
    session: Session,
}

impl SdnClient {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    /// Reads the operational topology into the core builder's input form.
    /// LOCAL ports and ports whose operational state is link-down are
    /// dropped before they reach the model.
    pub fn fetch_topology(&self) -> Result<TopologyInput, ClientError> {
        let data = self.session.get_json(TOPOLOGY_PATH)?;
        let mut input = TopologyInput::default();
        for topo in data["topology"].as_array().into_iter().flatten() {
            for node in topo["node"].as_array().into_iter().flatten() {
                for addr in node["host-tracker-service:addresses"]
                    .as_array()
                    .into_iter()
                    .flatten()
                {
                    if let (Some(ip), Some(mac)) = (addr["ip"].as_str(), addr["mac"].as_str()) {
                        input.addresses.push(sdfabric_core::topology::HostAddress {
                            mac: mac.to_owned(),
                            ip: ip.to_owned(),
                        });
                    }
                }
                for tp in node["termination-point"].as_array().into_iter().flatten() {
                    let Some(tp_id) = tp["tp-id"].as_str() else {
                        continue;
                    };
                    let Some((switch, port)) = parse_switch_tp(tp_id) else {
                        continue;
                    };
                    if self.is_port_down(&switch, port)? {
                        debug!("skipping link-down port {switch}:{port}");
                        continue;
                    }
                    input.switch_ports.push(SwitchPort { switch, port });
                }
            }
            for link in topo["link"].as_array().into_iter().flatten() {
                let (Some(src), Some(dst)) = (
                    link["source"]["source-tp"].as_str(),
                    link["destination"]["dest-tp"].as_str(),
                ) else {
                    continue;
                };
                input.links.push(TopologyLink {
                    source: parse_endpoint(src),
                    dest: parse_endpoint(dst),
                });
            }
        }
        Ok(input)
    }

    fn is_port_down(&self, switch: &str, port: u32) -> Result<bool, ClientError> {
        let path = format!(
            "/restconf/operational/opendaylight-inventory:nodes/node/openflow:{switch}\
             /node-connector/openflow:{switch}:{port}"
        );
        let data = self.session.get_json(&path)?;
        Ok(data["node-connector"][0]["flow-node-inventory:state"]["link-down"]
            .as_bool()
            .unwrap_or(false))
    }

    /// Resolves an OpenFlow port number to the OVS interface name, from the
    /// operational bridge document.
    pub fn port_ifname(&self, switch: &str, port: u32) -> Result<String, ClientError> {
        let path = format!(
            "/restconf/operational/network-topology:network-topology/topology/ovsdb:1\
             /node/ovsdb:{switch}%2Fbridge%2Fovsbr0"
        );
        let data = self.session.get_json(&path)?;
        for tp in data["node"][0]["termination-point"]
            .as_array()
            .into_iter()
            .flatten()
        {
            if tp["ovsdb:ofport"].as_u64() == Some(u64::from(port)) {
                if let Some(name) = tp["tp-id"].as_str() {
                    return Ok(name.to_owned());
                }
            }
        }
        Err(ClientError::NotFound(format!(
            "interface for port {port} on {switch}"
        )))
    }

    fn flow_path(switch: &str, table: u32, flow_id: &str) -> String {
        format!(
            "/restconf/config/opendaylight-inventory:nodes/node/openflow:{switch}\
             /table/{table}/flow/{flow_id}"
        )
    }

    fn put_flow(
        &self,
        switch: &str,
        table: u32,
        flow_id: &str,
        flowname: &str,
        priority: u32,
        match_doc: Value,
        actions: Value,
    ) -> Result<(), ClientError> {
        let body = json!({
            "flow-node-inventory:flow": [{
                "id": flow_id,
                "flow-name": flowname,
                "table_id": table,
                "priority": priority,
                "idle-timeout": 0,
                "hard-timeout": 0,
                "match": match_doc,
                "instructions": {
                    "instruction": [{
                        "order": 0,
                        "apply-actions": {"action": actions}
                    }]
                }
            }]
        });
        self.session
            .put_json(&Self::flow_path(switch, table, flow_id), &body)
    }

    fn ipv4_match(src_ip: &str, dst_ip: &str) -> Value {
        json!({
            "ethernet-match": {"ethernet-type": {"type": 2048}},
            "ipv4-source": format!("{src_ip}/32"),
            "ipv4-destination": format!("{dst_ip}/32"),
        })
    }

    /// Installs a match on `(src_ip, dst_ip)` whose action enqueues the
    /// packet into `queue_no` on `outport`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_flow_enqueue(
        &self,
        switch: &str,
        outport: u32,
        queue_no: u32,
        src_ip: &str,
        dst_ip: &str,
        table: u32,
        flowname: &str,
        priority: u32,
    ) -> Result<(), ClientError> {
        debug!("enqueue rule at {switch}: {src_ip}->{dst_ip} port {outport} queue {queue_no}");
        let flow_id = format!("{flowname}_{src_ip}_{dst_ip}");
        let actions = json!([
            {"order": 0, "set-queue-action": {"queue-id": queue_no}},
            {"order": 1, "output-action": {
                "output-node-connector": outport.to_string(),
                "max-length": 65535,
            }},
        ]);
        self.put_flow(
            switch,
            table,
            &flow_id,
            flowname,
            priority,
            Self::ipv4_match(src_ip, dst_ip),
            actions,
        )
    }

    /// Installs a baseline rule: anything arriving on `inport` egresses on
    /// `outport`.
    pub fn add_flow_inport(
        &self,
        switch: &str,
        inport: u32,
        outport: u32,
        flowname: &str,
        priority: u32,
    ) -> Result<(), ClientError> {
        let flow_id = format!("{flowname}_{inport}");
        let match_doc = json!({"in-port": format!("openflow:{switch}:{inport}")});
        let actions = json!([
            {"order": 0, "output-action": {
                "output-node-connector": outport.to_string(),
                "max-length": 65535,
            }},
        ]);
        self.put_flow(switch, DEFAULT_TABLE, &flow_id, flowname, priority, match_doc, actions)
    }

    /// Installs a per-pair path rule: `(src_ip, dst_ip)` egresses on
    /// `outport`, overriding the baseline by priority.
    pub fn add_flow_match_output(
        &self,
        switch: &str,
        outport: u32,
        src_ip: &str,
        dst_ip: &str,
        flowname: &str,
        priority: u32,
    ) -> Result<(), ClientError> {
        let flow_id = format!("{flowname}_{src_ip}_{dst_ip}");
        let actions = json!([
            {"order": 0, "output-action": {
                "output-node-connector": outport.to_string(),
                "max-length": 65535,
            }},
        ]);
        self.put_flow(
            switch,
            DEFAULT_TABLE,
            &flow_id,
            flowname,
            priority,
            Self::ipv4_match(src_ip, dst_ip),
            actions,
        )
    }

    /// Reads the configured rules of a table; an absent table is empty.
    pub fn flows(&self, switch: &str, table: u32) -> Result<Vec<FlowRecord>, ClientError> {
        let path = format!(
            "/restconf/config/opendaylight-inventory:nodes/node/openflow:{switch}/table/{table}"
        );
        let Some(data) = self.session.get_json_opt(&path)? else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for flow in data["flow-node-inventory:table"][0]["flow"]
            .as_array()
            .into_iter()
            .flatten()
        {
            let Some(id) = flow["id"].as_str() else {
                continue;
            };
            records.push(FlowRecord {
                id: id.to_owned(),
                name: flow["flow-name"].as_str().map(str::to_owned),
                src_ip: flow["match"]["ipv4-source"].as_str().map(str::to_owned),
                dst_ip: flow["match"]["ipv4-destination"]
                    .as_str()
                    .map(str::to_owned),
            });
        }
        Ok(records)
    }

    pub fn del_flow(&self, switch: &str, table: u32, flow_id: &str) -> Result<(), ClientError> {
        self.session
            .delete(&Self::flow_path(switch, table, flow_id))
    }

    /// Removes the rules on `switch` carrying `flowname` whose match covers
    /// the given pair. Individual delete failures are logged and skipped so
    /// the sweep is idempotent.
    pub fn del_flows_by_name_match(
        &self,
        switch: &str,
        flowname: &str,
        src_ip: &str,
        dst_ip: &str,
    ) -> Result<usize, ClientError> {
        let mut removed = 0;
        for flow in self.flows(switch, DEFAULT_TABLE)? {
            if flow.name.as_deref() != Some(flowname) {
                continue;
            }
            if !(ip_matches(flow.src_ip.as_deref(), src_ip)
                && ip_matches(flow.dst_ip.as_deref(), dst_ip))
            {
                continue;
            }
            match self.del_flow(switch, DEFAULT_TABLE, &flow.id) {
                Ok(()) => removed += 1,
                Err(e) => warn!("could not delete flow {} at {switch}: {e}", flow.id),
            }
        }
        Ok(removed)
    }

    /// Removes every rule carrying `flowname` across all switches.
    pub fn del_all_flows_by_name(
        &self,
        topo: &Topology,
        flowname: &str,
    ) -> Result<usize, ClientError> {
        let mut removed = 0;
        for switch in topo.switches() {
            let flows = match self.flows(&switch.id, DEFAULT_TABLE) {
                Ok(flows) => flows,
                Err(e) => {
                    warn!("could not list flows at {}: {e}", switch.id);
                    continue;
                }
            };
            for flow in flows {
                if flow.name.as_deref() != Some(flowname) {
                    continue;
                }
                match self.del_flow(&switch.id, DEFAULT_TABLE, &flow.id) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("could not delete flow {} at {}: {e}", flow.id, switch.id),
                }
            }
        }
        Ok(removed)
    }

    /// Installs the baseline forwarding rules for a port pairing.
    pub fn install_default_paths(&self, pairing: &PortPairing) -> Result<(), ClientError> {
        for (switch, pairs) in pairing.switch_pairs() {
            info!("installing {} default-path rules on {switch}", pairs.len());
            for (&inport, &outport) in pairs {
                self.add_flow_inport(
                    switch,
                    inport,
                    outport,
                    FLOWNAME_DEFAULT_PATH,
                    PRIORITY_DEFAULT_PATH,
                )?;
            }
        }
        Ok(())
    }
}

fn ip_matches(field: Option<&str>, ip: &str) -> bool {
    field
        .map(|f| f.split('/').next() == Some(ip))
        .unwrap_or(false)
}

/// `openflow:40960021:2` -> `(40960021, 2)`; LOCAL and host endpoints yield
/// `None`.
fn parse_switch_tp(tp_id: &str) -> Option<(String, u32)> {
    let mut parts = tp_id.splitn(3, ':');
    if parts.next() != Some("openflow") {
        return None;
    }
    let switch = parts.next()?.to_owned();
    let port = parts.next()?;
    if port == "LOCAL" {
        return None;
    }
    Some((switch, port.parse().ok()?))
}

/// Either side of a discovered link: a switch termination point or a
/// host-tracker node id (`host:<mac>`).
fn parse_endpoint(tp_id: &str) -> LinkEndpoint {
    if let Some((switch, port)) = parse_switch_tp(tp_id) {
        return LinkEndpoint {
            node: switch,
            port: Some(port),
        };
    }
    let node = tp_id.split_once(':').map(|(_, rest)| rest).unwrap_or(tp_id);
    LinkEndpoint {
        node: node.to_owned(),
        port: None,
    }
}
