//! The OVSDB queue installer: materializes a planned [`QueueConfig`] on the
//! switches through the SDN controller's OVSDB mirror.
//!
//! The controller requires the QoS entry and the queue list to exist before
//! a port can reference them, so installation is a four-step transaction per
//! switch: PUT the node document (qos-entries + queues), verify the
//! operational QoS entries, PUT the termination-point bindings, verify them.
//! Teardown runs the same steps in reverse and never escalates: a resource
//! that is already gone is the desired state.

use log::{error, info, warn};
use serde_json::{json, Value};

use sdfabric_core::naming::switch_dpid_to_ip;
use sdfabric_core::qos::QueueConfig;
use sdfabric_core::units::BitsPerSec;

use crate::http::ClientError;
use crate::sdn::{
    SdnClient, DEFAULT_TABLE, FLOWNAME_SPECIAL_QUEUE, PRIORITY_SPECIAL_QUEUE,
};

/// The per-port default queue is granted this share of the total rate.
pub const DEFAULT_MIN_RATE_RATIO: f64 = 0.1;

fn qos_id(port: u32) -> String {
    format!("qos_port_{port}")
}

fn ovsdb_node_path(switch: &str) -> String {
    format!("/restconf/config/network-topology:network-topology/topology/ovsdb:1/node/ovsdb:{switch}")
}

fn bridge_tp_path(kind: &str, switch: &str, ifname: &str) -> String {
    format!(
        "/restconf/{kind}/network-topology:network-topology/topology/ovsdb:1\
         /node/ovsdb:{switch}%2Fbridge%2Fovsbr0/termination-point/{ifname}"
    )
}

fn queue_ref(switch: &str, queue_id: &str) -> String {
    format!(
        "/network-topology:network-topology/network-topology:topology\
         [network-topology:topology-id='ovsdb:1']/network-topology:node\
         [network-topology:node-id='ovsdb:{switch}']/ovsdb:queues\
         [ovsdb:queue-id='{queue_id}']"
    )
}

fn qos_ref(switch: &str, qos: &str) -> String {
    format!(
        "/network-topology:network-topology/network-topology:topology\
         [network-topology:topology-id='ovsdb:1']/network-topology:node\
         [network-topology:node-id='ovsdb:{switch}']/ovsdb:qos-entries\
         [ovsdb:qos-id='{qos}']"
    )
}

/// Installs and tears down queue configurations.
#[derive(Debug)]
pub struct QueueInstaller<'a> {
    sdn: &'a SdnClient,
}

impl<'a> QueueInstaller<'a> {
    pub fn new(sdn: &'a SdnClient) -> Self {
        Self { sdn }
    }

    /// Runs the full install: queues and bindings per switch, then the
    /// enqueue flow rules. On a failed switch the installer tears down what
    /// it already created before surfacing the error.
    pub fn install(&self, config: &QueueConfig, total_rate: BitsPerSec) -> Result<(), ClientError> {
        let mut done: Vec<&str> = Vec::new();
        for switch in config.switches() {
            info!("installing queues and flows on {switch}");
            if let Err(e) = self.install_switch(switch, config, total_rate) {
                error!("install failed on {switch}: {e}; rolling back {} switch(es)", done.len() + 1);
                for rollback in done.iter().chain([&switch]) {
                    self.teardown_switch(rollback, config);
                }
                return Err(e);
            }
            done.push(switch);
        }
        Ok(())
    }

    fn install_switch(
        &self,
        switch: &str,
        config: &QueueConfig,
        total_rate: BitsPerSec,
    ) -> Result<(), ClientError> {
        self.set_queues(switch, config, total_rate)?;
        for port in config.ports(switch) {
            for (src_ip, dst_ip) in config.flows(switch, port) {
                let queue_no = config
                    .queue_no(switch, src_ip, dst_ip)
                    .expect("planned flows have queue numbers");
                self.sdn.add_flow_enqueue(
                    switch,
                    port,
                    queue_no,
                    src_ip,
                    dst_ip,
                    DEFAULT_TABLE,
                    FLOWNAME_SPECIAL_QUEUE,
                    PRIORITY_SPECIAL_QUEUE,
                )?;
            }
        }
        Ok(())
    }

    /// The four-step transaction for one switch.
    fn set_queues(
        &self,
        switch: &str,
        config: &QueueConfig,
        total_rate: BitsPerSec,
    ) -> Result<(), ClientError> {
        let session = self.sdn.session();
        session.put_json(&ovsdb_node_path(switch), &self.node_document(switch, config, total_rate))?;
        for port in config.ports(switch) {
            session.verify_get(&format!(
                "/restconf/operational/network-topology:network-topology/topology/ovsdb:1\
                 /node/ovsdb:{switch}/ovsdb:qos-entries/{}",
                qos_id(port)
            ))?;
        }
        for port in config.ports(switch) {
            let ifname = self.sdn.port_ifname(switch, port)?;
            session.put_json(
                &bridge_tp_path("config", switch, &ifname),
                &self.binding_document(switch, &ifname, &qos_id(port)),
            )?;
            session.verify_get(&bridge_tp_path("operational", switch, &ifname))?;
        }
        Ok(())
    }

    /// The OVSDB node document: one QoS entry per port capped at the total
    /// rate, each referencing its per-port default queue as number 0 plus
    /// every planned queue by number.
    fn node_document(&self, switch: &str, config: &QueueConfig, total_rate: BitsPerSec) -> Value {
        let default_min = total_rate.scale_by(DEFAULT_MIN_RATE_RATIO);
        let mut qos_entries = Vec::new();
        let mut queues = Vec::new();
        for port in config.ports(switch) {
            let mut queue_list = vec![json!({
                "queue-number": "0",
                "queue-ref": queue_ref(switch, &format!("QUEUE-DEF-{port}")),
            })];
            queues.push(queue_document(
                &format!("QUEUE-DEF-{port}"),
                default_min,
                total_rate,
            ));
            for spec in config.queues(switch, port) {
                queue_list.push(json!({
                    "queue-number": spec.queue_no.to_string(),
                    "queue-ref": queue_ref(switch, &format!("QUEUE-{}", spec.queue_no)),
                }));
                queues.push(queue_document(
                    &format!("QUEUE-{}", spec.queue_no),
                    spec.min_rate,
                    spec.max_rate,
                ));
            }
            qos_entries.push(json!({
                "qos-id": qos_id(port),
                "qos-type": "ovsdb:qos-type-linux-htb",
                "qos-other-config": [{
                    "other-config-key": "max-rate",
                    "other-config-value": total_rate.into_u64().to_string(),
                }],
                "queue-list": queue_list,
            }));
        }
        json!({
            "network-topology:node": [{
                "node-id": format!("ovsdb:{switch}"),
                "connection-info": {
                    "ovsdb:remote-port": "6640",
                    "ovsdb:remote-ip": switch_dpid_to_ip(switch),
                },
                "ovsdb:qos-entries": qos_entries,
                "ovsdb:queues": queues,
            }]
        })
    }

    fn binding_document(&self, switch: &str, ifname: &str, qos: &str) -> Value {
        json!({
            "network-topology:termination-point": [{
                "ovsdb:name": ifname,
                "tp-id": ifname,
                "ovsdb:qos-entry": [{
                    "qos-key": 1,
                    "qos-ref": qos_ref(switch, qos),
                }]
            }]
        })
    }

    /// Tears down everything the configuration describes, in reverse order:
    /// flow rules, port bindings, QoS entries, queues, default queues.
    /// Failures are logged, never raised; a second run is a no-op.
    pub fn teardown(&self, config: &QueueConfig) {
        for switch in config.switches() {
            info!("deleting queues and flows on {switch}");
            self.teardown_switch(switch, config);
        }
    }

    fn teardown_switch(&self, switch: &str, config: &QueueConfig) {
        for port in config.ports(switch) {
            for (src_ip, dst_ip) in config.flows(switch, port) {
                if let Err(e) =
                    self.sdn
                        .del_flows_by_name_match(switch, FLOWNAME_SPECIAL_QUEUE, src_ip, dst_ip)
                {
                    warn!("flow cleanup at {switch} for {src_ip}->{dst_ip} failed: {e}");
                }
            }
            self.delete_port_queues(
                switch,
                port,
                &config
                    .queues(switch, port)
                    .iter()
                    .map(|q| q.queue_no)
                    .collect::<Vec<_>>(),
            );
        }
    }

    /// Unbind the port, delete its QoS entry, then its queues. Used both by
    /// planned teardown and by the maintenance sweep.
    pub fn delete_port_queues(&self, switch: &str, port: u32, queue_nos: &[u32]) {
        let session = self.sdn.session();
        let qos = qos_id(port);
        match self.sdn.port_ifname(switch, port) {
            Ok(ifname) => {
                let path = format!("{}/qos-entry/1", bridge_tp_path("config", switch, &ifname));
                if let Err(e) = session.delete(&path) {
                    warn!("could not unbind {qos} from {switch}:{port}: {e}");
                }
            }
            Err(e) => warn!("no interface name for {switch}:{port}: {e}"),
        }
        let qos_path = format!("{}/ovsdb:qos-entries/{qos}", ovsdb_node_path(switch));
        if let Err(e) = session.delete(&qos_path) {
            warn!("could not delete {qos} at {switch}: {e}");
        }
        for no in queue_nos {
            let path = format!("{}/ovsdb:queues/QUEUE-{no}", ovsdb_node_path(switch));
            if let Err(e) = session.delete(&path) {
                warn!("could not delete QUEUE-{no} at {switch}: {e}");
            }
        }
        let path = format!("{}/ovsdb:queues/QUEUE-DEF-{port}", ovsdb_node_path(switch));
        if let Err(e) = session.delete(&path) {
            warn!("could not delete QUEUE-DEF-{port} at {switch}: {e}");
        }
    }
}

fn queue_document(queue_id: &str, min_rate: BitsPerSec, max_rate: BitsPerSec) -> Value {
    json!({
        "queue-id": queue_id,
        "queues-other-config": [
            {"queue-other-config-key": "max-rate",
             "queue-other-config-value": max_rate.into_u64().to_string()},
            {"queue-other-config-key": "min-rate",
             "queue-other-config-value": min_rate.into_u64().to_string()},
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_support;
    use sdfabric_core::defpath::{self, PortPairing};
    use sdfabric_core::qos::QueuePlanner;
    use sdfabric_core::topology::{
        Endpoint, HostAddress, Topology, TopologyInput, TopologyLink,
    };
    use sdfabric_core::units::Mbps;

    /// host .2 - edge 40960021 - host .3, queue planned on the edge.
    fn tiny_config() -> (Topology, QueueConfig) {
        let input = TopologyInput {
            addresses: vec![
                HostAddress {
                    mac: "ab:cd:ef:00:00:02".into(),
                    ip: "192.168.0.2".into(),
                },
                HostAddress {
                    mac: "ab:cd:ef:00:00:03".into(),
                    ip: "192.168.0.3".into(),
                },
            ],
            switch_ports: vec![],
            links: vec![
                TopologyLink {
                    source: Endpoint {
                        node: "40960021".into(),
                        port: Some(2),
                    },
                    dest: Endpoint {
                        node: "ab:cd:ef:00:00:02".into(),
                        port: None,
                    },
                },
                TopologyLink {
                    source: Endpoint {
                        node: "40960021".into(),
                        port: Some(3),
                    },
                    dest: Endpoint {
                        node: "ab:cd:ef:00:00:03".into(),
                        port: None,
                    },
                },
            ],
        };
        let topo = Topology::from_input(&input).unwrap();
        let pairing = PortPairing::build(&topo);
        let mut planner = QueuePlanner::new(Mbps::new(95).into());
        planner.add_entry(
            "192.168.0.2",
            "192.168.0.3",
            Mbps::new(50).into(),
            Mbps::new(95).into(),
            None,
        );
        let resolver = move |topo: &Topology, src: &str, dst: &str| {
            defpath::default_path(topo, &pairing, src, dst)
        };
        let config = planner.build(&topo, &resolver).unwrap();
        (topo, config)
    }

    fn bridge_doc_mock(server: &mut mockito::ServerGuard) {
        server
            .mock(
                "GET",
                "/restconf/operational/network-topology:network-topology/topology/ovsdb:1\
                 /node/ovsdb:40960021%2Fbridge%2Fovsbr0",
            )
            .with_body(
                json!({"node": [{"termination-point": [
                    {"tp-id": "eth3", "ovsdb:ofport": 3},
                    {"tp-id": "eth2", "ovsdb:ofport": 2}
                ]}]})
                .to_string(),
            )
            .create();
    }

    #[test]
    fn install_runs_the_four_step_transaction() -> anyhow::Result<()> {
        let (_topo, config) = tiny_config();
        let mut server = mockito::Server::new();

        let node_put = server
            .mock(
                "PUT",
                "/restconf/config/network-topology:network-topology/topology/ovsdb:1\
                 /node/ovsdb:40960021",
            )
            .match_body(mockito::Matcher::PartialJson(json!({
                "network-topology:node": [{
                    "node-id": "ovsdb:40960021",
                    "connection-info": {"ovsdb:remote-ip": "192.168.99.121"},
                }]
            })))
            .with_status(201)
            .expect(1)
            .create();
        let qos_verify = server
            .mock(
                "GET",
                "/restconf/operational/network-topology:network-topology/topology/ovsdb:1\
                 /node/ovsdb:40960021/ovsdb:qos-entries/qos_port_3",
            )
            .with_body("{}")
            .expect(1)
            .create();
        bridge_doc_mock(&mut server);
        let bind_put = server
            .mock(
                "PUT",
                "/restconf/config/network-topology:network-topology/topology/ovsdb:1\
                 /node/ovsdb:40960021%2Fbridge%2Fovsbr0/termination-point/eth3",
            )
            .match_body(mockito::Matcher::PartialJson(json!({
                "network-topology:termination-point": [{"tp-id": "eth3"}]
            })))
            .expect(1)
            .create();
        let bind_verify = server
            .mock(
                "GET",
                "/restconf/operational/network-topology:network-topology/topology/ovsdb:1\
                 /node/ovsdb:40960021%2Fbridge%2Fovsbr0/termination-point/eth3",
            )
            .with_body("{}")
            .expect(1)
            .create();
        let flow_put = server
            .mock(
                "PUT",
                "/restconf/config/opendaylight-inventory:nodes/node/openflow:40960021\
                 /table/0/flow/SPECIAL_QUEUE_192.168.0.2_192.168.0.3",
            )
            .expect(1)
            .create();

        let sdn = SdnClient::new(test_support::session(&server));
        QueueInstaller::new(&sdn).install(&config, Mbps::new(95).into())?;

        node_put.assert();
        qos_verify.assert();
        bind_put.assert();
        bind_verify.assert();
        flow_put.assert();
        Ok(())
    }

    #[test]
    fn node_document_reserves_the_default_queue() {
        let (_topo, config) = tiny_config();
        let server = mockito::Server::new();
        let sdn = SdnClient::new(test_support::session(&server));
        let installer = QueueInstaller::new(&sdn);
        let doc = installer.node_document("40960021", &config, Mbps::new(95).into());

        let entries = doc["network-topology:node"][0]["ovsdb:qos-entries"]
            .as_array()
            .unwrap();
        assert_eq!(entries.len(), 1);
        let queue_list = entries[0]["queue-list"].as_array().unwrap();
        assert_eq!(queue_list[0]["queue-number"], "0");
        assert_eq!(queue_list[1]["queue-number"], "10");

        let queues = doc["network-topology:node"][0]["ovsdb:queues"]
            .as_array()
            .unwrap();
        let ids: Vec<&str> = queues.iter().map(|q| q["queue-id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["QUEUE-DEF-3", "QUEUE-10"]);
        // Default queue gets 10% of the total rate as its floor.
        assert_eq!(
            queues[0]["queues-other-config"][1]["queue-other-config-value"],
            "9500000"
        );
    }

    #[test]
    fn failed_verification_rolls_back_and_surfaces() {
        let (_topo, config) = tiny_config();
        let mut server = mockito::Server::new();
        server
            .mock("PUT", mockito::Matcher::Regex(".*".into()))
            .with_status(200)
            .create();
        // Operational state never appears.
        server
            .mock("GET", mockito::Matcher::Regex("/restconf/operational/.*".into()))
            .with_status(404)
            .create();
        // Teardown deletes may also 404.
        server
            .mock("DELETE", mockito::Matcher::Regex(".*".into()))
            .with_status(404)
            .create();

        let sdn = SdnClient::new(test_support::session(&server));
        let res = QueueInstaller::new(&sdn).install(&config, Mbps::new(95).into());
        assert!(matches!(res, Err(ClientError::VerificationFailed { .. })));
    }

    #[test]
    fn teardown_is_idempotent_under_missing_resources() {
        let (_topo, config) = tiny_config();
        let mut server = mockito::Server::new();
        bridge_doc_mock(&mut server);
        server
            .mock(
                "GET",
                "/restconf/config/opendaylight-inventory:nodes/node/openflow:40960021/table/0",
            )
            .with_body(json!({"flow-node-inventory:table": [{"id": 0, "flow": []}]}).to_string())
            .create();
        // Every delete answers 404: the second teardown of anything.
        let deletes = server
            .mock("DELETE", mockito::Matcher::Regex(".*".into()))
            .with_status(404)
            .expect_at_least(3)
            .create();

        let sdn = SdnClient::new(test_support::session(&server));
        let installer = QueueInstaller::new(&sdn);
        installer.teardown(&config);
        installer.teardown(&config);
        deletes.assert();
    }
}
