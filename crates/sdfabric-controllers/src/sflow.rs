//! The sFlow collector client: pushes the flow definition used for per-pair
//! byte rates and reads aggregated flows back, translated into switch DPIDs
//! and OpenFlow port numbers.

use rustc_hash::FxHashMap;
use serde_json::json;

use sdfabric_core::naming::{data_source_to_port, switch_ip_to_dpid};

use crate::http::{ClientError, Session};

/// The flow definition keyed on IP source/destination.
pub const FLOW_IP: &str = "ip_flows";

/// The sFlow collaborator.
#[derive(Debug)]
pub struct SflowClient {
    session: Session,
}

impl SflowClient {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Defines (idempotently) the `ip_flows` aggregation the readers below
    /// depend on.
    pub fn define_ip_flows(&self) -> Result<(), ClientError> {
        let body = json!({
            "keys": "ipsource,ipdestination",
            "value": "bytes",
            "log": true,
        });
        self.session.put_json(&format!("/flow/{FLOW_IP}/json"), &body)
    }

    /// The byte rate of one `(src, dst)` pair as seen by `agent` (a switch
    /// DPID or `"ALL"`), if the collector has the flow.
    pub fn flow_rate(
        &self,
        src_ip: &str,
        dst_ip: &str,
        agent: &str,
    ) -> Result<Option<f64>, ClientError> {
        let agent_ip = sdfabric_core::naming::switch_dpid_to_ip(agent);
        let data = self.session.get_json(&format!(
            "/activeflows/{agent_ip}/{FLOW_IP}/json?maxFlows=200"
        ))?;
        let key = format!("{src_ip},{dst_ip}");
        for entry in data.as_array().into_iter().flatten() {
            if entry["key"].as_str() == Some(&key) {
                return Ok(entry["value"].as_f64());
            }
        }
        Ok(None)
    }

    /// Aggregate incoming byte rate per `(switch DPID, port)`, from the
    /// collector-wide dump. Optionally excludes one `(src, dst)` pair from
    /// the sums.
    pub fn port_loads(
        &self,
        exclude: Option<(&str, &str)>,
    ) -> Result<FxHashMap<(String, u32), f64>, ClientError> {
        let data = self.session.get_json(&format!("/dump/ALL/{FLOW_IP}/json"))?;
        let exclude_key = exclude.map(|(s, d)| format!("{s},{d}"));
        let mut loads: FxHashMap<(String, u32), f64> = FxHashMap::default();
        for entry in data.as_array().into_iter().flatten() {
            let Some(agent) = entry["agent"].as_str() else {
                continue;
            };
            let Some(data_source) = entry["dataSource"]
                .as_str()
                .and_then(|s| s.parse::<u32>().ok())
                .or_else(|| entry["dataSource"].as_u64().map(|v| v as u32))
            else {
                continue;
            };
            let dpid = switch_ip_to_dpid(agent);
            let port = data_source_to_port(&dpid, data_source);
            let mut rate = 0.0;
            for top in entry["topKeys"].as_array().into_iter().flatten() {
                if top["key"].as_str() == exclude_key.as_deref() {
                    continue;
                }
                rate += top["value"].as_f64().unwrap_or(0.0);
            }
            *loads.entry((dpid, port)).or_default() += rate;
        }
        Ok(loads)
    }

    /// The switches (and inbound ports) currently observing a pair, for
    /// path monitoring.
    pub fn flow_locations(
        &self,
        src_ip: &str,
        dst_ip: &str,
    ) -> Result<Vec<(String, u32)>, ClientError> {
        let data = self.session.get_json(&format!(
            "/flowlocations/ALL/{FLOW_IP}/json?key={src_ip},{dst_ip}"
        ))?;
        let mut locations = Vec::new();
        for entry in data.as_array().into_iter().flatten() {
            let (Some(agent), Some(data_source)) = (
                entry["agent"].as_str(),
                entry["dataSource"]
                    .as_str()
                    .and_then(|s| s.parse::<u32>().ok())
                    .or_else(|| entry["dataSource"].as_u64().map(|v| v as u32)),
            ) else {
                continue;
            };
            let dpid = switch_ip_to_dpid(agent);
            let port = data_source_to_port(&dpid, data_source);
            locations.push((dpid, port));
        }
        Ok(locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_support;

    fn client(server: &mockito::ServerGuard) -> SflowClient {
        SflowClient::new(test_support::session_with_auth(server, "", ""))
    }

    #[test]
    fn define_puts_the_flow_keys() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let put = server
            .mock("PUT", "/flow/ip_flows/json")
            .match_body(mockito::Matcher::PartialJson(json!({
                "keys": "ipsource,ipdestination",
                "value": "bytes",
            })))
            .create();
        client(&server).define_ip_flows()?;
        put.assert();
        Ok(())
    }

    #[test]
    fn port_loads_applies_the_data_source_offset() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/dump/ALL/ip_flows/json")
            .with_body(
                json!([
                    {"agent": "192.168.99.121", "dataSource": "6", "topKeys": [
                        {"key": "192.168.0.4,192.168.0.2", "value": 2000.0},
                        {"key": "192.168.0.5,192.168.0.2", "value": 500.0}
                    ]},
                    {"agent": "192.168.0.4", "dataSource": "1", "topKeys": [
                        {"key": "192.168.0.4,192.168.0.2", "value": 100.0}
                    ]}
                ])
                .to_string(),
            )
            .create();

        let loads = client(&server).port_loads(None)?;
        // Switch agents shift the data source by two; hosts do not.
        assert_eq!(loads[&("40960021".to_owned(), 4)], 2500.0);
        assert_eq!(loads[&("192.168.0.4".to_owned(), 1)], 100.0);
        Ok(())
    }

    #[test]
    fn port_loads_can_exclude_a_pair() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/dump/ALL/ip_flows/json")
            .with_body(
                json!([
                    {"agent": "192.168.99.121", "dataSource": "6", "topKeys": [
                        {"key": "192.168.0.4,192.168.0.2", "value": 2000.0},
                        {"key": "192.168.0.5,192.168.0.2", "value": 500.0}
                    ]}
                ])
                .to_string(),
            )
            .create();

        let loads = client(&server).port_loads(Some(("192.168.0.4", "192.168.0.2")))?;
        assert_eq!(loads[&("40960021".to_owned(), 4)], 500.0);
        Ok(())
    }
}
