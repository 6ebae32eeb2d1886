//! The telemetry collaborator: read-only time-series CPU utilization for
//! hypervisors and VMs.

use serde_json::Value;

use crate::http::{ClientError, Session};

const HOST_RESOURCE_KIND: &str = "nova_compute";
const VM_RESOURCE_KIND: &str = "instance";
const HOST_CPU_METRIC: &str = "compute.node.cpu.percent";
const VM_CPU_METRIC: &str = "cpu_util";

/// One `[timestamp, interval, value]` sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub timestamp: String,
    pub interval_secs: f64,
    pub value: f64,
}

/// The telemetry client. `window` is the number of trailing samples
/// averaged for utilization queries.
#[derive(Debug)]
pub struct TelemetryClient {
    session: Session,
    window: usize,
}

impl TelemetryClient {
    pub fn new(session: Session) -> Self {
        Self { session, window: 6 }
    }

    fn resource_id(&self, kind: &str, key: &str, wanted: &str) -> Result<String, ClientError> {
        let resources = self.session.get_json(&format!("/v1/resource/{kind}"))?;
        for rsrc in resources.as_array().into_iter().flatten() {
            if rsrc[key].as_str() == Some(wanted) && rsrc["ended_at"].is_null() {
                if let Some(id) = rsrc["id"].as_str() {
                    return Ok(id.to_owned());
                }
            }
        }
        Err(ClientError::NotFound(format!("{kind} resource {wanted}")))
    }

    /// Measures for one metric of one resource, oldest first.
    pub fn measures(
        &self,
        kind: &str,
        resource_id: &str,
        metric: &str,
    ) -> Result<Vec<Measure>, ClientError> {
        let data = self.session.get_json(&format!(
            "/v1/resource/{kind}/{resource_id}/metric/{metric}/measures"
        ))?;
        Ok(data
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(parse_measure)
            .collect())
    }

    fn mean_tail(&self, measures: &[Measure]) -> Option<f64> {
        if measures.is_empty() {
            return None;
        }
        let tail = &measures[measures.len().saturating_sub(self.window)..];
        Some(tail.iter().map(|m| m.value).sum::<f64>() / tail.len() as f64)
    }

    /// Mean CPU utilization of a hypervisor over the trailing window, as a
    /// fraction of 1.0. The telemetry backend registers hypervisors as
    /// `compute.<hostname>`.
    pub fn host_utilization(&self, hostname: &str) -> Result<f64, ClientError> {
        let id = self.resource_id(
            HOST_RESOURCE_KIND,
            "host_name",
            &format!("compute.{hostname}"),
        )?;
        let measures = self.measures(HOST_RESOURCE_KIND, &id, HOST_CPU_METRIC)?;
        self.mean_tail(&measures)
            .map(|percent| percent / 100.0)
            .ok_or_else(|| ClientError::NotFound(format!("measures for {hostname}")))
    }

    /// Mean CPU utilization of a VM over the trailing window, in percent.
    pub fn vm_utilization(&self, vm_name: &str) -> Result<f64, ClientError> {
        let id = self.resource_id(VM_RESOURCE_KIND, "display_name", vm_name)?;
        let measures = self.measures(VM_RESOURCE_KIND, &id, VM_CPU_METRIC)?;
        self.mean_tail(&measures)
            .ok_or_else(|| ClientError::NotFound(format!("measures for {vm_name}")))
    }
}

fn parse_measure(value: &Value) -> Option<Measure> {
    let row = value.as_array()?;
    Some(Measure {
        timestamp: row.first()?.as_str()?.to_owned(),
        interval_secs: row.get(1)?.as_f64()?,
        value: row.get(2)?.as_f64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_support;

    #[test]
    fn host_utilization_averages_the_tail() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/v1/resource/nova_compute")
            .with_body(r#"[{"id": "r-1", "host_name": "compute.compute4", "ended_at": null}]"#)
            .create();
        let samples: Vec<String> = (0..10)
            .map(|i| format!(r#"["2018-01-0{}T00:00:00+00:00", 60.0, {}.0]"#, i % 9 + 1, i * 10))
            .collect();
        server
            .mock(
                "GET",
                "/v1/resource/nova_compute/r-1/metric/compute.node.cpu.percent/measures",
            )
            .with_body(format!("[{}]", samples.join(",")))
            .create();

        let client = TelemetryClient::new(test_support::session(&server));
        // Last six samples: 40..90 percent, mean 65% = 0.65.
        let util = client.host_utilization("compute4")?;
        assert!((util - 0.65).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn unknown_vm_is_not_found() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/v1/resource/instance")
            .with_body("[]")
            .create();
        let client = TelemetryClient::new(test_support::session(&server));
        assert!(matches!(
            client.vm_utilization("ghost"),
            Err(ClientError::NotFound(..))
        ));
    }
}
