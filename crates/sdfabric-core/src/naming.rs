//! Node-identifier classification and the fixed address-mapping conventions
//! shared with the compute and SDN controllers.
//!
//! Switch tiers are encoded structurally in the datapath id: the
//! second-to-last character is `0` for core, `1` for aggregation and `2` for
//! edge switches. Hosts appear either as MAC addresses (in the L2 topology)
//! or as IPv4 addresses (everywhere else).

/// The structural kind of a topology node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeTier {
    Core,
    Aggregation,
    Edge,
    HostMac,
    HostIp,
}

impl NodeTier {
    /// Classifies a node id by shape. Ids that are neither MAC-shaped,
    /// IPv4-shaped, nor valid switch DPIDs are rejected.
    pub fn classify(id: &str) -> Result<NodeTier, NamingError> {
        if is_mac(id) {
            return Ok(NodeTier::HostMac);
        }
        if is_ipv4(id) {
            return Ok(NodeTier::HostIp);
        }
        if id.len() >= 2 && id.bytes().all(|b| b.is_ascii_digit()) {
            let tier_char = id.as_bytes()[id.len() - 2];
            return match tier_char {
                b'0' => Ok(NodeTier::Core),
                b'1' => Ok(NodeTier::Aggregation),
                b'2' => Ok(NodeTier::Edge),
                _ => Err(NamingError::UnrecognizedId(id.to_owned())),
            };
        }
        Err(NamingError::UnrecognizedId(id.to_owned()))
    }

    pub fn is_switch(self) -> bool {
        matches!(self, NodeTier::Core | NodeTier::Aggregation | NodeTier::Edge)
    }

    pub fn is_host(self) -> bool {
        matches!(self, NodeTier::HostMac | NodeTier::HostIp)
    }

    /// Height in the fat tree; used to split switch ports into up- and
    /// down-facing sets.
    pub(crate) fn rank(self) -> u8 {
        match self {
            NodeTier::Core => 3,
            NodeTier::Aggregation => 2,
            NodeTier::Edge => 1,
            NodeTier::HostMac | NodeTier::HostIp => 0,
        }
    }
}

fn is_mac(id: &str) -> bool {
    let groups: Vec<&str> = id.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn is_ipv4(id: &str) -> bool {
    let octets: Vec<&str> = id.split('.').collect();
    octets.len() == 4 && octets.iter().all(|o| !o.is_empty() && o.parse::<u8>().is_ok())
}

/// An error classifying a node id.
#[derive(Debug, thiserror::Error)]
pub enum NamingError {
    /// The id is neither MAC-shaped, IPv4-shaped, nor a valid switch DPID.
    #[error("unrecognized node id {0:?}")]
    UnrecognizedId(String),
}

/// `computeN` -> `192.168.0.N`.
pub fn hostname_to_ip(hostname: &str) -> Option<String> {
    let n = hostname.strip_prefix("compute")?;
    if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("192.168.0.{n}"))
}

/// `192.168.0.N` -> `computeN`.
pub fn ip_to_hostname(ip: &str) -> String {
    let n = ip.rsplit('.').next().unwrap_or_default();
    format!("compute{n}")
}

/// Management addresses `192.168.99.1XX` (XX in 00..=30) belong to switches.
pub fn is_switch_ip(ip: &str) -> bool {
    ip.rsplit('.')
        .next()
        .and_then(|o| o.parse::<u32>().ok())
        .map(|o| (100..=130).contains(&o))
        .unwrap_or(false)
}

/// `192.168.99.1XX` -> `409600XX`. Non-switch addresses come back with the
/// third octet zeroed (the data-plane address of the same machine); `"ALL"`
/// passes through for collector-wide queries.
pub fn switch_ip_to_dpid(ip: &str) -> String {
    if ip == "ALL" {
        return ip.to_owned();
    }
    if !is_switch_ip(ip) {
        let mut octets: Vec<&str> = ip.split('.').collect();
        if octets.len() == 4 {
            octets[2] = "0";
            return octets.join(".");
        }
        return ip.to_owned();
    }
    format!("409600{}", &ip[ip.len() - 2..])
}

/// `409600XX` -> `192.168.99.1XX`; non-switch ids pass through.
pub fn switch_dpid_to_ip(dpid: &str) -> String {
    if dpid == "ALL" {
        return dpid.to_owned();
    }
    match NodeTier::classify(dpid) {
        Ok(tier) if tier.is_switch() => format!("192.168.99.1{}", &dpid[dpid.len() - 2..]),
        _ => dpid.to_owned(),
    }
}

/// sFlow data sources on switches are offset by two from OpenFlow port
/// numbers; host agents report ports verbatim.
pub fn data_source_to_port(node_id: &str, data_source: u32) -> u32 {
    match NodeTier::classify(node_id) {
        Ok(tier) if tier.is_switch() => data_source.saturating_sub(2),
        _ => data_source,
    }
}

/// Inverse of [`data_source_to_port`].
pub fn port_to_data_source(node_id: &str, port: u32) -> u32 {
    match NodeTier::classify(node_id) {
        Ok(tier) if tier.is_switch() => port + 2,
        _ => port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_all_shapes() {
        assert_eq!(
            NodeTier::classify("ab:cd:ef:00:11:22").unwrap(),
            NodeTier::HostMac
        );
        assert_eq!(NodeTier::classify("192.168.0.5").unwrap(), NodeTier::HostIp);
        assert_eq!(NodeTier::classify("40960021").unwrap(), NodeTier::Edge);
        assert_eq!(
            NodeTier::classify("40960011").unwrap(),
            NodeTier::Aggregation
        );
        assert_eq!(NodeTier::classify("40960001").unwrap(), NodeTier::Core);
    }

    #[test]
    fn classify_rejects_malformed_ids() {
        for id in [
            "",
            "4",
            "4096x021",
            "40960041", // tier char out of range
            "ab:cd:ef:00:11",
            "ab:cd:ef:00:11:2g",
            "192.168.0",
            "192.168.0.999",
            "host-7",
        ] {
            assert!(
                NodeTier::classify(id).is_err(),
                "id {id:?} should be rejected"
            );
        }
    }

    #[test]
    fn hostname_ip_mapping_round_trips() {
        assert_eq!(hostname_to_ip("compute7").as_deref(), Some("192.168.0.7"));
        assert_eq!(ip_to_hostname("192.168.0.7"), "compute7");
        assert_eq!(hostname_to_ip("controller"), None);
    }

    #[test]
    fn dpid_ip_mapping_round_trips() {
        assert_eq!(switch_ip_to_dpid("192.168.99.121"), "40960021");
        assert_eq!(switch_dpid_to_ip("40960021"), "192.168.99.121");
        for dpid in ["40960001", "40960012", "40960024"] {
            assert_eq!(switch_ip_to_dpid(&switch_dpid_to_ip(dpid)), dpid);
        }
    }

    #[test]
    fn non_switch_addresses_pass_through() {
        assert_eq!(switch_ip_to_dpid("192.168.99.5"), "192.168.0.5");
        assert_eq!(switch_dpid_to_ip("192.168.0.5"), "192.168.0.5");
        assert_eq!(switch_ip_to_dpid("ALL"), "ALL");
        assert_eq!(switch_dpid_to_ip("ALL"), "ALL");
    }

    #[test]
    fn data_source_offset_applies_to_switches_only() {
        assert_eq!(data_source_to_port("40960021", 6), 4);
        assert_eq!(port_to_data_source("40960021", 4), 6);
        assert_eq!(data_source_to_port("192.168.0.5", 6), 6);
        assert_eq!(port_to_data_source("192.168.0.5", 6), 6);
    }
}
