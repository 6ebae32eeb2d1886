#![warn(unreachable_pub, missing_debug_implementations)]

//! Synchronous REST collaborators for the sdfabric core: the compute
//! controller, the SDN controller (topology, OpenFlow rules, OVSDB queue
//! installation), the telemetry backend, and the sFlow collector.
//!
//! All clients share one [`http::Session`] shape: HTTP basic auth,
//! connect+read timeouts on every call, a pacing delay after each mutation,
//! and a bounded retry discipline for operational-state verification.

pub mod compute;
pub mod http;
pub mod ovsdb;
pub mod sdn;
pub mod sflow;
pub mod telemetry;

pub use compute::ComputeClient;
pub use http::{ClientError, Endpoint, Session, SessionOpts};
pub use ovsdb::QueueInstaller;
pub use sdn::SdnClient;
pub use sflow::SflowClient;
pub use telemetry::TelemetryClient;
