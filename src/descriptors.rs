//! JSON descriptors exchanged at the service boundaries.
//!
//! Field names follow the wire contract exactly (`SLO`, `arrivalInfo`,
//! `enforcerType`, ...), so these types round-trip descriptors produced by
//! external tooling unchanged. Validation lives in the admission service;
//! these are plain data.

use crate::curves::Segment;
use serde::{Deserialize, Serialize};

/// Admission status codes returned by every admission-service operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionStatus {
    Ok,
    MissingArgument,
    InvalidArgument,
    FlowNameInUse,
    ClientNameInUse,
    QueueNameInUse,
    FlowNameNonexistent,
    ClientNameNonexistent,
    QueueNameNonexistent,
    QueueHasActiveFlows,
}

impl AdmissionStatus {
    pub fn is_ok(self) -> bool {
        self == AdmissionStatus::Ok
    }
}

/// Which enforcement point a flow's parameters are pushed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcerType {
    Network,
    Storage,
}

/// One (rate, burst) rate-limiter stage pushed to an enforcement point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSpec {
    pub rate: f64,
    pub burst: f64,
}

/// A flow of a client workload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlowSpec {
    pub name: String,
    /// Ordered queue names along the flow's path.
    pub queues: Vec<String>,
    /// Arrival curve segments, without the implicit origin segment.
    #[serde(rename = "arrivalInfo", default)]
    pub arrival_info: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(rename = "ignoreLatency", default)]
    pub ignore_latency: bool,
    #[serde(rename = "enforcerType", default, skip_serializing_if = "Option::is_none")]
    pub enforcer_type: Option<EnforcerType>,
    #[serde(rename = "enforcerAddr", default, skip_serializing_if = "Option::is_none")]
    pub enforcer_addr: Option<String>,
    #[serde(rename = "srcAddr", default, skip_serializing_if = "Option::is_none")]
    pub src_addr: Option<String>,
    #[serde(rename = "dstAddr", default, skip_serializing_if = "Option::is_none")]
    pub dst_addr: Option<String>,
    #[serde(rename = "clientAddr", default, skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    /// Filled in after admission, before the enforcement push.
    #[serde(rename = "rateLimiters", default, skip_serializing_if = "Option::is_none")]
    pub rate_limiters: Option<Vec<RateLimiterSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
}

/// A client workload: one SLO covering a set of flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSpec {
    pub name: String,
    #[serde(rename = "SLO")]
    pub slo: f64,
    #[serde(rename = "SLOpercentile", default, skip_serializing_if = "Option::is_none")]
    pub slo_percentile: Option<f64>,
    /// Set by the placement coordinator when re-installing a placement that
    /// already passed the admission check; skips the latency verification.
    #[serde(default)]
    pub admitted: bool,
    pub flows: Vec<FlowSpec>,
}

/// A shared queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub bandwidth: f64,
}
