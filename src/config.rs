//! Deployment naming scheme and workload rendering.
//!
//! The placement coordinator works with workload templates that are not yet
//! tied to machines. Rendering a template against a concrete (client, server)
//! pair produces the admission-service client descriptor: a network flow into
//! the server, a storage flow at the server, and a network flow back out,
//! wired to the queues named after the hosts involved. The naming scheme here
//! is the one shared with the queue-provisioning side, so the flows always
//! resolve against the queues created when VMs were registered.

use crate::curves::Segment;
use crate::descriptors::{ClientSpec, EnforcerType, FlowSpec, QueueSpec};
use serde::{Deserialize, Serialize};

/// Host link bandwidth in bytes per second.
pub const NETWORK_BANDWIDTH: f64 = 125_000_000.0;
/// Storage queues are measured in device seconds per second.
pub const STORAGE_BANDWIDTH: f64 = 1.0;

pub fn network_in_flow_name(client_name: &str) -> String {
    format!("F{client_name}In")
}

pub fn network_out_flow_name(client_name: &str) -> String {
    format!("F{client_name}Out")
}

pub fn storage_flow_name(client_name: &str) -> String {
    format!("F{client_name}Storage")
}

/// Queue carrying traffic into a host.
pub fn queue_in_name(host: &str) -> String {
    format!("{host}-in")
}

/// Queue carrying traffic out of a host.
pub fn queue_out_name(host: &str) -> String {
    format!("{host}-out")
}

/// Storage queue name for a server VM.
pub fn server_name(host: &str, vm: &str) -> String {
    format!("{host}vm{vm}")
}

/// Resolvable address of a VM under the deployment's address prefix.
pub fn vm_addr(prefix: &str, host: &str, vm: &str) -> String {
    format!("{}-{}", prefix, server_name(host, vm))
}

pub fn network_in_queue(host: &str) -> QueueSpec {
    QueueSpec {
        name: queue_in_name(host),
        bandwidth: NETWORK_BANDWIDTH,
    }
}

pub fn network_out_queue(host: &str) -> QueueSpec {
    QueueSpec {
        name: queue_out_name(host),
        bandwidth: NETWORK_BANDWIDTH,
    }
}

pub fn storage_queue(server: &str) -> QueueSpec {
    QueueSpec {
        name: server.to_owned(),
        bandwidth: STORAGE_BANDWIDTH,
    }
}

/// A workload awaiting placement: its SLO and the per-resource arrival curves
/// fitted from its trace, not yet bound to any machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadTemplate {
    pub name: String,
    #[serde(rename = "SLO")]
    pub slo: f64,
    #[serde(rename = "SLOpercentile", default, skip_serializing_if = "Option::is_none")]
    pub slo_percentile: Option<f64>,
    /// Set when re-placing a workload that was already admitted; pins the
    /// candidate list to its recorded server.
    #[serde(default)]
    pub admitted: bool,
    /// Filled in by a successful placement so the annotated template records
    /// where the workload landed.
    #[serde(rename = "clientHost", default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
    #[serde(rename = "clientVM", default, skip_serializing_if = "Option::is_none")]
    pub client_vm: Option<String>,
    #[serde(rename = "serverHost", default, skip_serializing_if = "Option::is_none")]
    pub server_host: Option<String>,
    #[serde(rename = "serverVM", default, skip_serializing_if = "Option::is_none")]
    pub server_vm: Option<String>,
    /// Arrival curve of traffic from the workload VM to the server.
    #[serde(rename = "networkIn", default, skip_serializing_if = "Option::is_none")]
    pub network_in: Option<Vec<Segment>>,
    /// Arrival curve of traffic from the server back to the VM.
    #[serde(rename = "networkOut", default, skip_serializing_if = "Option::is_none")]
    pub network_out: Option<Vec<Segment>>,
    /// Arrival curve of storage work at the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Vec<Segment>>,
}

/// A client VM available for placement, as listed in a topology file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientVmEntry {
    #[serde(rename = "clientHost")]
    pub client_host: String,
    #[serde(rename = "clientVM")]
    pub client_vm: String,
}

/// A server VM available for placement, as listed in a topology file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerVmEntry {
    #[serde(rename = "serverHost")]
    pub server_host: String,
    #[serde(rename = "serverVM")]
    pub server_vm: String,
}

/// Topology file consumed by the placement-client driver: the VM inventory,
/// the workload templates, and the deployment flags. The driver writes the
/// same structure back out with each placed workload annotated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementTopology {
    #[serde(rename = "addrPrefix", default)]
    pub addr_prefix: String,
    #[serde(default)]
    pub enforce: bool,
    #[serde(rename = "clientVMs", default)]
    pub client_vms: Vec<ClientVmEntry>,
    #[serde(rename = "serverVMs", default)]
    pub server_vms: Vec<ServerVmEntry>,
    #[serde(default)]
    pub clients: Vec<WorkloadTemplate>,
}

/// Bind a template to a concrete client VM and server VM.
///
/// With `enforce` set, each flow carries the enforcement-point address it
/// should be pushed to: the network shapers sit at the sending host, the
/// storage scheduler at the server VM.
pub fn render_client(
    template: &WorkloadTemplate,
    client_host: &str,
    client_vm: &str,
    server_host: &str,
    server_vm: &str,
    addr_prefix: &str,
    enforce: bool,
) -> ClientSpec {
    let client_addr = vm_addr(addr_prefix, client_host, client_vm);
    let server_addr = vm_addr(addr_prefix, server_host, server_vm);
    let mut flows = Vec::new();
    if let Some(curve) = &template.network_in {
        let mut flow = FlowSpec {
            name: network_in_flow_name(&template.name),
            queues: vec![queue_out_name(client_host), queue_in_name(server_host)],
            arrival_info: curve.clone(),
            ..FlowSpec::default()
        };
        if enforce {
            flow.enforcer_type = Some(EnforcerType::Network);
            flow.enforcer_addr = Some(client_host.to_owned());
            flow.src_addr = Some(client_addr.clone());
            flow.dst_addr = Some(server_addr.clone());
        }
        flows.push(flow);
    }
    if let Some(curve) = &template.storage {
        let mut flow = FlowSpec {
            name: storage_flow_name(&template.name),
            queues: vec![server_name(server_host, server_vm)],
            arrival_info: curve.clone(),
            ..FlowSpec::default()
        };
        if enforce {
            flow.enforcer_type = Some(EnforcerType::Storage);
            flow.enforcer_addr = Some(server_addr.clone());
            flow.client_addr = Some(client_addr.clone());
        }
        flows.push(flow);
    }
    if let Some(curve) = &template.network_out {
        let mut flow = FlowSpec {
            name: network_out_flow_name(&template.name),
            queues: vec![queue_out_name(server_host), queue_in_name(client_host)],
            arrival_info: curve.clone(),
            ..FlowSpec::default()
        };
        if enforce {
            flow.enforcer_type = Some(EnforcerType::Network);
            flow.enforcer_addr = Some(server_host.to_owned());
            flow.src_addr = Some(server_addr);
            flow.dst_addr = Some(client_addr);
        }
        flows.push(flow);
    }
    ClientSpec {
        name: template.name.clone(),
        slo: template.slo,
        slo_percentile: template.slo_percentile,
        admitted: template.admitted,
        flows,
    }
}
