//! Shared object graph of queues, flows, and workloads.
//!
//! Everything is id-keyed: entities live in flat per-type tables and reference
//! each other through copyable ids, so deletion is O(links touched) and the
//! analysis code never chases shared pointers. Queue-to-flow back-links are
//! `(flow, hop)` pairs. Names are unique per entity type and map back to ids.

use crate::curves::{Curve, Segment, TokenBucket};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);
    };
}

entity_id!(QueueId);
entity_id!(FlowId);
entity_id!(WorkloadId);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("queue name already in use")]
    QueueNameInUse,
    #[error("flow name already in use")]
    FlowNameInUse,
    #[error("workload name already in use")]
    WorkloadNameInUse,
    #[error("queue does not exist")]
    UnknownQueue,
    #[error("workload does not exist")]
    UnknownWorkload,
    #[error("queue still has active flows")]
    QueueHasActiveFlows,
    #[error("invalid argument")]
    InvalidArgument,
}

/// Back-link from a queue to a flow crossing it at a given hop of its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowHop {
    pub flow: FlowId,
    pub hop: usize,
}

#[derive(Debug)]
pub struct Queue {
    pub id: QueueId,
    pub name: String,
    /// Service bandwidth in work units per second, always positive.
    pub bandwidth: f64,
    /// Unordered set of (flow, hop) pairs passing through this queue.
    pub flows: Vec<FlowHop>,
}

#[derive(Debug)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub workload: WorkloadId,
    /// Ordered queue path; non-empty.
    pub path: Vec<QueueId>,
    /// Smaller number means higher scheduling priority; 0 is the highest.
    pub priority: u32,
    /// Control flows opt out of latency accounting entirely.
    pub ignore_latency: bool,
    /// Piecewise arrival curve, including the implicit origin segment.
    pub arrival_curve: Curve,
    /// Token-bucket shaper chosen by the optimizer; zero until solved.
    pub shaper: TokenBucket,
    /// Most recently computed worst-case latency.
    pub latency: f64,
}

#[derive(Debug)]
pub struct Workload {
    pub id: WorkloadId,
    pub name: String,
    /// Tail-latency SLO deadline in seconds, always positive.
    pub slo: f64,
    /// Percentile the SLO was sized at; opaque to the analysis.
    pub slo_percentile: Option<f64>,
    pub flows: Vec<FlowId>,
    /// Max worst-case latency over this workload's flows.
    pub latency: f64,
}

/// Parameters for one flow of a workload being added.
#[derive(Debug, Clone)]
pub struct FlowParams {
    pub name: String,
    pub path: Vec<QueueId>,
    pub priority: u32,
    pub ignore_latency: bool,
    /// Arrival curve segments without the implicit origin segment.
    pub arrival_info: Vec<Segment>,
}

/// Parameters for a workload being added.
#[derive(Debug, Clone)]
pub struct WorkloadParams {
    pub name: String,
    pub slo: f64,
    pub slo_percentile: Option<f64>,
    pub flows: Vec<FlowParams>,
}

/// The shared topology: flat tables plus name indexes.
///
/// Mutations are synchronous and atomic with respect to analysis; the
/// admission service serializes all access.
#[derive(Debug, Default)]
pub struct Topology {
    queues: BTreeMap<QueueId, Queue>,
    flows: BTreeMap<FlowId, Flow>,
    workloads: BTreeMap<WorkloadId, Workload>,
    queue_names: HashMap<String, QueueId>,
    flow_names: HashMap<String, FlowId>,
    workload_names: HashMap<String, WorkloadId>,
    next_queue: u32,
    next_flow: u32,
    next_workload: u32,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    pub fn add_queue(&mut self, name: &str, bandwidth: f64) -> Result<QueueId, TopologyError> {
        if bandwidth <= 0.0 {
            return Err(TopologyError::InvalidArgument);
        }
        if self.queue_names.contains_key(name) {
            return Err(TopologyError::QueueNameInUse);
        }
        let id = QueueId(self.next_queue);
        self.next_queue += 1;
        self.queues.insert(
            id,
            Queue {
                id,
                name: name.to_owned(),
                bandwidth,
                flows: Vec::new(),
            },
        );
        self.queue_names.insert(name.to_owned(), id);
        Ok(id)
    }

    pub fn del_queue(&mut self, id: QueueId) -> Result<(), TopologyError> {
        let queue = self.queues.get(&id).ok_or(TopologyError::UnknownQueue)?;
        if !queue.flows.is_empty() {
            return Err(TopologyError::QueueHasActiveFlows);
        }
        let queue = self.queues.remove(&id).unwrap();
        self.queue_names.remove(&queue.name);
        Ok(())
    }

    /// Create a workload and wire its flows into every queue they cross.
    ///
    /// The caller validates names and queue references up front; a failure
    /// here leaves the topology unchanged.
    pub fn add_workload(&mut self, params: WorkloadParams) -> Result<WorkloadId, TopologyError> {
        if params.slo <= 0.0 || params.flows.is_empty() {
            return Err(TopologyError::InvalidArgument);
        }
        if self.workload_names.contains_key(&params.name) {
            return Err(TopologyError::WorkloadNameInUse);
        }
        let mut batch_names = std::collections::HashSet::new();
        for flow in &params.flows {
            if flow.path.is_empty() {
                return Err(TopologyError::InvalidArgument);
            }
            if self.flow_names.contains_key(&flow.name) || !batch_names.insert(&flow.name) {
                return Err(TopologyError::FlowNameInUse);
            }
            if flow.path.iter().any(|q| !self.queues.contains_key(q)) {
                return Err(TopologyError::UnknownQueue);
            }
        }
        let workload_id = WorkloadId(self.next_workload);
        self.next_workload += 1;
        let mut flow_ids = Vec::with_capacity(params.flows.len());
        for flow in params.flows {
            let flow_id = FlowId(self.next_flow);
            self.next_flow += 1;
            let mut arrival_curve = vec![Segment::origin()];
            arrival_curve.extend(flow.arrival_info);
            for (hop, queue_id) in flow.path.iter().enumerate() {
                self.queues
                    .get_mut(queue_id)
                    .unwrap()
                    .flows
                    .push(FlowHop { flow: flow_id, hop });
            }
            self.flow_names.insert(flow.name.clone(), flow_id);
            self.flows.insert(
                flow_id,
                Flow {
                    id: flow_id,
                    name: flow.name,
                    workload: workload_id,
                    path: flow.path,
                    priority: flow.priority,
                    ignore_latency: flow.ignore_latency,
                    arrival_curve,
                    shaper: TokenBucket::ZERO,
                    latency: 0.0,
                },
            );
            flow_ids.push(flow_id);
        }
        self.workload_names.insert(params.name.clone(), workload_id);
        self.workloads.insert(
            workload_id,
            Workload {
                id: workload_id,
                name: params.name,
                slo: params.slo,
                slo_percentile: params.slo_percentile,
                flows: flow_ids,
                latency: 0.0,
            },
        );
        Ok(workload_id)
    }

    /// Remove a workload: unlink all of its flows from their queues, then the
    /// flows, then the workload itself.
    pub fn del_workload(&mut self, id: WorkloadId) -> Result<(), TopologyError> {
        let workload = self
            .workloads
            .remove(&id)
            .ok_or(TopologyError::UnknownWorkload)?;
        self.workload_names.remove(&workload.name);
        for flow_id in workload.flows {
            let flow = self.flows.remove(&flow_id).unwrap();
            self.flow_names.remove(&flow.name);
            for queue_id in &flow.path {
                let queue = self.queues.get_mut(queue_id).unwrap();
                queue.flows.retain(|link| link.flow != flow_id);
            }
        }
        Ok(())
    }

    pub fn queue_id_by_name(&self, name: &str) -> Option<QueueId> {
        self.queue_names.get(name).copied()
    }

    pub fn flow_id_by_name(&self, name: &str) -> Option<FlowId> {
        self.flow_names.get(name).copied()
    }

    pub fn workload_id_by_name(&self, name: &str) -> Option<WorkloadId> {
        self.workload_names.get(name).copied()
    }

    /// Borrow a live queue; panics on a dangling id, which would be a
    /// bookkeeping bug rather than an input error.
    pub fn queue(&self, id: QueueId) -> &Queue {
        &self.queues[&id]
    }

    pub fn flow(&self, id: FlowId) -> &Flow {
        &self.flows[&id]
    }

    pub fn workload(&self, id: WorkloadId) -> &Workload {
        &self.workloads[&id]
    }

    pub fn flow_mut(&mut self, id: FlowId) -> &mut Flow {
        self.flows.get_mut(&id).unwrap()
    }

    pub fn workload_mut(&mut self, id: WorkloadId) -> &mut Workload {
        self.workloads.get_mut(&id).unwrap()
    }

    pub fn get_queue(&self, id: QueueId) -> Option<&Queue> {
        self.queues.get(&id)
    }

    pub fn get_workload(&self, id: WorkloadId) -> Option<&Workload> {
        self.workloads.get(&id)
    }

    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn workloads(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }

    pub fn queue_ids(&self) -> impl Iterator<Item = QueueId> + '_ {
        self.queues.keys().copied()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.len()
    }
}
