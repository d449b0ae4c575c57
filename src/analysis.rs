//! Worst-case latency analysis over the shared queues.
//!
//! Two algorithms are available behind one entry point. Hop-by-hop handles
//! paths of arbitrary length by walking a flow's queues one at a time.
//! Aggregate two-hop mirrors the per-priority aggregation analysis and is the
//! default, since end-host links are modelled as at most two queues.
//!
//! Both treat equal-priority cross flows as interfering (the conservative
//! choice) and yield infinity the moment any leftover service is
//! overcommitted; callers read infinity as "fails its SLO".

use crate::curves::{
    aggregate, convolve, latency_bound, leftover, output, shaper_latency, RateLatency, TokenBucket,
};
use crate::topology::{Flow, FlowId, QueueId, Topology};
use std::collections::BTreeMap;

/// Which analysis algorithm a latency query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisMode {
    /// Per-priority aggregation for single- and two-hop paths.
    #[default]
    AggregateTwoHop,
    /// General analysis for paths of any length.
    HopByHop,
}

/// Worst-case latency of a flow, including the delay through its own shaper.
///
/// Assumes shaper curves and priorities are current; the compactor
/// reoptimizes before querying.
pub fn flow_latency(topo: &Topology, mode: AnalysisMode, flow_id: FlowId) -> f64 {
    let flow = topo.flow(flow_id);
    if flow.ignore_latency {
        return 0.0;
    }
    let queue_latency = match mode {
        AnalysisMode::HopByHop => hop_by_hop(topo, flow),
        AnalysisMode::AggregateTwoHop => aggregate_two_hop(topo, flow),
    };
    queue_latency + shaper_latency(&flow.arrival_curve, &flow.shaper)
}

/// The flow's arrival curve as seen entering hop `hop` of its path: its shaper
/// output pushed through the leftover service of every earlier hop.
fn arrival_at_hop(topo: &Topology, flow: &Flow, hop: usize) -> TokenBucket {
    if hop == 0 {
        return flow.shaper;
    }
    let arrival = arrival_at_hop(topo, flow, hop - 1);
    let service = service_at_hop(topo, flow, hop - 1);
    output(&arrival, &service)
}

/// The service left for `flow` at hop `hop` after subtracting every cross
/// flow of equal or higher priority at that queue.
fn service_at_hop(topo: &Topology, flow: &Flow, hop: usize) -> RateLatency {
    let queue = topo.queue(flow.path[hop]);
    let mut service = RateLatency::constant(queue.bandwidth);
    for link in &queue.flows {
        let other = topo.flow(link.flow);
        if other.priority <= flow.priority && other.id != flow.id {
            let arrival = arrival_at_hop(topo, other, link.hop);
            service = leftover(&arrival, &service);
        }
    }
    service
}

fn hop_by_hop(topo: &Topology, flow: &Flow) -> f64 {
    let mut arrival = flow.shaper;
    let mut latency = 0.0;
    for hop in 0..flow.path.len() {
        let service = service_at_hop(topo, flow, hop);
        latency += latency_bound(&arrival, &service);
        arrival = output(&arrival, &service);
    }
    latency
}

fn aggregate_two_hop(topo: &Topology, flow: &Flow) -> f64 {
    match flow.path.len() {
        1 => aggregate_one_hop(topo, flow),
        2 => aggregate_two_hops(topo, flow),
        n => {
            tracing::error!(flow = %flow.name, hops = n, "aggregate analysis supports at most two hops");
            f64::INFINITY
        }
    }
}

fn aggregate_one_hop(topo: &Topology, flow: &Flow) -> f64 {
    let first_queue = topo.queue(flow.path[0]);
    let mut arrival = TokenBucket::ZERO;
    let mut service = RateLatency::constant(first_queue.bandwidth);
    for link in &first_queue.flows {
        let other = topo.flow(link.flow);
        if other.priority <= flow.priority {
            if other.priority == flow.priority {
                // equal-priority sharers aggregate into one arrival
                arrival = aggregate(&other.shaper, &arrival);
            } else {
                service = leftover(&other.shaper, &service);
            }
        }
    }
    latency_bound(&arrival, &service)
}

fn aggregate_two_hops(topo: &Topology, flow: &Flow) -> f64 {
    let first_queue_id = flow.path[0];
    let second_queue_id = flow.path[1];
    let second_queue = topo.queue(second_queue_id);

    // Other first-hop queues feeding the second queue, mapped to the lowest
    // priority (largest value) among their competing flows.
    let mut feeder_queues: BTreeMap<QueueId, u32> = BTreeMap::new();
    for link in &second_queue.flows {
        let other = topo.flow(link.flow);
        if other.path[0] != first_queue_id && other.priority <= flow.priority {
            feeder_queues
                .entry(other.path[0])
                .and_modify(|p| *p = (*p).max(other.priority))
                .or_insert(other.priority);
        }
    }

    // Subtract each feeder's worst-case output from the second queue's service.
    let mut second_service = RateLatency::constant(second_queue.bandwidth);
    for (&feeder_id, &max_priority) in &feeder_queues {
        let feeder = topo.queue(feeder_id);
        let mut feeder_arrival = TokenBucket::ZERO;
        let mut feeder_service = RateLatency::constant(feeder.bandwidth);
        for link in &feeder.flows {
            let other = topo.flow(link.flow);
            if other.priority <= max_priority {
                if other.path.get(1) == Some(&second_queue_id) {
                    feeder_arrival = aggregate(&other.shaper, &feeder_arrival);
                } else {
                    feeder_service = leftover(&other.shaper, &feeder_service);
                }
            }
        }
        let feeder_output = output(&feeder_arrival, &feeder_service);
        second_service = leftover(&feeder_output, &second_service);
    }

    // First hop: aggregate equal-priority sharers, subtract strictly higher
    // priority flows that branch away, and remember the strictly higher
    // priority sharers present on both hops.
    let first_queue = topo.queue(first_queue_id);
    let mut arrival = TokenBucket::ZERO;
    let mut shared_arrival = TokenBucket::ZERO;
    let mut first_service = RateLatency::constant(first_queue.bandwidth);
    for link in &first_queue.flows {
        let other = topo.flow(link.flow);
        if other.priority <= flow.priority {
            if other.path.get(1) == Some(&second_queue_id) {
                if other.priority == flow.priority {
                    arrival = aggregate(&other.shaper, &arrival);
                } else {
                    shared_arrival = aggregate(&other.shaper, &shared_arrival);
                }
            } else {
                first_service = leftover(&other.shaper, &first_service);
            }
        }
    }

    let convolved = convolve(&first_service, &second_service);
    let final_service = leftover(&shared_arrival, &convolved);
    latency_bound(&arrival, &final_service)
}
