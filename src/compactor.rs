//! Shaper-parameter optimization over the topology.
//!
//! The engine owns the topology and tracks which queues were touched by
//! workload churn. Latency queries are lazy: the first query after a mutation
//! partitions the affected queues into connected groups (queues joined
//! transitively by sharing a workload), solves one linear program per group to
//! pick each flow's (rate, burst) shaper, assigns SLO-ranked priorities, and
//! only then runs the latency analysis. Subsequent queries reuse the cached
//! shaper curves until the next mutation.
//!
//! The LP minimizes aggregate shaper rate subject to three constraint
//! families: each shaper dominates its flow's arrival curve, first-hop rates
//! fit each queue, and the accumulated burst at every stage of every path
//! fits within the bandwidth left over from strictly higher priority traffic.
//! All rates and bursts are normalized by the first queue's bandwidth so the
//! program is dimensionless.

use crate::analysis::{self, AnalysisMode};
use crate::curves::{y_intercept, TokenBucket};
use crate::solver::{Direction, LpSolver, Relation, SimplexSolver, VarKind};
use crate::topology::{
    FlowId, QueueId, Topology, TopologyError, WorkloadId, WorkloadParams,
};
use std::collections::{BTreeSet, HashMap};

/// Safety margin applied to rate caps and SLO scaling to absorb the rounding
/// error of the floating-point solve.
pub const SAFETY_MARGIN: f64 = 0.999;

/// Network-calculus engine: topology, analysis mode, and the incremental
/// reoptimizer state.
#[derive(Debug)]
pub struct Engine {
    topology: Topology,
    mode: AnalysisMode,
    /// Queues whose shaper assignment may be stale; empty means every cached
    /// shaper curve is consistent with the topology.
    affected: BTreeSet<QueueId>,
}

impl Engine {
    pub fn new(mode: AnalysisMode) -> Engine {
        Engine {
            topology: Topology::new(),
            mode,
            affected: BTreeSet::new(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    /// True when a mutation since the last reoptimization means cached
    /// latencies may be stale.
    pub fn has_pending_changes(&self) -> bool {
        !self.affected.is_empty()
    }

    pub fn add_queue(&mut self, name: &str, bandwidth: f64) -> Result<QueueId, TopologyError> {
        self.topology.add_queue(name, bandwidth)
    }

    pub fn del_queue(&mut self, id: QueueId) -> Result<(), TopologyError> {
        self.topology.del_queue(id)
    }

    /// Add a workload and mark every queue its flows touch for reoptimization.
    pub fn add_workload(&mut self, params: WorkloadParams) -> Result<WorkloadId, TopologyError> {
        let id = self.topology.add_workload(params)?;
        self.mark_workload_queues(id);
        Ok(id)
    }

    /// Mark the workload's queues and remove it.
    pub fn del_workload(&mut self, id: WorkloadId) -> Result<(), TopologyError> {
        if self.topology.get_workload(id).is_none() {
            return Err(TopologyError::UnknownWorkload);
        }
        self.mark_workload_queues(id);
        self.topology.del_workload(id)
    }

    fn mark_workload_queues(&mut self, id: WorkloadId) {
        let queues: Vec<QueueId> = self
            .topology
            .workload(id)
            .flows
            .iter()
            .flat_map(|&f| self.topology.flow(f).path.iter().copied().collect::<Vec<_>>())
            .collect();
        self.affected.extend(queues);
    }

    pub fn shaper(&self, flow: FlowId) -> TokenBucket {
        self.topology.flow(flow).shaper
    }

    /// Worst-case latency of one flow, reoptimizing first if needed.
    pub fn flow_latency(&mut self, flow: FlowId) -> f64 {
        self.reoptimize_if_needed();
        let latency = analysis::flow_latency(&self.topology, self.mode, flow);
        self.topology.flow_mut(flow).latency = latency;
        latency
    }

    /// Worst-case latency of a workload: the max over its flows.
    pub fn workload_latency(&mut self, workload: WorkloadId) -> f64 {
        let flows = self.topology.workload(workload).flows.clone();
        let mut latency = 0.0f64;
        for flow in flows {
            latency = latency.max(self.flow_latency(flow));
        }
        self.topology.workload_mut(workload).latency = latency;
        latency
    }

    /// Recompute the latency of every workload.
    pub fn calc_all_latency(&mut self) {
        let ids: Vec<WorkloadId> = self.topology.workloads().map(|w| w.id).collect();
        for id in ids {
            self.workload_latency(id);
        }
    }

    fn reoptimize_if_needed(&mut self) {
        if self.affected.is_empty() {
            return;
        }
        self.reoptimize();
        self.affected.clear();
    }

    /// Partition the affected queues into connected workload groups and solve
    /// each group's LP independently.
    fn reoptimize(&mut self) -> bool {
        let mut remaining: BTreeSet<QueueId> = self.topology.queue_ids().collect();
        let mut groups: Vec<BTreeSet<WorkloadId>> = Vec::new();
        while let Some(&first) = self.affected.iter().next() {
            remaining.remove(&first);
            self.affected.remove(&first);
            let mut group = BTreeSet::new();
            let mut pending = vec![first];
            while let Some(queue_id) = pending.pop() {
                let links = self.topology.queue(queue_id).flows.clone();
                for link in links {
                    let workload_id = self.topology.flow(link.flow).workload;
                    group.insert(workload_id);
                    for &flow_id in &self.topology.workload(workload_id).flows {
                        for &path_queue in &self.topology.flow(flow_id).path {
                            if remaining.remove(&path_queue) {
                                self.affected.remove(&path_queue);
                                pending.push(path_queue);
                            }
                        }
                    }
                }
            }
            groups.push(group);
        }
        let mut result = true;
        for group in &groups {
            if !self.optimize_group(group) {
                result = false;
            }
        }
        result
    }

    /// Build and solve the LP for one connected group; write shaper curves
    /// and SLO-ranked priorities back into the topology.
    fn optimize_group(&mut self, group: &BTreeSet<WorkloadId>) -> bool {
        if group.is_empty() {
            return true;
        }
        // Distinct scaled SLOs, ascending: index is the priority level.
        let mut slo_levels: Vec<f64> = group
            .iter()
            .map(|&w| self.topology.workload(w).slo * SAFETY_MARGIN)
            .collect();
        slo_levels.sort_by(|a, b| a.partial_cmp(b).unwrap());
        slo_levels.dedup();
        let priority_of = |slo: f64| slo_levels.iter().position(|&s| s == slo).unwrap() as u32;

        // Distinct first-hop paths across the group, and a stage index for
        // every distinct first-hop queue.
        let mut paths: Vec<Vec<QueueId>> = Vec::new();
        let mut stage_order: Vec<QueueId> = Vec::new();
        let mut stage_index: HashMap<QueueId, usize> = HashMap::new();
        for &workload_id in group {
            let workload = self.topology.workload(workload_id);
            let mut workload_path = Vec::with_capacity(workload.flows.len());
            for &flow_id in &workload.flows {
                let queue_id = self.topology.flow(flow_id).path[0];
                workload_path.push(queue_id);
                stage_index.entry(queue_id).or_insert_with(|| {
                    stage_order.push(queue_id);
                    stage_order.len() - 1
                });
            }
            if !paths.contains(&workload_path) {
                paths.push(workload_path);
            }
        }

        let mut solver = SimplexSolver::new();
        let mut rate_vars = Vec::new();
        let mut burst_vars = Vec::new();
        type Terms = Vec<(usize, f64)>;
        let mut rate_caps: Vec<Terms> = vec![Vec::new(); stage_order.len()];
        // burst_caps[level][path][stage], levels ordered by descending SLO
        let mut burst_caps: Vec<Vec<Vec<Terms>>> = slo_levels
            .iter()
            .map(|_| paths.iter().map(|p| vec![Vec::new(); p.len()]).collect())
            .collect();

        for &workload_id in group {
            let workload = self.topology.workload(workload_id);
            let scaled_slo = workload.slo * SAFETY_MARGIN;
            for &flow_id in &workload.flows.clone() {
                let flow = self.topology.flow(flow_id);
                let first_queue = flow.path[0];
                let bandwidth = self.topology.queue(first_queue).bandwidth;
                let rate_var = solver.add_variable(0.0, SAFETY_MARGIN, VarKind::Continuous);
                let burst_var = solver.add_variable(0.0, scaled_slo, VarKind::Continuous);
                rate_vars.push(rate_var);
                burst_vars.push(burst_var);
                rate_caps[stage_index[&first_queue]].push((rate_var, 1.0));

                // The flow's burst counts against every priority level with an
                // SLO at least as large as its own; its rate additionally
                // competes at levels with a strictly larger SLO.
                for (level, &level_slo) in slo_levels.iter().rev().enumerate() {
                    if level_slo < scaled_slo {
                        break;
                    }
                    for (path_idx, path) in paths.iter().enumerate() {
                        if let Some(stage) = path.iter().position(|&q| q == first_queue) {
                            if level_slo > scaled_slo {
                                burst_caps[level][path_idx][stage].push((rate_var, 1.0));
                            }
                            for k in 0..path.len() {
                                burst_caps[level][path_idx][k].push((burst_var, 1.0 / level_slo));
                            }
                        }
                    }
                }

                // Dominance: the shaper line must lie on or above every
                // segment of the (normalized) arrival curve.
                let curve = &flow.arrival_curve;
                let seg = &curve[1];
                let mut r1 = seg.slope / bandwidth;
                let mut b1 = y_intercept(seg.x, seg.y, seg.slope) / bandwidth;
                solver.add_constraint(&[(burst_var, 1.0)], Relation::Ge, b1);
                for seg in &curve[2..] {
                    let r2 = seg.slope / bandwidth;
                    let b2 = y_intercept(seg.x, seg.y, seg.slope) / bandwidth;
                    debug_assert!(b2 >= b1 && r1 >= r2);
                    solver.add_constraint(
                        &[(rate_var, b2 - b1), (burst_var, r1 - r2)],
                        Relation::Ge,
                        r1 * b2 - r2 * b1,
                    );
                    r1 = r2;
                    b1 = b2;
                }
                solver.add_constraint(&[(rate_var, 1.0)], Relation::Ge, r1);
            }
        }

        // Per-stage rate caps: the shapers entering a queue leave headroom.
        for terms in &rate_caps {
            solver.add_constraint(terms, Relation::Le, SAFETY_MARGIN);
        }
        // Per-level burst/SLO caps at every stage of every path.
        for per_path in &burst_caps {
            for per_stage in per_path {
                for terms in per_stage {
                    if !terms.is_empty() {
                        solver.add_constraint(terms, Relation::Le, 1.0);
                    }
                }
            }
        }

        solver.set_direction(Direction::Minimize);
        for &rate_var in &rate_vars {
            solver.set_objective_coeff(rate_var, 1.0);
        }

        let solved = solver.solve();
        if !solved {
            tracing::warn!(
                workloads = group.len(),
                "shaper LP infeasible; zeroing group shapers"
            );
        }
        let mut var = 0;
        for &workload_id in group {
            let (scaled_slo, flows) = {
                let workload = self.topology.workload(workload_id);
                (workload.slo * SAFETY_MARGIN, workload.flows.clone())
            };
            let priority = priority_of(scaled_slo);
            for &flow_id in &flows {
                let shaper = if solved {
                    let bandwidth = {
                        let first_queue = self.topology.flow(flow_id).path[0];
                        self.topology.queue(first_queue).bandwidth
                    };
                    TokenBucket::new(
                        solver.value(rate_vars[var]) * bandwidth,
                        solver.value(burst_vars[var]) * bandwidth,
                    )
                } else {
                    TokenBucket::ZERO
                };
                var += 1;
                let flow = self.topology.flow_mut(flow_id);
                flow.shaper = shaper;
                flow.priority = priority;
            }
        }
        solved
    }
}
