//! Admission control service.
//!
//! One service instance owns one engine; callers serialize access (the RPC
//! layer holds the service behind a single mutex). `add_clients` is
//! transactional: clients are validated, added, reoptimized, and latency
//! checked, and on any SLO miss every client added by the call is deleted
//! again, leaving the engine exactly as it was. On success the solved shaper
//! parameters and priorities are pushed to each flow's enforcement point; a
//! failed push is logged and does not fail the admission, since admission
//! correctness depends only on topology state.

use crate::compactor::{Engine, SAFETY_MARGIN};
use crate::curves::TokenBucket;
use crate::descriptors::{
    AdmissionStatus, ClientSpec, FlowSpec, QueueSpec, RateLimiterSpec,
};
use crate::topology::{FlowHop, FlowParams, Topology, WorkloadId, WorkloadParams};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{info, warn};

/// Pushes solved parameters to enforcement points. Implementations are
/// expected to be idempotent; an orphaned entry on an enforcer is cleaned up
/// by the next removal or a process restart.
pub trait EnforcementDispatcher: Send {
    /// Install or refresh a flow's rate limiters and priority. The flow spec
    /// arrives annotated with `latency`, `priority`, and `rateLimiters`.
    fn update_client(&mut self, flow: &FlowSpec) -> Result<(), String>;
    /// Reset a flow's tenant to defaults (no rate limits, priority 0).
    fn remove_client(&mut self, flow: &FlowSpec) -> Result<(), String>;
}

/// Dispatcher that only logs; used when no enforcement points are attached.
#[derive(Debug, Default)]
pub struct NullDispatcher;

impl EnforcementDispatcher for NullDispatcher {
    fn update_client(&mut self, flow: &FlowSpec) -> Result<(), String> {
        info!(flow = %flow.name, "no enforcement point attached; update dropped");
        Ok(())
    }

    fn remove_client(&mut self, flow: &FlowSpec) -> Result<(), String> {
        info!(flow = %flow.name, "no enforcement point attached; removal dropped");
        Ok(())
    }
}

/// Result of an `add_clients` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddClientsResult {
    pub status: AdmissionStatus,
    pub admitted: bool,
}

impl AddClientsResult {
    fn rejected(status: AdmissionStatus) -> AddClientsResult {
        AddClientsResult {
            status,
            admitted: false,
        }
    }
}

pub struct AdmissionService {
    engine: Engine,
    dispatcher: Box<dyn EnforcementDispatcher>,
    /// Original descriptors of live clients, kept for enforcement teardown.
    client_store: HashMap<WorkloadId, ClientSpec>,
}

impl AdmissionService {
    pub fn new(engine: Engine, dispatcher: Box<dyn EnforcementDispatcher>) -> AdmissionService {
        AdmissionService {
            engine,
            dispatcher,
            client_store: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Admission check for a batch of clients; all of them are admitted or
    /// none are.
    pub fn add_clients(&mut self, clients: &[ClientSpec], fast_first_fit: bool) -> AddClientsResult {
        let status = self.check_clients(clients);
        if !status.is_ok() {
            return AddClientsResult::rejected(status);
        }
        if fast_first_fit && self.check_overload(clients) {
            return AddClientsResult::rejected(AdmissionStatus::Ok);
        }

        // Add everything, then verify.
        let mut added = Vec::with_capacity(clients.len());
        for client in clients {
            let params = self.to_workload_params(client);
            let id = self
                .engine
                .add_workload(params)
                .expect("validated client must insert");
            self.client_store.insert(id, client.clone());
            added.push(id);
        }

        // Placements being re-installed on a replica skip the latency check.
        let admit_override = clients.iter().all(|c| c.admitted);
        let admitted = admit_override || self.check_latency(&added);

        if admitted {
            // Ensure the pushed parameters reflect the solved state even when
            // the latency check was skipped by the admitted override.
            for &id in &added {
                self.engine.workload_latency(id);
            }
            for client in clients {
                for flow in &client.flows {
                    if flow.enforcer_type.is_some() {
                        let annotated = self.annotate_flow(flow);
                        if let Err(err) = self.dispatcher.update_client(&annotated) {
                            warn!(flow = %flow.name, error = %err, "enforcement update failed");
                        }
                    }
                }
            }
        } else {
            for id in added {
                self.client_store.remove(&id);
                self.engine
                    .del_workload(id)
                    .expect("added workload must delete");
            }
        }
        AddClientsResult {
            status: AdmissionStatus::Ok,
            admitted,
        }
    }

    /// Remove a client and reset its enforcement-point state to defaults.
    pub fn del_client(&mut self, name: &str) -> AdmissionStatus {
        let Some(id) = self.engine.topology().workload_id_by_name(name) else {
            return AdmissionStatus::ClientNameNonexistent;
        };
        let client = self
            .client_store
            .remove(&id)
            .expect("live client must be stored");
        for flow in &client.flows {
            if flow.enforcer_type.is_some() {
                if let Err(err) = self.dispatcher.remove_client(flow) {
                    warn!(flow = %flow.name, error = %err, "enforcement removal failed");
                }
            }
        }
        self.engine
            .del_workload(id)
            .expect("live workload must delete");
        AdmissionStatus::Ok
    }

    pub fn add_queue(&mut self, queue: &QueueSpec) -> AdmissionStatus {
        if queue.name.is_empty() {
            return AdmissionStatus::MissingArgument;
        }
        if self
            .engine
            .topology()
            .queue_id_by_name(&queue.name)
            .is_some()
        {
            return AdmissionStatus::QueueNameInUse;
        }
        if queue.bandwidth <= 0.0 {
            return AdmissionStatus::InvalidArgument;
        }
        self.engine
            .add_queue(&queue.name, queue.bandwidth)
            .expect("validated queue must insert");
        AdmissionStatus::Ok
    }

    pub fn del_queue(&mut self, name: &str) -> AdmissionStatus {
        let Some(id) = self.engine.topology().queue_id_by_name(name) else {
            return AdmissionStatus::QueueNameNonexistent;
        };
        if !self.engine.topology().queue(id).flows.is_empty() {
            return AdmissionStatus::QueueHasActiveFlows;
        }
        self.engine.del_queue(id).expect("empty queue must delete");
        AdmissionStatus::Ok
    }

    fn check_clients(&self, clients: &[ClientSpec]) -> AdmissionStatus {
        let mut client_names = HashSet::new();
        let mut flow_names = HashSet::new();
        let topo = self.engine.topology();
        for client in clients {
            if client.name.is_empty() || client.flows.is_empty() {
                return AdmissionStatus::MissingArgument;
            }
            if topo.workload_id_by_name(&client.name).is_some()
                || !client_names.insert(client.name.as_str())
            {
                return AdmissionStatus::ClientNameInUse;
            }
            if client.slo <= 0.0 {
                return AdmissionStatus::InvalidArgument;
            }
            if let Some(pct) = client.slo_percentile {
                if !(0.0 < pct && pct < 100.0) {
                    return AdmissionStatus::InvalidArgument;
                }
            }
            for flow in &client.flows {
                if flow.name.is_empty() || flow.queues.is_empty() || flow.arrival_info.is_empty() {
                    return AdmissionStatus::MissingArgument;
                }
                if topo.flow_id_by_name(&flow.name).is_some()
                    || !flow_names.insert(flow.name.as_str())
                {
                    return AdmissionStatus::FlowNameInUse;
                }
                if flow
                    .queues
                    .iter()
                    .any(|q| topo.queue_id_by_name(q).is_none())
                {
                    return AdmissionStatus::QueueNameNonexistent;
                }
            }
        }
        AdmissionStatus::Ok
    }

    /// Fast-first-fit short circuit: reject without running the LP when a new
    /// flow's sustained rate plus the existing shaper rates would overload any
    /// queue it crosses. Already-admitted clients are skipped because their
    /// shaper curves change under re-optimization; an uninitialized shaper
    /// anywhere forces the full computation.
    fn check_overload(&self, clients: &[ClientSpec]) -> bool {
        let topo = self.engine.topology();
        let mut possible_overload = false;
        for client in clients.iter().filter(|c| !c.admitted) {
            for flow in &client.flows {
                let rate = flow.arrival_info.last().map_or(0.0, |s| s.slope);
                for queue_name in &flow.queues {
                    let queue_id = topo.queue_id_by_name(queue_name).expect("validated queue");
                    let queue = topo.queue(queue_id);
                    let mut load = rate;
                    for link in &queue.flows {
                        let shaper = topo.flow(link.flow).shaper;
                        if shaper.is_zero() {
                            return false;
                        }
                        load += shaper.rate;
                    }
                    if load > SAFETY_MARGIN * queue.bandwidth {
                        possible_overload = true;
                    }
                }
            }
        }
        possible_overload
    }

    /// Verify every added client and every client its flows can affect.
    fn check_latency(&mut self, added: &[WorkloadId]) -> bool {
        let added_set: BTreeSet<WorkloadId> = added.iter().copied().collect();
        let mut affected_flows = BTreeSet::new();
        for &id in added {
            let latency = self.engine.workload_latency(id);
            if latency > self.engine.topology().workload(id).slo {
                return false;
            }
            let flows = self.engine.topology().workload(id).flows.clone();
            for flow in flows {
                mark_affected_flows(
                    self.engine.topology(),
                    &mut affected_flows,
                    FlowHop { flow, hop: 0 },
                    0,
                );
            }
        }
        let affected_clients: BTreeSet<WorkloadId> = affected_flows
            .iter()
            .map(|fh| self.engine.topology().flow(fh.flow).workload)
            .filter(|id| !added_set.contains(id))
            .collect();
        for id in affected_clients {
            let latency = self.engine.workload_latency(id);
            if latency > self.engine.topology().workload(id).slo {
                return false;
            }
        }
        true
    }

    /// Fill in the solved latency, priority, and rate limiters before a push.
    fn annotate_flow(&self, flow: &FlowSpec) -> FlowSpec {
        let topo = self.engine.topology();
        let flow_id = topo
            .flow_id_by_name(&flow.name)
            .expect("admitted flow must exist");
        let solved = topo.flow(flow_id);
        let mut annotated = flow.clone();
        annotated.latency = Some(solved.latency);
        annotated.priority = Some(solved.priority);
        annotated.rate_limiters = Some(vec![shaper_to_limiter(solved.shaper)]);
        annotated
    }

    fn to_workload_params(&self, client: &ClientSpec) -> WorkloadParams {
        let topo = self.engine.topology();
        WorkloadParams {
            name: client.name.clone(),
            slo: client.slo,
            slo_percentile: client.slo_percentile,
            flows: client
                .flows
                .iter()
                .map(|flow| FlowParams {
                    name: flow.name.clone(),
                    path: flow
                        .queues
                        .iter()
                        .map(|q| topo.queue_id_by_name(q).expect("validated queue"))
                        .collect(),
                    priority: flow.priority.unwrap_or(0),
                    ignore_latency: flow.ignore_latency,
                    arrival_info: flow.arrival_info.clone(),
                })
                .collect(),
        }
    }
}

fn shaper_to_limiter(shaper: TokenBucket) -> RateLimiterSpec {
    RateLimiterSpec {
        rate: shaper.rate,
        burst: shaper.burst,
    }
}

/// Mark every flow reachable from `fh` that the propagated priority can
/// delay: walk each queue from the hop onward and recurse into flows sharing
/// it, stopping at flows of strictly higher priority.
fn mark_affected_flows(
    topo: &Topology,
    affected: &mut BTreeSet<FlowHop>,
    fh: FlowHop,
    priority: u32,
) {
    let flow = topo.flow(fh.flow);
    if flow.priority < priority {
        return;
    }
    if !affected.insert(fh) {
        return;
    }
    for hop in fh.hop..flow.path.len() {
        let queue = topo.queue(flow.path[hop]);
        for &link in &queue.flows {
            mark_affected_flows(topo, affected, link, flow.priority);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisMode;
    use crate::curves::{rb_curve_to_arrival_curve, Segment};
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingDispatcher {
        updates: Arc<Mutex<Vec<FlowSpec>>>,
        removals: Arc<Mutex<Vec<String>>>,
    }

    impl EnforcementDispatcher for RecordingDispatcher {
        fn update_client(&mut self, flow: &FlowSpec) -> Result<(), String> {
            self.updates.lock().unwrap().push(flow.clone());
            Ok(())
        }

        fn remove_client(&mut self, flow: &FlowSpec) -> Result<(), String> {
            self.removals.lock().unwrap().push(flow.name.clone());
            Ok(())
        }
    }

    fn service() -> (AdmissionService, RecordingDispatcher) {
        let dispatcher = RecordingDispatcher::default();
        let service = AdmissionService::new(
            Engine::new(AnalysisMode::AggregateTwoHop),
            Box::new(dispatcher.clone()),
        );
        (service, dispatcher)
    }

    fn arrival(rates: &[f64], bursts: &[f64]) -> Vec<Segment> {
        let mut curve = rb_curve_to_arrival_curve(rates, bursts);
        curve.remove(0);
        curve
    }

    fn client(name: &str, slo: f64, queue: &str, rates: &[f64], bursts: &[f64]) -> ClientSpec {
        ClientSpec {
            name: name.to_owned(),
            slo,
            slo_percentile: Some(99.9),
            admitted: false,
            flows: vec![FlowSpec {
                name: format!("F{name}"),
                queues: vec![queue.to_owned()],
                arrival_info: arrival(rates, bursts),
                enforcer_type: Some(crate::descriptors::EnforcerType::Storage),
                enforcer_addr: Some("server0".to_owned()),
                client_addr: Some("tenant0".to_owned()),
                ..FlowSpec::default()
            }],
        }
    }

    #[test]
    fn validation_reports_precise_status_codes() {
        let (mut service, _) = service();
        assert!(service
            .add_queue(&QueueSpec { name: "Q0".into(), bandwidth: 1.0 })
            .is_ok());

        let good = client("C0", 5.1, "Q0", &[1.0, 0.2, 0.1], &[1.0, 1.5, 5.0]);
        let mut unknown_queue = good.clone();
        unknown_queue.flows[0].queues = vec!["missing".into()];
        assert_eq!(
            service.add_clients(&[unknown_queue], false).status,
            AdmissionStatus::QueueNameNonexistent
        );

        let mut bad_slo = good.clone();
        bad_slo.slo = 0.0;
        assert_eq!(
            service.add_clients(&[bad_slo], false).status,
            AdmissionStatus::InvalidArgument
        );

        let mut bad_pct = good.clone();
        bad_pct.slo_percentile = Some(100.0);
        assert_eq!(
            service.add_clients(&[bad_pct], false).status,
            AdmissionStatus::InvalidArgument
        );

        let mut no_curve = good.clone();
        no_curve.flows[0].arrival_info.clear();
        assert_eq!(
            service.add_clients(&[no_curve], false).status,
            AdmissionStatus::MissingArgument
        );

        // duplicate names within one batch
        assert_eq!(
            service.add_clients(&[good.clone(), good.clone()], false).status,
            AdmissionStatus::ClientNameInUse
        );

        // nothing was mutated by any rejected call
        assert_eq!(service.engine().topology().workload_count(), 0);

        assert!(service.add_clients(&[good.clone()], false).admitted);
        assert_eq!(
            service.add_clients(&[good], false).status,
            AdmissionStatus::ClientNameInUse
        );
    }

    #[test]
    fn admitted_clients_push_solved_parameters() {
        let (mut service, dispatcher) = service();
        service.add_queue(&QueueSpec { name: "Q0".into(), bandwidth: 1.0 });
        let result =
            service.add_clients(&[client("C0", 5.1, "Q0", &[1.0, 0.2, 0.1], &[1.0, 1.5, 5.0])], false);
        assert!(result.status.is_ok() && result.admitted);

        let updates = dispatcher.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        let pushed = &updates[0];
        assert_eq!(pushed.priority, Some(0));
        let limiter = pushed.rate_limiters.as_ref().unwrap()[0];
        assert!(limiter.rate >= 0.1 - 1e-6 && limiter.rate <= 0.11 + 1e-6);
        assert!(pushed.latency.unwrap() <= 5.1);
    }

    #[test]
    fn del_client_resets_enforcement_and_state() {
        let (mut service, dispatcher) = service();
        service.add_queue(&QueueSpec { name: "Q0".into(), bandwidth: 1.0 });
        let spec = client("C0", 5.1, "Q0", &[1.0, 0.2, 0.1], &[1.0, 1.5, 5.0]);
        assert!(service.add_clients(&[spec], false).admitted);
        assert_eq!(service.del_client("C0"), AdmissionStatus::Ok);
        assert_eq!(
            service.del_client("C0"),
            AdmissionStatus::ClientNameNonexistent
        );
        assert_eq!(dispatcher.removals.lock().unwrap().as_slice(), ["FC0"]);
        assert_eq!(service.engine().topology().workload_count(), 0);
        assert_eq!(service.engine().topology().flow_count(), 0);
    }

    #[test]
    fn fast_first_fit_rejects_obvious_overload() {
        let (mut service, _) = service();
        service.add_queue(&QueueSpec { name: "Q0".into(), bandwidth: 1.0 });
        assert!(
            service
                .add_clients(&[client("C0", 50.0, "Q0", &[1.0, 0.5], &[1.0, 2.0])], true)
                .admitted
        );
        // sustained rate 0.7 on top of the existing shaper cannot fit
        let result = service.add_clients(&[client("C1", 50.0, "Q0", &[1.0, 0.7], &[1.0, 2.0])], true);
        assert_eq!(result.status, AdmissionStatus::Ok);
        assert!(!result.admitted);
        // the LP never ran for the rejected client
        assert_eq!(service.engine().topology().workload_count(), 1);
    }

    #[test]
    fn admitted_override_skips_latency_check() {
        let (mut service, _) = service();
        service.add_queue(&QueueSpec { name: "Q0".into(), bandwidth: 1.0 });
        // an SLO this tight would normally be rejected
        let mut spec = client("C0", 1e-6, "Q0", &[1.0, 0.2, 0.1], &[1.0, 1.5, 5.0]);
        assert!(!service.add_clients(&[spec.clone()], false).admitted);
        spec.admitted = true;
        assert!(service.add_clients(&[spec], false).admitted);
        assert_eq!(service.engine().topology().workload_count(), 1);
    }

    #[test]
    fn queue_lifecycle_statuses() {
        let (mut service, _) = service();
        assert_eq!(
            service.add_queue(&QueueSpec { name: "Q0".into(), bandwidth: 1.0 }),
            AdmissionStatus::Ok
        );
        assert_eq!(
            service.add_queue(&QueueSpec { name: "Q0".into(), bandwidth: 1.0 }),
            AdmissionStatus::QueueNameInUse
        );
        assert_eq!(
            service.add_queue(&QueueSpec { name: "Q1".into(), bandwidth: -1.0 }),
            AdmissionStatus::InvalidArgument
        );
        assert_eq!(service.del_queue("Q9"), AdmissionStatus::QueueNameNonexistent);

        assert!(
            service
                .add_clients(&[client("C0", 5.1, "Q0", &[1.0, 0.2, 0.1], &[1.0, 1.5, 5.0])], false)
                .admitted
        );
        assert_eq!(service.del_queue("Q0"), AdmissionStatus::QueueHasActiveFlows);
        service.del_client("C0");
        assert_eq!(service.del_queue("Q0"), AdmissionStatus::Ok);
    }
}
