//! First-fit placement across parallel admission replicas.

use parking_lot::Mutex;
use slogate::admission::{AdmissionService, NullDispatcher};
use slogate::analysis::AnalysisMode;
use slogate::compactor::Engine;
use slogate::config::WorkloadTemplate;
use slogate::curves::rb_curve_to_arrival_curve;
use slogate::curves::Segment;
use slogate::placement::{AdmissionReplica, LocalReplica, PlacementCoordinator};
use std::sync::Arc;

fn replicas(n: usize) -> (Vec<Arc<dyn AdmissionReplica>>, Vec<Arc<Mutex<AdmissionService>>>) {
    let services: Vec<Arc<Mutex<AdmissionService>>> = (0..n)
        .map(|_| {
            Arc::new(Mutex::new(AdmissionService::new(
                Engine::new(AnalysisMode::AggregateTwoHop),
                Box::new(NullDispatcher),
            )))
        })
        .collect();
    let replicas = services
        .iter()
        .map(|s| Arc::new(LocalReplica(s.clone())) as Arc<dyn AdmissionReplica>)
        .collect();
    (replicas, services)
}

fn storage_template(name: &str, slo: f64, rates: &[f64], bursts: &[f64]) -> WorkloadTemplate {
    let mut curve: Vec<Segment> = rb_curve_to_arrival_curve(rates, bursts);
    curve.remove(0);
    WorkloadTemplate {
        name: name.to_owned(),
        slo,
        slo_percentile: None,
        admitted: false,
        client_host: None,
        client_vm: None,
        server_host: None,
        server_vm: None,
        network_in: None,
        network_out: None,
        storage: Some(curve),
    }
}

/// Pin a filler onto a specific server without running the admission check.
fn filler_on(pc: &PlacementCoordinator, name: &str, server_host: &str) {
    let mut template = storage_template(name, 1000.0, &[1.0, 0.9], &[0.5, 1.0]);
    template.admitted = true;
    template.server_host = Some(server_host.to_owned());
    template.server_vm = Some("1".to_owned());
    let result = pc.add_clients(&[template], "lab", false);
    assert!(result.admitted, "filler {name} must install");
}

#[test]
fn first_fit_lands_on_the_lowest_fitting_server() {
    let (reps, services) = replicas(4);
    let pc = PlacementCoordinator::new(reps, false);
    for host in ["S0", "S1", "S2", "S3", "S4"] {
        pc.add_server_vm(host, "1");
    }
    for vm in ["1", "2", "3", "4", "5", "6"] {
        pc.add_client_vm("c0", vm);
    }

    // saturate every server except S2
    for host in ["S0", "S1", "S3", "S4"] {
        filler_on(&pc, &format!("filler-{host}"), host);
    }

    // the new workload needs a sustained rate of 0.5; only S2 has room
    let result = pc.add_clients(
        &[storage_template("W", 1000.0, &[1.0, 0.5], &[0.5, 1.0])],
        "lab",
        false,
    );
    assert!(result.admitted);
    assert_eq!(result.placements.len(), 1);
    assert_eq!(result.placements[0].server_host, "S2");

    // every replica holds the workload, none holds speculative probes
    for service in &services {
        let service = service.lock();
        assert!(service
            .engine()
            .topology()
            .workload_id_by_name("W")
            .is_some());
        assert_eq!(service.engine().topology().workload_count(), 5);
    }
}

#[test]
fn full_cluster_rejects_without_residue() {
    let (reps, services) = replicas(2);
    let pc = PlacementCoordinator::new(reps, false);
    for vm in ["1", "2", "3"] {
        pc.add_client_vm("c0", vm);
    }
    for host in ["S0", "S1"] {
        pc.add_server_vm(host, "1");
        filler_on(&pc, &format!("filler-{host}"), host);
    }

    let result = pc.add_clients(
        &[storage_template("W", 1000.0, &[1.0, 0.5], &[0.5, 1.0])],
        "lab",
        false,
    );
    assert!(!result.admitted);
    assert!(result.placements.is_empty());
    for service in &services {
        assert!(service
            .lock()
            .engine()
            .topology()
            .workload_id_by_name("W")
            .is_none());
    }
    assert_eq!(pc.placements().len(), 2); // just the fillers
}

#[test]
fn failed_batch_rolls_back_earlier_placements() {
    let (reps, services) = replicas(2);
    let pc = PlacementCoordinator::new(reps, false);
    pc.add_server_vm("S0", "1");
    for vm in ["1", "2"] {
        pc.add_client_vm("c0", vm);
    }

    // the first workload fits; the second cannot fit anywhere
    let batch = [
        storage_template("W0", 1000.0, &[1.0, 0.5], &[0.5, 1.0]),
        storage_template("W1", 1000.0, &[1.0, 0.9], &[0.5, 1.0]),
    ];
    let result = pc.add_clients(&batch, "lab", false);
    assert!(!result.admitted);
    assert!(pc.placements().is_empty());
    for service in &services {
        let service = service.lock();
        assert_eq!(service.engine().topology().workload_count(), 0);
    }
}

#[test]
fn workloads_sharing_a_server_share_a_client_host() {
    let (reps, _services) = replicas(2);
    let pc = PlacementCoordinator::new(reps, false);
    pc.add_server_vm("S0", "1");
    pc.add_server_vm("S0", "2");
    pc.add_client_vm("cA", "1");
    pc.add_client_vm("cA", "2");
    pc.add_client_vm("cB", "1");

    let first = pc.add_clients(
        &[storage_template("W0", 1000.0, &[1.0, 0.2], &[0.5, 1.0])],
        "lab",
        false,
    );
    assert!(first.admitted);
    let first_host = first.placements[0].client_host.clone();

    let second = pc.add_clients(
        &[storage_template("W1", 1000.0, &[1.0, 0.2], &[0.5, 1.0])],
        "lab",
        false,
    );
    assert!(second.admitted);
    // both landed on host S0, so the grouping rule keeps the client host
    assert_eq!(second.placements[0].server_host, "S0");
    assert_eq!(second.placements[0].client_host, first_host);
}
