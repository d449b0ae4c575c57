//! End-to-end optimizer coverage: shaper parameters and latencies across a
//! growing and shrinking set of workloads sharing one storage queue.

use slogate::analysis::AnalysisMode;
use slogate::compactor::Engine;
use slogate::curves::rb_curve_to_arrival_curve;
use slogate::topology::{FlowParams, WorkloadId, WorkloadParams};

const EPSILON: f64 = 1e-6;

fn between(value: f64, lo: f64, hi: f64) -> bool {
    value >= lo - EPSILON && value <= hi + EPSILON
}

fn workload(name: &str, slo: f64, rates: &[f64], bursts: &[f64]) -> WorkloadParams {
    let mut curve = rb_curve_to_arrival_curve(rates, bursts);
    curve.remove(0);
    WorkloadParams {
        name: name.to_owned(),
        slo,
        slo_percentile: None,
        flows: vec![FlowParams {
            name: format!("F{name}"),
            path: Vec::new(), // filled by the caller
            priority: 0,
            ignore_latency: false,
            arrival_info: curve,
        }],
    }
}

fn check(engine: &mut Engine, id: WorkloadId, r: (f64, f64), b: (f64, f64), latency: (f64, f64)) {
    let observed_latency = engine.workload_latency(id);
    let flow = engine.topology().workload(id).flows[0];
    let shaper = engine.shaper(flow);
    assert!(
        between(shaper.rate, r.0, r.1),
        "rate {} outside [{}, {}]",
        shaper.rate,
        r.0,
        r.1
    );
    assert!(
        between(shaper.burst, b.0, b.1),
        "burst {} outside [{}, {}]",
        shaper.burst,
        b.0,
        b.1
    );
    assert!(
        between(observed_latency, latency.0, latency.1),
        "latency {} outside [{}, {}]",
        observed_latency,
        latency.0,
        latency.1
    );
}

#[test]
fn shaper_optimization_tracks_workload_churn() {
    let mut engine = Engine::new(AnalysisMode::AggregateTwoHop);
    let q0 = engine.add_queue("Q0", 1.0).unwrap();
    let with_path = |mut params: WorkloadParams| {
        params.flows[0].path = vec![q0];
        params
    };

    // A lone workload's shaper hugs its arrival curve's tail.
    let c0 = engine
        .add_workload(with_path(workload("C0", 5.1, &[1.0, 0.2, 0.1], &[1.0, 1.5, 5.0])))
        .unwrap();
    engine.calc_all_latency();
    check(&mut engine, c0, (0.1, 0.11), (5.0, 5.1), (5.0, 5.1));

    // A looser-SLO workload joins at a lower priority without disturbing C0.
    let c1 = engine
        .add_workload(with_path(workload("C1", 23.0, &[1.0, 0.3, 0.2], &[2.0, 11.0, 15.0])))
        .unwrap();
    engine.calc_all_latency();
    check(&mut engine, c0, (0.1, 0.11), (5.0, 5.1), (5.0, 5.1));
    check(&mut engine, c1, (0.2, 0.21), (15.0, 16.0), (20.0 / 0.9, 23.0));

    let c2 = engine
        .add_workload(with_path(workload(
            "C2",
            165.0,
            &[1.0, 0.6, 0.4, 0.3],
            &[5.0, 10.0, 50.0, 95.0],
        )))
        .unwrap();
    engine.calc_all_latency();
    check(&mut engine, c0, (0.1, 0.11), (5.0, 5.1), (5.0, 5.1));
    check(&mut engine, c1, (0.2, 0.21), (15.0, 16.0), (20.0 / 0.9, 23.0));
    check(&mut engine, c2, (0.3, 0.31), (95.0, 100.0), (115.0 / 0.7, 165.0));

    // A tight-SLO workload takes the top priority and squeezes everyone's
    // bursts; rates rise to compensate.
    let c3 = engine
        .add_workload(with_path(workload("C3", 4.0, &[1.0, 0.5, 0.1], &[1.0, 2.0, 3.0])))
        .unwrap();
    engine.calc_all_latency();
    check(&mut engine, c0, (0.19, 0.21), (1.4, 1.6), (5.0, 5.1));
    check(&mut engine, c1, (0.25, 0.35), (10.0, 12.0), (15.5 / 0.7, 23.0));
    check(&mut engine, c2, (0.35, 0.45), (45.0, 55.0), (65.5 / 0.4, 165.0));
    check(&mut engine, c3, (0.1, 0.11), (3.0, 4.0), (3.0, 4.0));

    // Swapping C3 for a loose workload relaxes the solution back.
    let c4 = engine
        .add_workload(with_path(workload("C4", 300.0, &[1.0, 0.4, 0.3], &[1.0, 4.0, 5.0])))
        .unwrap();
    engine.del_workload(c3).unwrap();
    engine.calc_all_latency();
    check(&mut engine, c0, (0.1, 0.11), (5.0, 5.1), (5.0, 5.1));
    check(&mut engine, c1, (0.2, 0.21), (15.0, 16.0), (20.0 / 0.9, 23.0));
    check(&mut engine, c2, (0.3, 0.31), (90.0, 100.0), (110.0 / 0.7, 165.0));
    check(&mut engine, c4, (0.3, 0.4), (4.0, 5.0), (119.0 / 0.4, 300.0));
}

#[test]
fn priorities_follow_slo_order_densely() {
    let mut engine = Engine::new(AnalysisMode::AggregateTwoHop);
    let q0 = engine.add_queue("Q0", 1.0).unwrap();
    let mut ids = Vec::new();
    for (i, slo) in [90.0, 40.0, 90.0, 10.0].iter().enumerate() {
        let mut params = workload(&format!("C{i}"), *slo, &[1.0, 0.1], &[0.5, 1.0]);
        params.flows[0].path = vec![q0];
        ids.push(engine.add_workload(params).unwrap());
    }
    engine.calc_all_latency();
    let priority = |id: WorkloadId| {
        let flow = engine.topology().workload(id).flows[0];
        engine.topology().flow(flow).priority
    };
    // distinct SLOs rank densely; equal SLOs share a level
    assert_eq!(priority(ids[3]), 0);
    assert_eq!(priority(ids[1]), 1);
    assert_eq!(priority(ids[0]), 2);
    assert_eq!(priority(ids[2]), 2);
}
