//! Tail-latency SLO admission control and runtime enforcement for tenants
//! sharing a networked storage fabric.
//!
//! Workloads declare an SLO and an arrival curve fitted from their trace.
//! Before a workload lands on a server, the compactor solves a linear
//! program that picks per-flow token-bucket shapers dominating the arrival
//! curve while every affected workload's deterministic worst-case latency
//! stays under its SLO. Admitted parameters are pushed to the enforcement
//! points: the storage-side request scheduler here, or a network-side shaper.

pub mod admission;
pub mod analysis;
pub mod compactor;
pub mod config;
pub mod curves;
pub mod descriptors;
pub mod estimator;
pub mod placement;
pub mod rpc;
pub mod scheduler;
pub mod solver;
pub mod threading;
pub mod topology;

pub use admission::{AdmissionService, EnforcementDispatcher};
pub use analysis::AnalysisMode;
pub use compactor::Engine;
pub use placement::PlacementCoordinator;
pub use scheduler::{Scheduler, SchedulerConfig, WorkerPool};
