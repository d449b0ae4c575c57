//! Parallel first-fit workload placement across admission-service replicas.
//!
//! Candidate servers form a work queue in a fixed order. One worker thread
//! per replica takes the next index, renders the workload against that
//! candidate, and asks its replica whether the placement would be admitted,
//! immediately undoing the speculative add so replicas accumulate no state.
//! The first success cancels all unstarted work; in-flight probes finish and
//! are discarded unless they land on a lower index. The accepted placement is
//! always the lowest-index success regardless of completion order. The chosen
//! placement is then re-installed on every replica (marked admitted, so the
//! latency check is skipped); only replica 0 renders enforcement addresses.
//!
//! One exclusive lock protects all coordinator state, with two condition
//! variables: work available and placement complete. Lock order is
//! coordinator state first, then a replica's service lock; workers call
//! replicas only after releasing the state lock.

use crate::admission::{AddClientsResult, AdmissionService};
use crate::config::{
    self, render_client, server_name, WorkloadTemplate,
};
use crate::descriptors::{AdmissionStatus, ClientSpec, QueueSpec};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

/// Placement-surface status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementStatus {
    #[default]
    Ok,
    InvalidArgument,
    ClientVmAlreadyExists,
    ClientVmNonexistent,
    ServerVmAlreadyExists,
    ServerVmNonexistent,
    ServerVmInUse,
}

/// An admission-service replica as seen by the coordinator.
pub trait AdmissionReplica: Send + Sync {
    fn add_clients(&self, clients: &[ClientSpec], fast_first_fit: bool) -> AddClientsResult;
    fn del_client(&self, name: &str) -> AdmissionStatus;
    fn add_queue(&self, queue: &QueueSpec) -> AdmissionStatus;
    fn del_queue(&self, name: &str) -> AdmissionStatus;
}

/// In-process replica: the admission service behind its serializing lock.
pub struct LocalReplica(pub Arc<Mutex<AdmissionService>>);

impl AdmissionReplica for LocalReplica {
    fn add_clients(&self, clients: &[ClientSpec], fast_first_fit: bool) -> AddClientsResult {
        self.0.lock().add_clients(clients, fast_first_fit)
    }

    fn del_client(&self, name: &str) -> AdmissionStatus {
        self.0.lock().del_client(name)
    }

    fn add_queue(&self, queue: &QueueSpec) -> AdmissionStatus {
        self.0.lock().add_queue(queue)
    }

    fn del_queue(&self, name: &str) -> AdmissionStatus {
        self.0.lock().del_queue(name)
    }
}

/// Where an admitted workload ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub name: String,
    #[serde(rename = "clientHost")]
    pub client_host: String,
    #[serde(rename = "clientVM")]
    pub client_vm: String,
    #[serde(rename = "serverHost")]
    pub server_host: String,
    #[serde(rename = "serverVM")]
    pub server_vm: String,
}

/// Result of a batch placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementResult {
    pub status: PlacementStatus,
    pub admitted: bool,
    pub placements: Vec<PlacementRecord>,
}

#[derive(Clone)]
struct CurrentJob {
    template: WorkloadTemplate,
    addr_prefix: String,
}

struct State {
    /// serverHost -> free server VMs.
    servers: BTreeMap<String, BTreeSet<String>>,
    /// clientHost -> free client VMs.
    clients: BTreeMap<String, BTreeSet<String>>,
    /// Workloads sharing a server stay on the same client host, since their
    /// performance is already correlated through that server.
    server_client_grouping: BTreeMap<String, String>,
    workloads: Vec<PlacementRecord>,
    current: Option<CurrentJob>,
    work_queue: Vec<(String, String)>,
    outstanding_work: usize,
    next_index: usize,
    best_index: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    work_available: Condvar,
    work_complete: Condvar,
}

pub struct PlacementCoordinator {
    replicas: Vec<Arc<dyn AdmissionReplica>>,
    fast_first_fit: bool,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl PlacementCoordinator {
    /// Spawn one probing worker per replica.
    pub fn new(replicas: Vec<Arc<dyn AdmissionReplica>>, fast_first_fit: bool) -> PlacementCoordinator {
        assert!(!replicas.is_empty(), "at least one admission replica required");
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                servers: BTreeMap::new(),
                clients: BTreeMap::new(),
                server_client_grouping: BTreeMap::new(),
                workloads: Vec::new(),
                current: None,
                work_queue: Vec::new(),
                outstanding_work: 0,
                next_index: 0,
                best_index: 0,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            work_complete: Condvar::new(),
        });
        let workers = replicas
            .iter()
            .map(|replica| {
                let shared = shared.clone();
                let replica = replica.clone();
                std::thread::spawn(move || worker_loop(shared, replica, fast_first_fit))
            })
            .collect();
        PlacementCoordinator {
            replicas,
            fast_first_fit,
            shared,
            workers,
        }
    }

    /// Place a batch of workloads first-fit; a failed placement rolls back
    /// every placement made earlier in the same batch.
    pub fn add_clients(
        &self,
        templates: &[WorkloadTemplate],
        addr_prefix: &str,
        enforce: bool,
    ) -> PlacementResult {
        let mut placements = Vec::new();
        for template in templates {
            match self.place(template, addr_prefix, enforce) {
                Some(record) => placements.push(record),
                None => {
                    for prior in &placements {
                        self.remove_client(&prior.name);
                    }
                    return PlacementResult {
                        status: PlacementStatus::Ok,
                        admitted: false,
                        placements: Vec::new(),
                    };
                }
            }
        }
        PlacementResult {
            status: PlacementStatus::Ok,
            admitted: true,
            placements,
        }
    }

    pub fn del_clients(&self, names: &[String]) -> PlacementStatus {
        for name in names {
            self.remove_client(name);
        }
        PlacementStatus::Ok
    }

    /// Try to admit one workload on the first fitting server.
    fn place(
        &self,
        template: &WorkloadTemplate,
        addr_prefix: &str,
        enforce: bool,
    ) -> Option<PlacementRecord> {
        let mut guard = self.shared.state.lock();
        while guard.current.is_some() {
            self.shared.work_complete.wait(&mut guard);
        }
        if template.admitted {
            // Re-placing an already-admitted workload: pin to its server.
            let (Some(host), Some(vm)) = (&template.server_host, &template.server_vm) else {
                error!(workload = %template.name, "admitted workload lacks a recorded server");
                self.shared.work_complete.notify_all();
                return None;
            };
            guard.work_queue = vec![(host.clone(), vm.clone())];
            guard.next_index = guard.work_queue.len();
            guard.best_index = 0;
        } else {
            guard.work_queue = guard
                .servers
                .iter()
                .flat_map(|(host, vms)| vms.iter().map(move |vm| (host.clone(), vm.clone())))
                .collect();
            guard.next_index = 0;
            guard.best_index = guard.work_queue.len();
            guard.current = Some(CurrentJob {
                template: template.clone(),
                addr_prefix: addr_prefix.to_owned(),
            });
            self.shared.work_available.notify_all();
            while guard.outstanding_work > 0 || guard.next_index < guard.work_queue.len() {
                self.shared.work_complete.wait(&mut guard);
            }
            guard.current = None;
        }

        let admitted = guard.best_index < guard.work_queue.len();
        let record = if admitted {
            let (server_host, server_vm) = guard.work_queue[guard.best_index].clone();
            match client_server_placement(&guard, &server_host) {
                Some((client_host, client_vm)) => {
                    let mut bound = template.clone();
                    bound.admitted = true;
                    let sync_spec = render_client(
                        &bound, &client_host, &client_vm, &server_host, &server_vm, addr_prefix,
                        false,
                    );
                    // Replica 0 performs the enforcement pushes; the rest only
                    // mirror the topology.
                    if enforce {
                        let enforce_spec = render_client(
                            &bound, &client_host, &client_vm, &server_host, &server_vm,
                            addr_prefix, true,
                        );
                        self.replicas[0].add_clients(&[enforce_spec], self.fast_first_fit);
                    } else {
                        self.replicas[0].add_clients(&[sync_spec.clone()], self.fast_first_fit);
                    }
                    for replica in &self.replicas[1..] {
                        replica.add_clients(&[sync_spec.clone()], self.fast_first_fit);
                    }
                    guard
                        .server_client_grouping
                        .insert(server_host.clone(), client_host.clone());
                    if let Some(vms) = guard.clients.get_mut(&client_host) {
                        vms.remove(&client_vm);
                    }
                    let record = PlacementRecord {
                        name: template.name.clone(),
                        client_host,
                        client_vm,
                        server_host,
                        server_vm,
                    };
                    guard.workloads.push(record.clone());
                    info!(workload = %record.name, server = %record.server_host, "workload placed");
                    Some(record)
                }
                None => {
                    error!(workload = %template.name, "out of client machines");
                    None
                }
            }
        } else {
            None
        };
        guard.work_queue.clear();
        guard.next_index = 0;
        guard.best_index = 0;
        self.shared.work_complete.notify_all();
        record
    }

    fn remove_client(&self, name: &str) {
        let mut guard = self.shared.state.lock();
        let Some(pos) = guard.workloads.iter().position(|w| w.name == name) else {
            return;
        };
        let record = guard.workloads.remove(pos);
        for replica in &self.replicas {
            replica.del_client(name);
        }
        guard.server_client_grouping.remove(&record.server_host);
        guard
            .clients
            .entry(record.client_host)
            .or_default()
            .insert(record.client_vm);
    }

    /// Register a client VM; the first VM of a host provisions the host's
    /// network queues on every replica.
    pub fn add_client_vm(&self, client_host: &str, client_vm: &str) -> PlacementStatus {
        let mut guard = self.shared.state.lock();
        if !guard.clients.contains_key(client_host) {
            for replica in &self.replicas {
                replica.add_queue(&config::network_in_queue(client_host));
                replica.add_queue(&config::network_out_queue(client_host));
            }
        }
        let in_use = guard
            .workloads
            .iter()
            .any(|w| w.client_host == client_host && w.client_vm == client_vm);
        let vms = guard.clients.entry(client_host.to_owned()).or_default();
        if vms.contains(client_vm) || in_use {
            return PlacementStatus::ClientVmAlreadyExists;
        }
        vms.insert(client_vm.to_owned());
        PlacementStatus::Ok
    }

    pub fn del_client_vm(&self, client_host: &str, client_vm: &str) -> PlacementStatus {
        let mut guard = self.shared.state.lock();
        let Some(vms) = guard.clients.get_mut(client_host) else {
            return PlacementStatus::ClientVmNonexistent;
        };
        if !vms.remove(client_vm) {
            return PlacementStatus::ClientVmNonexistent;
        }
        if vms.is_empty()
            && !guard.workloads.iter().any(|w| w.client_host == client_host)
        {
            for replica in &self.replicas {
                replica.del_queue(&config::queue_in_name(client_host));
                replica.del_queue(&config::queue_out_name(client_host));
            }
            guard.clients.remove(client_host);
        }
        PlacementStatus::Ok
    }

    /// Register a server VM: the host's network queues on first sight, and
    /// the VM's storage queue always.
    pub fn add_server_vm(&self, server_host: &str, server_vm: &str) -> PlacementStatus {
        let mut guard = self.shared.state.lock();
        if !guard.servers.contains_key(server_host) {
            for replica in &self.replicas {
                replica.add_queue(&config::network_in_queue(server_host));
                replica.add_queue(&config::network_out_queue(server_host));
            }
        }
        let vms = guard.servers.entry(server_host.to_owned()).or_default();
        if vms.contains(server_vm) {
            return PlacementStatus::ServerVmAlreadyExists;
        }
        for replica in &self.replicas {
            replica.add_queue(&config::storage_queue(&server_name(server_host, server_vm)));
        }
        vms.insert(server_vm.to_owned());
        PlacementStatus::Ok
    }

    pub fn del_server_vm(&self, server_host: &str, server_vm: &str) -> PlacementStatus {
        let mut guard = self.shared.state.lock();
        let Some(vms) = guard.servers.get_mut(server_host) else {
            return PlacementStatus::ServerVmNonexistent;
        };
        if !vms.contains(server_vm) {
            return PlacementStatus::ServerVmNonexistent;
        }
        if guard
            .workloads
            .iter()
            .any(|w| w.server_host == server_host && w.server_vm == server_vm)
        {
            return PlacementStatus::ServerVmInUse;
        }
        for replica in &self.replicas {
            replica.del_queue(&server_name(server_host, server_vm));
        }
        let vms = guard.servers.get_mut(server_host).unwrap();
        vms.remove(server_vm);
        if vms.is_empty() {
            for replica in &self.replicas {
                replica.del_queue(&config::queue_in_name(server_host));
                replica.del_queue(&config::queue_out_name(server_host));
            }
            guard.servers.remove(server_host);
        }
        PlacementStatus::Ok
    }

    pub fn placements(&self) -> Vec<PlacementRecord> {
        self.shared.state.lock().workloads.clone()
    }
}

impl Drop for PlacementCoordinator {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.state.lock();
            guard.shutdown = true;
        }
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Pick the client VM for a placement on `server_host`: prefer the host
/// already grouped with that server, then any client hosting a workload that
/// shares the server, then the client host with the most free VMs.
fn client_server_placement(state: &State, server_host: &str) -> Option<(String, String)> {
    if let Some(client_host) = state.server_client_grouping.get(server_host) {
        if let Some(vm) = state
            .clients
            .get(client_host)
            .and_then(|vms| vms.iter().next())
        {
            return Some((client_host.clone(), vm.clone()));
        }
    }
    for workload in &state.workloads {
        if workload.server_host == server_host {
            if let Some(vm) = state
                .clients
                .get(&workload.client_host)
                .and_then(|vms| vms.iter().next())
            {
                return Some((workload.client_host.clone(), vm.clone()));
            }
        }
    }
    state
        .clients
        .iter()
        .max_by_key(|(_, vms)| vms.len())
        .filter(|(_, vms)| !vms.is_empty())
        .map(|(host, vms)| (host.clone(), vms.iter().next().unwrap().clone()))
}

fn worker_loop(shared: Arc<Shared>, replica: Arc<dyn AdmissionReplica>, fast_first_fit: bool) {
    let mut guard = shared.state.lock();
    loop {
        // Wait for an index to probe.
        loop {
            if guard.shutdown {
                return;
            }
            if guard.current.is_some() && guard.next_index < guard.work_queue.len() {
                break;
            }
            shared.work_available.wait(&mut guard);
        }
        let index = guard.next_index;
        guard.next_index += 1;
        guard.outstanding_work += 1;
        let (server_host, server_vm) = guard.work_queue[index].clone();
        let placement = client_server_placement(&guard, &server_host);
        let job = guard.current.clone().unwrap();
        // Release the lock for the long-running admission probe.
        drop(guard);

        let admitted = match placement {
            Some((client_host, client_vm)) => {
                let spec = render_client(
                    &job.template,
                    &client_host,
                    &client_vm,
                    &server_host,
                    &server_vm,
                    &job.addr_prefix,
                    false,
                );
                let result = replica.add_clients(&[spec], fast_first_fit);
                // Undo the speculative add so the replica stays clean.
                if result.admitted {
                    replica.del_client(&job.template.name);
                }
                result.status.is_ok() && result.admitted
            }
            None => false,
        };

        guard = shared.state.lock();
        guard.outstanding_work -= 1;
        if admitted {
            // Cancel unstarted probes and track the lowest fitting index.
            guard.next_index = guard.work_queue.len();
            if index < guard.best_index {
                guard.best_index = index;
            }
        }
        if guard.outstanding_work == 0 && guard.next_index >= guard.work_queue.len() {
            shared.work_complete.notify_all();
        }
    }
}
