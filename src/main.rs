// slogate binary.
//
// Runs one of the services, or the placement driver, selected by the first
// argument:
//   slogate admission [--bind addr]
//   slogate placement -a replicaAddr [-a replicaAddr ...] [-f] [--bind addr]
//   slogate enforcer -c configFile
//   slogate placement-client -t topoFile -o outputFile -s serverAddr [-e eventFile]
//
// The three service modes start their TCP surface on a background runtime
// thread and keep the process alive until Ctrl+C. The placement-client mode
// registers the topology file's VM inventory with a running placement
// coordinator, replays the event file (or adds every workload once), and
// writes the annotated topology to the output file.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use slogate::admission::AdmissionService;
use slogate::analysis::AnalysisMode;
use slogate::compactor::Engine;
use slogate::config::PlacementTopology;
use slogate::estimator::{Estimator, StorageProfile};
use slogate::placement::{AdmissionReplica, PlacementCoordinator};
use slogate::rpc::{
    self, FrameBackend, PlacementClient, RemoteReplica, RpcEnforcementDispatcher,
};
use slogate::scheduler::{Scheduler, SchedulerConfig, WorkerPool};
use slogate::threading;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_ADMISSION_BIND: &str = "0.0.0.0:4010";
const DEFAULT_PLACEMENT_BIND: &str = "0.0.0.0:4011";

struct CliOptions {
    mode: String,
    bind: Option<String>,
    replicas: Vec<String>,
    fast_first_fit: bool,
    config_path: Option<String>,
    hop_by_hop: bool,
    topo_path: Option<String>,
    output_path: Option<String>,
    server_addr: Option<String>,
    event_path: Option<String>,
}

fn parse_cli_options() -> Result<CliOptions> {
    let mut args = std::env::args().skip(1);
    let mode = args.next().ok_or_else(|| {
        anyhow!("usage: slogate <admission|placement|enforcer|placement-client> [options]")
    })?;
    let mut options = CliOptions {
        mode,
        bind: None,
        replicas: Vec::new(),
        fast_first_fit: false,
        config_path: None,
        hop_by_hop: false,
        topo_path: None,
        output_path: None,
        server_addr: None,
        event_path: None,
    };
    while let Some(arg) = args.next() {
        let (key, inline_value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_owned(), Some(value.to_owned())),
            None => (arg, None),
        };
        let mut value = |args: &mut dyn Iterator<Item = String>| {
            inline_value
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| anyhow!("missing value for {key}"))
        };
        match key.as_str() {
            "-a" | "--replica" => options.replicas.push(value(&mut args)?),
            "-f" | "--fast-first-fit" => options.fast_first_fit = true,
            "-c" | "--config" => options.config_path = Some(value(&mut args)?),
            "--bind" => options.bind = Some(value(&mut args)?),
            "--hop-by-hop" => options.hop_by_hop = true,
            "-t" | "--topo" => options.topo_path = Some(value(&mut args)?),
            "-o" | "--output" => options.output_path = Some(value(&mut args)?),
            "-s" | "--server" => options.server_addr = Some(value(&mut args)?),
            "-e" | "--events" => options.event_path = Some(value(&mut args)?),
            other => bail!("unknown option {other}"),
        }
    }
    Ok(options)
}

/// Storage enforcer configuration file.
#[derive(Debug, Deserialize)]
struct EnforcerConfig {
    #[serde(rename = "listenAddr", default = "default_enforcer_bind")]
    listen_addr: String,
    #[serde(rename = "downstreamAddr")]
    downstream_addr: String,
    #[serde(rename = "downstreamConnections", default = "default_connections")]
    downstream_connections: usize,
    #[serde(rename = "workerThreads", default = "default_connections")]
    worker_threads: usize,
    #[serde(rename = "profilePath")]
    profile_path: String,
    #[serde(rename = "maxOutstandingReadJobs", default = "default_jobs")]
    max_outstanding_read_jobs: u64,
    #[serde(rename = "maxOutstandingWriteJobs", default = "default_jobs")]
    max_outstanding_write_jobs: u64,
    #[serde(rename = "maxOutstandingReadBytes", default = "default_bytes")]
    max_outstanding_read_bytes: u64,
    #[serde(rename = "maxOutstandingWriteBytes", default = "default_bytes")]
    max_outstanding_write_bytes: u64,
    #[serde(rename = "keepAliveSecs", default = "default_keep_alive")]
    keep_alive_secs: u64,
}

fn default_enforcer_bind() -> String {
    format!("0.0.0.0:{}", rpc::ENFORCER_PORT)
}

fn default_connections() -> usize {
    8
}

fn default_jobs() -> u64 {
    16
}

fn default_bytes() -> u64 {
    1 << 22
}

fn default_keep_alive() -> u64 {
    60
}

fn serve_on_thread<F>(name: &str, server: F)
where
    F: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    let name = name.to_owned();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
        if let Err(err) = rt.block_on(server) {
            error!(service = %name, error = %err, "server exited");
        }
    });
}

fn wait_for_shutdown() -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
    })?;
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

fn run_admission(options: &CliOptions) -> Result<()> {
    let bind = options
        .bind
        .clone()
        .unwrap_or_else(|| DEFAULT_ADMISSION_BIND.to_owned());
    let mode = if options.hop_by_hop {
        AnalysisMode::HopByHop
    } else {
        AnalysisMode::AggregateTwoHop
    };
    let service = Arc::new(Mutex::new(AdmissionService::new(
        Engine::new(mode),
        Box::new(RpcEnforcementDispatcher),
    )));
    info!(%bind, ?mode, "admission service starting");
    serve_on_thread("admission", async move {
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        rpc::serve_admission(listener, service).await
    });
    wait_for_shutdown()
}

fn run_placement(options: &CliOptions) -> Result<()> {
    if options.replicas.is_empty() {
        bail!("placement mode needs at least one -a replica address");
    }
    let bind = options
        .bind
        .clone()
        .unwrap_or_else(|| DEFAULT_PLACEMENT_BIND.to_owned());
    let replicas: Vec<Arc<dyn AdmissionReplica>> = options
        .replicas
        .iter()
        .map(|addr| Arc::new(RemoteReplica::new(addr.clone())) as Arc<dyn AdmissionReplica>)
        .collect();
    let coordinator = Arc::new(PlacementCoordinator::new(replicas, options.fast_first_fit));
    info!(%bind, replicas = options.replicas.len(), "placement coordinator starting");
    serve_on_thread("placement", async move {
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        rpc::serve_placement(listener, coordinator).await
    });
    wait_for_shutdown()
}

fn run_enforcer(options: &CliOptions) -> Result<()> {
    let config_path = options
        .config_path
        .as_ref()
        .ok_or_else(|| anyhow!("enforcer mode needs -c configFile"))?;
    let config_text = std::fs::read_to_string(config_path)
        .with_context(|| format!("reading {config_path}"))?;
    let config: EnforcerConfig =
        serde_json::from_str(&config_text).with_context(|| format!("parsing {config_path}"))?;
    let profile_text = std::fs::read_to_string(&config.profile_path)
        .with_context(|| format!("reading {}", config.profile_path))?;
    let profile: StorageProfile = serde_json::from_str(&profile_text)
        .with_context(|| format!("parsing {}", config.profile_path))?;
    let estimator = Estimator::storage_ssd(&profile)?;

    threading::set_cpu_affinity(3).map_err(|e| anyhow!(e.to_string()))?;
    let (backend, handles) = FrameBackend::new(config.downstream_addr.clone(), config.downstream_connections);
    let scheduler = Arc::new(Scheduler::new(
        handles,
        SchedulerConfig {
            max_outstanding_read_jobs: config.max_outstanding_read_jobs,
            max_outstanding_write_jobs: config.max_outstanding_write_jobs,
            max_outstanding_read_bytes: config.max_outstanding_read_bytes,
            max_outstanding_write_bytes: config.max_outstanding_write_bytes,
        },
        estimator,
    ));
    let _pool = WorkerPool::new(
        scheduler.clone(),
        backend,
        config.worker_threads,
        Duration::from_secs(config.keep_alive_secs),
    );
    info!(bind = %config.listen_addr, downstream = %config.downstream_addr, "storage enforcer starting");
    let listen_addr = config.listen_addr.clone();
    serve_on_thread("enforcer", async move {
        let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
        rpc::serve_enforcer(listener, scheduler).await
    });
    wait_for_shutdown()
}

/// One line of the event file: which topology workload to add or remove.
#[derive(Debug, Clone, Copy)]
struct PlacementEvent {
    index: usize,
    add: bool,
}

/// Parse the event CSV: `index,addClient` or `index,delClient` per line;
/// malformed lines are skipped.
fn read_event_file(path: &str) -> Result<Vec<PlacementEvent>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let mut events = Vec::new();
    for line in text.lines() {
        let Some((index, action)) = line.split_once(',') else {
            continue;
        };
        let Ok(index) = index.trim().parse::<usize>() else {
            continue;
        };
        match action.trim() {
            "addClient" => events.push(PlacementEvent { index, add: true }),
            "delClient" => events.push(PlacementEvent { index, add: false }),
            _ => {}
        }
    }
    Ok(events)
}

fn write_placement_results(path: &str, topology: &PlacementTopology) -> Result<()> {
    let json = serde_json::to_string_pretty(topology)?;
    std::fs::write(path, json).with_context(|| format!("writing {path}"))?;
    Ok(())
}

fn run_placement_client(options: &CliOptions) -> Result<()> {
    let topo_path = options
        .topo_path
        .as_ref()
        .ok_or_else(|| anyhow!("placement-client mode needs -t topoFile"))?;
    let output_path = options
        .output_path
        .clone()
        .ok_or_else(|| anyhow!("placement-client mode needs -o outputFile"))?;
    let server_addr = options
        .server_addr
        .as_ref()
        .ok_or_else(|| anyhow!("placement-client mode needs -s serverAddr"))?;
    let topo_text =
        std::fs::read_to_string(topo_path).with_context(|| format!("reading {topo_path}"))?;
    let topology: PlacementTopology =
        serde_json::from_str(&topo_text).with_context(|| format!("parsing {topo_path}"))?;
    let addr_prefix = topology.addr_prefix.clone();
    let enforce = topology.enforce;

    let client = PlacementClient::new(server_addr.clone());
    for vm in &topology.client_vms {
        if let Err(err) = client.add_client_vm(&vm.client_host, &vm.client_vm) {
            warn!(host = %vm.client_host, vm = %vm.client_vm, error = %err, "client VM registration failed");
        }
    }
    for vm in &topology.server_vms {
        if let Err(err) = client.add_server_vm(&vm.server_host, &vm.server_vm) {
            warn!(host = %vm.server_host, vm = %vm.server_vm, error = %err, "server VM registration failed");
        }
    }

    // Without an event file, each workload in the topology is added once.
    let events = match &options.event_path {
        Some(path) => read_event_file(path)?,
        None => (0..topology.clients.len())
            .map(|index| PlacementEvent { index, add: true })
            .collect(),
    };

    // A long replay may be cut short; flush whatever has been placed so far.
    let state = Arc::new(Mutex::new(topology));
    {
        let state = state.clone();
        let output_path = output_path.clone();
        ctrlc::set_handler(move || {
            let _ = write_placement_results(&output_path, &state.lock());
            std::process::exit(0);
        })?;
    }

    for event in events {
        let Some(template) = state.lock().clients.get(event.index).cloned() else {
            warn!(index = event.index, "event references a workload outside the topology file");
            continue;
        };
        if event.add {
            match client.add_clients(&[template.clone()], &addr_prefix, enforce) {
                Ok(response) if response.admitted == Some(true) => {
                    let mut state = state.lock();
                    let placed = &mut state.clients[event.index];
                    placed.admitted = true;
                    placed.client_host = response.client_hosts.first().cloned();
                    placed.client_vm = response.client_vms.first().cloned();
                    placed.server_host = response.server_hosts.first().cloned();
                    placed.server_vm = response.server_vms.first().cloned();
                    info!(
                        workload = %template.name,
                        client_host = placed.client_host.as_deref().unwrap_or(""),
                        server_host = placed.server_host.as_deref().unwrap_or(""),
                        "workload placed"
                    );
                }
                Ok(_) => info!(workload = %template.name, "workload rejected"),
                Err(err) => warn!(workload = %template.name, error = %err, "placement call failed"),
            }
        } else if let Err(err) = client.del_clients(&[template.name.clone()]) {
            warn!(workload = %template.name, error = %err, "removal call failed");
        }
    }

    let guard = state.lock();
    write_placement_results(&output_path, &guard)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let options = parse_cli_options()?;
    match options.mode.as_str() {
        "admission" => run_admission(&options),
        "placement" => run_placement(&options),
        "enforcer" => run_enforcer(&options),
        "placement-client" => run_placement_client(&options),
        other => bail!(
            "unknown mode {other}; expected admission, placement, enforcer, or placement-client"
        ),
    }
}
