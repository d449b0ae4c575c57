//! JSON-lines-over-TCP glue for the three service surfaces.
//!
//! The logical contracts (operations, fields, status codes) live in the
//! descriptor types; this module only frames them: one JSON request per
//! line, one JSON response per line, over a persistent TCP connection.
//! Servers run on tokio and hand each request to the owning service behind
//! its serializing lock; clients are synchronous, since every caller (a
//! placement worker, the admission dispatcher) already runs on its own
//! thread. A failed or timed-out call surfaces as a local error and never as
//! partial state.

use crate::admission::{AddClientsResult, AdmissionService, EnforcementDispatcher};
use crate::config::WorkloadTemplate;
use crate::descriptors::{AdmissionStatus, ClientSpec, EnforcerType, FlowSpec, QueueSpec};
use crate::placement::{AdmissionReplica, PlacementCoordinator, PlacementStatus};
use crate::scheduler::{Job, JobReply, Scheduler, StorageBackend};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Per-call timeout; generous because a placement probe may run many LPs.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default port of the storage enforcement service.
pub const ENFORCER_PORT: u16 = 4012;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Append the default enforcer port when an address has none.
fn normalize_enforcer_addr(value: &str) -> String {
    if value.contains(':') {
        value.to_string()
    } else {
        format!("{value}:{ENFORCER_PORT}")
    }
}

//
// Admission surface
//

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum AdmissionRequest {
    AddClients {
        clients: Vec<ClientSpec>,
        #[serde(rename = "fastFirstFit", default)]
        fast_first_fit: bool,
    },
    DelClient {
        name: String,
    },
    AddQueue {
        queue: QueueSpec,
    },
    DelQueue {
        name: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub status: AdmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admitted: Option<bool>,
}

fn handle_admission(
    service: &Mutex<AdmissionService>,
    request: AdmissionRequest,
) -> AdmissionResponse {
    match request {
        AdmissionRequest::AddClients {
            clients,
            fast_first_fit,
        } => {
            let result = service.lock().add_clients(&clients, fast_first_fit);
            AdmissionResponse {
                status: result.status,
                admitted: Some(result.admitted),
            }
        }
        AdmissionRequest::DelClient { name } => AdmissionResponse {
            status: service.lock().del_client(&name),
            admitted: None,
        },
        AdmissionRequest::AddQueue { queue } => AdmissionResponse {
            status: service.lock().add_queue(&queue),
            admitted: None,
        },
        AdmissionRequest::DelQueue { name } => AdmissionResponse {
            status: service.lock().del_queue(&name),
            admitted: None,
        },
    }
}

/// Serve the admission surface until the listener is dropped.
pub async fn serve_admission(
    listener: TcpListener,
    service: Arc<Mutex<AdmissionService>>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, move |line| {
                respond(line, |req| handle_admission(&service, req))
            })
            .await
            {
                debug!(%peer, error = %err, "admission connection closed");
            }
        });
    }
}

//
// Placement surface
//

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PlacementRequest {
    AddClients {
        clients: Vec<WorkloadTemplate>,
        #[serde(rename = "addrPrefix", default)]
        addr_prefix: String,
        #[serde(default)]
        enforce: bool,
    },
    DelClients {
        names: Vec<String>,
    },
    AddClientVm {
        #[serde(rename = "clientHost")]
        client_host: String,
        #[serde(rename = "clientVM")]
        client_vm: String,
    },
    DelClientVm {
        #[serde(rename = "clientHost")]
        client_host: String,
        #[serde(rename = "clientVM")]
        client_vm: String,
    },
    AddServerVm {
        #[serde(rename = "serverHost")]
        server_host: String,
        #[serde(rename = "serverVM")]
        server_vm: String,
    },
    DelServerVm {
        #[serde(rename = "serverHost")]
        server_host: String,
        #[serde(rename = "serverVM")]
        server_vm: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct PlacementResponse {
    pub status: PlacementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admitted: Option<bool>,
    #[serde(rename = "clientHosts", default)]
    pub client_hosts: Vec<String>,
    #[serde(rename = "clientVMs", default)]
    pub client_vms: Vec<String>,
    #[serde(rename = "serverHosts", default)]
    pub server_hosts: Vec<String>,
    #[serde(rename = "serverVMs", default)]
    pub server_vms: Vec<String>,
}

fn handle_placement(pc: &PlacementCoordinator, request: PlacementRequest) -> PlacementResponse {
    match request {
        PlacementRequest::AddClients {
            clients,
            addr_prefix,
            enforce,
        } => {
            let result = pc.add_clients(&clients, &addr_prefix, enforce);
            let mut response = PlacementResponse {
                status: result.status,
                admitted: Some(result.admitted),
                ..PlacementResponse::default()
            };
            for placement in result.placements {
                response.client_hosts.push(placement.client_host);
                response.client_vms.push(placement.client_vm);
                response.server_hosts.push(placement.server_host);
                response.server_vms.push(placement.server_vm);
            }
            response
        }
        PlacementRequest::DelClients { names } => PlacementResponse {
            status: pc.del_clients(&names),
            ..PlacementResponse::default()
        },
        PlacementRequest::AddClientVm {
            client_host,
            client_vm,
        } => PlacementResponse {
            status: pc.add_client_vm(&client_host, &client_vm),
            ..PlacementResponse::default()
        },
        PlacementRequest::DelClientVm {
            client_host,
            client_vm,
        } => PlacementResponse {
            status: pc.del_client_vm(&client_host, &client_vm),
            ..PlacementResponse::default()
        },
        PlacementRequest::AddServerVm {
            server_host,
            server_vm,
        } => PlacementResponse {
            status: pc.add_server_vm(&server_host, &server_vm),
            ..PlacementResponse::default()
        },
        PlacementRequest::DelServerVm {
            server_host,
            server_vm,
        } => PlacementResponse {
            status: pc.del_server_vm(&server_host, &server_vm),
            ..PlacementResponse::default()
        },
    }
}

/// Serve the placement surface. Placement probes block on worker threads, so
/// each request runs on the blocking pool.
pub async fn serve_placement(
    listener: TcpListener,
    pc: Arc<PlacementCoordinator>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let pc = pc.clone();
        tokio::spawn(async move {
            let result = serve_connection_blocking(stream, move |line| {
                respond(line, |req| handle_placement(&pc, req))
            })
            .await;
            if let Err(err) = result {
                debug!(%peer, error = %err, "placement connection closed");
            }
        });
    }
}

//
// Enforcement surface
//

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum EnforcerRequest {
    UpdateClient {
        #[serde(rename = "tenantKey")]
        tenant_key: String,
        #[serde(default)]
        priority: u32,
        #[serde(rename = "rateLimitRates", default)]
        rate_limit_rates: Vec<f64>,
        #[serde(rename = "rateLimitBursts", default)]
        rate_limit_bursts: Vec<f64>,
    },
    RemoveClient {
        #[serde(rename = "tenantKey")]
        tenant_key: String,
    },
    GetOccupancy {
        #[serde(rename = "tenantKey")]
        tenant_key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnforcerResponse {
    pub status: AdmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupancy: Option<f64>,
}

fn handle_enforcer(scheduler: &Scheduler, request: EnforcerRequest) -> EnforcerResponse {
    match request {
        EnforcerRequest::UpdateClient {
            tenant_key,
            priority,
            rate_limit_rates,
            rate_limit_bursts,
        } => {
            if rate_limit_rates.len() != rate_limit_bursts.len() {
                return EnforcerResponse {
                    status: AdmissionStatus::InvalidArgument,
                    occupancy: None,
                };
            }
            let limiters: Vec<_> = rate_limit_rates
                .iter()
                .zip(&rate_limit_bursts)
                .map(|(&rate, &burst)| crate::descriptors::RateLimiterSpec { rate, burst })
                .collect();
            scheduler.update_tenant(&tenant_key, priority, &limiters);
            EnforcerResponse {
                status: AdmissionStatus::Ok,
                occupancy: None,
            }
        }
        EnforcerRequest::RemoveClient { tenant_key } => {
            scheduler.remove_tenant(&tenant_key);
            EnforcerResponse {
                status: AdmissionStatus::Ok,
                occupancy: None,
            }
        }
        EnforcerRequest::GetOccupancy { tenant_key } => EnforcerResponse {
            status: AdmissionStatus::Ok,
            occupancy: Some(scheduler.occupancy(&tenant_key)),
        },
    }
}

/// Serve the enforcement surface of a storage scheduler.
pub async fn serve_enforcer(
    listener: TcpListener,
    scheduler: Arc<Scheduler>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, move |line| {
                respond(line, |req| handle_enforcer(&scheduler, req))
            })
            .await
            {
                debug!(%peer, error = %err, "enforcer connection closed");
            }
        });
    }
}

//
// Shared framing
//

fn respond<Req: DeserializeOwned, Resp: Serialize>(
    line: &str,
    handler: impl FnOnce(Req) -> Resp,
) -> String {
    match serde_json::from_str::<Req>(line) {
        Ok(request) => {
            serde_json::to_string(&handler(request)).expect("responses always serialize")
        }
        Err(err) => {
            warn!(error = %err, "malformed request line");
            "{\"status\":\"INVALID_ARGUMENT\"}".to_owned()
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    mut handle: impl FnMut(&str) -> String,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = tokio::io::BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let mut response = handle(&line);
        response.push('\n');
        write_half.write_all(response.as_bytes()).await?;
    }
    Ok(())
}

async fn serve_connection_blocking(
    stream: tokio::net::TcpStream,
    handle: impl Fn(&str) -> String + Send + Sync + 'static,
) -> std::io::Result<()> {
    let handle = Arc::new(handle);
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = tokio::io::BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let handle = handle.clone();
        let mut response = tokio::task::spawn_blocking(move || (*handle)(&line))
            .await
            .unwrap_or_else(|_| "{\"status\":\"INVALID_ARGUMENT\"}".to_owned());
        response.push('\n');
        write_half.write_all(response.as_bytes()).await?;
    }
    Ok(())
}

/// Synchronous JSON-lines client with a lazily established, self-healing
/// connection.
pub struct JsonLineClient {
    addr: String,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl JsonLineClient {
    pub fn new(addr: impl Into<String>) -> JsonLineClient {
        JsonLineClient {
            addr: addr.into(),
            stream: Mutex::new(None),
        }
    }

    pub fn call<Req: Serialize, Resp: DeserializeOwned>(&self, request: &Req) -> Result<Resp, RpcError> {
        let line = serde_json::to_string(request)?;
        let response = self.call_raw(&line)?;
        Ok(serde_json::from_str(&response)?)
    }

    fn call_raw(&self, line: &str) -> std::io::Result<String> {
        let mut guard = self.stream.lock();
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr)?;
            stream.set_read_timeout(Some(CALL_TIMEOUT))?;
            stream.set_write_timeout(Some(CALL_TIMEOUT))?;
            *guard = Some(BufReader::new(stream));
        }
        let reader = guard.as_mut().unwrap();
        let result = (|| {
            reader.get_mut().write_all(line.as_bytes())?;
            reader.get_mut().write_all(b"\n")?;
            let mut response = String::new();
            if reader.read_line(&mut response)? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
            Ok(response)
        })();
        if result.is_err() {
            // Drop the wedged connection; the next call reconnects.
            *guard = None;
        }
        result
    }
}

/// An admission-service replica reached over TCP. Transport failures surface
/// as rejected admissions, never as partial state.
pub struct RemoteReplica {
    client: JsonLineClient,
}

impl RemoteReplica {
    pub fn new(addr: impl Into<String>) -> RemoteReplica {
        RemoteReplica {
            client: JsonLineClient::new(addr),
        }
    }

    fn call(&self, request: &AdmissionRequest) -> AdmissionResponse {
        match self.client.call(request) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "admission replica call failed");
                AdmissionResponse {
                    status: AdmissionStatus::InvalidArgument,
                    admitted: Some(false),
                }
            }
        }
    }
}

impl AdmissionReplica for RemoteReplica {
    fn add_clients(&self, clients: &[ClientSpec], fast_first_fit: bool) -> AddClientsResult {
        let response = self.call(&AdmissionRequest::AddClients {
            clients: clients.to_vec(),
            fast_first_fit,
        });
        AddClientsResult {
            status: response.status,
            admitted: response.admitted.unwrap_or(false),
        }
    }

    fn del_client(&self, name: &str) -> AdmissionStatus {
        self.call(&AdmissionRequest::DelClient { name: name.to_owned() }).status
    }

    fn add_queue(&self, queue: &QueueSpec) -> AdmissionStatus {
        self.call(&AdmissionRequest::AddQueue { queue: queue.clone() }).status
    }

    fn del_queue(&self, name: &str) -> AdmissionStatus {
        self.call(&AdmissionRequest::DelQueue { name: name.to_owned() }).status
    }
}

/// Driver-side client for the placement surface, used by the placement-client
/// tool to register VM inventory and replay workload add/remove events
/// against a running coordinator.
pub struct PlacementClient {
    client: JsonLineClient,
}

impl PlacementClient {
    pub fn new(addr: impl Into<String>) -> PlacementClient {
        PlacementClient {
            client: JsonLineClient::new(addr),
        }
    }

    fn call(&self, request: &PlacementRequest) -> Result<PlacementResponse, RpcError> {
        self.client.call(request)
    }

    pub fn add_clients(
        &self,
        clients: &[WorkloadTemplate],
        addr_prefix: &str,
        enforce: bool,
    ) -> Result<PlacementResponse, RpcError> {
        self.call(&PlacementRequest::AddClients {
            clients: clients.to_vec(),
            addr_prefix: addr_prefix.to_owned(),
            enforce,
        })
    }

    pub fn del_clients(&self, names: &[String]) -> Result<PlacementResponse, RpcError> {
        self.call(&PlacementRequest::DelClients {
            names: names.to_vec(),
        })
    }

    pub fn add_client_vm(&self, host: &str, vm: &str) -> Result<PlacementResponse, RpcError> {
        self.call(&PlacementRequest::AddClientVm {
            client_host: host.to_owned(),
            client_vm: vm.to_owned(),
        })
    }

    pub fn del_client_vm(&self, host: &str, vm: &str) -> Result<PlacementResponse, RpcError> {
        self.call(&PlacementRequest::DelClientVm {
            client_host: host.to_owned(),
            client_vm: vm.to_owned(),
        })
    }

    pub fn add_server_vm(&self, host: &str, vm: &str) -> Result<PlacementResponse, RpcError> {
        self.call(&PlacementRequest::AddServerVm {
            server_host: host.to_owned(),
            server_vm: vm.to_owned(),
        })
    }

    pub fn del_server_vm(&self, host: &str, vm: &str) -> Result<PlacementResponse, RpcError> {
        self.call(&PlacementRequest::DelServerVm {
            server_host: host.to_owned(),
            server_vm: vm.to_owned(),
        })
    }
}

/// Enforcement dispatcher that pushes parameters to the enforcer named in
/// each flow, one short-lived call per push.
#[derive(Debug, Default)]
pub struct RpcEnforcementDispatcher;

impl RpcEnforcementDispatcher {
    fn tenant_key(flow: &FlowSpec) -> Option<String> {
        match flow.enforcer_type? {
            // The storage scheduler keys tenants by the requesting client.
            EnforcerType::Storage => flow.client_addr.clone(),
            // The network shaper keys by (source, destination).
            EnforcerType::Network => match (&flow.src_addr, &flow.dst_addr) {
                (Some(src), Some(dst)) => Some(format!("{src}>{dst}")),
                _ => None,
            },
        }
    }
}

impl EnforcementDispatcher for RpcEnforcementDispatcher {
    fn update_client(&mut self, flow: &FlowSpec) -> Result<(), String> {
        let (Some(addr), Some(tenant_key)) = (&flow.enforcer_addr, Self::tenant_key(flow)) else {
            return Ok(()); // nothing to enforce
        };
        let limiters = flow.rate_limiters.clone().unwrap_or_default();
        let request = EnforcerRequest::UpdateClient {
            tenant_key,
            priority: flow.priority.unwrap_or(0),
            rate_limit_rates: limiters.iter().map(|l| l.rate).collect(),
            rate_limit_bursts: limiters.iter().map(|l| l.burst).collect(),
        };
        let client = JsonLineClient::new(normalize_enforcer_addr(addr));
        client
            .call::<_, EnforcerResponse>(&request)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    fn remove_client(&mut self, flow: &FlowSpec) -> Result<(), String> {
        let (Some(addr), Some(tenant_key)) = (&flow.enforcer_addr, Self::tenant_key(flow)) else {
            return Ok(());
        };
        let client = JsonLineClient::new(normalize_enforcer_addr(addr));
        client
            .call::<_, EnforcerResponse>(&EnforcerRequest::RemoveClient { tenant_key })
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// Downstream storage transport: one persistent TCP connection per scheduler
/// handle, length-prefixed frames in both directions. A failed exchange drops
/// the connection; the next use (or a keep-alive ping) reconnects.
pub struct FrameBackend {
    addr: String,
    conns: Vec<Mutex<Option<BufReader<TcpStream>>>>,
}

impl FrameBackend {
    /// Returns the backend plus the handle set to seed the scheduler with.
    pub fn new(addr: impl Into<String>, connections: usize) -> (Arc<FrameBackend>, Vec<usize>) {
        let backend = Arc::new(FrameBackend {
            addr: addr.into(),
            conns: (0..connections).map(|_| Mutex::new(None)).collect(),
        });
        let handles = (0..connections).collect();
        (backend, handles)
    }

    fn exchange(&self, handle: usize, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut guard = self.conns[handle].lock();
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr)?;
            stream.set_read_timeout(Some(CALL_TIMEOUT))?;
            stream.set_write_timeout(Some(CALL_TIMEOUT))?;
            *guard = Some(BufReader::new(stream));
        }
        let reader = guard.as_mut().unwrap();
        let result = (|| {
            reader
                .get_mut()
                .write_all(format!("{}\n", payload.len()).as_bytes())?;
            reader.get_mut().write_all(payload)?;
            let mut header = String::new();
            if reader.read_line(&mut header)? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
            let len: usize = header.trim().parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame header")
            })?;
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body)?;
            Ok(body)
        })();
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

impl StorageBackend for FrameBackend {
    fn forward(&self, handle: usize, job: &Job) -> JobReply {
        self.exchange(handle, &job.payload).map_err(|err| err.to_string())
    }

    fn keep_alive(&self, handle: usize) -> bool {
        // a zero-length frame doubles as a no-op ping
        self.exchange(handle, b"").is_ok()
    }
}
