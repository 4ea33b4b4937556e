//! Shared fakes and builders for the manager integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mesh::mechanism::{kernel, memif, vxlan};
use mesh::{
    CallContext, Connection, ConnectionState, CrossConnect, EndpointName, EndpointRegistration,
    EndpointRegistry, ExclusionSet, Forwarder, ForwarderClient, ForwarderName,
    InMemoryEndpointRegistry, InMemoryForwarderRegistry, ManagerName, Mechanism, MechanismClass,
    MeshConfig, MeshError, NetworkService, NetworkServiceRequest, Signer, StaticEndpointConnector,
};
use parking_lot::Mutex;
use stages::{NetworkServiceManager, NetworkServiceManagerBuilder};
use tokio::sync::Notify;

pub const SERVICE: &str = "secure-intranet";

// ============================================================================
// Configuration and payloads
// ============================================================================

pub fn test_config(manager: &str) -> MeshConfig {
    MeshConfig {
        manager_name: manager.to_string(),
        heal_retry_delay: Duration::from_millis(10),
        forwarder_retry_delay: Duration::from_millis(10),
        ..MeshConfig::default()
    }
}

pub fn kernel_preference() -> Mechanism {
    Mechanism::new(MechanismClass::Local, kernel::MECHANISM)
}

pub fn client_request(id: &str, service: &str) -> NetworkServiceRequest {
    let mut connection = Connection::new(service);
    connection.id = id.to_string();
    NetworkServiceRequest::new(connection, vec![kernel_preference()])
}

/// A forwarder offering kernel and memif locally and VXLAN from `ip`.
pub fn forwarder(name: &str, ip: &str) -> Forwarder {
    Forwarder {
        name: ForwarderName::new(name).unwrap(),
        local_mechanisms: vec![
            Mechanism::new(MechanismClass::Local, kernel::MECHANISM),
            Mechanism::new(MechanismClass::Local, memif::MECHANISM),
        ],
        remote_mechanisms: vec![
            Mechanism::new(MechanismClass::Remote, vxlan::MECHANISM).with_parameter(vxlan::SRC_IP, ip),
        ],
    }
}

pub fn registration(name: &str, service: &str, manager: &str) -> EndpointRegistration {
    EndpointRegistration {
        name: EndpointName::new(name).unwrap(),
        network_service: service.to_string(),
        manager: ManagerName::new(manager).unwrap(),
        payload: "IP".to_string(),
        labels: Default::default(),
        workspace: Some("ws-1".to_string()),
    }
}

// ============================================================================
// Forwarder
// ============================================================================

/// Forwarder client that fails a configurable number of program attempts.
#[derive(Default)]
pub struct FakeForwarder {
    failures_left: AtomicU32,
    always_fail: AtomicBool,
    rewrite: Option<fn(&mut CrossConnect)>,
    requests: AtomicU32,
    closes: Mutex<Vec<String>>,
}

impl FakeForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_first(n: u32) -> Arc<Self> {
        let forwarder = Self::default();
        forwarder.failures_left.store(n, Ordering::SeqCst);
        Arc::new(forwarder)
    }

    pub fn always_failing() -> Arc<Self> {
        let forwarder = Self::default();
        forwarder.always_fail.store(true, Ordering::SeqCst);
        Arc::new(forwarder)
    }

    /// Programs successfully but answers with the cross connect as changed
    /// by `rewrite`.
    pub fn rewriting(rewrite: fn(&mut CrossConnect)) -> Arc<Self> {
        Arc::new(Self {
            rewrite: Some(rewrite),
            ..Self::default()
        })
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> Vec<String> {
        self.closes.lock().clone()
    }
}

#[async_trait]
impl ForwarderClient for FakeForwarder {
    async fn request(
        &self,
        _ctx: &CallContext,
        cross_connect: CrossConnect,
    ) -> Result<CrossConnect, MeshError> {
        let attempt = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(MeshError::transport(format!("dataplane rejected attempt {attempt}")));
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(MeshError::transport(format!("dataplane busy on attempt {attempt}")));
        }
        let mut programmed = cross_connect;
        if let Some(rewrite) = self.rewrite {
            rewrite(&mut programmed);
        }
        Ok(programmed)
    }

    async fn close(&self, _ctx: &CallContext, cross_connect: &CrossConnect) -> Result<(), MeshError> {
        self.closes.lock().push(cross_connect.id.clone());
        Ok(())
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Endpoint that answers with the first offered mechanism and a fixed
/// address pair derived from `octet`.
pub struct FakeEndpoint {
    octet: u8,
    failing: AtomicBool,
    requests: Mutex<Vec<NetworkServiceRequest>>,
    closes: Mutex<Vec<String>>,
    gate: Option<Gate>,
}

/// Holds a request inside the endpoint until released.
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl FakeEndpoint {
    pub fn new(octet: u8) -> Arc<Self> {
        Arc::new(Self {
            octet,
            failing: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    pub fn failing(octet: u8) -> Arc<Self> {
        let endpoint = Self::new(octet);
        endpoint.set_failing(true);
        endpoint
    }

    pub fn gated(octet: u8, gate: Gate) -> Arc<Self> {
        Arc::new(Self {
            octet,
            failing: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn src_ip(&self) -> String {
        format!("10.{}.0.1/32", self.octet)
    }

    pub fn dst_ip(&self) -> String {
        format!("10.{}.0.2/32", self.octet)
    }

    pub fn requests(&self) -> Vec<NetworkServiceRequest> {
        self.requests.lock().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.closes.lock().clone()
    }
}

#[async_trait]
impl NetworkService for FakeEndpoint {
    async fn request(
        &self,
        _ctx: &CallContext,
        request: NetworkServiceRequest,
    ) -> Result<Connection, MeshError> {
        self.requests.lock().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(MeshError::transport(format!(
                "endpoint 10.{}.0.0 unavailable",
                self.octet
            )));
        }
        let mut connection = request.connection;
        connection.mechanism = Some(
            request
                .mechanism_preferences
                .first()
                .cloned()
                .ok_or_else(|| MeshError::validation("no mechanism offered"))?,
        );
        connection.context.ip.src_ip_addr = Some(self.src_ip());
        connection.context.ip.dst_ip_addr = Some(self.dst_ip());
        connection.state = ConnectionState::Up;
        Ok(connection)
    }

    async fn close(&self, _ctx: &CallContext, connection: &Connection) -> Result<(), MeshError> {
        self.closes.lock().push(connection.id.clone());
        Ok(())
    }
}

// ============================================================================
// Registry and signer
// ============================================================================

/// Endpoint registry that records the exclusion set of every lookup.
#[derive(Default)]
pub struct RecordingEndpointRegistry {
    pub inner: InMemoryEndpointRegistry,
    lookups: Mutex<Vec<Vec<String>>>,
}

impl RecordingEndpointRegistry {
    pub fn lookups(&self) -> Vec<Vec<String>> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl EndpointRegistry for RecordingEndpointRegistry {
    async fn get_candidate(
        &self,
        connection: &Connection,
        excluded: &ExclusionSet,
    ) -> Result<EndpointRegistration, MeshError> {
        self.lookups
            .lock()
            .push(excluded.iter().map(|n| n.to_string()).collect());
        self.inner.get_candidate(connection, excluded).await
    }
}

/// Signs with `signed:<id>` and accepts any token with that prefix.
pub struct FakeSigner;

impl Signer for FakeSigner {
    fn sign(&self, connection: &Connection) -> Result<String, MeshError> {
        Ok(format!("signed:{}", connection.id))
    }

    fn verify(&self, token: &str) -> Result<(), MeshError> {
        if token.starts_with("signed:") {
            Ok(())
        } else {
            Err(MeshError::validation(format!("unknown token {token:?}")))
        }
    }
}

/// Verifies everything and refuses to sign.
pub struct RejectingSigner;

impl Signer for RejectingSigner {
    fn sign(&self, connection: &Connection) -> Result<String, MeshError> {
        Err(MeshError::transport(format!(
            "signing service unreachable for {}",
            connection.id
        )))
    }

    fn verify(&self, _token: &str) -> Result<(), MeshError> {
        Ok(())
    }
}

// ============================================================================
// Assembled manager
// ============================================================================

pub struct TestMesh {
    pub manager: NetworkServiceManager,
    pub forwarder: Arc<FakeForwarder>,
    pub forwarders: Arc<InMemoryForwarderRegistry>,
    pub endpoints: Arc<RecordingEndpointRegistry>,
}

/// Builds a manager with one forwarder and the given endpoints, all local.
pub fn local_mesh(
    config: MeshConfig,
    client: Arc<FakeForwarder>,
    endpoints: Vec<(EndpointRegistration, Arc<FakeEndpoint>)>,
) -> TestMesh {
    mesh_with(config, client, endpoints, Vec::new(), |builder| builder)
}

/// Builds a manager; `peers` resolve endpoints owned by other managers.
pub fn mesh_with<F>(
    config: MeshConfig,
    client: Arc<FakeForwarder>,
    endpoints: Vec<(EndpointRegistration, Arc<FakeEndpoint>)>,
    peers: Vec<(ManagerName, Arc<dyn NetworkService>)>,
    customize: F,
) -> TestMesh
where
    F: FnOnce(NetworkServiceManagerBuilder) -> NetworkServiceManagerBuilder,
{
    let manager_name = config.manager().unwrap();
    let forwarders = Arc::new(InMemoryForwarderRegistry::new());
    forwarders.register(forwarder("fwd-1", "192.168.0.1"), client.clone());

    let registry = Arc::new(RecordingEndpointRegistry::default());
    let mut connector = StaticEndpointConnector::new(manager_name);
    for (registration, endpoint) in endpoints {
        connector = connector.with_endpoint(registration.name.clone(), endpoint);
        registry.inner.register(registration);
    }
    for (manager, service) in peers {
        connector = connector.with_peer(manager, service);
    }

    let builder = NetworkServiceManager::builder(config)
        .forwarders(forwarders.clone())
        .endpoints(registry.clone())
        .connector(Arc::new(connector));
    let manager = customize(builder).build().unwrap();
    TestMesh {
        manager,
        forwarder: client,
        forwarders,
        endpoints: registry,
    }
}
