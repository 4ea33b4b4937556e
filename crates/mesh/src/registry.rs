//! In-memory implementations of the registry and connector ports.
//!
//! These back the `meshd` scenario runner and the integration tests. A
//! production deployment replaces them with registry and RPC adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::ports::ForwarderPredicate;
use crate::{
    Connection, ConnectionScope, EndpointConnector, EndpointName, EndpointRegistration, EndpointRegistry,
    ExclusionSet, Forwarder, ForwarderClient, ForwarderName, ForwarderRegistry, ManagerName,
    MeshError, NetworkService,
};

/// Interval between availability checks in
/// [`InMemoryForwarderRegistry::wait_for_available`].
pub const FORWARDER_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Forwarders
// ---------------------------------------------------------------------------

struct RegisteredForwarder {
    forwarder: Forwarder,
    client: Arc<dyn ForwarderClient>,
}

/// Forwarders registered in process, in registration order.
#[derive(Default)]
pub struct InMemoryForwarderRegistry {
    forwarders: RwLock<Vec<RegisteredForwarder>>,
}

impl std::fmt::Debug for InMemoryForwarderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.forwarders.read().iter().map(|r| r.forwarder.name.clone()))
            .finish()
    }
}

impl InMemoryForwarderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a forwarder.
    pub fn register(&self, forwarder: Forwarder, client: Arc<dyn ForwarderClient>) {
        let mut forwarders = self.forwarders.write();
        forwarders.retain(|r| r.forwarder.name != forwarder.name);
        tracing::info!(forwarder = %forwarder.name, "forwarder registered");
        forwarders.push(RegisteredForwarder { forwarder, client });
    }

    /// Removes a forwarder; returns `true` if it was registered.
    pub fn unregister(&self, name: &ForwarderName) -> bool {
        let mut forwarders = self.forwarders.write();
        let before = forwarders.len();
        forwarders.retain(|r| &r.forwarder.name != name);
        before != forwarders.len()
    }

    /// Replaces the advertised mechanisms of a registered forwarder.
    pub fn update(&self, forwarder: Forwarder) -> bool {
        let mut forwarders = self.forwarders.write();
        match forwarders
            .iter_mut()
            .find(|r| r.forwarder.name == forwarder.name)
        {
            Some(registered) => {
                registered.forwarder = forwarder;
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.forwarders.read().is_empty()
    }
}

#[async_trait]
impl ForwarderRegistry for InMemoryForwarderRegistry {
    fn select(&self, predicate: ForwarderPredicate<'_>) -> Option<Forwarder> {
        self.forwarders
            .read()
            .iter()
            .map(|r| &r.forwarder)
            .find(|f| predicate(f))
            .cloned()
    }

    fn get(&self, name: &ForwarderName) -> Option<Forwarder> {
        self.forwarders
            .read()
            .iter()
            .find(|r| &r.forwarder.name == name)
            .map(|r| r.forwarder.clone())
    }

    async fn wait_for_available(&self, timeout: Duration) -> Result<(), MeshError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MeshError::selection(format!(
                    "no forwarder registered within {timeout:?}"
                )));
            }
            tokio::time::sleep(FORWARDER_POLL_INTERVAL).await;
        }
    }

    async fn connect(&self, forwarder: &Forwarder) -> Result<Arc<dyn ForwarderClient>, MeshError> {
        self.forwarders
            .read()
            .iter()
            .find(|r| r.forwarder.name == forwarder.name)
            .map(|r| r.client.clone())
            .ok_or_else(|| {
                MeshError::transport(format!("forwarder {} is not registered", forwarder.name))
            })
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Endpoints registered in process, matched by service and labels.
#[derive(Debug, Default)]
pub struct InMemoryEndpointRegistry {
    endpoints: RwLock<Vec<EndpointRegistration>>,
}

impl InMemoryEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: EndpointRegistration) {
        let mut endpoints = self.endpoints.write();
        endpoints.retain(|e| e.name != endpoint.name);
        endpoints.push(endpoint);
    }

    pub fn unregister(&self, name: &EndpointName) -> bool {
        let mut endpoints = self.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|e| &e.name != name);
        before != endpoints.len()
    }

    /// An endpoint serves a connection if the service matches and no label
    /// present on both disagrees.
    fn serves(endpoint: &EndpointRegistration, connection: &Connection) -> bool {
        endpoint.network_service == connection.network_service
            && endpoint.labels.iter().all(|(key, value)| {
                connection
                    .labels
                    .get(key)
                    .map_or(true, |wanted| wanted == value)
            })
    }
}

#[async_trait]
impl EndpointRegistry for InMemoryEndpointRegistry {
    async fn get_candidate(
        &self,
        connection: &Connection,
        excluded: &ExclusionSet,
    ) -> Result<EndpointRegistration, MeshError> {
        let endpoints = self.endpoints.read();
        // A request forwarded by a peer manager names its endpoint.
        if let ConnectionScope::Remote {
            endpoint_name: Some(target),
            ..
        } = &connection.scope
        {
            return endpoints
                .iter()
                .find(|e| &e.name == target && !excluded.contains(&e.name))
                .cloned()
                .ok_or_else(|| {
                    MeshError::selection(format!("endpoint {target} is not available here"))
                });
        }
        endpoints
            .iter()
            .filter(|e| !excluded.contains(&e.name))
            .find(|e| Self::serves(e, connection))
            .cloned()
            .ok_or_else(|| {
                MeshError::selection(format!(
                    "no endpoint left for network service {:?} ({} excluded)",
                    connection.network_service,
                    excluded.len()
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Resolves local endpoints by name and remote ones by owning manager.
pub struct StaticEndpointConnector {
    local_manager: ManagerName,
    endpoints: HashMap<EndpointName, Arc<dyn NetworkService>>,
    peers: HashMap<ManagerName, Arc<dyn NetworkService>>,
}

impl std::fmt::Debug for StaticEndpointConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticEndpointConnector")
            .field("local_manager", &self.local_manager)
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticEndpointConnector {
    pub fn new(local_manager: ManagerName) -> Self {
        Self {
            local_manager,
            endpoints: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, name: EndpointName, service: Arc<dyn NetworkService>) -> Self {
        self.endpoints.insert(name, service);
        self
    }

    #[must_use]
    pub fn with_peer(mut self, manager: ManagerName, service: Arc<dyn NetworkService>) -> Self {
        self.peers.insert(manager, service);
        self
    }
}

#[async_trait]
impl EndpointConnector for StaticEndpointConnector {
    async fn connect(
        &self,
        endpoint: &EndpointRegistration,
    ) -> Result<Arc<dyn NetworkService>, MeshError> {
        let found = if endpoint.manager == self.local_manager {
            self.endpoints.get(&endpoint.name)
        } else {
            self.peers.get(&endpoint.manager)
        };
        found.cloned().ok_or_else(|| {
            MeshError::transport(format!(
                "no route to endpoint {} on {}",
                endpoint.name, endpoint.manager
            ))
        })
    }
}
