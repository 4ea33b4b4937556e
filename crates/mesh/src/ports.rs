//! Collaborator interfaces consumed by the pipeline.
//!
//! Every hop in the mesh speaks the same two-verb contract, [`NetworkService`]:
//! client to manager, manager to manager, and manager to endpoint. Forwarders
//! are programmed through [`ForwarderClient`]. Transports implement these
//! traits; the domain crate never opens a socket.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    CallContext, Connection, ConnectionContext, CrossConnect, EndpointName, EndpointRegistration,
    Forwarder, ForwarderName, MeshError, NetworkServiceRequest,
};

/// Request/Close contract shared by managers and endpoints.
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Establishes (or re-establishes) a connection.
    async fn request(
        &self,
        ctx: &CallContext,
        request: NetworkServiceRequest,
    ) -> Result<Connection, MeshError>;

    /// Tears a connection down.
    async fn close(&self, ctx: &CallContext, connection: &Connection) -> Result<(), MeshError>;
}

/// Programming interface of one dataplane forwarder.
#[async_trait]
pub trait ForwarderClient: Send + Sync {
    /// Programs a cross connect. The forwarder may amend either leg's context.
    async fn request(
        &self,
        ctx: &CallContext,
        cross_connect: CrossConnect,
    ) -> Result<CrossConnect, MeshError>;

    /// Removes a programmed cross connect.
    async fn close(&self, ctx: &CallContext, cross_connect: &CrossConnect)
        -> Result<(), MeshError>;
}

/// Predicate used to pick a forwarder.
pub type ForwarderPredicate<'a> = &'a (dyn Fn(&Forwarder) -> bool + Send + Sync);

/// Registered forwarders on this node.
#[async_trait]
pub trait ForwarderRegistry: Send + Sync {
    /// First registered forwarder satisfying `predicate`.
    fn select(&self, predicate: ForwarderPredicate<'_>) -> Option<Forwarder>;

    /// Forwarder registered under `name`.
    fn get(&self, name: &ForwarderName) -> Option<Forwarder>;

    /// Waits until at least one forwarder is registered.
    async fn wait_for_available(&self, timeout: Duration) -> Result<(), MeshError>;

    /// Opens a programming client for `forwarder`.
    async fn connect(&self, forwarder: &Forwarder) -> Result<Arc<dyn ForwarderClient>, MeshError>;
}

/// Endpoints already tried during one external call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    names: BTreeSet<EndpointName>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `name` was not excluded before.
    pub fn insert(&mut self, name: EndpointName) -> bool {
        self.names.insert(name)
    }

    pub fn contains(&self, name: &EndpointName) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointName> {
        self.names.iter()
    }
}

/// Endpoint discovery.
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    /// Next endpoint able to serve `connection`, skipping `excluded`.
    ///
    /// Returns [`MeshError::Selection`] once no candidate is left.
    async fn get_candidate(
        &self,
        connection: &Connection,
        excluded: &ExclusionSet,
    ) -> Result<EndpointRegistration, MeshError>;
}

/// Resolves an endpoint registration to something that can be called.
///
/// Local endpoints resolve to the endpoint itself; remote ones to the peer
/// manager that owns them.
#[async_trait]
pub trait EndpointConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &EndpointRegistration,
    ) -> Result<Arc<dyn NetworkService>, MeshError>;
}

/// Opaque connection signing.
pub trait Signer: Send + Sync {
    /// Produces a token for `connection`.
    fn sign(&self, connection: &Connection) -> Result<String, MeshError>;

    /// Checks a token produced by a previous hop.
    fn verify(&self, token: &str) -> Result<(), MeshError>;
}

/// Connection context hook run around every endpoint request.
pub trait ConnectionPlugin: Send + Sync {
    /// Plugin name for logs.
    fn name(&self) -> &str;

    /// Amends the context before it is sent to an endpoint.
    fn enrich(&self, _context: &mut ConnectionContext) -> Result<(), MeshError> {
        Ok(())
    }

    /// Checks a connection returned by an endpoint.
    fn validate(&self, _connection: &Connection) -> Result<(), MeshError> {
        Ok(())
    }
}
