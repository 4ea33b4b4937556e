//! The network service manager: chain assembly, Request/Close entry points,
//! heal, and connection listing.

use std::sync::Arc;

use async_trait::async_trait;
use mesh::{
    CallContext, Chain, ChainElement, ClientConnection, ClientConnectionTable, Connection,
    ConnectionId, ConnectionState, EndpointConnector, EndpointRegistry, ErrorKind,
    ForwarderRegistry, ManagerName, MechanismRegistry, MeshConfig, MeshError, MonitorEvent,
    MonitorPublisher, NetworkService, NetworkServiceRequest, PluginChain, RequestScope,
    ScopeSelector, Signer,
};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    ConnectionStage, CrossConnectStage, EndpointRequestStage, EndpointSelectorStage,
    ForwarderStage, MonitorStage, RequestValidator,
};

/// Result of [`NetworkServiceManager::heal`].
#[derive(Debug, Clone, PartialEq)]
pub enum HealOutcome {
    /// The connection was re-established.
    Healed(Connection),
    /// Healing is disabled; the connection was closed instead.
    Closed,
}

/// Request/Close pipeline of one manager.
pub struct NetworkServiceManager {
    config: MeshConfig,
    manager: ManagerName,
    table: Arc<ClientConnectionTable>,
    monitor: Option<Arc<MonitorPublisher>>,
    chain: Chain,
}

impl std::fmt::Debug for NetworkServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServiceManager")
            .field("manager", &self.manager)
            .field("chain", &self.chain)
            .field("connections", &self.table.len())
            .finish()
    }
}

impl NetworkServiceManager {
    pub fn builder(config: MeshConfig) -> NetworkServiceManagerBuilder {
        NetworkServiceManagerBuilder::new(config)
    }

    pub fn name(&self) -> &ManagerName {
        &self.manager
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Establishes or heals a connection.
    pub async fn request(
        &self,
        ctx: &CallContext,
        request: NetworkServiceRequest,
    ) -> Result<Connection, MeshError> {
        let span = tracing::info_span!(
            "request",
            manager = %self.manager,
            network_service = %request.connection.network_service,
            connection_id = %request.connection.id,
        );
        let mut scope = RequestScope::new(*ctx, span.clone());
        let result = self.chain.request(&mut scope, request).instrument(span).await;
        if let Err(e) = &result {
            tracing::warn!(manager = %self.manager, error = %e, kind = ?e.kind(), "request failed");
        }
        result
    }

    /// Tears a connection down. The record is removed even if a downstream
    /// step fails; that failure is still returned.
    pub async fn close(&self, ctx: &CallContext, connection: &Connection) -> Result<(), MeshError> {
        let span = tracing::info_span!(
            "close",
            manager = %self.manager,
            connection_id = %connection.id,
        );
        let mut scope = RequestScope::new(*ctx, span.clone());
        self.chain
            .close(&mut scope, connection.clone())
            .instrument(span)
            .await
    }

    /// Re-requests an established connection whose destination failed.
    ///
    /// The stored request is replayed up to `heal_retry_count` times, each
    /// attempt bounded by `heal_dst_wait_timeout`. A heal that gives up leaves
    /// the record `Broken`. With healing disabled the connection is closed.
    pub async fn heal(&self, id: &ConnectionId) -> Result<HealOutcome, MeshError> {
        let record = self
            .table
            .get(id)
            .ok_or_else(|| MeshError::no_such_connection(id.as_str()))?;
        let connection = record
            .source()
            .cloned()
            .unwrap_or_else(|| record.request.connection.clone());

        if !self.config.heal_enabled {
            tracing::info!(connection_id = %id, "heal disabled, closing connection");
            self.close(&CallContext::with_timeout(self.config.close_timeout), &connection)
                .await?;
            return Ok(HealOutcome::Closed);
        }

        let marked = self.table.modify(id, |record| {
            if let Some(cross_connect) = record.cross_connect.as_mut() {
                cross_connect.destination.state = ConnectionState::Down;
            }
        });
        if !marked {
            return Err(MeshError::state_conflict(
                id.as_str(),
                "heal rejected while another operation is in progress",
            ));
        }

        let request = NetworkServiceRequest::new(
            connection,
            record.request.mechanism_preferences.clone(),
        );
        let attempts = self.config.heal_retry_count.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let ctx = CallContext::with_timeout(self.config.heal_dst_wait_timeout);
            match self.request(&ctx, request.clone()).await {
                Ok(connection) => {
                    tracing::info!(connection_id = %id, attempt, "connection healed");
                    return Ok(HealOutcome::Healed(connection));
                }
                Err(e) if matches!(
                    e.kind(),
                    ErrorKind::StateConflict | ErrorKind::NotFound | ErrorKind::Validation
                ) =>
                {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(connection_id = %id, attempt, attempts, error = %e, "heal attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.heal_retry_delay).await;
            }
        }
        self.table.mark_broken(id);
        Err(last_error.unwrap_or_else(|| MeshError::transport("heal was never attempted")))
    }

    /// Snapshots of every record, ordered by id.
    pub fn connections(&self) -> Vec<ClientConnection> {
        self.table.snapshot()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<ClientConnection> {
        self.table.get(id)
    }

    /// Subscribes to connection events.
    pub fn subscribe(
        &self,
        selector: ScopeSelector,
    ) -> Result<mpsc::UnboundedReceiver<MonitorEvent>, MeshError> {
        self.monitor
            .as_ref()
            .map(|m| m.subscribe(selector))
            .ok_or_else(|| MeshError::configuration("no monitor configured"))
    }
}

#[async_trait]
impl NetworkService for NetworkServiceManager {
    async fn request(
        &self,
        ctx: &CallContext,
        request: NetworkServiceRequest,
    ) -> Result<Connection, MeshError> {
        NetworkServiceManager::request(self, ctx, request).await
    }

    async fn close(&self, ctx: &CallContext, connection: &Connection) -> Result<(), MeshError> {
        NetworkServiceManager::close(self, ctx, connection).await
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`NetworkServiceManager`] from its collaborators.
pub struct NetworkServiceManagerBuilder {
    config: MeshConfig,
    forwarders: Option<Arc<dyn ForwarderRegistry>>,
    endpoints: Option<Arc<dyn EndpointRegistry>>,
    connector: Option<Arc<dyn EndpointConnector>>,
    signer: Option<Arc<dyn Signer>>,
    monitor: Option<Arc<MonitorPublisher>>,
    mechanisms: MechanismRegistry,
    plugins: PluginChain,
}

impl NetworkServiceManagerBuilder {
    fn new(config: MeshConfig) -> Self {
        Self {
            config,
            forwarders: None,
            endpoints: None,
            connector: None,
            signer: None,
            monitor: Some(Arc::new(MonitorPublisher::new())),
            mechanisms: MechanismRegistry::default(),
            plugins: PluginChain::default(),
        }
    }

    #[must_use]
    pub fn forwarders(mut self, forwarders: Arc<dyn ForwarderRegistry>) -> Self {
        self.forwarders = Some(forwarders);
        self
    }

    #[must_use]
    pub fn endpoints(mut self, endpoints: Arc<dyn EndpointRegistry>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn EndpointConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Replaces the default publisher; `None` runs without a monitor.
    #[must_use]
    pub fn monitor(mut self, monitor: Option<Arc<MonitorPublisher>>) -> Self {
        self.monitor = monitor;
        self
    }

    #[must_use]
    pub fn mechanisms(mut self, mechanisms: MechanismRegistry) -> Self {
        self.mechanisms = mechanisms;
        self
    }

    #[must_use]
    pub fn plugins(mut self, plugins: PluginChain) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn build(self) -> Result<NetworkServiceManager, MeshError> {
        self.config.validate()?;
        let manager = self.config.manager()?;
        let missing = |what: &str| MeshError::configuration(format!("{what} is required"));
        let forwarders = self.forwarders.ok_or_else(|| missing("forwarder registry"))?;
        let endpoints = self.endpoints.ok_or_else(|| missing("endpoint registry"))?;
        let connector = self.connector.ok_or_else(|| missing("endpoint connector"))?;
        let table = Arc::new(ClientConnectionTable::new());

        let elements: Vec<Arc<dyn ChainElement>> = vec![
            Arc::new(RequestValidator::new(self.mechanisms.clone())),
            Arc::new(MonitorStage::new(self.monitor.clone())),
            Arc::new(ConnectionStage::new(
                manager.clone(),
                table.clone(),
                self.signer,
            )),
            Arc::new(ForwarderStage::new(
                self.config.clone(),
                forwarders,
                self.mechanisms.clone(),
            )),
            Arc::new(EndpointSelectorStage::new(
                self.config.clone(),
                manager.clone(),
                endpoints,
                self.mechanisms.clone(),
                self.plugins.clone(),
            )),
            Arc::new(EndpointRequestStage::new(
                self.config.clone(),
                manager.clone(),
                connector,
                self.mechanisms,
                self.plugins,
            )),
            Arc::new(CrossConnectStage),
        ];
        tracing::info!(manager = %manager, elements = elements.len(), "network service manager assembled");
        let chain = Chain::new(manager.as_str(), elements)
            .with_failure_close_timeout(self.config.error_close_timeout);
        Ok(NetworkServiceManager {
            config: self.config,
            chain,
            manager,
            table,
            monitor: self.monitor,
        })
    }
}
