//! Endpoint selection with per-call exclusion and the heal fast path.
//!
//! One candidate is tried per forward step. When anything deeper fails, the
//! candidate is excluded and the chain re-runs this stage, until the
//! registry has nothing left or the call deadline passes.

use std::sync::Arc;

use async_trait::async_trait;
use mesh::mechanism::find_mechanism;
use mesh::{
    ChainElement, ClientConnection, ClientConnectionState, Connection, ConnectionState,
    Downstream, EndpointRegistry, ErrorKind, Flow, Forwarder, ManagerName, MechanismRegistry,
    MeshConfig, MeshError, NetworkServiceRequest, PluginChain, Recovery, RequestScope,
};

/// Chooses the endpoint that will serve the request.
pub struct EndpointSelectorStage {
    config: MeshConfig,
    manager: ManagerName,
    endpoints: Arc<dyn EndpointRegistry>,
    mechanisms: MechanismRegistry,
    plugins: PluginChain,
}

impl std::fmt::Debug for EndpointSelectorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSelectorStage")
            .field("manager", &self.manager)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

impl EndpointSelectorStage {
    pub fn new(
        config: MeshConfig,
        manager: ManagerName,
        endpoints: Arc<dyn EndpointRegistry>,
        mechanisms: MechanismRegistry,
        plugins: PluginChain,
    ) -> Self {
        Self {
            config,
            manager,
            endpoints,
            mechanisms,
            plugins,
        }
    }

    /// `true` if the heal cannot reuse the established destination.
    fn needs_reselection(
        &self,
        record: &ClientConnection,
        request: &NetworkServiceRequest,
        forwarder: Option<&Forwarder>,
    ) -> bool {
        let Some(source) = record.source() else {
            return true;
        };
        if source.context != request.connection.context {
            tracing::info!("connection context changed, endpoint request required");
            return true;
        }
        let Some(destination) = record.destination() else {
            return true;
        };
        if destination.state == ConnectionState::Down {
            return true;
        }
        if !destination.is_remote() {
            return false;
        }
        let (Some(negotiated), Some(forwarder)) = (&destination.mechanism, forwarder) else {
            return true;
        };
        match find_mechanism(&forwarder.remote_mechanisms, &negotiated.mechanism_type) {
            Some(advertised) if self.mechanisms.is_stale(negotiated, advertised) => {
                tracing::info!(
                    mechanism = %negotiated.mechanism_type,
                    "forwarder advertisement changed, endpoint request required"
                );
                true
            }
            _ => false,
        }
    }

    /// Reuses the established destination: refreshes the cross connect and
    /// answers with the destination's context. A destination whose context no
    /// longer fits the connection is closed.
    async fn heal_in_place(
        &self,
        scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        downstream: Downstream<'_>,
    ) -> Result<Flow, MeshError> {
        let mut cross_connect = scope
            .client_connection()?
            .cross_connect
            .clone()
            .ok_or_else(|| MeshError::invariant("healing connection has no cross connect"))?;
        if let Err(e) = request
            .connection
            .update_context(cross_connect.destination.context.clone(), &self.mechanisms)
        {
            tracing::warn!(
                connection_id = %request.connection.id,
                error = %e,
                "destination context rejected, closing destination"
            );
            if let Err(close_error) = downstream
                .close_detached(scope, cross_connect.source.clone(), self.config.error_close_timeout)
                .await
            {
                tracing::warn!(error = %close_error, "closing rejected destination failed");
            }
            return Err(e);
        }
        cross_connect.source = request.connection.clone();
        cross_connect.destination.state = ConnectionState::Up;
        let record = scope.client_connection_mut()?;
        let endpoint = record.endpoint.clone();
        record.cross_connect = Some(cross_connect);
        scope.endpoint = endpoint;
        tracing::info!(connection_id = %request.connection.id, "healed without endpoint request");
        Ok(Flow::Respond(request.connection.clone()))
    }

    async fn close_previous(&self, scope: &mut RequestScope, downstream: Downstream<'_>) {
        let Some(previous) = scope
            .client_connection
            .as_ref()
            .and_then(|r| r.source().cloned())
        else {
            return;
        };
        if let Err(e) = downstream.close(scope, previous).await {
            tracing::warn!(error = %e, "closing previous network service failed");
        }
        if let Some(record) = scope.client_connection.as_mut() {
            record.endpoint = None;
            record.remote_manager = None;
            if let Some(cross_connect) = record.cross_connect.as_mut() {
                cross_connect.destination.id.clear();
            }
        }
    }
}

#[async_trait]
impl ChainElement for EndpointSelectorStage {
    fn name(&self) -> &'static str {
        "endpoint_selector"
    }

    async fn request(
        &self,
        scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        downstream: Downstream<'_>,
    ) -> Result<Flow, MeshError> {
        let record = scope.client_connection()?.clone();
        let healing = record.state == ClientConnectionState::Healing;
        if healing && scope.excluded_endpoints.is_empty() {
            if record.network_service() != request.connection.network_service {
                tracing::info!(
                    from = record.network_service(),
                    to = %request.connection.network_service,
                    "network service changed, closing previous connection"
                );
                self.close_previous(scope, downstream).await;
            } else if self.config.heal_enabled
                && !self.needs_reselection(&record, request, scope.forwarder.as_ref())
            {
                return self.heal_in_place(scope, request, downstream).await;
            }
        }

        scope.call.check("selecting an endpoint")?;
        let bound = scope
            .client_connection()?
            .endpoint
            .clone()
            .filter(|e| healing && !scope.excluded_endpoints.contains(&e.name));
        let endpoint = match bound {
            Some(endpoint) => endpoint,
            None => self
                .endpoints
                .get_candidate(&request.connection, &scope.excluded_endpoints)
                .await
                .map_err(|e| e.combine(scope.last_endpoint_error.take()))?,
        };
        self.plugins.enrich(&mut request.connection.context)?;
        tracing::info!(
            endpoint = %endpoint.name,
            manager = %endpoint.manager,
            excluded = scope.excluded_endpoints.len(),
            "endpoint candidate selected"
        );
        scope.endpoint = Some(endpoint);
        Ok(Flow::Continue)
    }

    async fn commit(
        &self,
        scope: &mut RequestScope,
        _request: &NetworkServiceRequest,
        _connection: &mut Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        let endpoint = scope.endpoint.clone();
        let record = scope.client_connection_mut()?;
        record.remote_manager = endpoint
            .as_ref()
            .filter(|e| e.manager != self.manager)
            .map(|e| e.manager.clone());
        record.endpoint = endpoint;
        Ok(())
    }

    async fn compensate(
        &self,
        scope: &mut RequestScope,
        _request: &NetworkServiceRequest,
        error: &MeshError,
        _downstream: Downstream<'_>,
    ) -> Recovery {
        if error.kind() == ErrorKind::Timeout || scope.call.is_expired() {
            return Recovery::Propagate;
        }
        let Some(endpoint) = scope.endpoint.take() else {
            return Recovery::Propagate;
        };
        tracing::warn!(endpoint = %endpoint.name, %error, "endpoint failed, trying next candidate");
        scope.excluded_endpoints.insert(endpoint.name);
        scope.last_endpoint_error = Some(error.clone());
        Recovery::Retry
    }
}
