//! Builds and sends the request to the selected endpoint or peer manager.

use std::sync::Arc;

use async_trait::async_trait;
use mesh::mechanism::workspace;
use mesh::{
    CallContext, ChainElement, ClientConnectionState, Connection, ConnectionId, ConnectionScope,
    Downstream, EndpointConnector, EndpointRegistration, Flow, ManagerName, MechanismClass,
    MechanismRegistry, MeshConfig, MeshError, NetworkService, NetworkServiceRequest, PluginChain,
    Recovery, RequestScope,
};

use crate::forwarder::advertised;

/// Requests the destination leg from the chosen endpoint.
pub struct EndpointRequestStage {
    config: MeshConfig,
    manager: ManagerName,
    connector: Arc<dyn EndpointConnector>,
    mechanisms: MechanismRegistry,
    plugins: PluginChain,
}

impl std::fmt::Debug for EndpointRequestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRequestStage")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl EndpointRequestStage {
    pub fn new(
        config: MeshConfig,
        manager: ManagerName,
        connector: Arc<dyn EndpointConnector>,
        mechanisms: MechanismRegistry,
        plugins: PluginChain,
    ) -> Self {
        Self {
            config,
            manager,
            connector,
            mechanisms,
            plugins,
        }
    }

    fn is_local(&self, endpoint: &EndpointRegistration) -> bool {
        endpoint.manager == self.manager
    }

    /// Destination leg for `endpoint`. A heal against the same endpoint keeps
    /// the previous destination identity so the endpoint can correlate it.
    fn destination_request(
        &self,
        scope: &RequestScope,
        request: &NetworkServiceRequest,
        endpoint: &EndpointRegistration,
    ) -> Result<NetworkServiceRequest, MeshError> {
        let record = scope.client_connection()?;
        let forwarder = scope
            .forwarder
            .as_ref()
            .ok_or_else(|| MeshError::invariant("no forwarder selected"))?;
        let local = self.is_local(endpoint);

        let previous = (record.state == ClientConnectionState::Healing)
            .then(|| record.destination())
            .flatten()
            .filter(|_| record.endpoint.as_ref().is_some_and(|e| e.name == endpoint.name))
            .filter(|d| !d.id.is_empty() && d.id != ConnectionId::REMOTE_ASSIGNED);

        let mut destination = Connection::new(request.connection.network_service.clone());
        match previous {
            Some(previous) => {
                destination.id = previous.id.clone();
                destination.network_service = previous.network_service.clone();
                destination.context = previous.context.clone();
                destination.labels = previous.labels.clone();
            }
            None => {
                destination.id = if local {
                    ConnectionId::generate().to_string()
                } else {
                    ConnectionId::REMOTE_ASSIGNED.to_string()
                };
                destination.context = request.connection.context.clone();
                destination.labels = request.connection.labels.clone();
            }
        }
        destination.path = request.connection.path.clone();

        let class = if local {
            MechanismClass::Local
        } else {
            destination.scope = ConnectionScope::Remote {
                source_manager: self.manager.clone(),
                destination_manager: endpoint.manager.clone(),
                endpoint_name: Some(endpoint.name.clone()),
            };
            MechanismClass::Remote
        };
        Ok(NetworkServiceRequest::new(
            destination,
            advertised(forwarder, class).to_vec(),
        ))
    }

    async fn send(
        &self,
        call: &CallContext,
        service: &Arc<dyn NetworkService>,
        request: NetworkServiceRequest,
    ) -> Result<Connection, MeshError> {
        let response = match call.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, service.request(call, request))
                .await
                .map_err(|_| MeshError::timeout("endpoint request exceeded the call deadline"))?,
            None => service.request(call, request).await,
        };
        response.map_err(|e| e.with_context("endpoint request"))
    }

    fn accept(&self, response: &Connection) -> Result<(), MeshError> {
        response
            .is_complete(&self.mechanisms)
            .map_err(|e| e.with_context("endpoint response"))?;
        self.plugins
            .validate(response)
            .map_err(|e| MeshError::invariant(e.to_string()))
    }

    async fn close_endpoint(
        &self,
        endpoint: &EndpointRegistration,
        destination: &Connection,
    ) -> Result<(), MeshError> {
        let service = self.connector.connect(endpoint).await?;
        let ctx = CallContext::with_timeout(self.config.close_timeout);
        match tokio::time::timeout(self.config.close_timeout, service.close(&ctx, destination)).await
        {
            Ok(result) => result,
            Err(_) => Err(MeshError::transport(format!(
                "closing endpoint {} timed out",
                endpoint.name
            ))),
        }
    }
}

#[async_trait]
impl ChainElement for EndpointRequestStage {
    fn name(&self) -> &'static str {
        "endpoint_request"
    }

    async fn request(
        &self,
        scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        _downstream: Downstream<'_>,
    ) -> Result<Flow, MeshError> {
        let endpoint = scope
            .endpoint
            .clone()
            .ok_or_else(|| MeshError::invariant("no endpoint selected"))?;
        let outbound = self.destination_request(scope, request, &endpoint)?;
        let service = self
            .connector
            .connect(&endpoint)
            .await
            .map_err(|e| e.with_context("endpoint connect"))?;
        tracing::debug!(
            endpoint = %endpoint.name,
            destination_id = %outbound.connection.id,
            remote = outbound.connection.is_remote(),
            "requesting destination"
        );
        let mut response = self.send(&scope.call, &service, outbound).await?;

        let merged = self.accept(&response).and_then(|()| {
            request
                .connection
                .update_context(response.context.clone(), &self.mechanisms)
        });
        if let Err(e) = merged {
            let ctx = CallContext::with_timeout(self.config.close_timeout);
            if let Err(close_error) = service.close(&ctx, &response).await {
                tracing::warn!(error = %close_error, "closing rejected destination failed");
            }
            return Err(e);
        }

        if self.is_local(&endpoint) {
            if let Some(mechanism) = response.mechanism.as_mut() {
                mechanism.set_parameter(
                    workspace::WORKSPACE,
                    endpoint.workspace.clone().unwrap_or_default(),
                );
                mechanism.set_parameter(workspace::WORKSPACE_NSE_NAME, endpoint.name.as_str());
            }
        }
        scope.endpoint_connection = Some(response);
        Ok(Flow::Continue)
    }

    async fn compensate(
        &self,
        scope: &mut RequestScope,
        _request: &NetworkServiceRequest,
        _error: &MeshError,
        _downstream: Downstream<'_>,
    ) -> Recovery {
        if let (Some(endpoint), Some(destination)) =
            (scope.endpoint.clone(), scope.endpoint_connection.take())
        {
            if let Err(e) = self.close_endpoint(&endpoint, &destination).await {
                tracing::warn!(endpoint = %endpoint.name, error = %e, "closing destination failed");
            }
        }
        Recovery::Propagate
    }

    async fn close(&self, scope: &mut RequestScope, _connection: &Connection) -> Result<(), MeshError> {
        let Some(record) = scope.client_connection.as_ref() else {
            return Ok(());
        };
        let (Some(endpoint), Some(destination)) = (&record.endpoint, record.destination()) else {
            return Ok(());
        };
        if destination.id.is_empty() {
            return Ok(());
        }
        self.close_endpoint(endpoint, destination)
            .await
            .map_err(|e| e.with_context("endpoint close"))
    }
}
