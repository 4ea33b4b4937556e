//! Client connection bookkeeping: admission, promotion to `Ready`, removal.

use std::sync::Arc;

use async_trait::async_trait;
use mesh::{
    ChainElement, ClientConnectionTable, Connection, ConnectionId, ConnectionState, Downstream,
    Flow, ManagerName, MeshError, NetworkServiceRequest, Recovery, RequestScope, Signer,
};

/// Owns the [`ClientConnectionTable`] side of every call.
pub struct ConnectionStage {
    manager: ManagerName,
    table: Arc<ClientConnectionTable>,
    signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for ConnectionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStage")
            .field("manager", &self.manager)
            .field("signing", &self.signer.is_some())
            .finish()
    }
}

impl ConnectionStage {
    pub fn new(
        manager: ManagerName,
        table: Arc<ClientConnectionTable>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Self {
        Self {
            manager,
            table,
            signer,
        }
    }

    fn id_of(connection: &Connection) -> Result<ConnectionId, MeshError> {
        ConnectionId::new(connection.id.as_str())
            .ok_or_else(|| MeshError::validation("connection id cannot be empty"))
    }

    fn sign(&self, connection: &mut Connection) -> Result<(), MeshError> {
        let Some(signer) = &self.signer else {
            return Ok(());
        };
        let token = signer.sign(connection)?;
        if let Some(segment) = connection.path.current_mut() {
            segment.token = token.clone();
        }
        connection.signature = Some(token);
        Ok(())
    }
}

#[async_trait]
impl ChainElement for ConnectionStage {
    fn name(&self) -> &'static str {
        "connection"
    }

    async fn request(
        &self,
        scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        _downstream: Downstream<'_>,
    ) -> Result<Flow, MeshError> {
        if let (Some(signer), Some(signature)) = (&self.signer, &request.connection.signature) {
            signer
                .verify(signature)
                .map_err(|e| MeshError::validation(format!("signature rejected: {e}")))?;
        }

        let connection = &mut request.connection;
        if connection.id.is_empty() || connection.id == ConnectionId::REMOTE_ASSIGNED {
            connection.id = ConnectionId::generate().to_string();
        }
        let id = Self::id_of(connection)?;
        connection.path.extend(self.manager.as_str(), id.as_str());

        let record = self.table.begin_request(&id, request)?;
        tracing::info!(connection_id = %id, state = ?record.state, "client connection admitted");
        scope.client_connection = Some(record);
        Ok(Flow::Continue)
    }

    async fn commit(
        &self,
        scope: &mut RequestScope,
        request: &NetworkServiceRequest,
        connection: &mut Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        connection.state = ConnectionState::Up;
        if let Err(e) = self.sign(connection) {
            if let Some(id) = connection.connection_id() {
                self.table.abandon(&id);
            }
            return Err(e.with_context("signing connection"));
        }

        let record = scope.client_connection_mut()?;
        record.request = NetworkServiceRequest::new(
            connection.clone(),
            request.mechanism_preferences.clone(),
        );
        if let Some(cross_connect) = record.cross_connect.as_mut() {
            cross_connect.source = connection.clone();
        }
        let stored = self.table.complete(record.clone());
        tracing::info!(connection_id = %stored.id, "client connection ready");
        scope.client_connection = Some(stored);
        Ok(())
    }

    async fn compensate(
        &self,
        _scope: &mut RequestScope,
        request: &NetworkServiceRequest,
        error: &MeshError,
        _downstream: Downstream<'_>,
    ) -> Recovery {
        if let Some(id) = request.connection.connection_id() {
            let remaining = self.table.abandon(&id);
            tracing::warn!(connection_id = %id, ?remaining, %error, "request failed");
        }
        Recovery::Propagate
    }

    async fn admit_close(
        &self,
        scope: &mut RequestScope,
        connection: &mut Connection,
    ) -> Result<(), MeshError> {
        let id = Self::id_of(connection)?;
        let record = self.table.begin_close(&id)?;
        if let Some(source) = record.source() {
            *connection = source.clone();
        }
        scope.client_connection = Some(record);
        Ok(())
    }

    async fn finish_close(
        &self,
        _scope: &mut RequestScope,
        connection: &Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        if let Some(id) = connection.connection_id() {
            self.table.remove(&id);
            tracing::info!(connection_id = %id, "client connection removed");
        }
        Ok(())
    }
}
