//! Pairs the client-facing and endpoint-facing legs.

use async_trait::async_trait;
use mesh::{
    ChainElement, CrossConnect, Downstream, Flow, MeshError, NetworkServiceRequest, RequestScope,
};

/// Last element of the request chain: records the cross connect the
/// forwarder stage will program.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossConnectStage;

#[async_trait]
impl ChainElement for CrossConnectStage {
    fn name(&self) -> &'static str {
        "cross_connect"
    }

    async fn request(
        &self,
        scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        _downstream: Downstream<'_>,
    ) -> Result<Flow, MeshError> {
        let destination = scope
            .endpoint_connection
            .clone()
            .ok_or_else(|| MeshError::invariant("no destination connection to cross connect"))?;
        let payload = scope
            .endpoint
            .as_ref()
            .map(|e| e.payload.clone())
            .ok_or_else(|| MeshError::invariant("no endpoint selected"))?;
        let cross_connect = CrossConnect::new(payload, request.connection.clone(), destination);
        scope.client_connection_mut()?.cross_connect = Some(cross_connect);
        Ok(Flow::Continue)
    }
}
