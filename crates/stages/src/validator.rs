//! Structural admission checks.

use async_trait::async_trait;
use mesh::{
    ChainElement, Connection, Downstream, Flow, MechanismRegistry, MeshError,
    NetworkServiceRequest, RequestScope,
};

/// Rejects malformed requests before any state is created.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    mechanisms: MechanismRegistry,
}

impl RequestValidator {
    pub fn new(mechanisms: MechanismRegistry) -> Self {
        Self { mechanisms }
    }

    /// Network service named, preferences present and of one class, every
    /// preference accepted by its type.
    pub fn validate(&self, request: &NetworkServiceRequest) -> Result<(), MeshError> {
        if request.connection.network_service.is_empty() {
            return Err(MeshError::validation(
                "request.connection.network_service cannot be empty",
            ));
        }
        request.mechanism_class()?;
        for preference in &request.mechanism_preferences {
            self.mechanisms
                .validate(preference)
                .map_err(|e| e.with_context("request.mechanism_preferences"))?;
        }
        request
            .connection
            .path
            .validate()
            .map_err(|e| e.with_context("request.connection.path"))
    }
}

#[async_trait]
impl ChainElement for RequestValidator {
    fn name(&self) -> &'static str {
        "validator"
    }

    async fn request(
        &self,
        _scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        _downstream: Downstream<'_>,
    ) -> Result<Flow, MeshError> {
        self.validate(request)?;
        Ok(Flow::Continue)
    }

    async fn admit_close(
        &self,
        _scope: &mut RequestScope,
        connection: &mut Connection,
    ) -> Result<(), MeshError> {
        if connection.id.is_empty() {
            return Err(MeshError::validation("close requires a connection id"));
        }
        Ok(())
    }
}
