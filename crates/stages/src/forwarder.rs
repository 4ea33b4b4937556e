//! Forwarder selection, mechanism negotiation, and cross connect programming.
//!
//! ## Phases
//!
//! - **Request**: wait for a forwarder, pick one that serves the client's
//!   preferences, negotiate the mechanism of the client-facing leg.
//! - **Commit**: program the cross connect assembled by the deeper stages,
//!   retrying transport failures with a fixed delay. On failure, remove the
//!   cross connect from the forwarder and return the original error; the
//!   chain then closes everything downstream on a detached deadline.
//! - **Finish close**: release the programmed cross connect, once.

use std::sync::Arc;

use async_trait::async_trait;
use mesh::{
    CallContext, ChainElement, Connection, CrossConnect, Downstream, Flow, Forwarder,
    ForwarderClient, ForwarderRegistry, ForwarderState, Mechanism, MechanismClass,
    MechanismRegistry, MechanismSelector, MeshConfig, MeshError, NetworkServiceRequest,
    RequestScope, RetryPolicy,
};
use tracing::Instrument;

/// Mechanisms a forwarder offers for `class`.
pub(crate) fn advertised(forwarder: &Forwarder, class: MechanismClass) -> &[Mechanism] {
    match class {
        MechanismClass::Local => &forwarder.local_mechanisms,
        MechanismClass::Remote => &forwarder.remote_mechanisms,
    }
}

/// Programs the local dataplane.
pub struct ForwarderStage {
    config: MeshConfig,
    forwarders: Arc<dyn ForwarderRegistry>,
    mechanisms: MechanismRegistry,
    selector: MechanismSelector,
}

impl std::fmt::Debug for ForwarderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderStage")
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl ForwarderStage {
    pub fn new(
        config: MeshConfig,
        forwarders: Arc<dyn ForwarderRegistry>,
        mechanisms: MechanismRegistry,
    ) -> Self {
        let selector = MechanismSelector::new(mechanisms.clone(), config.preferred_mechanism.clone());
        Self {
            config,
            forwarders,
            mechanisms,
            selector,
        }
    }

    /// Prefers the forwarder already bound to the connection, if it can still
    /// serve the preferences.
    fn choose(
        &self,
        scope: &RequestScope,
        request: &NetworkServiceRequest,
        class: MechanismClass,
    ) -> Option<Forwarder> {
        let serves = |f: &Forwarder| {
            self.selector
                .can_serve(&request.mechanism_preferences, advertised(f, class))
        };
        let previous = scope
            .client_connection
            .as_ref()
            .and_then(|cc| cc.forwarder_name.as_ref())
            .and_then(|name| self.forwarders.get(name))
            .filter(|f| serves(f));
        previous.or_else(|| self.forwarders.select(&serves))
    }

    async fn program(
        &self,
        call: &CallContext,
        client: &Arc<dyn ForwarderClient>,
        cross_connect: &CrossConnect,
    ) -> Result<CrossConnect, MeshError> {
        let attempts = self.config.forwarder_retry_count.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            call.check("programming forwarder")?;
            let attempt_ctx = call.child(self.config.forwarder_timeout);
            let timeout = call.bounded(self.config.forwarder_timeout);
            let span = tracing::info_span!("program_attempt", attempt);
            let outcome = tokio::time::timeout(
                timeout,
                client.request(&attempt_ctx, cross_connect.clone()),
            )
            .instrument(span)
            .await;
            let error = match outcome {
                Ok(Ok(programmed)) => {
                    tracing::info!(attempt, connection_id = %cross_connect.id, "cross connect programmed");
                    return Ok(programmed);
                }
                Ok(Err(e)) => e,
                Err(_) => MeshError::transport(format!("forwarder attempt {attempt} timed out after {timeout:?}")),
            };
            tracing::warn!(attempt, attempts, error = %error, "forwarder programming failed");
            if error.retry_policy() == RetryPolicy::NonRetryable {
                return Err(error);
            }
            last_error = Some(error);
            if attempt < attempts {
                tokio::time::sleep(call.bounded(self.config.forwarder_retry_delay)).await;
            }
        }
        Err(last_error.unwrap_or_else(|| MeshError::transport("forwarder was never attempted")))
    }

    /// Best-effort removal of a cross connect that failed to program. Errors
    /// are logged.
    async fn failure_close(&self, client: &Arc<dyn ForwarderClient>, cross_connect: &CrossConnect) {
        let timeout = self.config.error_close_timeout;
        let ctx = CallContext::with_timeout(timeout);
        match tokio::time::timeout(timeout, client.close(&ctx, cross_connect)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failure close: forwarder close failed"),
            Err(_) => tracing::warn!("failure close: forwarder close timed out"),
        }
    }

    async fn release(
        &self,
        call: &CallContext,
        forwarder: &Forwarder,
        cross_connect: &CrossConnect,
    ) -> Result<(), MeshError> {
        let client = self.forwarders.connect(forwarder).await?;
        let ctx = call.child(self.config.close_timeout);
        match tokio::time::timeout(self.config.close_timeout, client.close(&ctx, cross_connect)).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::transport("forwarder close timed out")),
        }
    }
}

#[async_trait]
impl ChainElement for ForwarderStage {
    fn name(&self) -> &'static str {
        "forwarder"
    }

    async fn request(
        &self,
        scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        _downstream: Downstream<'_>,
    ) -> Result<Flow, MeshError> {
        self.forwarders
            .wait_for_available(scope.call.bounded(self.config.forwarder_wait_timeout))
            .await?;
        let class = request.mechanism_class()?;
        let forwarder = self.choose(scope, request, class).ok_or_else(|| {
            MeshError::selection(format!(
                "no forwarder offers any of the requested {class} mechanisms"
            ))
        })?;
        let mechanism = self.selector.select(
            &request.mechanism_preferences,
            advertised(&forwarder, class),
            &request.connection.id,
        )?;
        tracing::info!(
            forwarder = %forwarder.name,
            mechanism = %mechanism.mechanism_type,
            "forwarder selected"
        );
        request.connection.mechanism = Some(mechanism);
        scope.forwarder = Some(forwarder);
        Ok(Flow::Continue)
    }

    async fn commit(
        &self,
        scope: &mut RequestScope,
        _request: &NetworkServiceRequest,
        connection: &mut Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        let forwarder = scope
            .forwarder
            .clone()
            .ok_or_else(|| MeshError::invariant("no forwarder selected"))?;
        let mut cross_connect = scope
            .client_connection()?
            .cross_connect
            .clone()
            .ok_or_else(|| MeshError::invariant("no cross connect to program"))?;
        cross_connect.source = connection.clone();

        let client = self
            .forwarders
            .connect(&forwarder)
            .await
            .map_err(|e| e.with_context("forwarder"))?;

        let programmed = match self.program(&scope.call, &client, &cross_connect).await {
            Ok(programmed) => programmed,
            Err(e) => {
                self.failure_close(&client, &cross_connect).await;
                return Err(e.with_context("forwarder"));
            }
        };

        if let Err(e) = connection.update_context(programmed.source.context.clone(), &self.mechanisms) {
            self.failure_close(&client, &programmed).await;
            return Err(e.with_context("forwarder context"));
        }
        if connection.context.ethernet.is_none() {
            connection.context.ethernet = programmed.destination.context.ethernet.clone();
        }

        let mut programmed = programmed;
        programmed.source = connection.clone();
        let record = scope.client_connection_mut()?;
        record.cross_connect = Some(programmed);
        record.forwarder_name = Some(forwarder.name.clone());
        record.forwarder_state = ForwarderState::Ready;
        Ok(())
    }

    async fn finish_close(
        &self,
        scope: &mut RequestScope,
        _connection: &Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        let Some(record) = scope.client_connection.as_mut() else {
            return Ok(());
        };
        if record.forwarder_state == ForwarderState::None {
            return Ok(());
        }
        let (name, cross_connect) = match (&record.forwarder_name, &record.cross_connect) {
            (Some(name), Some(cross_connect)) => (name.clone(), cross_connect.clone()),
            _ => {
                record.forwarder_state = ForwarderState::None;
                return Ok(());
            }
        };
        let forwarder = self.forwarders.get(&name).ok_or_else(|| {
            MeshError::transport(format!("forwarder {name} is no longer registered"))
        })?;
        let result = self.release(&scope.call, &forwarder, &cross_connect).await;
        record.forwarder_state = ForwarderState::None;
        result.map_err(|e| e.with_context("forwarder close"))
    }
}
