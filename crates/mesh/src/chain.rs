//! Ordered chain runner with forward, commit, and compensate phases.
//!
//! A [`Chain`] is a list of [`ChainElement`]s executed by a plain loop.
//!
//! ## Request
//!
//! 1. **Forward.** Elements run in order. Each may rewrite the request and
//!    either continue or answer early with [`Flow::Respond`]. Reaching the end
//!    of the list answers with the request's connection.
//! 2. **Commit.** Entered elements run in reverse on the answer. Side effects
//!    that must only happen after everything deeper succeeded live here.
//! 3. **Compensate.** If a forward or commit step fails, the elements entered
//!    before it are compensated in reverse. An element may answer
//!    [`Recovery::Retry`]; the loop then restores that element's view of the
//!    request and resumes forward from it. The failing element itself is not
//!    compensated: it cleans up its own partial work before returning.
//!    When a commit step fails, the elements below it have already committed;
//!    they are closed on a detached deadline before compensation starts.
//!
//! ## Close
//!
//! 1. **Admit.** Elements may reject the close before any state is touched.
//!    The first rejection ends the call.
//! 2. **Close.** Every element runs in order; failures are collected.
//! 3. **Finish.** Every element runs in reverse; failures are collected.
//!
//! Collected close failures are returned through [`MeshError::aggregate`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::Instrument;

use crate::{
    ClientConnection, Connection, EndpointRegistration, ExclusionSet, Forwarder, MeshError,
    NetworkServiceRequest,
};

// ---------------------------------------------------------------------------
// Call context
// ---------------------------------------------------------------------------

/// Deadline of one external call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context without deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left, or `None` for unbounded contexts.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// `limit`, shortened to the time left.
    pub fn bounded(&self, limit: Duration) -> Duration {
        self.remaining().map_or(limit, |r| r.min(limit))
    }

    /// A child context that expires after `limit` or with this one,
    /// whichever comes first.
    #[must_use]
    pub fn child(&self, limit: Duration) -> Self {
        Self::with_timeout(self.bounded(limit))
    }

    /// Fails with [`MeshError::Timeout`] once the deadline has passed.
    pub fn check(&self, operation: &str) -> Result<(), MeshError> {
        if self.is_expired() {
            return Err(MeshError::timeout(format!(
                "deadline exceeded before {operation}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request scope
// ---------------------------------------------------------------------------

/// Per-call state threaded through every element.
#[derive(Debug)]
pub struct RequestScope {
    /// Deadline of the external call.
    pub call: CallContext,
    /// Working copy of the client connection record.
    pub client_connection: Option<ClientConnection>,
    /// Forwarder chosen for this call.
    pub forwarder: Option<Forwarder>,
    /// Endpoint candidate currently being tried.
    pub endpoint: Option<EndpointRegistration>,
    /// Connection returned by the endpoint (or peer manager).
    pub endpoint_connection: Option<Connection>,
    /// Endpoints that already failed during this call.
    pub excluded_endpoints: ExclusionSet,
    /// Failure of the last endpoint candidate.
    pub last_endpoint_error: Option<MeshError>,
    /// Span of the external call.
    pub span: tracing::Span,
}

impl RequestScope {
    pub fn new(call: CallContext, span: tracing::Span) -> Self {
        Self {
            call,
            client_connection: None,
            forwarder: None,
            endpoint: None,
            endpoint_connection: None,
            excluded_endpoints: ExclusionSet::default(),
            last_endpoint_error: None,
            span,
        }
    }

    /// Copy of this scope with a fresh deadline, for cleanup that must run
    /// even after the caller's deadline has passed.
    pub fn detached(&self, timeout: Duration) -> Self {
        let span = tracing::info_span!(parent: None, "failure_close");
        span.follows_from(&self.span);
        Self {
            call: CallContext::with_timeout(timeout),
            client_connection: self.client_connection.clone(),
            forwarder: self.forwarder.clone(),
            endpoint: self.endpoint.clone(),
            endpoint_connection: self.endpoint_connection.clone(),
            excluded_endpoints: ExclusionSet::default(),
            last_endpoint_error: None,
            span,
        }
    }

    /// The client connection record; stages below the connection stage
    /// rely on it.
    pub fn client_connection(&self) -> Result<&ClientConnection, MeshError> {
        self.client_connection
            .as_ref()
            .ok_or_else(|| MeshError::invariant("client connection missing from request scope"))
    }

    pub fn client_connection_mut(&mut self) -> Result<&mut ClientConnection, MeshError> {
        self.client_connection
            .as_mut()
            .ok_or_else(|| MeshError::invariant("client connection missing from request scope"))
    }
}

// ---------------------------------------------------------------------------
// Element contract
// ---------------------------------------------------------------------------

/// Result of an element's forward step.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Run the next element.
    Continue,
    /// Skip the remaining elements and answer with this connection.
    Respond(Connection),
}

/// Result of an element's compensation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Keep unwinding.
    Propagate,
    /// Run this element's forward step again.
    Retry,
}

/// One step of a chain. Every phase has a no-op default.
#[async_trait]
pub trait ChainElement: Send + Sync {
    /// Name used in spans and logs.
    fn name(&self) -> &'static str;

    /// Forward step of a Request.
    async fn request(
        &self,
        _scope: &mut RequestScope,
        _request: &mut NetworkServiceRequest,
        _downstream: Downstream<'_>,
    ) -> Result<Flow, MeshError> {
        Ok(Flow::Continue)
    }

    /// Reverse step of a successful Request.
    async fn commit(
        &self,
        _scope: &mut RequestScope,
        _request: &NetworkServiceRequest,
        _connection: &mut Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        Ok(())
    }

    /// Undo step after a deeper failure.
    async fn compensate(
        &self,
        _scope: &mut RequestScope,
        _request: &NetworkServiceRequest,
        _error: &MeshError,
        _downstream: Downstream<'_>,
    ) -> Recovery {
        Recovery::Propagate
    }

    /// Admission step of a Close; may replace the connection being closed.
    async fn admit_close(
        &self,
        _scope: &mut RequestScope,
        _connection: &mut Connection,
    ) -> Result<(), MeshError> {
        Ok(())
    }

    /// Forward step of a Close.
    async fn close(&self, _scope: &mut RequestScope, _connection: &Connection) -> Result<(), MeshError> {
        Ok(())
    }

    /// Reverse step of a Close.
    async fn finish_close(
        &self,
        _scope: &mut RequestScope,
        _connection: &Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        Ok(())
    }
}

type Elements = [Arc<dyn ChainElement>];

/// Handle on the elements after the current one.
#[derive(Clone, Copy)]
pub struct Downstream<'a> {
    chain: &'a str,
    elements: &'a Elements,
}

impl<'a> Downstream<'a> {
    /// Number of deeper elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Runs the Close protocol over the deeper elements.
    pub fn close<'s>(
        &'s self,
        scope: &'s mut RequestScope,
        connection: Connection,
    ) -> Pin<Box<dyn Future<Output = Result<(), MeshError>> + Send + 's>> {
        Box::pin(run_close(self.chain, self.elements, scope, connection))
    }

    /// Runs the Close protocol over the deeper elements on a detached scope
    /// with its own `timeout`, independent of the caller's deadline.
    pub async fn close_detached(
        &self,
        scope: &RequestScope,
        connection: Connection,
        timeout: Duration,
    ) -> Result<(), MeshError> {
        let mut detached = scope.detached(timeout);
        let span = detached.span.clone();
        self.close(&mut detached, connection).instrument(span).await
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

struct Entered {
    index: usize,
    snapshot: NetworkServiceRequest,
}

/// Deadline of the close issued after a failed commit, unless configured.
pub const DEFAULT_FAILURE_CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// An ordered list of elements.
pub struct Chain {
    name: String,
    elements: Vec<Arc<dyn ChainElement>>,
    failure_close_timeout: Duration,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field(
                "elements",
                &self.elements.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field("failure_close_timeout", &self.failure_close_timeout)
            .finish()
    }
}

fn element_span(chain: &str, element: &dyn ChainElement, phase: &'static str, id: &str) -> tracing::Span {
    tracing::info_span!(
        "chain_element",
        chain = %chain,
        element = element.name(),
        phase,
        connection_id = %id,
    )
}

impl Chain {
    pub fn new(name: impl Into<String>, elements: Vec<Arc<dyn ChainElement>>) -> Self {
        Self {
            name: name.into(),
            elements,
            failure_close_timeout: DEFAULT_FAILURE_CLOSE_TIMEOUT,
        }
    }

    /// Deadline of the cleanup close that follows a failed commit.
    #[must_use]
    pub fn with_failure_close_timeout(mut self, timeout: Duration) -> Self {
        self.failure_close_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn downstream(&self, index: usize) -> Downstream<'_> {
        Downstream {
            chain: &self.name,
            elements: self.elements.get(index + 1..).unwrap_or_default(),
        }
    }

    /// Runs a Request through the chain.
    pub async fn request(
        &self,
        scope: &mut RequestScope,
        request: NetworkServiceRequest,
    ) -> Result<Connection, MeshError> {
        let mut request = request;
        let mut entered = Vec::with_capacity(self.elements.len());
        let mut cursor = 0;
        loop {
            let error = match self.forward(scope, &mut request, &mut entered, cursor).await {
                Ok(mut connection) => {
                    match self.commit(scope, &request, &mut connection, &mut entered).await {
                        Ok(()) => return Ok(connection),
                        Err(error) => error,
                    }
                }
                Err(error) => error,
            };
            match self.compensate(scope, &mut request, &mut entered, &error).await {
                Some(resume) => cursor = resume,
                None => return Err(error),
            }
        }
    }

    async fn forward(
        &self,
        scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        entered: &mut Vec<Entered>,
        from: usize,
    ) -> Result<Connection, MeshError> {
        for (index, element) in self.elements.iter().enumerate().skip(from) {
            let snapshot = request.clone();
            let span = element_span(&self.name, element.as_ref(), "request", &request.connection.id);
            let flow = element
                .request(scope, request, self.downstream(index))
                .instrument(span)
                .await?;
            entered.push(Entered { index, snapshot });
            if let Flow::Respond(connection) = flow {
                tracing::debug!(chain = %self.name, element = element.name(), "answered early");
                return Ok(connection);
            }
        }
        Ok(request.connection.clone())
    }

    async fn commit(
        &self,
        scope: &mut RequestScope,
        request: &NetworkServiceRequest,
        connection: &mut Connection,
        entered: &mut Vec<Entered>,
    ) -> Result<(), MeshError> {
        while let Some(Entered { index, .. }) = entered.pop() {
            let element = &self.elements[index];
            let span = element_span(&self.name, element.as_ref(), "commit", &connection.id);
            let committed = element
                .commit(scope, request, connection, self.downstream(index))
                .instrument(span)
                .await;
            if let Err(error) = committed {
                self.close_committed(scope, index, connection, &error).await;
                return Err(error);
            }
        }
        Ok(())
    }

    /// Closes the elements below `index` after its commit failed. Errors are
    /// logged; the commit error is what the caller sees.
    async fn close_committed(
        &self,
        scope: &RequestScope,
        index: usize,
        connection: &Connection,
        error: &MeshError,
    ) {
        let downstream = self.downstream(index);
        if downstream.is_empty() {
            return;
        }
        tracing::warn!(
            chain = %self.name,
            element = self.elements[index].name(),
            %error,
            "commit failed, closing deeper elements"
        );
        if let Err(e) = downstream
            .close_detached(scope, connection.clone(), self.failure_close_timeout)
            .await
        {
            tracing::warn!(chain = %self.name, error = %e, "failure close incomplete");
        }
    }

    async fn compensate(
        &self,
        scope: &mut RequestScope,
        request: &mut NetworkServiceRequest,
        entered: &mut Vec<Entered>,
        error: &MeshError,
    ) -> Option<usize> {
        while let Some(Entered { index, snapshot }) = entered.pop() {
            let element = &self.elements[index];
            let span = element_span(&self.name, element.as_ref(), "compensate", &request.connection.id);
            let recovery = element
                .compensate(scope, request, error, self.downstream(index))
                .instrument(span)
                .await;
            if recovery == Recovery::Retry {
                tracing::debug!(chain = %self.name, element = element.name(), %error, "retrying");
                *request = snapshot;
                return Some(index);
            }
        }
        None
    }

    /// Runs a Close through the chain.
    pub async fn close(
        &self,
        scope: &mut RequestScope,
        connection: Connection,
    ) -> Result<(), MeshError> {
        run_close(&self.name, &self.elements, scope, connection).await
    }
}

async fn run_close(
    chain: &str,
    elements: &Elements,
    scope: &mut RequestScope,
    connection: Connection,
) -> Result<(), MeshError> {
    let mut connection = connection;
    for element in elements {
        let span = element_span(chain, element.as_ref(), "admit_close", &connection.id);
        element
            .admit_close(scope, &mut connection)
            .instrument(span)
            .await?;
    }

    let mut errors = Vec::new();
    for element in elements {
        let span = element_span(chain, element.as_ref(), "close", &connection.id);
        if let Err(e) = element.close(scope, &connection).instrument(span).await {
            tracing::warn!(element = element.name(), error = %e, "close step failed");
            errors.push(e);
        }
    }
    for (index, element) in elements.iter().enumerate().rev() {
        let downstream = Downstream {
            chain,
            elements: elements.get(index + 1..).unwrap_or_default(),
        };
        let span = element_span(chain, element.as_ref(), "finish_close", &connection.id);
        if let Err(e) = element
            .finish_close(scope, &connection, downstream)
            .instrument(span)
            .await
        {
            tracing::warn!(element = element.name(), error = %e, "close step failed");
            errors.push(e);
        }
    }
    MeshError::aggregate(errors)
}
