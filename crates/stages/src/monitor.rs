//! Publishes connection events around the whole pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use mesh::{
    ChainElement, Connection, Downstream, MeshError, MonitorPublisher, NetworkServiceRequest,
    RequestScope,
};

/// Emits `Update` after a successful request and `Delete` after a close.
///
/// Without a publisher, requests proceed silently and closes fail.
#[derive(Debug, Clone, Default)]
pub struct MonitorStage {
    publisher: Option<Arc<MonitorPublisher>>,
}

impl MonitorStage {
    pub fn new(publisher: Option<Arc<MonitorPublisher>>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl ChainElement for MonitorStage {
    fn name(&self) -> &'static str {
        "monitor"
    }

    async fn commit(
        &self,
        _scope: &mut RequestScope,
        _request: &NetworkServiceRequest,
        connection: &mut Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        match &self.publisher {
            Some(publisher) => publisher.update(connection),
            None => tracing::debug!(connection_id = %connection.id, "no monitor configured"),
        }
        Ok(())
    }

    async fn finish_close(
        &self,
        _scope: &mut RequestScope,
        connection: &Connection,
        _downstream: Downstream<'_>,
    ) -> Result<(), MeshError> {
        let publisher = self.publisher.as_ref().ok_or_else(|| {
            MeshError::configuration("no monitor configured to publish connection delete")
        })?;
        publisher.delete(connection);
        Ok(())
    }
}
