//! Scenario runner: in-process managers driven by a JSON script.
//!
//! A scenario names the managers to start, the forwarders on each, the
//! endpoints in the shared registry, and a list of steps. Each manager gets
//! simulated forwarder and endpoint clients; endpoints owned by another
//! manager are reached through that manager, as a peer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{bail, Context};
use async_trait::async_trait;
use mesh::{
    CallContext, Connection, ConnectionId, ConnectionState, CrossConnect, EndpointRegistration,
    ErrorKind, Forwarder, ForwarderClient, InMemoryEndpointRegistry, InMemoryForwarderRegistry,
    ManagerName, MeshConfig, MeshError, NetworkService, NetworkServiceRequest,
    StaticEndpointConnector,
};
use serde::{Deserialize, Serialize};
use stages::{HealOutcome, NetworkServiceManager};

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub managers: Vec<ManagerEntry>,
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerEntry {
    pub name: String,
    #[serde(default)]
    pub forwarders: Vec<ForwarderEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderEntry {
    #[serde(flatten)]
    pub forwarder: Forwarder,
    /// Program attempts that fail before the forwarder starts accepting.
    #[serde(default)]
    pub fail_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointEntry {
    #[serde(flatten)]
    pub registration: EndpointRegistration,
    /// Source address handed out to clients, in CIDR notation.
    #[serde(default)]
    pub src_ip_addr: Option<String>,
    /// Destination address handed out to clients, in CIDR notation.
    #[serde(default)]
    pub dst_ip_addr: Option<String>,
    /// Reject every request.
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Request {
        manager: String,
        request: NetworkServiceRequest,
    },
    Close {
        manager: String,
        connection_id: String,
    },
    Heal {
        manager: String,
        connection_id: String,
    },
    List {
        manager: String,
    },
}

impl Step {
    fn action(&self) -> &'static str {
        match self {
            Step::Request { .. } => "request",
            Step::Close { .. } => "close",
            Step::Heal { .. } => "heal",
            Step::List { .. } => "list",
        }
    }

    fn manager(&self) -> &str {
        match self {
            Step::Request { manager, .. }
            | Step::Close { manager, .. }
            | Step::Heal { manager, .. }
            | Step::List { manager } => manager,
        }
    }
}

/// Outcome of one step, printed as one JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub action: &'static str,
    pub manager: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&MeshError> for StepError {
    fn from(e: &MeshError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated collaborators
// ---------------------------------------------------------------------------

struct SimulatedForwarder {
    name: String,
    failures_left: AtomicU32,
}

#[async_trait]
impl ForwarderClient for SimulatedForwarder {
    async fn request(
        &self,
        _ctx: &CallContext,
        cross_connect: CrossConnect,
    ) -> Result<CrossConnect, MeshError> {
        let pending = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(MeshError::transport(format!(
                "forwarder {} rejected cross connect {}",
                self.name, cross_connect.id
            )));
        }
        tracing::debug!(forwarder = %self.name, cross_connect = %cross_connect.id, "cross connect programmed");
        Ok(cross_connect)
    }

    async fn close(&self, _ctx: &CallContext, cross_connect: &CrossConnect) -> Result<(), MeshError> {
        tracing::debug!(forwarder = %self.name, cross_connect = %cross_connect.id, "cross connect removed");
        Ok(())
    }
}

struct SimulatedEndpoint {
    entry: EndpointEntry,
}

#[async_trait]
impl NetworkService for SimulatedEndpoint {
    async fn request(
        &self,
        _ctx: &CallContext,
        request: NetworkServiceRequest,
    ) -> Result<Connection, MeshError> {
        let name = &self.entry.registration.name;
        if self.entry.unavailable {
            return Err(MeshError::transport(format!("endpoint {name} is unavailable")));
        }
        let mechanism = request
            .mechanism_preferences
            .first()
            .cloned()
            .ok_or_else(|| MeshError::selection(format!("endpoint {name}: no mechanism offered")))?;
        let mut connection = request.connection;
        connection.mechanism = Some(mechanism);
        if let Some(src) = &self.entry.src_ip_addr {
            connection.context.ip.src_ip_addr = Some(src.clone());
        }
        if let Some(dst) = &self.entry.dst_ip_addr {
            connection.context.ip.dst_ip_addr = Some(dst.clone());
        }
        connection.state = ConnectionState::Up;
        Ok(connection)
    }

    async fn close(&self, _ctx: &CallContext, connection: &Connection) -> Result<(), MeshError> {
        tracing::debug!(endpoint = %self.entry.registration.name, connection_id = %connection.id, "endpoint connection closed");
        Ok(())
    }
}

type Managers = BTreeMap<ManagerName, Arc<NetworkServiceManager>>;

/// Forwards calls to a manager that is assembled after this proxy. The
/// managers own their proxies, so the proxy only holds a weak reference back.
struct PeerProxy {
    peer: ManagerName,
    managers: Weak<OnceLock<Managers>>,
}

impl PeerProxy {
    fn resolve(&self) -> Result<Arc<NetworkServiceManager>, MeshError> {
        self.managers
            .upgrade()
            .and_then(|managers| managers.get().and_then(|m| m.get(&self.peer)).cloned())
            .ok_or_else(|| MeshError::transport(format!("peer manager {} is not running", self.peer)))
    }
}

#[async_trait]
impl NetworkService for PeerProxy {
    async fn request(
        &self,
        ctx: &CallContext,
        request: NetworkServiceRequest,
    ) -> Result<Connection, MeshError> {
        self.resolve()?.request(ctx, request).await
    }

    async fn close(&self, ctx: &CallContext, connection: &Connection) -> Result<(), MeshError> {
        self.resolve()?.close(ctx, connection).await
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Running managers of one scenario.
pub struct ScenarioMesh {
    managers: Arc<OnceLock<Managers>>,
}

impl ScenarioMesh {
    /// Assembles one manager per [`ManagerEntry`]; `base` supplies every
    /// setting except the manager name.
    pub fn build(scenario: &Scenario, base: &MeshConfig) -> anyhow::Result<Self> {
        let mut names = Vec::with_capacity(scenario.managers.len());
        for entry in &scenario.managers {
            let name = ManagerName::new(entry.name.as_str())
                .context("manager names cannot be empty")?;
            if names.contains(&name) {
                bail!("manager {name} is declared twice");
            }
            names.push(name);
        }

        let registry = Arc::new(InMemoryEndpointRegistry::new());
        for endpoint in &scenario.endpoints {
            if !names.contains(&endpoint.registration.manager) {
                bail!(
                    "endpoint {} belongs to unknown manager {}",
                    endpoint.registration.name,
                    endpoint.registration.manager
                );
            }
            registry.register(endpoint.registration.clone());
        }

        let shared = Arc::new(OnceLock::new());
        let mut managers = Managers::new();
        for (entry, name) in scenario.managers.iter().zip(&names) {
            let forwarders = Arc::new(InMemoryForwarderRegistry::new());
            for f in &entry.forwarders {
                let client = Arc::new(SimulatedForwarder {
                    name: f.forwarder.name.to_string(),
                    failures_left: AtomicU32::new(f.fail_attempts),
                });
                forwarders.register(f.forwarder.clone(), client);
            }

            let mut connector = StaticEndpointConnector::new(name.clone());
            for endpoint in scenario
                .endpoints
                .iter()
                .filter(|e| &e.registration.manager == name)
            {
                connector = connector.with_endpoint(
                    endpoint.registration.name.clone(),
                    Arc::new(SimulatedEndpoint {
                        entry: endpoint.clone(),
                    }),
                );
            }
            for peer in names.iter().filter(|n| *n != name) {
                connector = connector.with_peer(
                    peer.clone(),
                    Arc::new(PeerProxy {
                        peer: peer.clone(),
                        managers: Arc::downgrade(&shared),
                    }),
                );
            }

            let config = MeshConfig {
                manager_name: name.to_string(),
                ..base.clone()
            };
            let manager = NetworkServiceManager::builder(config)
                .forwarders(forwarders)
                .endpoints(registry.clone())
                .connector(Arc::new(connector))
                .build()
                .with_context(|| format!("assembling manager {name}"))?;
            managers.insert(name.clone(), Arc::new(manager));
        }

        if shared.set(managers).is_err() {
            bail!("scenario managers were assembled twice");
        }
        Ok(Self { managers: shared })
    }

    fn manager(&self, name: &str) -> Result<&Arc<NetworkServiceManager>, MeshError> {
        ManagerName::new(name)
            .and_then(|n| self.managers.get().and_then(|m| m.get(&n)))
            .ok_or_else(|| MeshError::configuration(format!("no manager named {name:?}")))
    }

    /// Runs every step in order. A failing step does not stop the run.
    pub async fn run(&self, steps: &[Step], timeout: std::time::Duration) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let outcome = self.execute(step, timeout).await;
            let report = StepReport {
                step: index + 1,
                action: step.action(),
                manager: step.manager().to_string(),
                ok: outcome.is_ok(),
                error: outcome.as_ref().err().map(StepError::from),
                result: outcome.ok(),
            };
            if let Some(error) = &report.error {
                tracing::warn!(step = report.step, action = report.action, kind = ?error.kind, "scenario step failed");
            }
            reports.push(report);
        }
        reports
    }

    async fn execute(
        &self,
        step: &Step,
        timeout: std::time::Duration,
    ) -> Result<serde_json::Value, MeshError> {
        let manager = self.manager(step.manager())?;
        let ctx = CallContext::with_timeout(timeout);
        match step {
            Step::Request { request, .. } => {
                let connection = manager.request(&ctx, request.clone()).await?;
                Ok(to_value(&connection))
            }
            Step::Close { connection_id, .. } => {
                let connection = manager
                    .connection(&parse_id(connection_id)?)
                    .and_then(|r| r.source().cloned())
                    .unwrap_or_else(|| Connection {
                        id: connection_id.clone(),
                        ..Connection::default()
                    });
                manager.close(&ctx, &connection).await?;
                Ok(serde_json::Value::Null)
            }
            Step::Heal { connection_id, .. } => match manager.heal(&parse_id(connection_id)?).await? {
                HealOutcome::Healed(connection) => Ok(to_value(&connection)),
                HealOutcome::Closed => Ok(serde_json::json!("closed")),
            },
            Step::List { .. } => Ok(to_value(&manager.connections())),
        }
    }
}

fn parse_id(value: &str) -> Result<ConnectionId, MeshError> {
    ConnectionId::new(value).ok_or_else(|| MeshError::validation("connection id cannot be empty"))
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| serde_json::json!({ "unserializable": e.to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TWO_MANAGERS: &str = r#"{
        "managers": [
            { "name": "nsmgr-a", "forwarders": [{
                "name": "vpp-a",
                "local_mechanisms": [{ "class": "local", "type": "KERNEL_INTERFACE" }],
                "remote_mechanisms": [{ "class": "remote", "type": "VXLAN", "parameters": { "src_ip": "192.168.1.1" } }]
            }] },
            { "name": "nsmgr-b", "forwarders": [{
                "name": "vpp-b",
                "local_mechanisms": [{ "class": "local", "type": "KERNEL_INTERFACE" }],
                "remote_mechanisms": [{ "class": "remote", "type": "VXLAN", "parameters": { "src_ip": "192.168.1.2" } }]
            }] }
        ],
        "endpoints": [
            { "name": "firewall", "network_service": "secure-intranet", "manager": "nsmgr-b",
              "src_ip_addr": "172.16.0.1/30", "dst_ip_addr": "172.16.0.2/30" }
        ],
        "steps": [
            { "action": "request", "manager": "nsmgr-a", "request": {
                "connection": { "id": "client-1", "network_service": "secure-intranet" },
                "mechanism_preferences": [{ "class": "local", "type": "KERNEL_INTERFACE" }]
            } },
            { "action": "list", "manager": "nsmgr-b" },
            { "action": "close", "manager": "nsmgr-a", "connection_id": "client-1" },
            { "action": "close", "manager": "nsmgr-a", "connection_id": "client-1" }
        ]
    }"#;

    #[tokio::test]
    async fn two_manager_scenario_runs_end_to_end() {
        let scenario: Scenario = serde_json::from_str(TWO_MANAGERS).unwrap();
        let mesh = ScenarioMesh::build(&scenario, &MeshConfig::default()).unwrap();

        let reports = mesh.run(&scenario.steps, Duration::from_secs(5)).await;

        assert_eq!(reports.len(), 4);
        assert!(reports[0].ok, "{:?}", reports[0].error);
        let connection = reports[0].result.as_ref().unwrap();
        assert_eq!(connection["context"]["ip"]["dst_ip_addr"], "172.16.0.2/30");
        let listed = reports[1].result.as_ref().unwrap().as_array().unwrap().len();
        assert_eq!(listed, 1, "the peer manager holds the remote leg");
        assert!(reports[2].ok, "{:?}", reports[2].error);
        assert_eq!(reports[3].error.as_ref().unwrap().kind, ErrorKind::NotFound);
    }

    #[test]
    fn dropping_the_mesh_releases_every_manager() {
        let scenario: Scenario = serde_json::from_str(TWO_MANAGERS).unwrap();
        let mesh = ScenarioMesh::build(&scenario, &MeshConfig::default()).unwrap();
        let managers = Arc::downgrade(&mesh.managers);
        let peer = Arc::downgrade(
            mesh.managers
                .get()
                .unwrap()
                .get(&ManagerName::new("nsmgr-b").unwrap())
                .unwrap(),
        );

        drop(mesh);

        assert!(managers.upgrade().is_none());
        assert!(peer.upgrade().is_none());
    }

    #[test]
    fn duplicate_manager_names_are_rejected() {
        let scenario: Scenario = serde_json::from_str(
            r#"{ "managers": [ { "name": "nsmgr" }, { "name": "nsmgr" } ] }"#,
        )
        .unwrap();
        assert!(ScenarioMesh::build(&scenario, &MeshConfig::default()).is_err());
    }

    #[tokio::test]
    async fn unknown_manager_is_reported_per_step() {
        let scenario: Scenario = serde_json::from_str(
            r#"{ "managers": [ { "name": "nsmgr" } ],
                 "steps": [ { "action": "list", "manager": "elsewhere" } ] }"#,
        )
        .unwrap();
        let mesh = ScenarioMesh::build(&scenario, &MeshConfig::default()).unwrap();
        let reports = mesh.run(&scenario.steps, Duration::from_secs(1)).await;
        assert_eq!(reports[0].error.as_ref().unwrap().kind, ErrorKind::Configuration);
    }
}
