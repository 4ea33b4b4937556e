//! Connection value objects exchanged at every hop.
//!
//! One [`Connection`] type serves client-facing, manager-to-manager, and
//! forwarder-facing legs; [`ConnectionScope`] records which one a value is.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ConnectionContext, ConnectionId, EndpointName, ManagerName, MechanismRegistry, MeshError,
};

// ---------------------------------------------------------------------------
// Mechanism
// ---------------------------------------------------------------------------

/// Whether a mechanism connects to a workload on this node or to another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismClass {
    /// Kernel interface, shared-memory interface, ...
    Local,
    /// Tunnel or segment-routing transport between nodes.
    Remote,
}

impl std::fmt::Display for MechanismClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A transport technology plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    /// Local or remote.
    pub class: MechanismClass,
    /// Mechanism type name, resolved through [`MechanismRegistry`].
    #[serde(rename = "type")]
    pub mechanism_type: String,
    /// Type-specific parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Mechanism {
    /// Creates a mechanism with no parameters.
    pub fn new(class: MechanismClass, mechanism_type: impl Into<String>) -> Self {
        Self {
            class,
            mechanism_type: mechanism_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Builder-style parameter setter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Returns a parameter value.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Sets a parameter value, replacing any previous one.
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }
}

// ---------------------------------------------------------------------------
// Path
// ---------------------------------------------------------------------------

/// One manager hop of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    /// Manager name.
    pub name: String,
    /// Connection id as known to that manager.
    pub id: String,
    /// Per-hop security token.
    #[serde(default)]
    pub token: String,
}

/// Ordered list of manager hops; `index` marks the current one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    /// Position of the current hop.
    #[serde(default)]
    pub index: u32,
    /// Hops, client side first.
    #[serde(default)]
    pub segments: Vec<PathSegment>,
}

impl Path {
    /// Returns `true` if no hop has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Checks `index < segments.len()` for non-empty paths.
    pub fn validate(&self) -> Result<(), MeshError> {
        if !self.segments.is_empty() && self.index as usize >= self.segments.len() {
            return Err(MeshError::validation(format!(
                "path index {} is out of range for {} segments",
                self.index,
                self.segments.len()
            )));
        }
        Ok(())
    }

    /// Returns the current hop.
    pub fn current(&self) -> Option<&PathSegment> {
        self.segments.get(self.index as usize)
    }

    /// Returns the current hop mutably.
    pub fn current_mut(&mut self) -> Option<&mut PathSegment> {
        self.segments.get_mut(self.index as usize)
    }

    /// Returns the hop before the current one.
    pub fn previous(&self) -> Option<&PathSegment> {
        (self.index as usize)
            .checked_sub(1)
            .and_then(|i| self.segments.get(i))
    }

    /// Manager names from client side to endpoint side.
    pub fn manager_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.name.as_str())
    }

    /// Records that `manager` now handles the connection under `id`.
    ///
    /// - Empty path: becomes a single hop at index 0.
    /// - The current or next hop already names `manager`: the index moves onto
    ///   it and its id is refreshed (re-request after Heal).
    /// - Otherwise hops after the current one are dropped and a new hop is
    ///   appended and made current.
    pub fn extend(&mut self, manager: &str, id: &str) {
        let current = self.index as usize;
        if self.segments.is_empty() {
            self.index = 0;
        } else if self.segments.get(current).is_some_and(|s| s.name == manager) {
            // Same hop.
        } else if self.segments.get(current + 1).is_some_and(|s| s.name == manager) {
            self.index += 1;
        } else {
            self.segments.truncate(current + 1);
            self.index = self.segments.len() as u32;
            self.segments.push(PathSegment::default());
        }
        if self.segments.is_empty() {
            self.segments.push(PathSegment::default());
        }
        if let Some(segment) = self.current_mut() {
            segment.name = manager.to_string();
            segment.id = id.to_string();
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Operational state of a connection leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Established.
    #[default]
    Up,
    /// Torn down or not yet established.
    Down,
}

/// Which hop a connection leg belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ConnectionScope {
    /// Between a workload and its own manager (or a local endpoint).
    #[default]
    Local,
    /// Between two managers on different nodes.
    Remote {
        /// Manager that issued the request.
        source_manager: ManagerName,
        /// Manager that owns the endpoint.
        destination_manager: ManagerName,
        /// Endpoint chosen by the source manager.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint_name: Option<EndpointName>,
    },
}

/// A point-to-point connection leg.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Leg id; empty on a first request, assigned by the manager.
    #[serde(default)]
    pub id: String,
    /// Requested network service.
    pub network_service: String,
    /// Negotiated mechanism; absent until a forwarder has been selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<Mechanism>,
    /// Negotiated addressing payload.
    #[serde(default)]
    pub context: ConnectionContext,
    /// Free-form labels used for endpoint matching.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Manager hops.
    #[serde(default)]
    pub path: Path,
    /// Up or down.
    #[serde(default)]
    pub state: ConnectionState,
    /// Local or manager-to-manager leg.
    #[serde(default)]
    pub scope: ConnectionScope,
    /// Token produced by the configured signer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Connection {
    /// Creates a connection request for `network_service`.
    pub fn new(network_service: impl Into<String>) -> Self {
        Self {
            network_service: network_service.into(),
            ..Self::default()
        }
    }

    /// Returns the id as a typed identifier, if one has been assigned.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        ConnectionId::new(self.id.as_str())
    }

    /// Returns `true` for manager-to-manager legs.
    pub fn is_remote(&self) -> bool {
        matches!(self.scope, ConnectionScope::Remote { .. })
    }

    /// Basic validity: service named, path well-formed, mechanism (if any)
    /// accepted by its type validator.
    pub fn is_valid(&self, mechanisms: &MechanismRegistry) -> Result<(), MeshError> {
        if self.network_service.is_empty() {
            return Err(MeshError::invariant(format!(
                "connection {:?}: network service cannot be empty",
                self.id
            )));
        }
        self.path.validate()?;
        if let Some(mechanism) = &self.mechanism {
            mechanisms.validate(mechanism).map_err(|e| {
                MeshError::invariant(format!("invalid mechanism in connection {:?}: {e}", self.id))
            })?;
        }
        Ok(())
    }

    /// Validity plus an assigned id and a well-formed context.
    pub fn is_complete(&self, mechanisms: &MechanismRegistry) -> Result<(), MeshError> {
        self.is_valid(mechanisms)?;
        if self.id.is_empty() {
            return Err(MeshError::invariant("connection id cannot be empty"));
        }
        self.context.validate()
    }

    /// Replaces the context with `context` if it satisfies the requirements
    /// declared by the current one.
    ///
    /// All-or-nothing: if the replacement leaves the connection invalid, the
    /// previous context is restored exactly and an error is returned.
    pub fn update_context(
        &mut self,
        context: ConnectionContext,
        mechanisms: &MechanismRegistry,
    ) -> Result<(), MeshError> {
        context.meets_requirements(&self.context)?;
        let previous = std::mem::replace(&mut self.context, context);
        let check = self
            .is_valid(mechanisms)
            .and_then(|()| self.context.validate());
        if let Err(e) = check {
            self.context = previous;
            return Err(e);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A client's request for a network service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServiceRequest {
    /// Requested connection.
    pub connection: Connection,
    /// Acceptable mechanisms in order of preference; all of one class.
    #[serde(default)]
    pub mechanism_preferences: Vec<Mechanism>,
}

impl NetworkServiceRequest {
    /// Creates a request.
    pub fn new(connection: Connection, mechanism_preferences: Vec<Mechanism>) -> Self {
        Self {
            connection,
            mechanism_preferences,
        }
    }

    /// Returns the common class of all preferences.
    pub fn mechanism_class(&self) -> Result<MechanismClass, MeshError> {
        let mut classes = self.mechanism_preferences.iter().map(|m| m.class);
        let first = classes
            .next()
            .ok_or_else(|| MeshError::validation("mechanism preferences cannot be empty"))?;
        if classes.any(|c| c != first) {
            return Err(MeshError::validation(
                "mechanism preferences mix local and remote classes",
            ));
        }
        Ok(first)
    }
}

// ---------------------------------------------------------------------------
// Cross-connect
// ---------------------------------------------------------------------------

/// Paired source and destination legs handed to a forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossConnect {
    /// Same as the source leg id.
    pub id: String,
    /// Payload type declared by the target service, e.g. `"IP"`.
    pub payload: String,
    /// Client-facing leg.
    pub source: Connection,
    /// Endpoint-facing leg.
    pub destination: Connection,
}

impl CrossConnect {
    /// Pairs two legs.
    pub fn new(payload: impl Into<String>, source: Connection, destination: Connection) -> Self {
        Self {
            id: source.id.clone(),
            payload: payload.into(),
            source,
            destination,
        }
    }

    /// Both legs complete and a payload declared.
    pub fn is_complete(&self, mechanisms: &MechanismRegistry) -> Result<(), MeshError> {
        if self.id.is_empty() {
            return Err(MeshError::invariant("cross connect id cannot be empty"));
        }
        if self.payload.is_empty() {
            return Err(MeshError::invariant("cross connect payload cannot be empty"));
        }
        self.source.is_complete(mechanisms)?;
        self.destination.is_complete(mechanisms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::kernel;

    fn registry() -> MechanismRegistry {
        MechanismRegistry::default()
    }

    #[test]
    fn extending_empty_path_yields_single_hop() {
        let mut path = Path::default();
        path.extend("nsmgr-a", "c1");
        assert_eq!(path.index, 0);
        assert_eq!(path.segments.len(), 1);
        assert!(path.validate().is_ok());
    }

    #[test]
    fn extending_moves_onto_known_next_hop() {
        let mut path = Path::default();
        path.extend("nsmgr-a", "c1");
        path.extend("nsmgr-b", "c2");
        path.index = 0;
        path.extend("nsmgr-b", "c3");
        assert_eq!(path.index, 1);
        assert_eq!(path.segments.len(), 2);
        assert_eq!(path.segments[1].id, "c3");
    }

    #[test]
    fn extending_same_hop_refreshes_id() {
        let mut path = Path::default();
        path.extend("nsmgr-a", "c1");
        path.extend("nsmgr-a", "c9");
        assert_eq!(path.segments.len(), 1);
        assert_eq!(path.segments[0].id, "c9");
    }

    #[test]
    fn out_of_range_index_is_invalid() {
        let path = Path {
            index: 1,
            segments: vec![PathSegment::default()],
        };
        assert!(path.validate().is_err());
    }

    #[test]
    fn failed_update_context_restores_previous_context() {
        let mut conn = Connection::new("secure-intranet");
        conn.id = "c1".into();
        conn.context.ip.src_ip_addr = Some("10.0.0.1/32".into());
        let before = conn.context.clone();

        let mut broken = ConnectionContext::default();
        broken.ip.dst_ip_addr = Some("999.0.0.1/32".into());
        assert!(conn.update_context(broken, &registry()).is_err());
        assert_eq!(conn.context, before);
    }

    #[test]
    fn unmet_requirement_rejects_update() {
        let mut conn = Connection::new("secure-intranet");
        conn.context.ip.dst_ip_required = true;
        let before = conn.context.clone();
        assert!(conn
            .update_context(ConnectionContext::default(), &registry())
            .is_err());
        assert_eq!(conn.context, before);
    }

    #[test]
    fn mixed_preference_classes_are_rejected() {
        let request = NetworkServiceRequest::new(
            Connection::new("svc"),
            vec![
                Mechanism::new(MechanismClass::Local, kernel::MECHANISM),
                Mechanism::new(MechanismClass::Remote, "VXLAN"),
            ],
        );
        assert!(request.mechanism_class().is_err());
    }

    #[test]
    fn remote_scope_round_trips_through_json() {
        let mut conn = Connection::new("svc");
        conn.scope = ConnectionScope::Remote {
            source_manager: ManagerName::new("a").unwrap(),
            destination_manager: ManagerName::new("b").unwrap(),
            endpoint_name: None,
        };
        let json = serde_json::to_string(&conn).unwrap();
        let back: Connection = serde_json::from_str(&json).unwrap();
        assert!(back.is_remote());
    }
}
