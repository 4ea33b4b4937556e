//! Control-plane bookkeeping: client connection records and the shared table.
//!
//! ## State machine
//!
//! ```text
//!   (unknown) --request--> Requesting --ok--> Ready --request--> Healing --ok--> Ready
//!                              |                |                   |
//!                            fail             close               fail
//!                              v                v                   v
//!                          (removed)         Closing --> (removed)  Broken
//! ```
//!
//! `Requesting`, `Healing`, and `Closing` are in-progress states. While a
//! record is in one of them every other Request or Close for the same id is
//! rejected with [`MeshError::StateConflict`]. Nothing is queued.

use std::collections::BTreeMap;

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};

use crate::{
    Connection, ConnectionId, CrossConnect, EndpointName, ForwarderName, ManagerName, Mechanism,
    MeshError, NetworkServiceRequest,
};

// ---------------------------------------------------------------------------
// Collaborator descriptions
// ---------------------------------------------------------------------------

/// A registered dataplane forwarder and its advertised mechanisms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forwarder {
    /// Registered name.
    pub name: ForwarderName,
    /// Mechanisms offered towards workloads on this node.
    #[serde(default)]
    pub local_mechanisms: Vec<Mechanism>,
    /// Mechanisms offered towards other nodes.
    #[serde(default)]
    pub remote_mechanisms: Vec<Mechanism>,
}

/// A registered network service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRegistration {
    /// Registered name.
    pub name: EndpointName,
    /// Service the endpoint implements.
    pub network_service: String,
    /// Manager that owns the endpoint.
    pub manager: ManagerName,
    /// Payload type of the service, e.g. `"IP"` or `"ETHERNET"`.
    #[serde(default = "default_payload")]
    pub payload: String,
    /// Labels used for matching.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Workspace of a local endpoint on its manager's node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

fn default_payload() -> String {
    "IP".to_string()
}

// ---------------------------------------------------------------------------
// Client connection
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`ClientConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientConnectionState {
    /// First request in flight.
    Requesting,
    /// Established and programmed.
    Ready,
    /// Re-request of an established connection in flight.
    Healing,
    /// The last heal failed; the record waits for another heal or a close.
    Broken,
    /// Close in flight.
    Closing,
}

impl ClientConnectionState {
    /// Returns `true` while an operation owns the record.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Requesting | Self::Healing | Self::Closing)
    }
}

/// Whether a cross connect has been programmed on the forwarder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwarderState {
    /// Nothing programmed.
    #[default]
    None,
    /// Programming confirmed.
    Ready,
}

/// Bookkeeping record for one client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConnection {
    /// Client-facing connection id.
    pub id: ConnectionId,
    /// Lifecycle state.
    pub state: ClientConnectionState,
    /// Request as received from the client, replayed on heal.
    pub request: NetworkServiceRequest,
    /// Endpoint bound by the last successful request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointRegistration>,
    /// Peer manager, for remote endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_manager: Option<ManagerName>,
    /// Forwarder selected for this connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarder_name: Option<ForwarderName>,
    /// Programming state of the forwarder.
    #[serde(default)]
    pub forwarder_state: ForwarderState,
    /// Source and destination legs as last programmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_connect: Option<CrossConnect>,
}

impl ClientConnection {
    /// Creates a record in `Requesting`.
    pub fn new(id: ConnectionId, request: NetworkServiceRequest) -> Self {
        Self {
            id,
            state: ClientConnectionState::Requesting,
            request,
            endpoint: None,
            remote_manager: None,
            forwarder_name: None,
            forwarder_state: ForwarderState::None,
            cross_connect: None,
        }
    }

    /// Service of the last programmed source leg, or of the stored request.
    pub fn network_service(&self) -> &str {
        self.source()
            .map(|c| c.network_service.as_str())
            .unwrap_or(self.request.connection.network_service.as_str())
    }

    /// Client-facing leg.
    pub fn source(&self) -> Option<&Connection> {
        self.cross_connect.as_ref().map(|x| &x.source)
    }

    /// Endpoint-facing leg.
    pub fn destination(&self) -> Option<&Connection> {
        self.cross_connect.as_ref().map(|x| &x.destination)
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Concurrent map of client connection records keyed by id.
///
/// Admission (`begin_request`, `begin_close`) is atomic per id; distinct ids
/// never contend beyond their shard.
#[derive(Debug, Default)]
pub struct ClientConnectionTable {
    records: DashMap<ConnectionId, ClientConnection>,
}

impl ClientConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a Request.
    ///
    /// Unknown ids get a new `Requesting` record. `Ready` and `Broken` records
    /// move to `Healing`. In-progress records are rejected.
    pub fn begin_request(
        &self,
        id: &ConnectionId,
        request: &NetworkServiceRequest,
    ) -> Result<ClientConnection, MeshError> {
        match self.records.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                let record = ClientConnection::new(id.clone(), request.clone());
                vacant.insert(record.clone());
                Ok(record)
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.state.is_in_progress() {
                    return Err(MeshError::state_conflict(
                        id.as_str(),
                        format!("request rejected while {:?}", record.state),
                    ));
                }
                record.state = ClientConnectionState::Healing;
                Ok(record.clone())
            }
        }
    }

    /// Admits a Close. The record moves to `Closing`.
    pub fn begin_close(&self, id: &ConnectionId) -> Result<ClientConnection, MeshError> {
        match self.records.entry(id.clone()) {
            Entry::Vacant(_) => Err(MeshError::no_such_connection(id.as_str())),
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.state.is_in_progress() {
                    return Err(MeshError::state_conflict(
                        id.as_str(),
                        format!("close rejected while {:?}", record.state),
                    ));
                }
                record.state = ClientConnectionState::Closing;
                Ok(record.clone())
            }
        }
    }

    /// Stores `record` as `Ready`.
    pub fn complete(&self, mut record: ClientConnection) -> ClientConnection {
        record.state = ClientConnectionState::Ready;
        self.records.insert(record.id.clone(), record.clone());
        record
    }

    /// Rolls back an admitted Request: a first request is deleted, a heal
    /// leaves the record `Broken`.
    pub fn abandon(&self, id: &ConnectionId) -> Option<ClientConnectionState> {
        match self.records.entry(id.clone()) {
            Entry::Vacant(_) => None,
            Entry::Occupied(mut occupied) => match occupied.get().state {
                ClientConnectionState::Requesting => {
                    occupied.remove();
                    None
                }
                ClientConnectionState::Healing => {
                    occupied.get_mut().state = ClientConnectionState::Broken;
                    Some(ClientConnectionState::Broken)
                }
                other => Some(other),
            },
        }
    }

    /// Applies `change` to a record that no operation currently owns.
    pub fn modify<F>(&self, id: &ConnectionId, change: F) -> bool
    where
        F: FnOnce(&mut ClientConnection),
    {
        match self.records.get_mut(id) {
            Some(mut record) if !record.state.is_in_progress() => {
                change(&mut *record);
                true
            }
            _ => false,
        }
    }

    /// Marks an established record `Broken` (heal gave up).
    pub fn mark_broken(&self, id: &ConnectionId) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) if !record.state.is_in_progress() => {
                record.state = ClientConnectionState::Broken;
                true
            }
            _ => false,
        }
    }

    /// Deletes the record unconditionally.
    pub fn remove(&self, id: &ConnectionId) -> Option<ClientConnection> {
        self.records.remove(id).map(|(_, record)| record)
    }

    /// Returns a copy of the record.
    pub fn get(&self, id: &ConnectionId) -> Option<ClientConnection> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Copies of all records, ordered by id.
    pub fn snapshot(&self) -> Vec<ClientConnection> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
