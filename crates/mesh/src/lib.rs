//! Core domain of the network service mesh control plane.
//!
//! This crate contains the connection model, mechanism negotiation, the chain
//! runner, the client connection state machine, and every port trait the
//! pipeline consumes. Transport crates implement the ports; they never add
//! domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate performs no network I/O.
//! tokio is used only for timers, channels, and deadlines.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`ConnectionId`, `ManagerName`, ...) |
//! | [`errors`] | `MeshError`, `ErrorKind`, `RetryPolicy` |
//! | [`context`] | Connection context payload and its validation |
//! | [`connection`] | `Connection`, `Path`, `Mechanism`, `NetworkServiceRequest`, `CrossConnect` |
//! | [`mechanism`] | Mechanism types, registry, and selector |
//! | [`allocator`] | Keyed VNI and SID allocators |
//! | [`model`] | `ClientConnection` records and the shared table |
//! | [`chain`] | Chain runner, call context, request scope |
//! | [`monitor`] | Connection event publisher |
//! | [`ports`] | Collaborator traits |
//! | [`plugins`] | Connection context plugins |
//! | [`registry`] | In-memory registries and connector |
//! | [`config`] | `MeshConfig` |

pub mod allocator;
pub mod chain;
pub mod config;
pub mod connection;
pub mod context;
pub mod errors;
pub mod identifiers;
pub mod mechanism;
pub mod model;
pub mod monitor;
pub mod plugins;
pub mod ports;
pub mod registry;

pub use allocator::{SidAllocator, VniAllocator};
pub use chain::{CallContext, Chain, ChainElement, Downstream, Flow, Recovery, RequestScope};
pub use config::MeshConfig;
pub use connection::{
    Connection, ConnectionScope, ConnectionState, CrossConnect, Mechanism, MechanismClass,
    NetworkServiceRequest, Path, PathSegment,
};
pub use context::{ConnectionContext, DnsContext, EthernetContext, IpContext};
pub use errors::{ErrorKind, MeshError, RetryPolicy};
pub use identifiers::{ConnectionId, EndpointName, ForwarderName, ManagerName};
pub use mechanism::{MechanismRegistry, MechanismSelector, MechanismType};
pub use model::{
    ClientConnection, ClientConnectionState, ClientConnectionTable, EndpointRegistration,
    Forwarder, ForwarderState,
};
pub use monitor::{MonitorEvent, MonitorEventKind, MonitorPublisher, ScopeSelector};
pub use plugins::{ExcludedPrefixes, PluginChain};
pub use ports::{
    ConnectionPlugin, EndpointConnector, EndpointRegistry, ExclusionSet, ForwarderClient,
    ForwarderRegistry, NetworkService, Signer,
};
pub use registry::{InMemoryEndpointRegistry, InMemoryForwarderRegistry, StaticEndpointConnector};
