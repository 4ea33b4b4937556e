//! Chain elements and the network service manager built from them.
//!
//! Each stage owns one concern of a Request or Close. The manager wires them
//! into a single chain in this order:
//!
//! ```text
//! validator -> monitor -> connection -> forwarder -> endpoint_selector -> endpoint_request -> cross_connect
//! ```
//!
//! Forward steps run top to bottom; commits run bottom to top, so the
//! connection record is only updated after the forwarder has programmed the
//! cross connect.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`validator`] | Request and close admission checks |
//! | [`monitor`] | Publishes connection updates and deletes |
//! | [`connection`] | Id assignment, path extension, record state transitions |
//! | [`forwarder`] | Forwarder selection, mechanism negotiation, programming |
//! | [`selector`] | Endpoint selection, exclusion, heal fast path |
//! | [`endpoint`] | Destination request and close |
//! | [`cross_connect`] | Pairs the source and destination legs |
//! | [`manager`] | `NetworkServiceManager` and its builder |

pub mod connection;
pub mod cross_connect;
pub mod endpoint;
pub mod forwarder;
pub mod manager;
pub mod monitor;
pub mod selector;
pub mod validator;

pub use connection::ConnectionStage;
pub use cross_connect::CrossConnectStage;
pub use endpoint::EndpointRequestStage;
pub use forwarder::ForwarderStage;
pub use manager::{HealOutcome, NetworkServiceManager, NetworkServiceManagerBuilder};
pub use monitor::MonitorStage;
pub use selector::EndpointSelectorStage;
pub use validator::RequestValidator;
