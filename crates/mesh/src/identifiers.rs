//! Newtype domain identifiers.
//!
//! Every named participant in the mesh is represented as a distinct newtype
//! wrapping a `String`. This prevents accidentally interchanging, for example,
//! a [`ManagerName`] with an [`EndpointName`] even though both are plain names
//! on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Connection identity
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies one leg of a connection as seen by this manager.
    ///
    /// Ids minted here are random UUIDs. Ids received from clients are kept as
    /// given so a Heal re-request correlates with the existing record.
    ConnectionId
}

impl ConnectionId {
    /// Placeholder id sent to a peer manager that assigns its own id.
    pub const REMOTE_ASSIGNED: &'static str = "-";

    /// Generates a fresh random connection id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

string_id! {
    /// Name of a network service manager (one hop of a connection path).
    ManagerName
}

string_id! {
    /// Registered name of a network service endpoint.
    EndpointName
}

string_id! {
    /// Registered name of a dataplane forwarder.
    ForwarderName
}
