//! Error taxonomy and retry-policy types for the control plane.
//!
//! [`MeshError`] covers every failure a chain element can produce. Each
//! variant maps to one [`ErrorKind`]; stages add diagnostic context with
//! [`MeshError::with_context`] but never change the kind of an error they
//! propagate.
//!
//! [`RetryPolicy`] is a cross-cutting concern: the forwarder stage consults it
//! to decide whether a failed programming attempt may be repeated.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// ## Rules
///
/// - `Retryable` errors: transport failures talking to forwarders, endpoints,
///   or peer managers.
/// - `NonRetryable` errors: malformed requests, state conflicts, exhausted
///   deadlines, broken invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Coarse classification of a [`MeshError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request.
    Validation,
    /// Another operation is already in progress for the same connection id.
    StateConflict,
    /// The connection id is not known to this manager.
    NotFound,
    /// No mechanism, forwarder, or endpoint matched.
    Selection,
    /// An RPC to a forwarder, endpoint, or peer manager failed.
    Transport,
    /// The call deadline was exhausted.
    Timeout,
    /// A context merge or connection validity check failed.
    Invariant,
    /// The manager configuration is unusable.
    Configuration,
    /// Several independent failures collected during a Close.
    Aggregate,
}

// ---------------------------------------------------------------------------
// Control-plane errors
// ---------------------------------------------------------------------------

/// Errors produced by the request/close pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    /// The request is structurally invalid. Never retried.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the malformed field.
        message: String,
    },

    /// An operation on this connection id is already in flight.
    #[error("connection {id} is busy: {message}")]
    StateConflict {
        /// Connection id the operation targeted.
        id: String,
        /// Description of the conflicting state.
        message: String,
    },

    /// Close (or Heal) was called for a connection id that has no record.
    #[error("there is no such client connection: {id}")]
    NoSuchConnection {
        /// Connection id the operation targeted.
        id: String,
    },

    /// No mechanism, forwarder, or endpoint candidate could be selected.
    #[error("selection failed: {message}")]
    Selection {
        /// Description of what could not be matched.
        message: String,
    },

    /// An RPC to a collaborator failed.
    #[error("transport failure: {message}")]
    Transport {
        /// Description of the failed call.
        message: String,
    },

    /// The caller deadline expired.
    #[error("timeout: {message}")]
    Timeout {
        /// Description of the operation that ran out of time.
        message: String,
    },

    /// A connection failed validation or a context merge was incompatible.
    #[error("invariant violated: {message}")]
    Invariant {
        /// Description of the violated invariant.
        message: String,
    },

    /// The manager configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Independent failures collected while tearing a connection down.
    #[error("{} failures during close: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<MeshError>),
}

fn join_messages(errors: &[MeshError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl MeshError {
    /// Creates a [`MeshError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a [`MeshError::StateConflict`].
    pub fn state_conflict(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateConflict {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Creates a [`MeshError::NoSuchConnection`].
    pub fn no_such_connection(id: impl Into<String>) -> Self {
        Self::NoSuchConnection { id: id.into() }
    }

    /// Creates a [`MeshError::Selection`].
    pub fn selection(message: impl Into<String>) -> Self {
        Self::Selection {
            message: message.into(),
        }
    }

    /// Creates a [`MeshError::Transport`].
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a [`MeshError::Timeout`].
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates a [`MeshError::Invariant`].
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Creates a [`MeshError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::NoSuchConnection { .. } => ErrorKind::NotFound,
            Self::Selection { .. } => ErrorKind::Selection,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Invariant { .. } => ErrorKind::Invariant,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Aggregate(_) => ErrorKind::Aggregate,
        }
    }

    /// Prefixes the message with `context`, keeping the variant unchanged.
    ///
    /// Aggregates and not-found errors are returned as-is; their text is
    /// already specific.
    #[must_use]
    pub fn with_context(self, context: &str) -> Self {
        let prefix = |message: String| format!("{context}: {message}");
        match self {
            Self::Validation { message } => Self::Validation {
                message: prefix(message),
            },
            Self::StateConflict { id, message } => Self::StateConflict {
                id,
                message: prefix(message),
            },
            Self::Selection { message } => Self::Selection {
                message: prefix(message),
            },
            Self::Transport { message } => Self::Transport {
                message: prefix(message),
            },
            Self::Timeout { message } => Self::Timeout {
                message: prefix(message),
            },
            Self::Invariant { message } => Self::Invariant {
                message: prefix(message),
            },
            Self::Configuration { message } => Self::Configuration {
                message: prefix(message),
            },
            other @ (Self::NoSuchConnection { .. } | Self::Aggregate(_)) => other,
        }
    }

    /// Returns the retry policy for this error.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Transport { .. } => RetryPolicy::Retryable { after: None },
            _ => RetryPolicy::NonRetryable,
        }
    }

    /// Returns `true` if this error ends the call regardless of what any stage
    /// could still try.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Validation)
    }

    /// Returns `true` if a Close must stop before touching any state.
    ///
    /// These are admission failures: the connection is unknown, busy, or the
    /// close request itself is malformed.
    pub fn aborts_close(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound | ErrorKind::StateConflict | ErrorKind::Validation
        )
    }

    /// Collapses collected errors: none is success, one is returned unchanged,
    /// several become [`MeshError::Aggregate`].
    pub fn aggregate(mut errors: Vec<MeshError>) -> Result<(), MeshError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }

    /// Merges a selection failure with the last per-candidate error, if any.
    pub fn combine(self, last: Option<MeshError>) -> Self {
        match last {
            None => self,
            Some(last) => {
                let message = format!("{self}. Last endpoint error: {last}");
                match last.kind() {
                    ErrorKind::Timeout => Self::timeout(message),
                    _ => Self::selection(message),
                }
            }
        }
    }
}
