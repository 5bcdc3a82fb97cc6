//! Crate-level error types for loads, live subscriptions, and mutations.
//!
//! Every error here is `Clone` so it can be stored in the published
//! [`CollectionState`](crate::CollectionState) and read by any number of
//! consumers. None of them is fatal: failures are surfaced as data.

use std::fmt;

use crate::event::RecordId;

/// Failure reported by the remote backend or its transport.
///
/// `status` follows HTTP conventions (e.g. `503` for an unreachable
/// backend, `404` for a missing row), which is what hosted backends put on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("remote error {status}: {message}")]
pub struct RemoteError {
    /// Transport status code.
    pub status: u16,
    /// Human-readable description from the backend.
    pub message: String,
}

impl RemoteError {
    /// Create an error with an explicit status code.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// `503`: the backend could not be reached.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }

    /// `404`: the addressed row does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    /// `400`: the request was rejected as malformed.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }
}

/// The initial (or refresh) query for a collection failed.
///
/// Recoverable: call [`SyncedCollection::refresh`](crate::SyncedCollection::refresh).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to load `{table}`: {source}")]
pub struct LoadError {
    /// Table the query targeted.
    pub table: String,
    /// Underlying transport failure.
    #[source]
    pub source: RemoteError,
}

/// Live updates for a collection are unavailable.
///
/// Non-fatal: the handle keeps serving the last loaded data and retries
/// according to its [`LiveConfig`](crate::LiveConfig).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The backend refused or could not establish the subscription.
    #[error("subscription to `{table}` rejected: {source}")]
    Rejected {
        /// Table the subscription targeted.
        table: String,
        /// Underlying transport failure.
        #[source]
        source: RemoteError,
    },

    /// An established subscription reported an error.
    #[error("subscription to `{table}` interrupted: {source}")]
    Interrupted {
        /// Table the subscription targeted.
        table: String,
        /// Underlying transport failure.
        #[source]
        source: RemoteError,
    },

    /// The backend closed the subscription stream.
    #[error("subscription to `{table}` closed by the backend")]
    Closed {
        /// Table the subscription targeted.
        table: String,
    },
}

/// Error held in a handle's error state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// See [`LoadError`].
    #[error(transparent)]
    Load(#[from] LoadError),

    /// See [`SubscriptionError`].
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

impl SyncError {
    /// Returns `true` for load failures.
    pub fn is_load(&self) -> bool {
        matches!(self, Self::Load(_))
    }

    /// Returns `true` for subscription failures.
    pub fn is_subscription(&self) -> bool {
        matches!(self, Self::Subscription(_))
    }
}

/// Which write-through operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert into",
            Self::Update => "update of",
            Self::Delete => "delete from",
        })
    }
}

/// A write-through mutation failed.
///
/// Returned to the caller; the local view is never touched by a failed
/// mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op} `{table}` failed{}: {source}", id_suffix(.id))]
pub struct MutationError {
    /// The operation that failed.
    pub op: MutationKind,
    /// Table the mutation targeted.
    pub table: String,
    /// Row the mutation addressed, when known.
    pub id: Option<RecordId>,
    /// Underlying transport failure.
    #[source]
    pub source: RemoteError,
}

fn id_suffix(id: &Option<RecordId>) -> String {
    id.as_ref()
        .map(|id| format!(" for id {id}"))
        .unwrap_or_default()
}

/// A JSON value could not be used as a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Records must be JSON objects.
    #[error("record must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display() {
        let err = RemoteError::unavailable("connection refused");
        assert_eq!(err.to_string(), "remote error 503: connection refused");
        assert_eq!(RemoteError::not_found("x").status, 404);
    }

    #[test]
    fn load_error_chains_source() {
        let err = LoadError {
            table: "orders".into(),
            source: RemoteError::unavailable("timeout"),
        };
        assert_eq!(
            err.to_string(),
            "failed to load `orders`: remote error 503: timeout"
        );
        let source = std::error::Error::source(&err).expect("load error should have a source");
        assert_eq!(source.to_string(), "remote error 503: timeout");
    }

    #[test]
    fn sync_error_is_transparent() {
        let err = SyncError::from(SubscriptionError::Closed {
            table: "reviews".into(),
        });
        assert!(err.is_subscription());
        assert!(!err.is_load());
        assert_eq!(
            err.to_string(),
            "subscription to `reviews` closed by the backend"
        );
    }

    #[test]
    fn mutation_error_mentions_id_when_known() {
        let err = MutationError {
            op: MutationKind::Update,
            table: "orders".into(),
            id: Some(RecordId::Int(7)),
            source: RemoteError::not_found("no such row"),
        };
        assert_eq!(
            err.to_string(),
            "update of `orders` failed for id 7: remote error 404: no such row"
        );

        let err = MutationError {
            op: MutationKind::Insert,
            table: "orders".into(),
            id: None,
            source: RemoteError::bad_request("missing store_id"),
        };
        assert_eq!(
            err.to_string(),
            "insert into `orders` failed: remote error 400: missing store_id"
        );
    }

    // Errors live inside watch-channel state and cross task boundaries.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync_clone<T: Send + Sync + Clone>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync_clone::<RemoteError>();
            assert_send_sync_clone::<SyncError>();
            assert_send_sync_clone::<MutationError>();
        }
    };
}
