//! The boundary to the hosted backend.
//!
//! [`RemoteCollectionClient`] is everything the engine needs from a backend:
//! a filtered, ordered query; write-through mutations; and a change
//! subscription keyed by table + filter. Methods return boxed futures so the
//! trait stays object safe and handles can hold an
//! `Arc<dyn RemoteCollectionClient>`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio_stream::Stream;
use uuid::Uuid;

use crate::collection::{CollectionIdentity, QueryRequest};
use crate::error::RemoteError;
use crate::event::{Record, RecordId, SubscriptionMessage};

/// A boxed, `Send` future borrowing from `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stream of messages for one subscription. Ends when the backend closes
/// the channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = SubscriptionMessage> + Send>>;

/// Identifies one open subscription for [`RemoteCollectionClient::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An open change subscription.
///
/// The backend is expected to yield [`SubscriptionMessage::Subscribed`]
/// once the channel is confirmed, then data events in commit order.
pub struct Subscription {
    pub id: SubscriptionId,
    pub messages: MessageStream,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Typed access to a hosted backend.
///
/// # Contract
///
/// - [`query`](Self::query) returns the rows matching the request's filter,
///   sorted by its order spec, with the `select` expansion applied.
/// - [`subscribe`](Self::subscribe) delivers change events for rows matching
///   the identity's filter, in the order the backend commits them.
/// - [`unsubscribe`](Self::unsubscribe) is idempotent: closing an id twice,
///   or an id the backend already dropped, is not an error.
/// - A `subscribe` future may register the channel before it resolves. The
///   engine never drops one mid-flight: at teardown it awaits the future
///   (for a bounded time) and closes whatever subscription it yields.
///   Backends whose `subscribe` can block indefinitely should time out on
///   their own, since an abandoned future leaks its channel.
/// - Mutations report failures as values; they never panic.
pub trait RemoteCollectionClient: Send + Sync + 'static {
    /// Run the filtered, ordered query behind a view.
    fn query<'a>(
        &'a self,
        request: &'a QueryRequest,
    ) -> BoxFuture<'a, Result<Vec<Record>, RemoteError>>;

    /// Insert a row and return it as stored (with generated fields).
    fn insert<'a>(
        &'a self,
        table: &'a str,
        payload: Record,
        select: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Record, RemoteError>>;

    /// Patch the row with `id` and return it as stored.
    fn update<'a>(
        &'a self,
        table: &'a str,
        id: &'a RecordId,
        patch: Record,
        select: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Record, RemoteError>>;

    /// Delete the row with `id`.
    fn delete<'a>(
        &'a self,
        table: &'a str,
        id: &'a RecordId,
    ) -> BoxFuture<'a, Result<(), RemoteError>>;

    /// Open a change subscription for `identity`.
    fn subscribe<'a>(
        &'a self,
        identity: &'a CollectionIdentity,
    ) -> BoxFuture<'a, Result<Subscription, RemoteError>>;

    /// Close a subscription. Idempotent.
    fn unsubscribe(&self, id: SubscriptionId) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_ids_are_unique() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
    }

    #[test]
    fn subscription_id_displays_as_uuid() {
        let id = SubscriptionId::new();
        assert_eq!(id.to_string(), id.as_uuid().to_string());
    }

    #[test]
    fn subscription_debug_omits_stream() {
        let sub = Subscription {
            id: SubscriptionId::new(),
            messages: Box::pin(tokio_stream::empty::<SubscriptionMessage>()),
        };
        let rendered = format!("{sub:?}");
        assert!(rendered.starts_with("Subscription { id: "));
        assert!(rendered.ends_with(".. }"));
    }

    // The engine stores clients as trait objects.
    const _: () = {
        #[allow(dead_code)]
        fn assert_object_safe(_: &dyn RemoteCollectionClient) {}
    };
}
