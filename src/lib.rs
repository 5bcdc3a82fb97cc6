//! Realtime collection synchronization: filtered, ordered views of a remote
//! collection kept live by a change subscription.
//!
//! Open a [`SyncedCollection`] with a [`RemoteCollectionClient`] and a
//! [`CollectionConfig`]; it loads the view, subscribes to changes for the
//! same filter, and publishes [`CollectionState`] updates as events arrive.
//! [`MemoryBackend`] is an in-process client for tests and demos.

pub mod bindings;
mod client;
mod collection;
mod error;
mod event;
mod handle;
mod live;
mod memory;
mod store;

pub use client::{BoxFuture, MessageStream, RemoteCollectionClient, Subscription, SubscriptionId};
pub use collection::{
    CollectionConfig, CollectionIdentity, DEFAULT_ORDER_FIELD, Filter, OrderSpec, QueryRequest,
};
pub use error::{
    LoadError, MutationError, MutationKind, RecordError, RemoteError, SubscriptionError, SyncError,
};
pub use event::{ChangeEvent, ID_FIELD, Record, RecordId, SubscriptionMessage};
pub use handle::{CollectionState, EventCallbacks, SubscriptionStatus, SyncedCollection};
pub use live::LiveConfig;
pub use memory::{MemoryBackend, QueryGate};
pub use store::{LocalCollectionStore, Snapshot};
