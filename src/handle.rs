//! The public handle a screen holds for one synchronized collection.
//!
//! [`SyncedCollection`] exposes the loading / error / data triad, a watch
//! channel for re-render signalling, and write-through mutations. The
//! view itself is maintained by a per-handle dispatcher task.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::client::RemoteCollectionClient;
use crate::collection::{CollectionConfig, CollectionIdentity};
use crate::error::{MutationError, MutationKind, RemoteError, SyncError};
use crate::event::{Record, RecordId};
use crate::live::{DispatcherHandle, spawn_dispatcher};
use crate::store::Snapshot;

/// Lifecycle of a handle's live subscription.
///
/// `Unsubscribed -> Subscribing -> Subscribed`, with `TornDown` terminal
/// from any state. A lost subscription drops back to `Unsubscribed` while
/// a reconnect is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    Unsubscribed,
    Subscribing,
    Subscribed,
    TornDown,
}

/// Everything a consumer renders from.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionState {
    /// The ordered view.
    pub data: Snapshot,
    /// A load is in flight.
    pub loading: bool,
    /// The most recent load or subscription failure, cleared by a
    /// successful load or acknowledgement respectively.
    pub error: Option<SyncError>,
    pub status: SubscriptionStatus,
}

impl CollectionState {
    fn initial(enabled: bool) -> Self {
        Self {
            data: Arc::from(Vec::new()),
            loading: enabled,
            error: None,
            status: if enabled {
                SubscriptionStatus::Subscribing
            } else {
                SubscriptionStatus::Unsubscribed
            },
        }
    }
}

type RecordCallback = Arc<dyn Fn(&Record) + Send + Sync>;
type UpdateCallback = Arc<dyn Fn(&Record, Option<&Record>) + Send + Sync>;

/// Optional hooks run by the dispatcher after an event is applied to the
/// view.
///
/// Callbacks run on the dispatcher task, so they must not block.
///
/// # Examples
///
/// ```
/// use livecollection::EventCallbacks;
///
/// let callbacks = EventCallbacks::new()
///     .on_insert(|record| println!("new row {:?}", record.id()))
///     .on_delete(|previous| println!("gone {:?}", previous.id()));
/// # let _ = callbacks;
/// ```
#[derive(Clone, Default)]
pub struct EventCallbacks {
    pub(crate) on_insert: Option<RecordCallback>,
    pub(crate) on_update: Option<UpdateCallback>,
    pub(crate) on_delete: Option<RecordCallback>,
}

impl EventCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with each inserted record.
    pub fn on_insert(mut self, f: impl Fn(&Record) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Arc::new(f));
        self
    }

    /// Called with the new version and, when known, the previous one. The
    /// previous version comes from the event if the backend ships it,
    /// otherwise from the local view.
    pub fn on_update(
        mut self,
        f: impl Fn(&Record, Option<&Record>) + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    /// Called with the removed record (at least its `id`).
    pub fn on_delete(mut self, f: impl Fn(&Record) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}

enum Driver {
    /// Disabled handle: nothing runs, but the state can still be torn down.
    Idle(watch::Sender<CollectionState>),
    Running(DispatcherHandle),
}

/// A filtered, ordered view of a remote collection kept live by a change
/// subscription.
///
/// Opening an enabled handle issues the query and subscribes concurrently.
/// Events are applied as they arrive; the query result is merged so that
/// anything the subscription reported during the load wins. Mutations are
/// write-through: they never touch the view, which changes only when the
/// corresponding event arrives (or on [`refresh`](Self::refresh)).
///
/// Dropping the handle tears the view down in the background;
/// [`close`](Self::close) does so and waits for the unsubscription.
pub struct SyncedCollection {
    client: Arc<dyn RemoteCollectionClient>,
    config: CollectionConfig,
    callbacks: EventCallbacks,
    state_rx: watch::Receiver<CollectionState>,
    driver: Option<Driver>,
}

impl SyncedCollection {
    /// Open a handle without callbacks.
    ///
    /// # Panics
    ///
    /// Panics if `config.enabled` is set and this is called outside a tokio
    /// runtime.
    pub fn open(client: Arc<dyn RemoteCollectionClient>, config: CollectionConfig) -> Self {
        Self::open_with_callbacks(client, config, EventCallbacks::default())
    }

    /// Open a handle whose dispatcher runs `callbacks` after applying each
    /// event.
    ///
    /// # Panics
    ///
    /// Panics if `config.enabled` is set and this is called outside a tokio
    /// runtime.
    pub fn open_with_callbacks(
        client: Arc<dyn RemoteCollectionClient>,
        config: CollectionConfig,
        callbacks: EventCallbacks,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(CollectionState::initial(config.enabled));
        let driver = if config.enabled {
            Driver::Running(spawn_dispatcher(
                Arc::clone(&client),
                config.clone(),
                callbacks.clone(),
                state_tx,
            ))
        } else {
            tracing::debug!(table = %config.table, "collection disabled, not loading");
            Driver::Idle(state_tx)
        };
        Self {
            client,
            config,
            callbacks,
            state_rx,
            driver: Some(driver),
        }
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn identity(&self) -> CollectionIdentity {
        self.config.identity()
    }

    /// A copy of the current state.
    pub fn state(&self) -> CollectionState {
        self.state_rx.borrow().clone()
    }

    /// The current ordered view.
    pub fn data(&self) -> Snapshot {
        Arc::clone(&self.state_rx.borrow().data)
    }

    pub fn loading(&self) -> bool {
        self.state_rx.borrow().loading
    }

    pub fn error(&self) -> Option<SyncError> {
        self.state_rx.borrow().error.clone()
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.state_rx.borrow().status
    }

    /// A receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<CollectionState> {
        self.state_rx.clone()
    }

    /// Wait until the state satisfies `predicate`.
    ///
    /// # Returns
    ///
    /// The first matching state, or `None` if the handle was torn down
    /// without ever matching.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&CollectionState) -> bool,
    ) -> Option<CollectionState> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| predicate(state))
            .await
            .ok()
            .map(|state| state.clone())
    }

    /// Re-issue the query and merge its result into the view.
    ///
    /// Any load still in flight is superseded. Failures land in
    /// [`error`](Self::error). No-op on a disabled or closed handle.
    pub fn refresh(&self) {
        if let Some(Driver::Running(dispatcher)) = &self.driver {
            dispatcher.refresh();
        }
    }

    /// Insert a row through the backend.
    ///
    /// # Returns
    ///
    /// The row as stored. The view is unchanged until the insert event
    /// arrives.
    ///
    /// # Errors
    ///
    /// [`MutationError`] carrying the backend's failure.
    pub async fn insert(&self, payload: Record) -> Result<Record, MutationError> {
        self.client
            .insert(&self.config.table, payload, self.config.select.as_deref())
            .await
            .map_err(|source| self.mutation_failed(MutationKind::Insert, None, source))
    }

    /// Patch the row with `id` through the backend.
    ///
    /// # Errors
    ///
    /// [`MutationError`] carrying the backend's failure (404 if the row does
    /// not exist).
    pub async fn update(&self, id: &RecordId, patch: Record) -> Result<Record, MutationError> {
        self.client
            .update(&self.config.table, id, patch, self.config.select.as_deref())
            .await
            .map_err(|source| self.mutation_failed(MutationKind::Update, Some(id), source))
    }

    /// Delete the row with `id` through the backend.
    ///
    /// # Errors
    ///
    /// [`MutationError`] carrying the backend's failure.
    pub async fn remove(&self, id: &RecordId) -> Result<(), MutationError> {
        self.client
            .delete(&self.config.table, id)
            .await
            .map_err(|source| self.mutation_failed(MutationKind::Delete, Some(id), source))
    }

    fn mutation_failed(
        &self,
        op: MutationKind,
        id: Option<&RecordId>,
        source: RemoteError,
    ) -> MutationError {
        let error = MutationError {
            op,
            table: self.config.table.clone(),
            id: id.cloned(),
            source,
        };
        tracing::warn!(error = %error, "mutation failed");
        error
    }

    /// Switch to `config`.
    ///
    /// If it describes the same view this does nothing. Otherwise the
    /// current view is torn down (unsubscribed and discarded) and a fresh
    /// one is opened with the same client and callbacks.
    pub async fn reconfigure(&mut self, config: CollectionConfig) {
        if config == self.config {
            return;
        }
        tracing::info!(
            from = %self.config.identity(),
            to = %config.identity(),
            "reconfiguring collection"
        );
        self.close().await;
        *self = Self::open_with_callbacks(Arc::clone(&self.client), config, self.callbacks.clone());
    }

    /// Tear the view down and wait until the subscription is closed.
    ///
    /// The last published state stays readable with status
    /// [`SubscriptionStatus::TornDown`]. Idempotent.
    pub async fn close(&mut self) {
        match self.driver.take() {
            Some(Driver::Running(dispatcher)) => dispatcher.shutdown().await,
            Some(Driver::Idle(state)) => state.send_modify(|state| {
                state.status = SubscriptionStatus::TornDown;
            }),
            None => {}
        }
    }
}

impl Drop for SyncedCollection {
    fn drop(&mut self) {
        if let Some(Driver::Running(dispatcher)) = &self.driver {
            dispatcher.signal_shutdown();
        }
    }
}

impl fmt::Debug for SyncedCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedCollection")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
