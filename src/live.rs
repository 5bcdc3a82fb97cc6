//! Live subscription configuration and the per-handle dispatcher loop.
//!
//! Each enabled [`SyncedCollection`](crate::SyncedCollection) is backed by
//! one dispatcher task. The task exclusively owns the handle's
//! [`LocalCollectionStore`] and its subscription, and processes three
//! sources in one `select!` loop:
//!
//! - commands from the handle (refresh) and results from load tasks;
//! - messages from the subscription stream (acknowledgement, data events,
//!   failures);
//! - the shutdown signal.
//!
//! Because only the dispatcher touches the store, events are applied in
//! exactly the order the transport delivers them and no locking is needed.

use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_stream::StreamExt;
use tracing::Instrument;

use crate::client::{BoxFuture, RemoteCollectionClient, Subscription};
use crate::collection::{CollectionConfig, CollectionIdentity};
use crate::error::{LoadError, RemoteError, SubscriptionError, SyncError};
use crate::event::{ChangeEvent, Record, RecordId, SubscriptionMessage};
use crate::handle::{CollectionState, EventCallbacks, SubscriptionStatus};
use crate::store::LocalCollectionStore;

/// Configuration for live subscription behaviour.
///
/// Controls how a handle reconnects after its subscription fails or is
/// closed by the backend. All fields have sensible defaults accessible via
/// [`LiveConfig::default()`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use livecollection::LiveConfig;
///
/// let config = LiveConfig {
///     max_reconnect_attempts: Some(3),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    /// Base delay for exponential backoff on reconnection.
    ///
    /// After a failure the handle waits `reconnect_base_delay`, then
    /// `2 * reconnect_base_delay`, etc., up to
    /// [`reconnect_max_delay`](LiveConfig::reconnect_max_delay). An
    /// acknowledged subscription resets the backoff.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,

    /// Maximum delay between reconnection attempts.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,

    /// Consecutive reconnection attempts before the handle gives up and
    /// serves non-live data. `None` retries forever; `Some(0)` never
    /// retries.
    ///
    /// Default: `None`.
    pub max_reconnect_attempts: Option<u32>,

    /// Re-run the query once a re-established subscription is acknowledged,
    /// since events may have been missed while it was down.
    ///
    /// Default: `true`.
    pub resync_on_reconnect: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
            resync_on_reconnect: true,
        }
    }
}

/// How long teardown waits for an in-flight `subscribe` so the channel it
/// opens can be closed.
const SUBSCRIBE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages sent to the dispatcher loop.
pub(crate) enum Command {
    /// Re-issue the query.
    Refresh,
    /// A load task finished. `generation` identifies which load.
    LoadFinished {
        generation: u64,
        result: Result<Vec<Record>, RemoteError>,
    },
}

/// Handle-side end of a running dispatcher.
pub(crate) struct DispatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub(crate) fn refresh(&self) {
        // Fails only if the dispatcher already exited; nothing to refresh then.
        let _ = self.commands.send(Command::Refresh);
    }

    /// Ask the dispatcher to tear down without waiting for it.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Tear down and wait until the subscription is closed.
    pub(crate) async fn shutdown(self) {
        self.signal_shutdown();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "collection dispatcher task panicked");
        }
    }
}

/// Start the dispatcher for an enabled handle.
///
/// Issues the initial load and opens the subscription concurrently. State
/// changes are published on `state`.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub(crate) fn spawn_dispatcher(
    client: Arc<dyn RemoteCollectionClient>,
    config: CollectionConfig,
    callbacks: EventCallbacks,
    state: watch::Sender<CollectionState>,
) -> DispatcherHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let identity = config.identity();
    let span = tracing::info_span!(
        "collection",
        table = %identity.table,
        channel = %identity.channel_id(),
    );

    let dispatcher = Dispatcher {
        store: LocalCollectionStore::new(config.order.clone()),
        backoff_delay: config.live.reconnect_base_delay,
        client,
        identity,
        config,
        callbacks,
        state,
        commands: commands_tx.clone(),
        load_generation: 0,
        load_task: None,
        reconnect_attempts: 0,
        resync_on_ack: false,
    };

    let task = tokio::spawn(run_dispatcher(dispatcher, commands_rx, shutdown_rx).instrument(span));

    DispatcherHandle {
        commands: commands_tx,
        shutdown_tx,
        task,
    }
}

/// Connection state of the dispatcher's subscription.
enum Link {
    /// No subscription and no retry pending.
    Idle,
    /// `subscribe` has been issued.
    Connecting(BoxFuture<'static, Result<Subscription, RemoteError>>),
    /// Subscription open; messages flow.
    Live(Subscription),
    /// Waiting before the next attempt.
    Backoff(Pin<Box<Sleep>>),
}

enum LinkEvent {
    Connected(Result<Subscription, RemoteError>),
    Message(Option<SubscriptionMessage>),
    Retry,
}

impl Link {
    /// Wait for whatever the current state produces next. Cancel safe: the
    /// pending future, stream and timer live in `self`.
    async fn next_event(&mut self) -> LinkEvent {
        match self {
            Self::Idle => std::future::pending().await,
            Self::Connecting(fut) => LinkEvent::Connected(fut.as_mut().await),
            Self::Live(subscription) => LinkEvent::Message(subscription.messages.next().await),
            Self::Backoff(sleep) => {
                sleep.as_mut().await;
                LinkEvent::Retry
            }
        }
    }
}

/// State owned by the dispatcher task.
struct Dispatcher {
    client: Arc<dyn RemoteCollectionClient>,
    config: CollectionConfig,
    identity: CollectionIdentity,
    callbacks: EventCallbacks,
    store: LocalCollectionStore,
    state: watch::Sender<CollectionState>,
    /// Cloned into load tasks so they can report back.
    commands: mpsc::UnboundedSender<Command>,
    /// Bumped on every load; results from older loads are discarded.
    load_generation: u64,
    load_task: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    backoff_delay: Duration,
    /// Set once a subscription is lost; the next acknowledgement resyncs.
    resync_on_ack: bool,
}

/// Run the dispatcher loop until shutdown is signalled or every handle-side
/// sender is gone.
async fn run_dispatcher(
    mut dispatcher: Dispatcher,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!("collection opened");
    dispatcher.start_load();
    let mut link = dispatcher.connect();

    loop {
        tokio::select! {
            biased;
            // Either an explicit signal or the handle was dropped.
            _ = shutdown_rx.changed() => break,
            Some(command) = commands.recv() => dispatcher.handle_command(command),
            event = link.next_event() => dispatcher.handle_link_event(&mut link, event).await,
        }
    }

    dispatcher.teardown(link).await;
}

impl Dispatcher {
    fn publish(&self, update: impl FnOnce(&mut CollectionState)) {
        let data = self.store.snapshot();
        self.state.send_modify(|state| {
            state.data = data;
            update(state);
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh => self.start_load(),
            Command::LoadFinished { generation, result } => self.finish_load(generation, result),
        }
    }

    /// Issue the query on its own task. Any load still in flight is
    /// superseded.
    fn start_load(&mut self) {
        self.load_generation += 1;
        let generation = self.load_generation;
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        self.store.begin_load();

        let client = Arc::clone(&self.client);
        let request = self.config.query_request();
        let commands = self.commands.clone();
        tracing::debug!(generation, "load started");
        self.load_task = Some(tokio::spawn(
            async move {
                let result = client.query(&request).await;
                // The dispatcher is gone if the handle was torn down; the
                // result is dropped with the channel.
                let _ = commands.send(Command::LoadFinished { generation, result });
            }
            .in_current_span(),
        ));

        self.publish(|state| state.loading = true);
    }

    fn finish_load(&mut self, generation: u64, result: Result<Vec<Record>, RemoteError>) {
        if generation != self.load_generation {
            tracing::debug!(
                generation,
                current = self.load_generation,
                "discarding stale load result"
            );
            return;
        }
        self.load_task = None;

        match result {
            Ok(records) => {
                tracing::debug!(generation, rows = records.len(), "load finished");
                self.store.replace_all(records);
                self.publish(|state| {
                    state.loading = false;
                    if state.error.as_ref().is_some_and(SyncError::is_load) {
                        state.error = None;
                    }
                });
            }
            Err(source) => {
                tracing::error!(generation, error = %source, "load failed");
                self.store.cancel_load();
                let error = LoadError {
                    table: self.identity.table.clone(),
                    source,
                };
                self.publish(|state| {
                    state.loading = false;
                    state.error = Some(error.into());
                });
            }
        }
    }

    fn connect(&mut self) -> Link {
        let client = Arc::clone(&self.client);
        let identity = self.identity.clone();
        self.publish(|state| state.status = SubscriptionStatus::Subscribing);
        Link::Connecting(Box::pin(async move { client.subscribe(&identity).await }))
    }

    async fn handle_link_event(&mut self, link: &mut Link, event: LinkEvent) {
        match event {
            LinkEvent::Connected(Ok(subscription)) => {
                tracing::debug!(
                    subscription = %subscription.id,
                    "subscription opened, awaiting acknowledgement"
                );
                *link = Link::Live(subscription);
            }
            LinkEvent::Connected(Err(source)) => {
                let error = SubscriptionError::Rejected {
                    table: self.identity.table.clone(),
                    source,
                };
                self.link_lost(link, error).await;
            }
            LinkEvent::Message(Some(SubscriptionMessage::Subscribed)) => self.acknowledged(),
            LinkEvent::Message(Some(SubscriptionMessage::Change(event))) => {
                self.apply_change(event)
            }
            LinkEvent::Message(Some(SubscriptionMessage::Failed(source))) => {
                let error = SubscriptionError::Interrupted {
                    table: self.identity.table.clone(),
                    source,
                };
                self.link_lost(link, error).await;
            }
            LinkEvent::Message(None) => {
                let error = SubscriptionError::Closed {
                    table: self.identity.table.clone(),
                };
                self.link_lost(link, error).await;
            }
            LinkEvent::Retry => *link = self.connect(),
        }
    }

    fn acknowledged(&mut self) {
        let resync = std::mem::take(&mut self.resync_on_ack) && self.config.live.resync_on_reconnect;
        self.reconnect_attempts = 0;
        self.backoff_delay = self.config.live.reconnect_base_delay;
        tracing::debug!(resync, "subscription acknowledged");

        self.publish(|state| {
            state.status = SubscriptionStatus::Subscribed;
            if state.error.as_ref().is_some_and(SyncError::is_subscription) {
                state.error = None;
            }
        });
        if resync {
            self.start_load();
        }
    }

    /// The subscription failed or closed: close it, surface the error, and
    /// schedule a reconnect if attempts remain. Loaded data stays visible.
    async fn link_lost(&mut self, link: &mut Link, error: SubscriptionError) {
        if let Link::Live(subscription) = std::mem::replace(link, Link::Idle) {
            self.client.unsubscribe(subscription.id).await;
        }
        tracing::warn!(error = %error, "live updates unavailable");
        self.resync_on_ack = true;
        self.publish(|state| {
            state.status = SubscriptionStatus::Unsubscribed;
            // A load failure is the more useful thing to show.
            if !state.error.as_ref().is_some_and(SyncError::is_load) {
                state.error = Some(error.into());
            }
        });

        let live = &self.config.live;
        if live
            .max_reconnect_attempts
            .is_some_and(|max| self.reconnect_attempts >= max)
        {
            tracing::warn!(
                attempts = self.reconnect_attempts,
                "giving up on live updates"
            );
            return;
        }
        self.reconnect_attempts += 1;
        let delay = self.backoff_delay;
        self.backoff_delay = delay.saturating_mul(2).min(live.reconnect_max_delay);
        tracing::debug!(
            attempt = self.reconnect_attempts,
            delay_ms = millis(delay),
            "scheduling reconnect"
        );
        *link = Link::Backoff(Box::pin(tokio::time::sleep(delay)));
    }

    /// Apply one data event to the store, then run the matching callback.
    fn apply_change(&mut self, event: ChangeEvent) {
        let Some(id) = event.record_id() else {
            tracing::warn!(kind = event.kind(), "change event without an id, skipping");
            return;
        };
        tracing::debug!(kind = event.kind(), id = %id, "applying change");

        match event {
            ChangeEvent::Insert { record } => {
                self.store.apply_insert(record.clone());
                if let Some(on_insert) = &self.callbacks.on_insert {
                    run_callback("insert", &id, || on_insert(&record));
                }
            }
            ChangeEvent::Update { record, previous } => {
                let local = self.store.apply_update(record.clone());
                if let Some(on_update) = &self.callbacks.on_update {
                    run_callback("update", &id, || {
                        on_update(&record, previous.as_ref().or(local.as_ref()))
                    });
                }
            }
            ChangeEvent::Delete { previous } => {
                self.store.apply_delete(&id);
                if let Some(on_delete) = &self.callbacks.on_delete {
                    run_callback("delete", &id, || on_delete(&previous));
                }
            }
        }
        self.publish(|_| {});
    }

    /// Close the subscription, then stop. After this nothing touches the
    /// published state except the final status.
    async fn teardown(mut self, link: Link) {
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        match link {
            Link::Live(subscription) => self.client.unsubscribe(subscription.id).await,
            // The backend may already have registered the channel.
            Link::Connecting(pending) => {
                match tokio::time::timeout(SUBSCRIBE_DRAIN_TIMEOUT, pending).await {
                    Ok(Ok(subscription)) => {
                        tracing::debug!(
                            subscription = %subscription.id,
                            "closing subscription that opened during teardown"
                        );
                        self.client.unsubscribe(subscription.id).await;
                    }
                    Ok(Err(_)) => {}
                    Err(_) => tracing::warn!(
                        timeout_ms = millis(SUBSCRIBE_DRAIN_TIMEOUT),
                        "subscribe still pending at teardown, abandoning it"
                    ),
                }
            }
            Link::Idle | Link::Backoff(_) => {}
        }
        tracing::info!("collection torn down");
        self.state.send_modify(|state| {
            state.status = SubscriptionStatus::TornDown;
            state.loading = false;
        });
    }
}

/// Run a consumer callback. A panic is logged and swallowed so the
/// dispatcher keeps applying events.
fn run_callback(kind: &'static str, id: &RecordId, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!(kind, id = %id, "event callback panicked");
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_config_default_values() {
        let config = LiveConfig::default();
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, None);
        assert!(config.resync_on_reconnect);
    }

    #[tokio::test]
    async fn idle_link_never_yields() {
        let mut link = Link::Idle;
        let outcome = tokio::time::timeout(Duration::from_millis(20), link.next_event()).await;
        assert!(outcome.is_err(), "idle link should stay pending");
    }

    #[tokio::test]
    async fn live_link_reports_stream_end() {
        let mut link = Link::Live(Subscription {
            id: crate::client::SubscriptionId::new(),
            messages: Box::pin(tokio_stream::iter(vec![SubscriptionMessage::Subscribed])),
        });
        assert!(matches!(
            link.next_event().await,
            LinkEvent::Message(Some(SubscriptionMessage::Subscribed))
        ));
        assert!(matches!(link.next_event().await, LinkEvent::Message(None)));
    }

    #[tokio::test]
    async fn backoff_link_retries_after_delay() {
        let mut link = Link::Backoff(Box::pin(tokio::time::sleep(Duration::from_millis(5))));
        assert!(matches!(link.next_event().await, LinkEvent::Retry));
    }

    #[test]
    fn millis_saturates_for_huge_durations() {
        assert_eq!(millis(Duration::from_millis(250)), 250);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
