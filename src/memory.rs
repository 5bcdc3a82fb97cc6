//! In-process [`RemoteCollectionClient`] used by tests and demos.
//!
//! [`MemoryBackend`] keeps tables of JSON records in memory and honours the
//! same observable contract as a hosted backend: filtered and ordered
//! queries, per-filter change delivery in commit order, and a connection
//! acknowledgement on every new subscription. It also exposes hooks for
//! injecting the failures a real network produces (slow queries, rejected
//! subscriptions, lost or delayed events).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::client::{BoxFuture, RemoteCollectionClient, Subscription, SubscriptionId};
use crate::collection::{CollectionIdentity, QueryRequest};
use crate::error::RemoteError;
use crate::event::{ChangeEvent, ID_FIELD, Record, RecordId, SubscriptionMessage};

/// Shared in-memory backend. Clones share the same tables and subscribers.
///
/// # Examples
///
/// ```
/// use livecollection::MemoryBackend;
/// use serde_json::json;
///
/// let backend = MemoryBackend::new();
/// backend.seed("orders", [json!({"id": 1, "status": "pending"})]);
/// assert_eq!(backend.records("orders").len(), 1);
/// ```
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    /// Number of queries issued so far.
    queries: watch::Sender<usize>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Record>>,
    next_id: i64,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    delivery: Delivery,
    query_failures: VecDeque<RemoteError>,
    subscribe_failures: VecDeque<RemoteError>,
    mutation_failures: VecDeque<RemoteError>,
    gate: Option<watch::Receiver<bool>>,
    withhold_acks: bool,
    last_query: Option<QueryRequest>,
}

struct Subscriber {
    identity: CollectionIdentity,
    tx: mpsc::UnboundedSender<SubscriptionMessage>,
}

/// A committed row change, before it is matched against subscriber filters.
struct RowChange {
    table: String,
    before: Option<Record>,
    after: Option<Record>,
}

#[derive(Default)]
enum Delivery {
    #[default]
    Live,
    /// Changes are queued until delivery resumes.
    Paused(Vec<RowChange>),
    /// Changes are committed but never delivered.
    Dropping,
}

/// Holds back every query issued while it is alive. Queries snapshot their
/// result when issued and return it once the gate is released (or dropped).
pub struct QueryGate {
    backend: MemoryBackend,
    open: watch::Sender<bool>,
}

impl QueryGate {
    /// Let held queries complete.
    pub fn release(self) {
        self.backend.lock().gate = None;
        let _ = self.open.send(true);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                queries: watch::channel(0).0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add rows to `table` without notifying subscribers.
    ///
    /// Values that are not JSON objects are skipped.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = serde_json::Value>) {
        let mut state = self.lock();
        let mut max_id = state.next_id;
        let records: Vec<Record> = rows
            .into_iter()
            .filter_map(|value| Record::try_from(value).ok())
            .inspect(|record| {
                if let Some(RecordId::Int(id)) = record.id() {
                    max_id = max_id.max(id);
                }
            })
            .collect();
        state.next_id = max_id;
        state
            .tables
            .entry(table.to_owned())
            .or_default()
            .extend(records);
    }

    /// Every row of `table`, in commit order.
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// The most recent query issued against this backend.
    pub fn last_query(&self) -> Option<QueryRequest> {
        self.lock().last_query.clone()
    }

    /// Hold every query issued from now on until the returned gate is
    /// released.
    pub fn hold_queries(&self) -> QueryGate {
        let (open, rx) = watch::channel(false);
        self.lock().gate = Some(rx);
        QueryGate {
            backend: self.clone(),
            open,
        }
    }

    /// Wait until at least `count` queries have been issued in total.
    pub async fn wait_for_queries(&self, count: usize) {
        let mut rx = self.shared.queries.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|issued| *issued >= count).await;
    }

    /// Number of queries issued so far.
    pub fn query_count(&self) -> usize {
        *self.shared.queries.borrow()
    }

    /// Make the next query fail with `error`.
    pub fn fail_next_query(&self, error: RemoteError) {
        self.lock().query_failures.push_back(error);
    }

    /// Make the next subscription attempt fail with `error`.
    pub fn fail_next_subscribe(&self, error: RemoteError) {
        self.lock().subscribe_failures.push_back(error);
    }

    /// Make the next insert, update or delete fail with `error`.
    pub fn fail_next_mutation(&self, error: RemoteError) {
        self.lock().mutation_failures.push_back(error);
    }

    /// Queue change delivery until [`resume_delivery`](Self::resume_delivery).
    pub fn pause_delivery(&self) {
        let mut state = self.lock();
        if !matches!(state.delivery, Delivery::Paused(_)) {
            state.delivery = Delivery::Paused(Vec::new());
        }
    }

    /// Discard changes instead of delivering them, as a lossy network would.
    pub fn drop_delivery(&self) {
        self.lock().delivery = Delivery::Dropping;
    }

    /// Deliver anything queued while paused, then go back to live delivery.
    pub fn resume_delivery(&self) {
        let mut state = self.lock();
        if let Delivery::Paused(queued) = std::mem::take(&mut state.delivery) {
            for change in &queued {
                state.fan_out(change);
            }
        }
    }

    /// Do not acknowledge new subscriptions until
    /// [`acknowledge_subscriptions`](Self::acknowledge_subscriptions).
    pub fn withhold_acks(&self, withhold: bool) {
        self.lock().withhold_acks = withhold;
    }

    /// Send the connection acknowledgement to every open subscription.
    pub fn acknowledge_subscriptions(&self) {
        for subscriber in self.lock().subscribers.values() {
            let _ = subscriber.tx.send(SubscriptionMessage::Subscribed);
        }
    }

    /// Fail every open subscription with `error` and forget it.
    pub fn interrupt_subscriptions(&self, error: RemoteError) {
        let mut state = self.lock();
        for (_, subscriber) in state.subscribers.drain() {
            let _ = subscriber
                .tx
                .send(SubscriptionMessage::Failed(error.clone()));
        }
    }

    /// Close every open subscription without an error.
    pub fn close_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Identities of the open subscriptions.
    pub fn subscribed_identities(&self) -> Vec<CollectionIdentity> {
        self.lock()
            .subscribers
            .values()
            .map(|s| s.identity.clone())
            .collect()
    }
}

impl State {
    fn commit(&mut self, change: RowChange) {
        match &mut self.delivery {
            Delivery::Live => self.fan_out(&change),
            Delivery::Paused(queued) => queued.push(change),
            Delivery::Dropping => {}
        }
    }

    /// Translate a row change into the event each subscriber's filter sees.
    /// A row moving out of a filter is a delete for that subscriber; a row
    /// moving in is an insert.
    fn fan_out(&self, change: &RowChange) {
        for subscriber in self.subscribers.values() {
            if subscriber.identity.table != change.table {
                continue;
            }
            let filter = &subscriber.identity.filter;
            let before = change.before.as_ref().filter(|r| filter.matches(r));
            let after = change.after.as_ref().filter(|r| filter.matches(r));
            let event = match (before, after) {
                (Some(previous), Some(record)) => ChangeEvent::Update {
                    record: record.clone(),
                    previous: Some(previous.clone()),
                },
                (None, Some(record)) => ChangeEvent::Insert {
                    record: record.clone(),
                },
                (Some(previous), None) => ChangeEvent::Delete {
                    previous: previous.clone(),
                },
                (None, None) => continue,
            };
            let _ = subscriber.tx.send(SubscriptionMessage::Change(event));
        }
    }

    fn position(&self, table: &str, id: &RecordId) -> Option<usize> {
        self.tables
            .get(table)?
            .iter()
            .position(|r| r.id().as_ref() == Some(id))
    }
}

impl RemoteCollectionClient for MemoryBackend {
    fn query<'a>(
        &'a self,
        request: &'a QueryRequest,
    ) -> BoxFuture<'a, Result<Vec<Record>, RemoteError>> {
        Box::pin(async move {
            // The result is fixed when the query is issued, like a snapshot
            // read; a held query returns it late.
            let (result, gate) = {
                let mut state = self.lock();
                state.last_query = Some(request.clone());
                let result = match state.query_failures.pop_front() {
                    Some(error) => Err(error),
                    None => {
                        let filter = &request.identity.filter;
                        let mut rows: Vec<Record> = state
                            .tables
                            .get(&request.identity.table)
                            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
                            .unwrap_or_default();
                        rows.sort_by(|a, b| request.order.compare(a, b));
                        Ok(rows)
                    }
                };
                (result, state.gate.clone())
            };
            self.shared.queries.send_modify(|issued| *issued += 1);

            if let Some(mut gate) = gate {
                let _ = gate.wait_for(|open| *open).await;
            }
            result
        })
    }

    fn insert<'a>(
        &'a self,
        table: &'a str,
        payload: Record,
        _select: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Record, RemoteError>> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.mutation_failures.pop_front() {
                return Err(error);
            }
            let mut record = payload;
            let id = match record.id() {
                Some(id) => id,
                None => {
                    state.next_id += 1;
                    record.insert(ID_FIELD, state.next_id);
                    RecordId::Int(state.next_id)
                }
            };
            if state.position(table, &id).is_some() {
                return Err(RemoteError::new(
                    409,
                    format!("duplicate key value violates unique constraint on `{table}.id`"),
                ));
            }
            if let RecordId::Int(n) = id {
                state.next_id = state.next_id.max(n);
            }
            state
                .tables
                .entry(table.to_owned())
                .or_default()
                .push(record.clone());
            state.commit(RowChange {
                table: table.to_owned(),
                before: None,
                after: Some(record.clone()),
            });
            Ok(record)
        })
    }

    fn update<'a>(
        &'a self,
        table: &'a str,
        id: &'a RecordId,
        patch: Record,
        _select: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Record, RemoteError>> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.mutation_failures.pop_front() {
                return Err(error);
            }
            let Some(index) = state.position(table, id) else {
                return Err(RemoteError::not_found(format!("no row in `{table}` with id {id}")));
            };
            let Some(row) = state.tables.get_mut(table).and_then(|rows| rows.get_mut(index)) else {
                return Err(RemoteError::not_found(format!("no row in `{table}` with id {id}")));
            };
            let before = row.clone();
            row.merge(&patch);
            // The key is immutable.
            row.insert(ID_FIELD, id.to_value());
            let after = row.clone();
            state.commit(RowChange {
                table: table.to_owned(),
                before: Some(before),
                after: Some(after.clone()),
            });
            Ok(after)
        })
    }

    fn delete<'a>(
        &'a self,
        table: &'a str,
        id: &'a RecordId,
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.mutation_failures.pop_front() {
                return Err(error);
            }
            let Some(index) = state.position(table, id) else {
                return Ok(());
            };
            let Some(removed) = state.tables.get_mut(table).map(|rows| rows.remove(index)) else {
                return Ok(());
            };
            state.commit(RowChange {
                table: table.to_owned(),
                before: Some(removed),
                after: None,
            });
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        identity: &'a CollectionIdentity,
    ) -> BoxFuture<'a, Result<Subscription, RemoteError>> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.subscribe_failures.pop_front() {
                return Err(error);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            if !state.withhold_acks {
                let _ = tx.send(SubscriptionMessage::Subscribed);
            }
            let id = SubscriptionId::new();
            state.subscribers.insert(
                id,
                Subscriber {
                    identity: identity.clone(),
                    tx,
                },
            );
            Ok(Subscription {
                id,
                messages: Box::pin(UnboundedReceiverStream::new(rx)),
            })
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.lock().subscribers.remove(&id);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::collection::{Filter, OrderSpec};

    fn rec(value: serde_json::Value) -> Record {
        Record::try_from(value).expect("test record should be an object")
    }

    fn request(table: &str, filter: Filter, order: OrderSpec) -> QueryRequest {
        QueryRequest {
            identity: CollectionIdentity::new(table, filter),
            order,
            select: None,
        }
    }

    async fn next_message(sub: &mut Subscription) -> SubscriptionMessage {
        tokio::time::timeout(Duration::from_secs(1), sub.messages.next())
            .await
            .expect("message should arrive in time")
            .expect("stream should be open")
    }

    #[tokio::test]
    async fn query_filters_and_orders() {
        let backend = MemoryBackend::new();
        backend.seed(
            "orders",
            [
                json!({"id": 1, "status": "pending", "order_date": "2024-01-01"}),
                json!({"id": 2, "status": "shipped", "order_date": "2024-01-02"}),
                json!({"id": 3, "status": "pending", "order_date": "2024-01-03"}),
            ],
        );
        let rows = backend
            .query(&request(
                "orders",
                Filter::new().eq("status", "pending"),
                OrderSpec::descending("order_date"),
            ))
            .await
            .expect("query should succeed");
        let ids: Vec<_> = rows.iter().filter_map(Record::id).collect();
        assert_eq!(ids, vec![RecordId::Int(3), RecordId::Int(1)]);
    }

    #[tokio::test]
    async fn query_of_unknown_table_is_empty() {
        let backend = MemoryBackend::new();
        let rows = backend
            .query(&request("nope", Filter::new(), OrderSpec::default()))
            .await
            .expect("query should succeed");
        assert!(rows.is_empty());
        assert_eq!(backend.query_count(), 1);
    }

    #[tokio::test]
    async fn injected_query_failure_is_returned_once() {
        let backend = MemoryBackend::new();
        backend.fail_next_query(RemoteError::unavailable("down"));
        let req = request("orders", Filter::new(), OrderSpec::default());
        let err = backend.query(&req).await.expect_err("first query fails");
        assert_eq!(err.status, 503);
        backend.query(&req).await.expect("second query succeeds");
    }

    #[tokio::test]
    async fn subscription_is_acknowledged_then_receives_matching_changes() {
        let backend = MemoryBackend::new();
        let identity = CollectionIdentity::new("orders", Filter::new().eq("status", "pending"));
        let mut sub = backend.subscribe(&identity).await.expect("subscribe");
        assert_eq!(next_message(&mut sub).await, SubscriptionMessage::Subscribed);

        backend
            .insert("orders", rec(json!({"status": "shipped"})), None)
            .await
            .expect("insert non-matching");
        let stored = backend
            .insert("orders", rec(json!({"status": "pending"})), None)
            .await
            .expect("insert matching");
        assert_eq!(stored.id(), Some(RecordId::Int(2)));

        assert_eq!(
            next_message(&mut sub).await,
            SubscriptionMessage::Change(ChangeEvent::Insert { record: stored })
        );
    }

    #[tokio::test]
    async fn update_leaving_filter_is_delivered_as_delete() {
        let backend = MemoryBackend::new();
        backend.seed("orders", [json!({"id": 7, "status": "pending"})]);
        let identity = CollectionIdentity::new("orders", Filter::new().eq("status", "pending"));
        let mut sub = backend.subscribe(&identity).await.expect("subscribe");
        next_message(&mut sub).await;

        backend
            .update("orders", &RecordId::Int(7), rec(json!({"status": "shipped"})), None)
            .await
            .expect("update");
        assert_eq!(
            next_message(&mut sub).await,
            SubscriptionMessage::Change(ChangeEvent::Delete {
                previous: rec(json!({"id": 7, "status": "pending"})),
            })
        );
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend
            .update("orders", &RecordId::Int(1), Record::default(), None)
            .await
            .expect_err("missing row");
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let backend = MemoryBackend::new();
        backend.seed("orders", [json!({"id": 1})]);
        let err = backend
            .insert("orders", rec(json!({"id": 1})), None)
            .await
            .expect_err("duplicate id");
        assert_eq!(err.status, 409);
        // Seeded ids advance the generator.
        let next = backend
            .insert("orders", Record::default(), None)
            .await
            .expect("generated id");
        assert_eq!(next.id(), Some(RecordId::Int(2)));
    }

    #[tokio::test]
    async fn paused_delivery_is_flushed_in_order() {
        let backend = MemoryBackend::new();
        let identity = CollectionIdentity::new("notes", Filter::new());
        let mut sub = backend.subscribe(&identity).await.expect("subscribe");
        next_message(&mut sub).await;

        backend.pause_delivery();
        backend.insert("notes", rec(json!({"id": 1})), None).await.expect("insert");
        backend.delete("notes", &RecordId::Int(1)).await.expect("delete");
        let early = tokio::time::timeout(Duration::from_millis(20), sub.messages.next()).await;
        assert!(early.is_err(), "nothing delivered while paused");

        backend.resume_delivery();
        assert!(matches!(
            next_message(&mut sub).await,
            SubscriptionMessage::Change(ChangeEvent::Insert { .. })
        ));
        assert!(matches!(
            next_message(&mut sub).await,
            SubscriptionMessage::Change(ChangeEvent::Delete { .. })
        ));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_ends_stream() {
        let backend = MemoryBackend::new();
        let identity = CollectionIdentity::new("notes", Filter::new());
        let mut sub = backend.subscribe(&identity).await.expect("subscribe");
        assert_eq!(backend.subscriber_count(), 1);

        backend.unsubscribe(sub.id).await;
        backend.unsubscribe(sub.id).await;
        assert_eq!(backend.subscriber_count(), 0);

        assert_eq!(next_message(&mut sub).await, SubscriptionMessage::Subscribed);
        assert_eq!(sub.messages.next().await, None);
    }

    #[tokio::test]
    async fn held_query_returns_snapshot_from_issue_time() {
        let backend = MemoryBackend::new();
        backend.seed("notes", [json!({"id": 1})]);
        let gate = backend.hold_queries();

        let query_backend = backend.clone();
        let pending = tokio::spawn(async move {
            let req = request("notes", Filter::new(), OrderSpec::default());
            query_backend.query(&req).await
        });
        backend.wait_for_queries(1).await;
        backend.delete("notes", &RecordId::Int(1)).await.expect("delete");
        gate.release();

        let rows = pending
            .await
            .expect("query task should not panic")
            .expect("query should succeed");
        assert_eq!(rows.len(), 1, "held query still sees the deleted row");
    }
}
