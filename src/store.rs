//! The in-memory ordered view of one collection identity.
//!
//! [`LocalCollectionStore`] holds the canonical snapshot and applies change
//! events to it. It never fails: records it cannot use (no `id`) are logged
//! and skipped.
//!
//! # Load/event merge
//!
//! A query and the live subscription race each other. Events are applied
//! the moment they arrive, even while a load is in flight, so the store
//! remembers which ids events touched between [`begin_load`] and
//! [`replace_all`]:
//!
//! - an id deleted during the load is dropped from the load result (a slow
//!   query must not resurrect a deleted row);
//! - an id inserted or updated during the load keeps the event version (the
//!   event is newer than the query snapshot);
//! - every other id takes the load result, and rows the load no longer
//!   returns are removed.
//!
//! [`begin_load`]: LocalCollectionStore::begin_load
//! [`replace_all`]: LocalCollectionStore::replace_all

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;

use crate::collection::OrderSpec;
use crate::event::{ChangeEvent, Record, RecordId};

/// Immutable, cheaply cloneable view of the ordered records.
pub type Snapshot = Arc<[Record]>;

/// What a change event did to an id while a load was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Upserted,
    Deleted,
}

/// Ordered, id-unique list of records for one collection identity.
#[derive(Debug)]
pub struct LocalCollectionStore {
    order: OrderSpec,
    records: Vec<Record>,
    /// `Some` between `begin_load` and `replace_all`/`cancel_load`.
    in_flight: Option<HashMap<RecordId, Touch>>,
    notifier: watch::Sender<Snapshot>,
}

impl LocalCollectionStore {
    /// Create an empty store sorted by `order`.
    pub fn new(order: OrderSpec) -> Self {
        let (notifier, _) = watch::channel(Snapshot::from(Vec::new()));
        Self {
            order,
            records: Vec::new(),
            in_flight: None,
            notifier,
        }
    }

    pub fn order(&self) -> &OrderSpec {
        &self.order
    }

    /// Current ordered records.
    pub fn snapshot(&self) -> Snapshot {
        self.notifier.borrow().clone()
    }

    /// Receiver notified with a fresh snapshot after every mutation.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.notifier.subscribe()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.position(id).map(|i| &self.records[i])
    }

    /// Returns `true` while a load started by [`begin_load`](Self::begin_load)
    /// has not resolved.
    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Mark the start of a load. Events applied from now until
    /// [`replace_all`](Self::replace_all) take precedence over the load
    /// result. Calling it again restarts tracking.
    pub fn begin_load(&mut self) {
        self.in_flight = Some(HashMap::new());
    }

    /// Stop tracking after a failed load. Data is left untouched.
    pub fn cancel_load(&mut self) {
        self.in_flight = None;
    }

    /// Merge a load result into the store.
    ///
    /// Without a preceding [`begin_load`](Self::begin_load) this is a plain
    /// replacement. Duplicate ids within `records` keep the first
    /// occurrence.
    pub fn replace_all(&mut self, records: Vec<Record>) {
        let touched = self.in_flight.take().unwrap_or_default();
        let mut seen = HashSet::with_capacity(records.len());
        let mut merged = Vec::with_capacity(records.len());

        for record in records {
            let Some(id) = record.id() else {
                tracing::warn!("load returned a record without an id, skipping");
                continue;
            };
            if touched.contains_key(&id) || !seen.insert(id) {
                continue;
            }
            merged.push(record);
        }

        for record in self.records.drain(..) {
            if let Some(id) = record.id()
                && touched.get(&id) == Some(&Touch::Upserted)
            {
                merged.push(record);
            }
        }

        let dropped = touched.values().filter(|t| **t == Touch::Deleted).count();
        tracing::debug!(
            loaded = merged.len(),
            deleted_during_load = dropped,
            "load merged"
        );

        self.records = merged;
        self.records.sort_by(|a, b| self.order.compare(a, b));
        self.publish();
    }

    /// Insert `record`, replacing any entry with the same id.
    ///
    /// Returns the replaced entry, if any.
    pub fn apply_insert(&mut self, record: Record) -> Option<Record> {
        self.upsert(record)
    }

    /// Update `record`. An unknown id is appended, so an update that
    /// outruns its insert (or the initial load) still lands.
    ///
    /// Returns the replaced entry, if any.
    pub fn apply_update(&mut self, record: Record) -> Option<Record> {
        self.upsert(record)
    }

    /// Remove the entry with `id`. Unknown ids are a no-op.
    ///
    /// Returns the removed entry, if any.
    pub fn apply_delete(&mut self, id: &RecordId) -> Option<Record> {
        if let Some(touched) = self.in_flight.as_mut() {
            touched.insert(id.clone(), Touch::Deleted);
        }
        let removed = self.position(id).map(|i| self.records.remove(i));
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    /// Apply one change event.
    pub fn apply(&mut self, event: &ChangeEvent) {
        match event {
            ChangeEvent::Insert { record } => {
                self.apply_insert(record.clone());
            }
            ChangeEvent::Update { record, .. } => {
                self.apply_update(record.clone());
            }
            ChangeEvent::Delete { previous } => match previous.id() {
                Some(id) => {
                    self.apply_delete(&id);
                }
                None => tracing::warn!("delete event without an id, skipping"),
            },
        }
    }

    fn upsert(&mut self, record: Record) -> Option<Record> {
        let Some(id) = record.id() else {
            tracing::warn!("change event record without an id, skipping");
            return None;
        };
        let replaced = match self.position(&id) {
            Some(i) => Some(std::mem::replace(&mut self.records[i], record)),
            None => {
                self.records.push(record);
                None
            }
        };
        if let Some(touched) = self.in_flight.as_mut() {
            touched.insert(id, Touch::Upserted);
        }
        // Stable: equal keys keep their relative order.
        self.records.sort_by(|a, b| self.order.compare(a, b));
        self.publish();
        replaced
    }

    fn position(&self, id: &RecordId) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.id().as_ref() == Some(id))
    }

    fn publish(&self) {
        self.notifier.send_replace(Snapshot::from(self.records.clone()));
    }
}
