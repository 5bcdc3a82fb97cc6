//! Collection identity (table + filter), ordering, and handle configuration.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::event::Record;
use crate::live::LiveConfig;

/// Fixed namespace UUID for deterministic channel id derivation.
///
/// Channel ids are UUID v5 values derived from this namespace and
/// `"{table}:{filter_expr}"`, so the same identity always maps to the same
/// channel name regardless of which process computes it.
const CHANNEL_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3f, 0x6b, 0x21, 0xd4, 0x8a, 0x0c, 0x4e, 0x57, 0x9d, 0x12, 0x6e, 0xa4, 0xc0, 0x3b, 0x75, 0x18,
]);

/// Ordering field used when none is configured.
pub const DEFAULT_ORDER_FIELD: &str = "created_at";

/// Equality filter over record fields.
///
/// Fields are kept sorted so that two filters built in a different order
/// compare and render identically. `null` values are never stored: a filter
/// entry whose value is not known yet simply does not constrain the query.
///
/// # Examples
///
/// ```
/// use livecollection::Filter;
///
/// let store_id: Option<&str> = None;
/// let filter = Filter::new().eq("status", "pending").eq_opt("store_id", store_id);
/// assert_eq!(filter.len(), 1);
/// assert_eq!(filter.to_expr(), "status=eq.pending");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter(BTreeMap<String, FilterValue>);

/// A scalar filter value. Wraps a JSON value so it can be hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
struct FilterValue(Value);

impl Eq for FilterValue {}

impl std::hash::Hash for FilterValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}

impl Filter {
    /// An empty filter (matches every record).
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`. A `null` value leaves the filter unchanged.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.0.insert(field.into(), FilterValue(value));
        }
        self
    }

    /// Require `field == value` when `value` is known.
    pub fn eq_opt<V: Into<Value>>(self, field: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.eq(field, v),
            None => self,
        }
    }

    /// The required value for `field`, if constrained.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).map(|v| &v.0)
    }

    /// Iterate `(field, value)` pairs in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), &v.0))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if every constrained field of `record` equals the
    /// filter value.
    pub fn matches(&self, record: &Record) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| record.get(field) == Some(&expected.0))
    }

    /// Render the filter as `field=eq.value` pairs joined by commas.
    pub fn to_expr(&self) -> String {
        self.0
            .iter()
            .map(|(field, value)| match &value.0 {
                Value::String(s) => format!("{field}=eq.{s}"),
                other => format!("{field}=eq.{other}"),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Sort order of a collection view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Field compared between records.
    pub field: String,
    /// `true` for smallest first.
    pub ascending: bool,
}

impl Default for OrderSpec {
    fn default() -> Self {
        Self::descending(DEFAULT_ORDER_FIELD)
    }
}

impl OrderSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }

    /// Compare two records by this spec.
    ///
    /// Missing and `null` keys sort as the largest value, so they come
    /// last when ascending and first when descending, the same placement a
    /// SQL backend gives them by default.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let ord = compare_values(a.get(&self.field), b.get(&self.field));
        if self.ascending { ord } else { ord.reverse() }
    }

    /// Returns `true` if `records` is sorted by this spec.
    pub fn is_sorted(&self, records: &[Record]) -> bool {
        records
            .windows(2)
            .all(|w| self.compare(&w[0], &w[1]) != Ordering::Greater)
    }
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        Some(Value::Bool(_)) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Array(_)) => 3,
        Some(Value::Object(_)) => 4,
        Some(Value::Null) | None => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => compare_numbers(x, y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Exact ordering across integers and floats. Converting a large integer to
/// `f64` rounds it, which would make the order intransitive.
fn compare_numbers(x: &Number, y: &Number) -> Ordering {
    match (integer(x), integer(y)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(x), None) => compare_integer_float(x, float(y)),
        (None, Some(y)) => compare_integer_float(y, float(x)).reverse(),
        (None, None) => float(x).partial_cmp(&float(y)).unwrap_or(Ordering::Equal),
    }
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn float(n: &Number) -> f64 {
    // serde_json numbers are finite.
    n.as_f64().unwrap_or(0.0)
}

fn compare_integer_float(i: i128, f: f64) -> Ordering {
    // 2^64: every i64 and u64 lies strictly between -BOUND and BOUND.
    const BOUND: f64 = 18_446_744_073_709_551_616.0;
    if f >= BOUND {
        return Ordering::Less;
    }
    if f <= -BOUND {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    // Exact: `whole` is integral and inside the i128 range.
    match i.cmp(&(whole as i128)) {
        Ordering::Equal => 0.0_f64
            .partial_cmp(&(f - whole))
            .unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

/// The logical identity of a live view: table plus filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionIdentity {
    pub table: String,
    pub filter: Filter,
}

impl CollectionIdentity {
    pub fn new(table: impl Into<String>, filter: Filter) -> Self {
        Self {
            table: table.into(),
            filter,
        }
    }

    /// Deterministic channel id for this identity.
    ///
    /// # Examples
    ///
    /// ```
    /// use livecollection::{CollectionIdentity, Filter};
    ///
    /// let a = CollectionIdentity::new("orders", Filter::new().eq("status", "pending"));
    /// let b = CollectionIdentity::new("orders", Filter::new().eq("status", "pending"));
    /// assert_eq!(a.channel_id(), b.channel_id());
    /// ```
    pub fn channel_id(&self) -> Uuid {
        Uuid::new_v5(&CHANNEL_NAMESPACE, self.to_string().as_bytes())
    }
}

impl fmt::Display for CollectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.filter.to_expr())
    }
}

/// Everything a backend needs to run the initial query of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub identity: CollectionIdentity,
    pub order: OrderSpec,
    /// Field-expansion clause (joined relations, aggregate counts).
    pub select: Option<String>,
}

/// Configuration of one [`SyncedCollection`](crate::SyncedCollection).
///
/// Two configs that differ in any field describe different views; handing a
/// different config to
/// [`reconfigure`](crate::SyncedCollection::reconfigure) tears the old view
/// down.
///
/// # Examples
///
/// ```
/// use livecollection::{CollectionConfig, OrderSpec};
///
/// let config = CollectionConfig::new("orders")
///     .filter_eq("status", "pending")
///     .order(OrderSpec::descending("order_date"));
/// assert_eq!(config.identity().to_string(), "orders:status=eq.pending");
/// assert!(config.enabled);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionConfig {
    pub table: String,
    pub filter: Filter,
    pub order: OrderSpec,
    pub select: Option<String>,
    /// When `false` the handle neither loads nor subscribes.
    pub enabled: bool,
    pub live: LiveConfig,
}

impl CollectionConfig {
    /// A config for `table` with no filter, default ordering, enabled.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Filter::new(),
            order: OrderSpec::default(),
            select: None,
            enabled: true,
            live: LiveConfig::default(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Add one equality constraint to the filter.
    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = self.filter.eq(field, value);
        self
    }

    pub fn order(mut self, order: OrderSpec) -> Self {
        self.order = order;
        self
    }

    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = Some(select.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn live(mut self, live: LiveConfig) -> Self {
        self.live = live;
        self
    }

    pub fn identity(&self) -> CollectionIdentity {
        CollectionIdentity::new(self.table.clone(), self.filter.clone())
    }

    pub fn query_request(&self) -> QueryRequest {
        QueryRequest {
            identity: self.identity(),
            order: self.order.clone(),
            select: self.select.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        Record::try_from(value).expect("test record should be an object")
    }

    #[test]
    fn mixed_number_ordering_is_transitive() {
        // 2^53 + 1 has no exact f64; it rounds down to 2^53.
        let big_int = json!(9_007_199_254_740_993_i64);
        let float = json!(9_007_199_254_740_992.0_f64);
        let int = json!(9_007_199_254_740_992_i64);

        assert_eq!(compare_values(Some(&big_int), Some(&float)), Ordering::Greater);
        assert_eq!(compare_values(Some(&float), Some(&int)), Ordering::Equal);
        assert_eq!(compare_values(Some(&big_int), Some(&int)), Ordering::Greater);
    }

    #[test]
    fn integers_and_floats_interleave() {
        let cases = [
            (json!(2), json!(2.5), Ordering::Less),
            (json!(-1), json!(-1.5), Ordering::Greater),
            (json!(-2), json!(-1.5), Ordering::Less),
            (json!(0), json!(-0.0), Ordering::Equal),
            (json!(u64::MAX), json!(1.0e20), Ordering::Less),
            (json!(i64::MIN), json!(-1.0e20), Ordering::Greater),
            (json!(u64::MAX), json!(i64::MAX), Ordering::Greater),
        ];
        for (a, b, expected) in cases {
            assert_eq!(compare_values(Some(&a), Some(&b)), expected, "{a} vs {b}");
            assert_eq!(
                compare_values(Some(&b), Some(&a)),
                expected.reverse(),
                "{b} vs {a}"
            );
        }
    }

    #[test]
    fn null_values_are_excluded_from_filters() {
        let f = Filter::new()
            .eq("status", "pending")
            .eq("store_id", Value::Null)
            .eq_opt("customer_id", None::<&str>);
        assert_eq!(f.len(), 1);
        assert_eq!(f.get("store_id"), None);
    }

    #[test]
    fn filter_order_does_not_affect_identity() {
        let a = Filter::new().eq("a", 1).eq("b", "x");
        let b = Filter::new().eq("b", "x").eq("a", 1);
        assert_eq!(a, b);
        assert_eq!(a.to_expr(), "a=eq.1,b=eq.x");
        assert_eq!(
            CollectionIdentity::new("t", a).channel_id(),
            CollectionIdentity::new("t", b).channel_id()
        );
    }

    #[test]
    fn different_filters_give_different_channels() {
        let pending = CollectionIdentity::new("orders", Filter::new().eq("status", "pending"));
        let shipped = CollectionIdentity::new("orders", Filter::new().eq("status", "shipped"));
        assert_ne!(pending.channel_id(), shipped.channel_id());
        assert_ne!(pending, shipped);
    }

    #[test]
    fn filter_matches_on_equality() {
        let f = Filter::new().eq("status", "pending").eq("store_id", 4);
        assert!(f.matches(&rec(json!({"id": 1, "status": "pending", "store_id": 4}))));
        assert!(!f.matches(&rec(json!({"id": 1, "status": "pending", "store_id": 5}))));
        assert!(!f.matches(&rec(json!({"id": 1, "status": "pending"}))));
        assert!(Filter::new().matches(&rec(json!({"id": 1}))));
    }

    #[test]
    fn default_order_is_created_at_descending() {
        let order = OrderSpec::default();
        assert_eq!(order.field, "created_at");
        assert!(!order.ascending);
    }

    #[test]
    fn compare_numbers_and_strings() {
        let asc = OrderSpec::ascending("k");
        assert_eq!(
            asc.compare(&rec(json!({"k": 2})), &rec(json!({"k": 10}))),
            Ordering::Less
        );
        assert_eq!(
            asc.compare(&rec(json!({"k": 1.5})), &rec(json!({"k": 1}))),
            Ordering::Greater
        );
        assert_eq!(
            asc.compare(
                &rec(json!({"k": "2024-01-02T00:00:00Z"})),
                &rec(json!({"k": "2024-01-10T00:00:00Z"}))
            ),
            Ordering::Less
        );
    }

    #[test]
    fn missing_keys_sort_last_ascending_first_descending() {
        let with = rec(json!({"id": 1, "k": 5}));
        let without = rec(json!({"id": 2}));
        assert_eq!(
            OrderSpec::ascending("k").compare(&with, &without),
            Ordering::Less
        );
        assert_eq!(
            OrderSpec::descending("k").compare(&with, &without),
            Ordering::Greater
        );
    }

    #[test]
    fn config_builder_and_query_request() {
        let config = CollectionConfig::new("reviews")
            .filter_eq("store_id", "s-1")
            .select("*, reviewer:profiles(full_name)")
            .enabled(false);
        let request = config.query_request();
        assert_eq!(request.identity.table, "reviews");
        assert_eq!(request.identity.filter.get("store_id"), Some(&json!("s-1")));
        assert_eq!(request.select.as_deref(), Some("*, reviewer:profiles(full_name)"));
        assert_eq!(request.order, OrderSpec::default());
        assert!(!config.enabled);
    }
}
