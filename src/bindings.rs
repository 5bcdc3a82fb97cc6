//! Ready-made collection configurations for the storefront's screens.
//!
//! Each function only builds a [`CollectionConfig`]; open it with
//! [`open_binding`] (or [`SyncedCollection::open`] directly).

use std::sync::Arc;

use crate::client::RemoteCollectionClient;
use crate::collection::{CollectionConfig, Filter, OrderSpec};
use crate::handle::SyncedCollection;

/// Expansion for order lists: the customer's profile, the store, and the
/// number of line items.
pub const ORDERS_SELECT: &str =
    "*, customer:profiles!customer_id(full_name, phone), store:stores(name, logo_url), order_items(count)";

/// Expansion for reviews: the reviewer's public profile.
pub const REVIEWS_SELECT: &str = "*, reviewer:profiles!customer_id(full_name, avatar_url)";

/// Expansion for commission records: the order they were charged on.
pub const COMMISSION_SELECT: &str = "*, order:orders(order_number, total_amount, created_at)";

/// A user's notifications, newest first.
///
/// Disabled until `user_id` is known.
pub fn notifications_for_user(user_id: Option<&str>) -> CollectionConfig {
    CollectionConfig::new("notifications")
        .filter(Filter::new().eq_opt("user_id", user_id))
        .enabled(user_id.is_some())
}

/// Which orders an order list shows. Unset fields do not constrain.
///
/// # Examples
///
/// ```
/// use livecollection::bindings::{OrderScope, orders};
///
/// let config = orders(OrderScope::for_store("s-1").with_status("pending"));
/// assert_eq!(
///     config.identity().to_string(),
///     "orders:status=eq.pending,store_id=eq.s-1"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderScope {
    pub customer_id: Option<String>,
    pub store_id: Option<String>,
    pub status: Option<String>,
}

impl OrderScope {
    /// Orders placed by one customer.
    pub fn for_customer(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            ..Self::default()
        }
    }

    /// Orders received by one store.
    pub fn for_store(store_id: impl Into<String>) -> Self {
        Self {
            store_id: Some(store_id.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// Orders in `scope`, newest first, with customer, store and item count.
pub fn orders(scope: OrderScope) -> CollectionConfig {
    let filter = Filter::new()
        .eq_opt("customer_id", scope.customer_id)
        .eq_opt("store_id", scope.store_id)
        .eq_opt("status", scope.status);
    CollectionConfig::new("orders")
        .filter(filter)
        .select(ORDERS_SELECT)
}

/// Reviews of one store, newest first, with the reviewer's profile.
///
/// Disabled until `store_id` is known.
pub fn reviews_for_store(store_id: Option<&str>) -> CollectionConfig {
    CollectionConfig::new("reviews")
        .filter(Filter::new().eq_opt("store_id", store_id))
        .select(REVIEWS_SELECT)
        .enabled(store_id.is_some())
}

/// Commission records of one store, or of every store when `store_id` is
/// `None` (the admin view).
pub fn commission_records(store_id: Option<&str>) -> CollectionConfig {
    CollectionConfig::new("commission_records")
        .filter(Filter::new().eq_opt("store_id", store_id))
        .order(OrderSpec::descending("created_at"))
        .select(COMMISSION_SELECT)
}

/// Open a handle for one of the configurations above.
pub fn open_binding(
    client: Arc<dyn RemoteCollectionClient>,
    config: CollectionConfig,
) -> SyncedCollection {
    SyncedCollection::open(client, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::DEFAULT_ORDER_FIELD;

    #[test]
    fn notifications_wait_for_user() {
        let config = notifications_for_user(None);
        assert!(!config.enabled);
        assert!(config.filter.is_empty());

        let config = notifications_for_user(Some("u-1"));
        assert!(config.enabled);
        assert_eq!(config.identity().to_string(), "notifications:user_id=eq.u-1");
        assert_eq!(config.order, OrderSpec::descending(DEFAULT_ORDER_FIELD));
        assert_eq!(config.select, None);
    }

    #[test]
    fn orders_filter_on_set_scope_fields_only() {
        let config = orders(OrderScope::for_customer("c-9"));
        assert_eq!(config.identity().to_string(), "orders:customer_id=eq.c-9");
        assert_eq!(config.select.as_deref(), Some(ORDERS_SELECT));
        assert!(config.enabled);

        let everything = orders(OrderScope::default());
        assert!(everything.filter.is_empty());
    }

    #[test]
    fn different_scopes_are_different_identities() {
        let a = orders(OrderScope::for_store("s-1"));
        let b = orders(OrderScope::for_store("s-1").with_status("pending"));
        assert_ne!(a.identity(), b.identity());
        assert_ne!(a.identity().channel_id(), b.identity().channel_id());
    }

    #[test]
    fn reviews_wait_for_store() {
        assert!(!reviews_for_store(None).enabled);
        let config = reviews_for_store(Some("s-2"));
        assert!(config.enabled);
        assert_eq!(config.identity().to_string(), "reviews:store_id=eq.s-2");
        assert_eq!(config.select.as_deref(), Some(REVIEWS_SELECT));
    }

    #[test]
    fn commission_records_global_without_store() {
        let global = commission_records(None);
        assert!(global.enabled);
        assert!(global.filter.is_empty());
        assert_eq!(global.identity().to_string(), "commission_records:");

        let scoped = commission_records(Some("s-3"));
        assert_eq!(
            scoped.identity().to_string(),
            "commission_records:store_id=eq.s-3"
        );
    }
}
