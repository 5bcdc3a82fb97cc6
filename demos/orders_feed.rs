//! A store owner's pending-orders feed kept live against an in-process
//! backend.
//!
//! Run with: `cargo run --example orders_feed`

use std::sync::Arc;

use livecollection::bindings::{OrderScope, open_binding, orders};
use livecollection::{CollectionState, MemoryBackend, Record, RecordId, RemoteCollectionClient};
use serde_json::json;

fn summary(state: &CollectionState) -> String {
    let ids: Vec<String> = state
        .data
        .iter()
        .filter_map(Record::id)
        .map(|id| id.to_string())
        .collect();
    format!(
        "[{}] loading={} status={:?}",
        ids.join(", "),
        state.loading,
        state.status
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let backend = MemoryBackend::new();
    backend.seed(
        "orders",
        [
            json!({"id": 1, "store_id": "s-1", "status": "pending", "created_at": "2024-05-01T09:00:00Z"}),
            json!({"id": 2, "store_id": "s-1", "status": "delivered", "created_at": "2024-05-01T09:30:00Z"}),
            json!({"id": 3, "store_id": "s-2", "status": "pending", "created_at": "2024-05-01T10:00:00Z"}),
        ],
    );

    let mut feed = open_binding(
        Arc::new(backend.clone()),
        orders(OrderScope::for_store("s-1").with_status("pending")),
    );
    let mut changes = feed.watch();

    let printer = tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            println!("feed: {}", summary(&changes.borrow_and_update()));
        }
    });

    feed.wait_for(|s| !s.loading).await;

    // A customer places an order; it reaches the feed through the
    // subscription, not through the insert call.
    backend
        .insert(
            "orders",
            Record::try_from(json!({
                "store_id": "s-1",
                "status": "pending",
                "created_at": "2024-05-01T11:00:00Z"
            }))?,
            None,
        )
        .await?;
    feed.wait_for(|s| s.data.len() == 2).await;

    // The store accepts order 1, which moves it out of the pending feed.
    feed.update(&RecordId::Int(1), Record::try_from(json!({"status": "accepted"}))?)
        .await?;
    feed.wait_for(|s| s.data.len() == 1).await;

    feed.close().await;
    printer.await?;
    println!("final: {}", summary(&feed.state()));
    Ok(())
}
