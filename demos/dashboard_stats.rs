//! Dashboard statistics served through the fetch cache.

use fetch_kit::{
    key::CacheKeyBuilder, Error, FetchOptions, Optimistic, QueryClient, Result,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mock stats API that fails its first request.
#[derive(Clone, Default)]
struct StatsApi {
    requests: Arc<AtomicU32>,
}

impl StatsApi {
    async fn dashboard_stats(&self, tenant: &str) -> Result<Value> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        println!("  [API] GET /tenants/{}/stats (request #{})", tenant, n);
        tokio::time::sleep(Duration::from_millis(20)).await;

        if n == 1 {
            return Err(Error::fetch("503 Service Unavailable"));
        }

        Ok(json!({
            "leads": 120 + n,
            "calls_today": 37,
            "whatsapp_followups": 12,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== fetch-kit - Dashboard Example ===\n");

    let client = QueryClient::new().with_options(
        FetchOptions::default()
            .with_stale_time(Duration::from_millis(200))
            .with_retry_delay(Duration::from_millis(100)),
    );
    let api = StatsApi::default();
    let key = CacheKeyBuilder::build("tenant-42", "dashboard-stats");

    let fetch_stats = {
        let api = api.clone();
        move || {
            let api = api.clone();
            async move { api.dashboard_stats("tenant-42").await }
        }
    };

    // 1. Cache miss: first request fails, the retry succeeds
    println!("1. Mounting the stats view (cache miss):");
    let view = client.query(&*key, fetch_stats.clone())?;
    let state = view.settled().await;
    println!("   ✓ Loaded {:?} (error: {:?})\n", state.data, state.error);

    // 2. Second view within stale_time: served from cache
    println!("2. Mounting a second view (fresh hit):");
    let sidebar = client.query::<Value, _>(&*key, fetch_stats.clone())?;
    println!(
        "   ✓ Immediate data {:?}, loading: {}\n",
        sidebar.data(),
        sidebar.is_loading()
    );

    // 3. After stale_time: cached data shown while revalidating
    tokio::time::sleep(Duration::from_millis(250)).await;
    println!("3. Mounting after stale_time (stale-while-revalidate):");
    let report = client.query::<Value, _>(&*key, fetch_stats.clone())?;
    println!(
        "   Showing {:?} (stale: {}, loading: {})",
        report.data(),
        report.is_stale(),
        report.is_loading()
    );
    let state = report.settled().await;
    println!("   ✓ Revalidated to {:?}\n", state.data);

    // 4. Forced refresh
    println!("4. Forced refetch:");
    let fresh = view.refetch(true).await?;
    println!("   ✓ {:?}\n", fresh);

    // 5. Optimistic settings update with rollback
    println!("5. Optimistic update rejected by the server:");
    let settings = Optimistic::new(json!({"voice": "nova"}), |_candidate: Value| async {
        Err::<Value, _>(Error::fetch("422 voice not available"))
    });
    let _ = settings.update(json!({"voice": "alloy"})).await;
    println!(
        "   ✓ Rolled back to {} (error: {:?})\n",
        settings.data(),
        settings.error()
    );

    // 6. Logout
    println!("6. Logout clears the tenant's cache:");
    client.invalidate_namespace("tenant-42");
    println!("   ✓ Store stats: {}\n", serde_json::to_string(&client.stats())?);

    println!("=== Example Complete ===\n");

    Ok(())
}
