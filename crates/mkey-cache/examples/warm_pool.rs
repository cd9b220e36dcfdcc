//! Drives a key cache against the in-memory mock backend.
//!
//! Real deployments implement `CommandBackend` on top of the adapter's
//! command interface; the mock stands in here so the pool mechanics can
//! be watched without hardware.

use std::sync::Arc;
use std::time::Duration;

use mkey_cache::test_utils::MockBackend;
use mkey_cache::{CacheConfig, KeyCache};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Memory-registration key cache ===\n");

    let backend = Arc::new(MockBackend::new());
    let config = CacheConfig::new()
        .with_min_order(12)
        .with_uniform_limit(4, 4);
    let cache = KeyCache::new(backend.clone(), config)?;

    // Give the background fill a moment to reach the high-water marks.
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("1. After the initial fill:");
    for entry in cache.stats().entries {
        println!(
            "   order {:>2}: cur={:<2} idle={:<2} (limit {})",
            entry.order, entry.cur, entry.idle, entry.limit
        );
    }

    println!("\n2. Checkout and release:");
    let key = cache.get(12).ok_or("pool should be warm")?;
    println!("   Checked out {} for order {}", key.handle(), key.order());
    cache.put(key).await;

    println!("\n3. Shrinking order 12 to limit 1 and trimming immediately:");
    cache.resize_limit(12, 1).await?;
    cache.set_rel_imm(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("   Order 12 now holds {} key(s)", cache.cur(12)?);

    let stats = cache.stats();
    println!("\n4. Lifetime counters:");
    println!(
        "   created={} destroyed={} checkouts={} misses={} hit rate {:.2}",
        stats.created,
        stats.destroyed,
        stats.checkouts,
        stats.misses,
        stats.hit_rate()
    );

    cache.shutdown().await;
    println!(
        "\nCache stopped, {} destroy command(s) issued in total",
        backend.destroys()
    );
    Ok(())
}
