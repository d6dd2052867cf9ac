use std::env;
use std::time::Instant;

use pagekv::{Config, KVStore};

/// Deterministic filler so runs are comparable.
fn drop_value(i: usize, size: usize) -> Vec<u8> {
    (0..size).map(|j| b'a' + ((i * 31 + j * 7) % 26) as u8).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("\n🌊 RESERVOIR MECHANICS SIMULATION (The Flood) 🌊");
    println!("==================================================");

    // 1. Initialize Connection
    let config = Config::from_env()?;
    let total_drops: usize = match env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 1000,
    };
    let drop_size = 1024; // 1KB per value

    println!("▶ Connecting to storage...");
    let store = KVStore::from_config(config).await?;
    println!("✓ Connected.\n");

    println!("▶ Initiating Inflow: {} drops of {} bytes each...", total_drops, drop_size);

    let start = Instant::now();

    // 2. Pump Water
    for i in 0..total_drops {
        let key = format!("drop:{}", i);
        store.set(&key, drop_value(i, drop_size)).await?;

        if (i + 1) % 100 == 0 {
            let stats = store.stats();
            println!(
                "  💧 Level: {} keys | Reservoir: {}/{} MB used | {} dirty | WAL Height: {}",
                i + 1,
                stats.buffer_pool_used_mb,
                stats.buffer_pool_total_mb,
                stats.dirty_pages,
                stats.wal_entries
            );
        }
    }

    let duration = start.elapsed();
    println!("\n✅ Flood Complete in {:.2?}", duration);
    println!("   Rate: {:.2} drops/sec", total_drops as f64 / duration.as_secs_f64());

    // 3. Inspect Reservoir State
    let stats = store.stats();
    println!("\n📊 Final Reservoir Status:");
    println!("  • Water Level (Keys): {}", stats.num_keys);
    println!("  • Pressure (WAL):     {} entries", stats.wal_entries);
    println!("  • Retention (Cache):  {}/{} MB", stats.buffer_pool_used_mb, stats.buffer_pool_total_mb);

    // 4. Release Water (Flush), then let the spillway close (Checkpoint)
    println!("\n▶ Opening Spillway (Flushing dirty pages)...");
    store.flush().await?;
    println!("✓ Flushed.");

    store.checkpoint().await?;
    println!("✓ Checkpointed: WAL holds {} entries.", store.stats().wal_entries);

    println!("\n🌊 Simulation Ends. The structure held firm.");

    Ok(())
}
