use std::sync::Arc;

use futures::TryStreamExt;
use pagekv::{backend, Config, KVStore};
use tracing::Level;

fn show(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    println!("\n╔════════════════════════════════════════════════════╗");
    println!("║  PAGEKV - Key-Value Store over Remote Pages        ║");
    println!("╚════════════════════════════════════════════════════╝\n");

    println!("This is a persistent, crash-safe Key-Value Store built on remote block storage.");
    println!("\n📚 Architecture (4 Layers):");
    println!("  1️⃣  BlockStore:  Treats remote storage as a raw page device");
    println!("  2️⃣  BufferPool:  LRU memory management with flush-before-evict");
    println!("  3️⃣  WAL:         Write-Ahead Log for durability and crash recovery");
    println!("  4️⃣  KVStore:     Key-Value store engine on top of the layers");

    let config = Config::from_env()?;
    let collaborators = backend::connect(&config).await?;

    println!("\n🧪 Running Demonstration...\n");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("▶ Initializing KVStore...");
    let store = KVStore::open(
        config.clone(),
        Arc::clone(&collaborators.0),
        Arc::clone(&collaborators.1),
    )
    .await?;
    println!("✓ KVStore initialized\n");

    // Demonstrate SET operations
    println!("▶ Performing SET operations...");
    for (key, value) in [
        ("user:1:name", "Alice"),
        ("user:2:name", "Bob"),
        ("user:3:name", "Charlie"),
    ] {
        store.set(key, value).await?;
        println!("  ✓ SET {} = {}", key, value);
    }
    println!();

    // Demonstrate GET operations
    println!("▶ Performing GET operations...");
    for key in ["user:1:name", "user:2:name", "user:999:name"] {
        match store.get(key).await? {
            Some(value) => println!("  ✓ GET {} = {}", key, show(&value)),
            None => println!("  ✓ GET {} = <not found>", key),
        }
    }
    println!();

    // Demonstrate UPDATE
    println!("▶ Performing UPDATE operation...");
    store.set("user:1:name", "Alice Smith").await?;
    println!("  ✓ UPDATE user:1:name = Alice Smith\n");

    // Demonstrate DELETE
    println!("▶ Performing DELETE operation...");
    let deleted = store.delete("user:3:name").await?;
    println!("  ✓ DELETE user:3:name (deleted: {})\n", deleted);

    // Demonstrate SCAN
    println!("▶ Performing SCAN operation...");
    let entries: Vec<(Vec<u8>, Vec<u8>)> = store.scan()?.try_collect().await?;
    println!("  ✓ Found {} entries:", entries.len());
    for (key, value) in &entries {
        println!("    - {} = {}", show(key), show(value));
    }
    println!();

    // Show statistics
    println!("▶ Store Statistics:");
    let stats = store.stats();
    println!("  • Keys in store: {} ({} tombstones)", stats.num_keys, stats.tombstones);
    println!("  • WAL entries: {} (LSN {})", stats.wal_entries, stats.current_lsn);
    println!(
        "  • Buffer pool: {}/{} frames, {} dirty",
        stats.used_frames, stats.total_frames, stats.dirty_pages
    );
    println!();

    // Simulate a crash: drop the engine without a checkpoint
    println!("▶ Simulating crash (no checkpoint)...");
    drop(store);
    let store = KVStore::open(config.clone(), Arc::clone(&collaborators.0), Arc::clone(&collaborators.1)).await?;
    match store.get("user:1:name").await? {
        Some(value) => println!("  ✓ Recovered user:1:name = {}", show(&value)),
        None => println!("  ✗ user:1:name lost"),
    }
    println!("  ✓ Recovered {} keys from the WAL\n", store.stats().num_keys);

    // Demonstrate checkpoint
    println!("▶ Creating checkpoint...");
    store.checkpoint().await?;
    let stats = store.stats();
    println!(
        "  ✓ Checkpoint complete at LSN {} ({} WAL entries left)\n",
        stats.checkpoint_lsn, stats.wal_entries
    );

    store.shutdown(false).await?;

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("\n✅ All operations completed successfully!");
    println!();

    Ok(())
}
