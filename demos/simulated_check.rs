//! Run a check and a booking change against the simulated booking site
//!
//! Run with: RUST_LOG=slotscout=debug cargo run --example simulated_check

use slotscout::{BookingSite, CheckConfig, Result, StealthConfig, StealthExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let page = BookingSite::new("Saturday 1 March 2025", "8:10am")
        .centre("Leeds")
        .offer_at("2025-02-10", "Leeds", &["09:00", "14:20"])
        .offer_at("2025-02-14", "York", &["10:40"])
        .offer_at("2025-04-01", "Leeds", &["11:00"])
        .build();

    let config = StealthConfig::default();
    config.validate()?;
    let mut executor = StealthExecutor::new(page, config);

    let check = CheckConfig {
        centres: vec!["Leeds".to_string()],
        ..Default::default()
    };

    println!("Checking for earlier slots (this takes a while on real time)...");
    let result = executor.check(&check).await;
    println!("{}", result.to_json()?);

    let Some(slot) = result.slots_found.first() else {
        println!("No earlier slot on offer");
        return Ok(());
    };

    println!("Moving booking to {}...", slot.date());
    let change = executor.execute_change(slot, &check).await;
    println!("{}", change.to_json()?);

    let metrics = executor.session().metrics();
    println!(
        "Session: {} checks, {} successes, {} failures, next check in {:?}",
        metrics.checks_performed,
        metrics.successes,
        metrics.failures,
        executor.next_interval()
    );

    Ok(())
}
