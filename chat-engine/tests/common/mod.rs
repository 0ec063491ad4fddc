//! Shared fixtures for integration tests

#![allow(dead_code)]

use chat_engine::{ChatEngine, Contact, EngineConfig, LoadReport, ManualClock, MemoryAdapter};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

pub struct Fixture {
    pub engine: ChatEngine,
    pub clock: Arc<ManualClock>,
    pub adapter: Arc<MemoryAdapter>,
    pub report: LoadReport,
}

/// Engine over an empty memory adapter with contacts `c1` (Alice) and `c2` (Bob)
pub async fn fixture_with(config: EngineConfig) -> Fixture {
    init_tracing();
    let clock = manual_clock();
    let adapter = Arc::new(MemoryAdapter::new());
    let (engine, report) = ChatEngine::open(config, adapter.clone(), clock.clone())
        .await
        .unwrap();
    engine.upsert_contact(Contact::new("c1", "Alice")).unwrap();
    engine.upsert_contact(Contact::new("c2", "Bob")).unwrap();
    Fixture {
        engine,
        clock,
        adapter,
        report,
    }
}

pub async fn fixture() -> Fixture {
    fixture_with(EngineConfig::default()).await
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
