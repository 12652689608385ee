//! End-to-end scenarios against the in-memory exchange.
//!
//! Run with: cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;

use triangular_arb::engine::{Engine, EngineSettings};
use triangular_arb::exchange::{FillBehavior, MockExchange, MockExchangeBuilder};
use triangular_arb::finder::{Finder, FinderSettings, OpportunityEvent};
use triangular_arb::graph::FillPolicy;
use triangular_arb::opportunity::{ExecutionSettings, JsonLinesStore, NullStore};

/// ETH/BTC, BTC/USD, ETH/USD priced so BTC -> ETH -> USD -> BTC yields 1.1.
fn exchange(usd: Decimal) -> Arc<MockExchange> {
    Arc::new(
        MockExchangeBuilder::new()
            .market("ETH", "BTC", dec!(0), dec!(0.05), dec!(0.05), dec!(100))
            .market("BTC", "USD", dec!(0), dec!(20000), dec!(20000), dec!(100))
            .market("ETH", "USD", dec!(0), dec!(1100), dec!(1100), dec!(100))
            .balance("USD", usd)
            .build(),
    )
}

fn finder_settings() -> FinderSettings {
    FinderSettings {
        threshold: dec!(1.001),
        fetch_volumes: true,
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn engine_settings(mock: bool) -> EngineSettings {
    EngineSettings {
        execution: ExecutionSettings {
            fill: FillPolicy {
                retries: 3,
                poll_interval: Duration::from_millis(1),
                market_slippage: dec!(0.01),
            },
            mock,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

#[tokio::test]
async fn opportunity_lifecycle_is_reported_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("opportunities.jsonl");
    let exchange = exchange(dec!(0));

    let mut finder = Finder::new(exchange.clone(), finder_settings(), Arc::new(JsonLinesStore::new(&path)));
    finder.load().await.unwrap();
    let mut events = finder.subscribe();

    finder.poll_once().await;
    match events.try_recv() {
        Ok(OpportunityEvent::Added { id }) => assert_eq!(id, "BTCETHUSD"),
        other => panic!("expected Added, got {other:?}"),
    }
    assert!(events.try_recv().is_err());

    tokio::time::sleep(Duration::from_millis(60)).await;
    exchange.set_ticker("ETH/USD", dec!(990), dec!(990));
    finder.poll_once().await;

    match events.try_recv() {
        Ok(OpportunityEvent::Closed { opportunity, duration }) => {
            assert_eq!(opportunity.id(), "BTCETHUSD");
            assert!(duration >= Duration::from_millis(50));
        }
        other => panic!("expected Closed, got {other:?}"),
    }
    assert!(events.try_recv().is_err());

    let saved = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = saved.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["exchange"], "mock");
    assert_eq!(record["cycle"].as_array().unwrap().len(), 3);
    assert_eq!(record["edges"].as_array().unwrap().len(), 3);
    assert!(!record["max_volume"].is_null());
}

#[tokio::test]
async fn finder_and_engine_exploit_end_to_end() {
    let exchange = exchange(dec!(1100));
    let mut finder = Finder::new(exchange.clone(), finder_settings(), Arc::new(NullStore));
    let markets = finder.load().await.unwrap();
    let events = finder.subscribe();

    let engine = Arc::new(Engine::new(exchange.clone(), engine_settings(false), finder.snapshot()));
    engine.init(&markets).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(events, shutdown_rx).await })
    };

    finder.poll_once().await;

    assert!(wait_until(|| engine.stats().exploited == 1).await);
    assert_eq!(exchange.orders().len(), 3);
    // 990 USD traded around a 1.1 cycle
    assert!(wait_until(|| !engine.is_locked()).await);
    assert_eq!(engine.balance().await.get("USD"), Some(dec!(1199)));
    assert_eq!(engine.stats().last_diff.get("USD"), Some(&dec!(99)));

    shutdown_tx.send(true).unwrap();
    engine_task.await.unwrap();
}

#[tokio::test]
async fn failed_leg_leaves_volume_in_neutral_currency() {
    let exchange = exchange(dec!(1100));
    exchange.set_fill_behavior("ETH/BTC", FillBehavior::Never);

    let mut finder = Finder::new(exchange.clone(), finder_settings(), Arc::new(NullStore));
    let markets = finder.load().await.unwrap();
    let engine = Engine::new(exchange.clone(), engine_settings(false), finder.snapshot());
    engine.init(&markets).await.unwrap();

    let events = finder.poll_once().await;
    let handle = engine.handle(&events[0]).await.expect("exploit scheduled");
    let report = handle.await.unwrap();

    assert!(!report.outcome.unwrap().is_completed());
    assert!(!report.gained);
    assert_eq!(engine.stats().failed, 1);
    // USD -> BTC filled, BTC -> ETH timed out and was cancelled
    let balance = engine.balance().await;
    assert_eq!(balance.get("BTC"), Some(dec!(0.0495)));
    assert_eq!(balance.get("USD"), Some(dec!(110)));
}

#[tokio::test]
async fn dry_run_never_touches_the_balance() {
    let exchange = exchange(dec!(1100));
    let mut finder = Finder::new(exchange.clone(), finder_settings(), Arc::new(NullStore));
    let markets = finder.load().await.unwrap();
    let engine = Engine::new(exchange.clone(), engine_settings(true), finder.snapshot());
    engine.init(&markets).await.unwrap();

    let events = finder.poll_once().await;
    let report = engine.handle(&events[0]).await.unwrap().await.unwrap();

    assert!(report.outcome.unwrap().is_completed());
    assert!(report.diff.is_empty());
    assert!(exchange.orders().is_empty());
    assert_eq!(exchange.balance().get("USD"), Some(&dec!(1100)));
}
