use anyhow::{Context, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{error, info};
use trade_capture::infrastructure::logging::init_logging;
use trade_capture::infrastructure::{KafkaTradePublisher, SimulatorConfig, TradePublisherTrait};
use trade_capture::{AppConfig, TradeEvent, TradeSide};
use uuid::Uuid;

const SYMBOLS: &[&str] = &["AAPL", "GOOGL", "MSFT", "AMZN", "TSLA", "NVDA", "META", "NFLX"];

fn random_trade(rng: &mut impl Rng, portfolios: &[Uuid]) -> Option<TradeEvent> {
    Some(TradeEvent {
        portfolio_id: *portfolios.choose(rng)?,
        trade_id: Uuid::new_v4(),
        symbol: SYMBOLS.choose(rng)?.to_string(),
        side: if rng.gen_bool(0.5) {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        },
        // 100.00 to 999.99
        price: Decimal::new(rng.gen_range(10_000..100_000), 2),
        quantity: rng.gen_range(1..=1000),
        event_time: Utc::now(),
    })
}

/// Publishes random trades onto the ingest topic, keyed by portfolio.
#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = init_logging(&config.logging)?;

    let SimulatorConfig {
        rate,
        duration_secs,
        portfolios: portfolio_count,
    } = SimulatorConfig::from_env()?;

    let publisher = KafkaTradePublisher::new(&config.kafka)?;
    let portfolios: Vec<Uuid> = (0..portfolio_count).map(|_| Uuid::new_v4()).collect();
    let total = rate * duration_secs;

    info!(
        "Starting trade simulation: {} msg/sec for {} seconds over {} portfolios",
        rate, duration_secs, portfolio_count
    );

    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / rate));
    let mut sent = 0u64;
    for _ in 0..total {
        ticker.tick().await;
        let event = {
            let mut rng = rand::thread_rng();
            random_trade(&mut rng, &portfolios).context("empty simulation pools")?
        };
        let payload = event.encode()?;
        match publisher
            .publish(
                &config.kafka.ingest_topic,
                &event.portfolio_id.to_string(),
                &payload,
            )
            .await
        {
            Ok(()) => sent += 1,
            Err(e) => error!("Failed to publish trade {}: {}", event.trade_id, e),
        }
    }

    info!("Simulation completed: {} of {} trades published", sent, total);
    Ok(())
}
