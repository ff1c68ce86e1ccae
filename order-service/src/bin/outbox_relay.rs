use order_service::config::Config;
use order_service::db;
use order_service::models::ORDER_EVENTS_TOPIC;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transactional_outbox::{KafkaOutboxPublisher, OutboxRelay, RelayMetrics, SqlxOutboxRepository};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match db::create_pool(&config.database).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    // Idempotent producer settings keep broker-side duplicates out of the
    // at-least-once window this relay already tolerates.
    let producer: FutureProducer = match ClientConfig::new()
        .set("bootstrap.servers", &config.broker.addr)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("message.timeout.ms", "30000")
        .create()
    {
        Ok(producer) => producer,
        Err(e) => {
            error!("Failed to create broker producer: {}", e);
            std::process::exit(1);
        }
    };

    let repository = Arc::new(SqlxOutboxRepository::new(pool));
    let publisher = Arc::new(KafkaOutboxPublisher::new(
        producer,
        ORDER_EVENTS_TOPIC.to_string(),
    ));
    let metrics = RelayMetrics::new("outbox-relay");

    let relay = OutboxRelay::new_with_metrics(
        repository,
        publisher,
        metrics,
        config.relay.batch_size,
        Duration::from_millis(config.relay.poll_interval_ms),
        Duration::from_millis(config.relay.poll_interval_ms),
    );

    tokio::select! {
        result = relay.start() => {
            if let Err(e) = result {
                error!("Outbox relay terminated: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping relay");
        }
    }
}
