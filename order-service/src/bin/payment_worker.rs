use order_service::config::Config;
use order_service::db;
use order_service::services::{MockPaymentService, PaymentService, PaymentWorker};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

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

    let payment: Arc<dyn PaymentService> = Arc::new(MockPaymentService::from_env());

    let worker = match PaymentWorker::new(pool, payment, config.worker.clone()) {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to build payment worker: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = worker.run(&config.broker) => {
            if let Err(e) = result {
                error!("Payment worker terminated: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping worker");
        }
    }
}
