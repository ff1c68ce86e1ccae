pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use services::{MockPaymentService, OrderService, PaymentService, PaymentWorker};
