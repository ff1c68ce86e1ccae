pub mod order_service;
pub mod payment;
pub mod payment_worker;

pub use order_service::*;
pub use payment::*;
pub use payment_worker::*;
