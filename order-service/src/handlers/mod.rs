/// HTTP handlers for the ingress API
pub mod orders;

pub use orders::*;
