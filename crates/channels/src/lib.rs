//! Outbound channel plumbing: message variation (spintax) and the WhatsApp
//! automation bridge client with multi-host failover.

pub mod hosts;
pub mod spintax;
pub mod whatsapp;

pub use hosts::{HostSelector, RoundRobin};
pub use spintax::{SpintaxEngine, TemplateValidation};
pub use whatsapp::{BridgeError, HealthReport, HostHealth, RetryPolicy, SendReceipt, WhatsAppBridge};
