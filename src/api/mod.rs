//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub inboxes (for federation)
//! - Metrics (Prometheus)

mod inbox;
pub mod metrics;

pub use inbox::{InboxReceipt, inbox_router};
pub use metrics::metrics_router;
