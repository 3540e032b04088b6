//! Service layer
//!
//! Operations the host invokes on the federation core.
//! Services orchestrate the feed repository, the resolver and the queue.

mod feed;
mod outbound;

pub use feed::{FeedService, PUSH_FEED_POLL_INTERVAL_SECS, suggest_user_login, support_confidence};
pub use outbound::OutboundService;
