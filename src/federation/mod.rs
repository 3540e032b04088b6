//! ActivityPub federation module
//!
//! Handles:
//! - Actor resolution (WebFinger, actor documents)
//! - Outbound activity construction
//! - Delivery queue and delivery workers
//! - Inbound activity processing (inbox, outbox preview)
//! - Mention linking

mod activity;
mod actor;
mod builder;
mod delivery;
mod mention;
mod object;
mod queue;
mod transport;
mod webfinger;

pub use activity::{ActivityProcessor, InboundOutcome, RejectReason};
pub use actor::{ActorResolver, ExampleDomainPolicy, NoPlaceholders, PlaceholderPolicy};
pub use builder::{
    ActivityObject, ActivityType, EmbeddedActivity, OutboundActivity, Verb, activity_id, announce,
    build, strip_scheme,
};
pub use delivery::{ActivityDelivery, DeliveryResult};
pub use mention::{MentionRewriter, MentionTable, extract_mentions, mention_slug};
pub use object::{Attachment, CollectionPage, InboundActivity, InboundType, Note};
pub use queue::{DeliveryJob, DeliveryQueue, EnqueueOutcome, JobRunner, Reservation};
pub use transport::{
    FederationTransport, Follower, FollowerRegistry, HttpTransport, RequestSigner,
    TransportResponse, with_deadline,
};
pub use webfinger::{ActorRef, Handle, WebFingerLink, WebFingerResponse};

#[cfg(test)]
pub use queue::MockJobRunner;
#[cfg(test)]
pub use transport::MockFederationTransport;
