//! Data layer module
//!
//! Holds the values shared across the federation core:
//! - Models for actors, feeds and feed items
//! - Actor cache and seen-activity guard (volatile)
//! - Feed engine traits and the in-memory feed repository

mod cache;
mod feeds;
mod models;

pub use cache::{ActorCache, SeenActivities};
pub use feeds::{FeedIngest, FeedRepository, InMemoryFeeds};
#[cfg(test)]
pub use feeds::{MockFeedIngest, MockFeedRepository};
pub use models::*;
