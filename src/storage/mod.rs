//! Persistent subscription and feed-error store.
//!
//! The whole state lives in memory behind a readers/writer lock and is
//! mirrored to a single pretty-printed JSON file after every mutation.

mod store;
mod types;

pub use store::Store;
pub use types::{FeedError, FeedInfo, StoreError, StoreState, Subscription, UNTITLED_FEED};
