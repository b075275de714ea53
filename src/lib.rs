//! Chat bot that watches RSS/Atom feeds and posts new items to subscribers.
//!
//! Users manage subscriptions through chat commands ([`commands`]); a
//! background [`monitor`] polls every subscribed feed and pushes the newest
//! item through a [`notify::ChatSink`]. State lives in a JSON snapshot
//! managed by [`storage::Store`].

pub mod commands;
pub mod config;
pub mod feed;
pub mod monitor;
pub mod notify;
pub mod shutdown;
pub mod storage;
pub mod telegram;
pub mod util;
