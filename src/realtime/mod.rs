//! Realtime layer - change notifications and live snapshot subscriptions.
//!
//! The [`ChangeFeed`] plays the part of the backend's server push: every write
//! path publishes the [`Topic`]s it touched after its transaction commits.
//! A [`SubscriptionManager`] turns a [`SnapshotQuery`] into one backend
//! listener per resource key, shared by every subscriber of that key.

pub mod feed;
pub mod subscription;

pub use feed::{ChangeFeed, Topic};
pub use subscription::{SnapshotQuery, Subscription, SubscriptionManager};
