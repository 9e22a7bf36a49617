//! Change feed shared by every client of one backing store.

use tokio::sync::broadcast;
use tracing::trace;

const FEED_CAPACITY: usize = 256;

/// A resource whose live view may have changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A user record (profile, balance, session token)
    User(String),
    /// The conversation list of a user
    Conversations(String),
    /// The messages of a conversation
    Messages(String),
    /// The notifications of a user
    Notifications(String),
}

/// Broadcasts change topics to listener tasks.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<Topic>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    /// Creates a feed with no listeners.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }

    /// Announces that `topic` changed. Having no listeners is not an error.
    pub fn publish(&self, topic: Topic) {
        trace!(?topic, "publishing change");
        let _ = self.sender.send(topic);
    }

    /// Announces several topics.
    pub fn publish_all(&self, topics: impl IntoIterator<Item = Topic>) {
        for topic in topics {
            self.publish(topic);
        }
    }

    /// New receiver that sees every topic published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Topic> {
        self.sender.subscribe()
    }
}
