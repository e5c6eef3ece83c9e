//! Topic-based publish/subscribe over [`tokio::sync::broadcast`].
//!
//! Every subscriber receives every event on its topic.  A subscriber that
//! falls behind loses the oldest events; the publisher never waits.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::PointClouds`] | Inbound `PointCloud2` frames |
//! | [`Topic::Obstacles`] | Per-frame obstacle arrays |
//! | [`Topic::Images`] | Annotated visualisation images |
//! | [`Topic::SystemAlerts`] | Dropped frames, pipeline faults |

use segfuse_types::Event;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 16;
const TOPIC_COUNT: usize = 4;

/// Routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    PointClouds,
    Obstacles,
    Images,
    SystemAlerts,
}

impl Topic {
    pub const ALL: [Topic; TOPIC_COUNT] = [
        Topic::PointClouds,
        Topic::Obstacles,
        Topic::Images,
        Topic::SystemAlerts,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Topic::PointClouds => "point_clouds",
            Topic::Obstacles => "obstacles",
            Topic::Images => "images",
            Topic::SystemAlerts => "system_alerts",
        }
    }
}

/// Shared event bus: one broadcast channel per [`Topic`].
///
/// Clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    senders: [broadcast::Sender<Event>; TOPIC_COUNT],
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per topic.
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: std::array::from_fn(|_| broadcast::channel(capacity).0),
        }
    }

    /// Publish `event` on `topic`.
    ///
    /// Returns how many receivers were handed the event; `0` when nobody is
    /// subscribed, which is not an error.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        self.senders[topic.slot()].send(event).unwrap_or(0)
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.senders[topic.slot()].subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.senders[topic.slot()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// Receiver bound to one [`Topic`], from [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// `Lagged(n)` means `n` older events were overwritten before this
    /// receiver read them; `Closed` means every bus handle is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
