//! `segfuse-middleware` – transport collaborator.
//!
//! Moves point-cloud frames in and obstacle/image results out without caring
//! about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`adapter`] – the [`TransportAdapter`] seam used by the fusion node, and
//!   [`BusAdapter`], its implementation over the [`EventBus`].
//! - [`ros2_bridge`] – rosbridge-protocol WebSocket endpoint that ingests
//!   `sensor_msgs/PointCloud2` frames and forwards detection results.

pub mod adapter;
pub mod bus;
pub mod ros2_bridge;

pub use adapter::{BusAdapter, TransportAdapter};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use ros2_bridge::Ros2Bridge;
