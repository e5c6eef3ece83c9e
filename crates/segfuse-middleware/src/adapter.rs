//! The transport seam.
//!
//! The fusion node never speaks directly to ROS 2 or WebSockets.  It pulls
//! frames from a [`TransportAdapter`] and hands results back to it.
//!
//! - [`TransportAdapter`] – the trait every transport must implement.
//! - [`BusAdapter`] – routes through the in-process [`EventBus`], which the
//!   [`Ros2Bridge`][crate::ros2_bridge::Ros2Bridge] feeds and drains.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use segfuse_types::{
    Event, EventPayload, FuseError, Header, ImageMessage, ObstacleArray, PointCloudFrame,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::bus::{EventBus, Topic};

/// Every transport must implement this trait.
///
/// # Contract
///
/// * `frame_stream` – live stream of inbound point-cloud frames.  The stream
///   ends when the transport shuts down.
/// * `publish_obstacles` / `publish_image` – hand one frame's results to
///   whoever is listening.
/// * `has_*_consumers` – whether anyone is listening at all; the node skips
///   a frame entirely when neither has consumers.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn frame_stream(&self) -> BoxStream<'static, Arc<PointCloudFrame>>;

    async fn publish_obstacles(&self, obstacles: ObstacleArray) -> Result<(), FuseError>;

    async fn publish_image(&self, image: ImageMessage) -> Result<(), FuseError>;

    fn has_obstacle_consumers(&self) -> bool;

    fn has_image_consumers(&self) -> bool;

    /// Report that the frame stamped `header` was skipped.
    async fn frame_dropped(&self, _header: Header, _reason: &str) -> Result<(), FuseError> {
        Ok(())
    }
}

/// [`TransportAdapter`] over the in-process [`EventBus`].
#[derive(Clone)]
pub struct BusAdapter {
    bus: Arc<EventBus>,
}

const SOURCE: &str = "segfuse-middleware::bus_adapter";

impl BusAdapter {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl TransportAdapter for BusAdapter {
    async fn frame_stream(&self) -> BoxStream<'static, Arc<PointCloudFrame>> {
        let rx = self.bus.subscribe_to(Topic::PointClouds);
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(Event {
                        payload: EventPayload::PointCloud(frame),
                        ..
                    }) => return Some((frame, rx)),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "frame stream lagged; stale frames dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    async fn publish_obstacles(&self, obstacles: ObstacleArray) -> Result<(), FuseError> {
        self.bus.publish_to(
            Topic::Obstacles,
            Event::new(SOURCE, EventPayload::Obstacles(obstacles)),
        );
        Ok(())
    }

    async fn publish_image(&self, image: ImageMessage) -> Result<(), FuseError> {
        self.bus
            .publish_to(Topic::Images, Event::new(SOURCE, EventPayload::Image(image)));
        Ok(())
    }

    fn has_obstacle_consumers(&self) -> bool {
        self.bus.subscriber_count(Topic::Obstacles) > 0
    }

    fn has_image_consumers(&self) -> bool {
        self.bus.subscriber_count(Topic::Images) > 0
    }

    async fn frame_dropped(&self, header: Header, reason: &str) -> Result<(), FuseError> {
        self.bus.publish_to(
            Topic::SystemAlerts,
            Event::new(
                SOURCE,
                EventPayload::FrameDropped {
                    header,
                    reason: reason.to_string(),
                },
            ),
        );
        Ok(())
    }
}
