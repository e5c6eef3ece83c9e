//! rosbridge-protocol WebSocket bridge.
//!
//! This module provides [`Ros2Bridge`], which:
//!
//! 1. **Ingests** `sensor_msgs/PointCloud2` messages published by a
//!    rosbridge client (`{"op":"publish","topic":…,"msg":{…}}`) and puts the
//!    decoded [`PointCloudFrame`] on [`Topic::PointClouds`].
//!
//! 2. **Forwards** every obstacle array and visualisation image produced on
//!    the bus to all connected clients, wrapped in the same rosbridge
//!    `publish` envelope on the `detection` and `image` topics.
//!
//! The `data` field of a `PointCloud2` message may be a JSON array of bytes
//! or the base64 string rosbridge produces for `uint8[]`.  The bridge only
//! handles serialisation and transport.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use segfuse_types::{Event, EventPayload, FuseError, PointCloudFrame};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};

/// Maximum size of a single point-cloud buffer accepted from a client.
///
/// Larger frames are rejected before they reach the bus.
pub const MAX_POINTCLOUD_BYTES: usize = 32 * 1024 * 1024; // 32 MiB

/// Topic on which obstacle arrays are forwarded to clients.
pub const DETECTION_TOPIC: &str = "detection";

/// Topic on which visualisation images are forwarded to clients.
pub const IMAGE_TOPIC: &str = "image";

const SOURCE: &str = "segfuse-middleware::ros2/pointcloud";

/// Bridge between rosbridge clients and the internal [`EventBus`].
#[derive(Clone)]
pub struct Ros2Bridge {
    bus: Arc<EventBus>,
    pointcloud_topic: String,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl Ros2Bridge {
    /// Create a bridge that accepts frames published on `pointcloud_topic`.
    pub fn new(bus: Arc<EventBus>, pointcloud_topic: impl Into<String>) -> Self {
        Self {
            bus,
            pointcloud_topic: pointcloud_topic.into(),
            limiter: None,
        }
    }

    /// Drop inbound frames arriving faster than `max_hz`.
    pub fn with_rate_limit(mut self, max_hz: NonZeroU32) -> Self {
        self.limiter = Some(Arc::new(RateLimiter::direct(Quota::per_second(max_hz))));
        self
    }

    pub fn pointcloud_topic(&self) -> &str {
        &self.pointcloud_topic
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Publish `frame` on [`Topic::PointClouds`].
    ///
    /// Returns the number of subscribers that received it; `0` when the frame
    /// was rate limited or nobody is listening.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::MalformedFrame`] if the buffer exceeds
    /// [`MAX_POINTCLOUD_BYTES`].
    pub fn ingest_pointcloud(&self, frame: PointCloudFrame) -> Result<usize, FuseError> {
        if frame.data.len() > MAX_POINTCLOUD_BYTES {
            return Err(FuseError::MalformedFrame(format!(
                "point cloud carries {} bytes, exceeding the limit of {}",
                frame.data.len(),
                MAX_POINTCLOUD_BYTES,
            )));
        }
        if let Some(limiter) = &self.limiter
            && limiter.check().is_err()
        {
            debug!(frame_id = %frame.header.frame_id, "inbound frame rate limited");
            return Ok(0);
        }
        let event = Event::new(SOURCE, EventPayload::PointCloud(Arc::new(frame)));
        Ok(self.bus.publish_to(Topic::PointClouds, event))
    }

    /// Parse an incoming rosbridge text message.
    ///
    /// Only `publish` operations on the configured point-cloud topic are
    /// acted on; anything else is ignored.
    pub fn handle_incoming_ws_message(&self, text: &str) -> Result<usize, FuseError> {
        let json: Value =
            serde_json::from_str(text).map_err(|e| FuseError::Serialization(e.to_string()))?;

        let op = json.get("op").and_then(Value::as_str).unwrap_or("");
        let topic = json.get("topic").and_then(Value::as_str).unwrap_or("");
        if op != "publish" || topic != self.pointcloud_topic {
            return Ok(0);
        }

        let msg = json
            .get("msg")
            .cloned()
            .ok_or_else(|| FuseError::Serialization("publish without msg".to_string()))?;
        let frame: PointCloudFrame = serde_json::from_value(msg)
            .map_err(|e| FuseError::Serialization(format!("bad PointCloud2 message: {e}")))?;
        self.ingest_pointcloud(frame)
    }

    // -----------------------------------------------------------------------
    // WebSocket server
    // -----------------------------------------------------------------------

    /// Start a WebSocket server on `addr`.
    ///
    /// Every connecting client may publish point clouds and receives every
    /// obstacle array and image as a rosbridge `publish` message.  The server
    /// runs until it encounters a fatal bind error.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::Channel`] if the TCP listener cannot be bound.
    pub async fn run_ws_server(self, addr: SocketAddr) -> Result<(), FuseError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FuseError::Channel(format!("ws bind error on {addr}: {e}")))?;
        info!(%addr, topic = %self.pointcloud_topic, "rosbridge endpoint listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_ws_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "ws accept error");
                }
            }
        }
    }

    async fn handle_ws_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), FuseError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| FuseError::Channel(format!("ws handshake from {peer}: {e}")))?;
        debug!(peer = %peer, "ws client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut obstacles = self.bus.subscribe_to(Topic::Obstacles);
        let mut images = self.bus.subscribe_to(Topic::Images);

        loop {
            tokio::select! {
                result = obstacles.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(text) = to_rosbridge(&event)? else { continue };
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(peer = %peer, lagged_by = n, "ws client lagged on obstacles");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                result = images.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(text) = to_rosbridge(&event)? else { continue };
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(peer = %peer, lagged_by = n, "ws client lagged on images");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_incoming_ws_message(text.as_str()) {
                                warn!(peer = %peer, error = %e, "rejected inbound message");
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        debug!(peer = %peer, "ws client disconnected");
        Ok(())
    }
}

/// Wrap a result event in a rosbridge `publish` envelope.
///
/// Returns `Ok(None)` for payloads that are not forwarded to clients.
pub fn to_rosbridge(event: &Event) -> Result<Option<String>, FuseError> {
    let (topic, msg) = match &event.payload {
        EventPayload::Obstacles(arr) => (DETECTION_TOPIC, serde_json::to_value(arr)),
        EventPayload::Image(img) => (IMAGE_TOPIC, serde_json::to_value(img)),
        _ => return Ok(None),
    };
    let msg = msg.map_err(|e| FuseError::Serialization(e.to_string()))?;
    let envelope = json!({ "op": "publish", "topic": topic, "msg": msg });
    Ok(Some(envelope.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use segfuse_types::{Header, ImageMessage, Obstacle, ObstacleArray, RgbImage, Vec3};

    const TOPIC: &str = "/realsense/camera/pointcloud";

    fn make_bridge() -> (Arc<EventBus>, Ros2Bridge) {
        let bus = Arc::new(EventBus::default());
        let bridge = Ros2Bridge::new(Arc::clone(&bus), TOPIC);
        (bus, bridge)
    }

    fn publish_msg(topic: &str) -> String {
        publish_msg_with_data(topic, json!([0,0,0,0, 0,0,0,0, 0,0,128,63, 1,2,3,0]))
    }

    fn publish_msg_with_data(topic: &str, data: Value) -> String {
        json!({
            "op": "publish",
            "topic": topic,
            "msg": {
                "header": {"stamp": {"sec": 5, "nanosec": 0}, "frame_id": "camera_link"},
                "height": 1, "width": 1,
                "fields": [
                    {"name": "x", "offset": 0, "datatype": 7, "count": 1},
                    {"name": "y", "offset": 4, "datatype": 7, "count": 1},
                    {"name": "z", "offset": 8, "datatype": 7, "count": 1},
                    {"name": "rgb", "offset": 12, "datatype": 7, "count": 1}
                ],
                "is_bigendian": false,
                "point_step": 16, "row_step": 16,
                "data": data,
                "is_dense": true
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn incoming_pointcloud_is_published_on_bus() {
        let (bus, bridge) = make_bridge();
        let mut rx = bus.subscribe_to(Topic::PointClouds);

        assert_eq!(bridge.handle_incoming_ws_message(&publish_msg(TOPIC)).unwrap(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, SOURCE);
        match event.payload {
            EventPayload::PointCloud(frame) => {
                assert_eq!(frame.header.frame_id, "camera_link");
                assert_eq!(frame.header.stamp.sec, 5);
                assert_eq!(frame.point_step, 16);
                assert_eq!(frame.data.len(), 16);
            }
            other => panic!("expected PointCloud, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn base64_pointcloud_data_is_decoded() {
        let (bus, bridge) = make_bridge();
        let mut rx = bus.subscribe_to(Topic::PointClouds);

        let msg = publish_msg_with_data(TOPIC, json!("AAAAAAAAAAAAAIA/AQIDAA=="));
        assert_eq!(bridge.handle_incoming_ws_message(&msg).unwrap(), 1);

        match rx.recv().await.unwrap().payload {
            EventPayload::PointCloud(frame) => {
                assert_eq!(frame.data, vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 128, 63, 1, 2, 3, 0]);
            }
            other => panic!("expected PointCloud, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_topics_and_ops_are_ignored() {
        let (bus, bridge) = make_bridge();
        let mut rx = bus.subscribe_to(Topic::PointClouds);

        assert_eq!(bridge.handle_incoming_ws_message(&publish_msg("/other")).unwrap(), 0);
        assert_eq!(
            bridge
                .handle_incoming_ws_message(r#"{"op":"subscribe","topic":"/detection"}"#)
                .unwrap(),
            0
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn invalid_json_is_a_serialization_error() {
        let (_, bridge) = make_bridge();
        assert!(matches!(
            bridge.handle_incoming_ws_message("not json"),
            Err(FuseError::Serialization(_))
        ));
        let missing_fields = json!({"op": "publish", "topic": TOPIC, "msg": {"height": 1}}).to_string();
        assert!(matches!(
            bridge.handle_incoming_ws_message(&missing_fields),
            Err(FuseError::Serialization(_))
        ));
    }

    #[test]
    fn oversized_pointcloud_is_rejected() {
        let (_, bridge) = make_bridge();
        let frame = PointCloudFrame {
            header: Header::default(),
            height: 1,
            width: 1,
            fields: vec![],
            is_bigendian: false,
            point_step: 1,
            row_step: 1,
            data: vec![0; MAX_POINTCLOUD_BYTES + 1],
            is_dense: true,
        };
        assert!(matches!(
            bridge.ingest_pointcloud(frame),
            Err(FuseError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn rate_limit_drops_burst_frames() {
        let (bus, bridge) = make_bridge();
        let bridge = bridge.with_rate_limit(NonZeroU32::new(1).unwrap());
        let _rx = bus.subscribe_to(Topic::PointClouds);

        assert_eq!(bridge.handle_incoming_ws_message(&publish_msg(TOPIC)).unwrap(), 1);
        assert_eq!(bridge.handle_incoming_ws_message(&publish_msg(TOPIC)).unwrap(), 0);
    }

    #[test]
    fn obstacle_event_becomes_detection_publish() {
        let arr = ObstacleArray {
            header: Header::default(),
            obstacles: vec![Obstacle {
                score: 0.9,
                position: Vec3::new(1.0, 2.0, 3.0),
                size: Vec3::new(0.1, 0.2, 0.3),
            }],
        };
        let text = to_rosbridge(&Event::new("test", EventPayload::Obstacles(arr)))
            .unwrap()
            .unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["op"], "publish");
        assert_eq!(v["topic"], DETECTION_TOPIC);
        assert_eq!(v["msg"]["obstacles"][0]["score"], 0.9);
    }

    #[test]
    fn image_event_becomes_image_publish() {
        let img = ImageMessage::rgb8(Header::default(), RgbImage::new(1, 1, vec![1, 2, 3]));
        let text = to_rosbridge(&Event::new("test", EventPayload::Image(img)))
            .unwrap()
            .unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["topic"], IMAGE_TOPIC);
        assert_eq!(v["msg"]["encoding"], "rgb8");
        assert_eq!(v["msg"]["step"], 3);
    }

    #[test]
    fn alerts_are_not_forwarded() {
        let event = Event::new(
            "test",
            EventPayload::FrameDropped {
                header: Header::default(),
                reason: "busy".into(),
            },
        );
        assert!(to_rosbridge(&event).unwrap().is_none());
    }
}
