//! `segfuse-types` – shared data model for the segmentation/point-cloud
//! fusion stack.
//!
//! Every crate in the workspace speaks these types: the transport layer
//! deserialises [`PointCloudFrame`]s, the perception layer turns them into
//! [`Obstacle`]s, and the runtime wraps everything in bus [`Event`]s.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, TimeZone, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Header
// ────────────────────────────────────────────────────────────────────────────

/// ROS-style timestamp (`builtin_interfaces/Time`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Stamp {
    pub sec: i32,
    pub nanosec: u32,
}

impl Stamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Seconds saturate at `i32::MAX` (2038-01-19) and `i32::MIN`.
    pub fn from_datetime(t: DateTime<Utc>) -> Self {
        let secs = t.timestamp();
        Self {
            sec: i32::try_from(secs).unwrap_or(if secs < 0 { i32::MIN } else { i32::MAX }),
            nanosec: t.timestamp_subsec_nanos(),
        }
    }

    /// Convert to a chrono timestamp. Out-of-range values map to the epoch.
    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.sec), self.nanosec)
            .single()
            .unwrap_or_default()
    }
}

/// Timestamp and frame of reference carried unchanged from an input frame to
/// every output derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Header {
    #[serde(default)]
    pub stamp: Stamp,
    #[serde(default)]
    pub frame_id: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Point-cloud frame
// ────────────────────────────────────────────────────────────────────────────

/// `sensor_msgs/PointField` datatype codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PointFieldType {
    Int8 = 1,
    Uint8 = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    Float32 = 7,
    Float64 = 8,
}

/// Byte width selected by a datatype code.
///
/// Codes 0–2 → 1 byte, 3–4 → 2 bytes, 5–7 → 4 bytes, 8 → 8 bytes.
///
/// # Errors
///
/// Returns [`FuseError::UnsupportedDatatype`] for any other code.
pub fn numeric_width(datatype: u8) -> Result<usize, FuseError> {
    match datatype {
        0..=2 => Ok(1),
        3..=4 => Ok(2),
        5..=7 => Ok(4),
        8 => Ok(8),
        other => Err(FuseError::UnsupportedDatatype(other)),
    }
}

fn default_count() -> u32 {
    1
}

/// Locates one named channel inside every point record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// Byte offset from the start of the record.
    pub offset: u32,
    /// `PointField` datatype code.
    pub datatype: u8,
    #[serde(default = "default_count")]
    pub count: u32,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, offset: u32, datatype: PointFieldType) -> Self {
        Self {
            name: name.into(),
            offset,
            datatype: datatype as u8,
            count: 1,
        }
    }
}

/// An organised point cloud: `height × width` fixed-size records of
/// `point_step` bytes each (`sensor_msgs/PointCloud2`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudFrame {
    #[serde(default)]
    pub header: Header,
    pub height: u32,
    pub width: u32,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub is_bigendian: bool,
    pub point_step: u32,
    #[serde(default)]
    pub row_step: u32,
    /// Packed records. Accepts a JSON byte array or the base64 string that
    /// rosbridge emits for `uint8[]`.
    #[serde(deserialize_with = "bytes_or_base64")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub is_dense: bool,
}

impl PointCloudFrame {
    /// Number of point records declared by the grid geometry, or `None`
    /// when it does not fit in `usize`.
    pub fn total_points(&self) -> Option<usize> {
        (self.height as usize).checked_mul(self.width as usize)
    }

    /// Buffer length the geometry requires: `height * width * point_step`.
    pub fn expected_data_len(&self) -> Option<usize> {
        self.total_points()?.checked_mul(self.point_step as usize)
    }

    /// First field descriptor called `name`.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteBuffer {
    Raw(Vec<u8>),
    Base64(String),
}

fn bytes_or_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    match ByteBuffer::deserialize(deserializer)? {
        ByteBuffer::Raw(bytes) => Ok(bytes),
        ByteBuffer::Base64(text) => STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Images
// ────────────────────────────────────────────────────────────────────────────

/// Row-major `height × width × 3` RGB image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RgbImage {
    pub height: u32,
    pub width: u32,
    pub data: Vec<u8>,
}

impl RgbImage {
    pub fn new(height: u32, width: u32, data: Vec<u8>) -> Self {
        Self { height, width, data }
    }

    /// `[r, g, b]` at (`row`, `col`), or `None` outside the image.
    pub fn pixel(&self, row: u32, col: u32) -> Option<[u8; 3]> {
        if row >= self.height || col >= self.width {
            return None;
        }
        let i = (row as usize)
            .checked_mul(self.width as usize)?
            .checked_add(col as usize)?
            .checked_mul(3)?;
        let px = self.data.get(i..i.checked_add(3)?)?;
        Some([px[0], px[1], px[2]])
    }
}

/// Flattened image for publication (`sensor_msgs/Image`, `rgb8`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImageMessage {
    pub header: Header,
    pub height: u32,
    pub width: u32,
    pub encoding: String,
    /// Bytes per row.
    pub step: u32,
    pub data: Vec<u8>,
}

impl ImageMessage {
    pub fn rgb8(header: Header, image: RgbImage) -> Self {
        Self {
            header,
            height: image.height,
            width: image.width,
            encoding: "rgb8".to_string(),
            step: 3 * image.width,
            data: image.data,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Detector output
// ────────────────────────────────────────────────────────────────────────────

/// Instance-segmentation output for one image.
///
/// Instance `i` is described by `classes[i]`, `scores[i]` and `masks[i]`.
/// Each mask holds `height * width` entries aligned to the pre-downsample
/// point grid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    pub height: u32,
    pub width: u32,
    pub classes: Vec<u32>,
    pub scores: Vec<f64>,
    pub masks: Vec<Vec<bool>>,
    /// Optional annotated visualisation produced by the detector.
    #[serde(default)]
    pub image: Option<RgbImage>,
}

impl DetectionResult {
    /// Number of detected instances.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Check that the per-instance vectors agree with each other and with
    /// the declared grid size.
    pub fn validate(&self) -> Result<(), FuseError> {
        let n = self.classes.len();
        if self.scores.len() != n || self.masks.len() != n {
            return Err(FuseError::DetectionUnavailable(format!(
                "detector returned {} classes, {} scores and {} masks",
                n,
                self.scores.len(),
                self.masks.len()
            )));
        }
        let expected = (self.height as usize)
            .checked_mul(self.width as usize)
            .ok_or_else(|| {
                FuseError::DetectionUnavailable(format!(
                    "detection grid {}x{} is too large",
                    self.height, self.width
                ))
            })?;
        if let Some((i, m)) = self.masks.iter().enumerate().find(|(_, m)| m.len() != expected) {
            return Err(FuseError::DetectionUnavailable(format!(
                "mask {i} has {} entries, expected {expected}",
                m.len()
            )));
        }
        Ok(())
    }

    /// Keep only instances whose score is at least `threshold`.
    pub fn retain_min_score(&mut self, threshold: f64) {
        let keep: Vec<bool> = self.scores.iter().map(|s| *s >= threshold).collect();
        let mut it = keep.iter();
        self.classes.retain(|_| *it.next().unwrap_or(&false));
        let mut it = keep.iter();
        self.scores.retain(|_| *it.next().unwrap_or(&false));
        let mut it = keep.iter();
        self.masks.retain(|_| *it.next().unwrap_or(&false));
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Obstacles
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// One detected object as an axis-aligned 3-D box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Obstacle {
    /// Detector confidence in `[0, 1]`.
    pub score: f64,
    /// Box centre.
    pub position: Vec3,
    /// Box extents; every component is ≥ 0.
    pub size: Vec3,
}

/// All obstacles found in one frame, tagged with the frame's header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ObstacleArray {
    pub header: Header,
    pub obstacles: Vec<Obstacle>,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "segfuse-middleware::ros2/pointcloud"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Inbound sensor frame. Shared so fan-out does not copy the buffer.
    PointCloud(Arc<PointCloudFrame>),
    Obstacles(ObstacleArray),
    Image(ImageMessage),
    /// A frame was skipped because another was still being processed.
    FrameDropped { header: Header, reason: String },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type for the fusion stack.
///
/// The first three variants are fatal to the current frame only; the
/// pipeline reports them and carries on with the next frame.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FuseError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsupported datatype code {0}")]
    UnsupportedDatatype(u8),

    #[error("Detection unavailable: {0}")]
    DetectionUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
