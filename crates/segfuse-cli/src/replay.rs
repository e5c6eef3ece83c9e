//! Offline single-frame replay.
//!
//! Runs one recorded `PointCloud2` frame through the pipeline with a recorded
//! detector reply, so a frame can be inspected without a camera or a model
//! server.

use std::fs;
use std::path::Path;

use segfuse_runtime::{FusionNode, FusionPipeline, RecordedDetector};
use segfuse_types::{ObstacleArray, PointCloudFrame};

use crate::config::Config;

/// Load `frame_path` and `detection_path` (both JSON) and return the
/// obstacles the pipeline produces for them under `cfg`.
pub fn replay(frame_path: &Path, detection_path: &Path, cfg: &Config) -> Result<ObstacleArray, String> {
    let raw_frame = fs::read_to_string(frame_path)
        .map_err(|e| format!("Failed to read frame {}: {}", frame_path.display(), e))?;
    let frame: PointCloudFrame = serde_json::from_str(&raw_frame)
        .map_err(|e| format!("Failed to parse frame {}: {}", frame_path.display(), e))?;

    let raw_detection = fs::read_to_string(detection_path)
        .map_err(|e| format!("Failed to read detection {}: {}", detection_path.display(), e))?;
    let detector = RecordedDetector::from_json(&raw_detection).map_err(|e| e.to_string())?;

    let pipeline = FusionPipeline::new(cfg.fusion_config()?, detector).map_err(|e| e.to_string())?;
    let node = FusionNode::new(pipeline);
    node.process_one(&frame)
        .map(|out| out.obstacles)
        .map_err(|e| e.to_string())
}
