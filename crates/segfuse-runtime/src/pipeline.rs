//! [`FusionPipeline`] – one frame, start to finish.
//!
//! decode → detect → estimate, with the detector call being the only slow
//! step.  The pipeline holds no mutable state; a single instance is shared
//! by every worker.

use segfuse_perception::{ChannelDecoder, EstimatorConfig, estimate};
use segfuse_types::{FuseError, ImageMessage, ObstacleArray, PointCloudFrame};
use tracing::{info, instrument};

use crate::detector::{Detector, DetectorSettings};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the pipeline needs to know, fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pub estimator: EstimatorConfig,
    pub detector: DetectorSettings,
    /// Publish the annotated image alongside the obstacles.
    pub publish_image: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            detector: DetectorSettings::default(),
            publish_image: true,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), FuseError> {
        self.estimator.validate()?;
        self.detector.validate()
    }
}

/// Result of one processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutput {
    /// Obstacles stamped with the input frame's header.
    pub obstacles: ObstacleArray,
    pub image: Option<ImageMessage>,
}

// ─────────────────────────────────────────────────────────────────────────────
// FusionPipeline
// ─────────────────────────────────────────────────────────────────────────────

pub struct FusionPipeline<D> {
    config: FusionConfig,
    decoder: ChannelDecoder,
    detector: D,
}

impl<D: Detector> FusionPipeline<D> {
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: FusionConfig, detector: D) -> Result<Self, FuseError> {
        config.validate()?;
        let decoder = ChannelDecoder::new(config.estimator.downsample_factor)?;
        Ok(Self {
            config,
            decoder,
            detector,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Run one frame through the pipeline.
    ///
    /// An image is produced only when `want_image` is set and the
    /// configuration enables image publishing.  It is the detector's
    /// visualisation when one was returned, otherwise the decoded colour
    /// image.
    ///
    /// # Errors
    ///
    /// - [`FuseError::MalformedFrame`] / [`FuseError::UnsupportedDatatype`]
    ///   from decoding.
    /// - [`FuseError::DetectionUnavailable`] if the detector fails or returns
    ///   output that does not fit the frame.
    #[instrument(
        level = "debug",
        skip_all,
        fields(frame_id = %frame.header.frame_id, stamp_sec = frame.header.stamp.sec)
    )]
    pub fn process(&self, frame: &PointCloudFrame, want_image: bool) -> Result<FusionOutput, FuseError> {
        let channels = self.decoder.decode(frame)?;

        let mut detection = self
            .detector
            .detect(&channels.image, &self.config.detector)
            .map_err(into_unavailable)?;
        detection.validate()?;
        if detection.height != frame.height || detection.width != frame.width {
            return Err(FuseError::DetectionUnavailable(format!(
                "detector grid {}x{} does not match frame {}x{}",
                detection.height, detection.width, frame.height, frame.width
            )));
        }

        let obstacles = estimate(&detection, &channels, &self.config.estimator);
        info!(
            instances = detection.len(),
            obstacles = obstacles.len(),
            "frame processed"
        );

        let image = if want_image && self.config.publish_image {
            let picture = detection.image.take().unwrap_or(channels.image);
            Some(ImageMessage::rgb8(frame.header.clone(), picture))
        } else {
            None
        };

        Ok(FusionOutput {
            obstacles: ObstacleArray {
                header: frame.header.clone(),
                obstacles,
            },
            image,
        })
    }
}

fn into_unavailable(err: FuseError) -> FuseError {
    match err {
        FuseError::DetectionUnavailable(_) => err,
        other => FuseError::DetectionUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use segfuse_types::{DetectionResult, FieldDescriptor, Header, PointFieldType, RgbImage, Stamp};

    use crate::detector::RecordedDetector;

    const POINTS: [([f32; 3], [u8; 3]); 4] = [
        ([0.0, 0.0, 1.0], [10, 20, 30]),
        ([1.0, 0.0, 1.0], [40, 50, 60]),
        ([0.0, 1.0, 2.0], [70, 80, 90]),
        ([1.0, 1.0, 2.0], [100, 110, 120]),
    ];

    /// 2×2 frame, little-endian f32 x/y/z at 0/4/8 and rgb bytes at 12.
    fn frame() -> PointCloudFrame {
        let mut data = Vec::with_capacity(16 * POINTS.len());
        for (xyz, rgb) in POINTS {
            for v in xyz {
                data.extend_from_slice(&v.to_le_bytes());
            }
            data.extend_from_slice(&rgb);
            data.push(0);
        }
        PointCloudFrame {
            header: Header {
                stamp: Stamp { sec: 42, nanosec: 7 },
                frame_id: "camera_depth_optical_frame".to_string(),
            },
            height: 2,
            width: 2,
            fields: vec![
                FieldDescriptor::new("x", 0, PointFieldType::Float32),
                FieldDescriptor::new("y", 4, PointFieldType::Float32),
                FieldDescriptor::new("z", 8, PointFieldType::Float32),
                FieldDescriptor::new("rgb", 12, PointFieldType::Float32),
            ],
            is_bigendian: false,
            point_step: 16,
            row_step: 32,
            data,
            is_dense: true,
        }
    }

    fn whole_frame_detection() -> DetectionResult {
        DetectionResult {
            height: 2,
            width: 2,
            classes: vec![0],
            scores: vec![0.9],
            masks: vec![vec![true; 4]],
            image: None,
        }
    }

    fn config() -> FusionConfig {
        FusionConfig {
            estimator: EstimatorConfig {
                downsample_factor: 1,
                min_mask: 1,
                categories: BTreeSet::from([0]),
                outlier_threshold: 0.0,
            },
            ..Default::default()
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(&self, _: &RgbImage, _: &DetectorSettings) -> Result<DetectionResult, FuseError> {
            Err(FuseError::Channel("socket closed".to_string()))
        }
    }

    #[test]
    fn single_instance_covering_the_frame() {
        let pipeline =
            FusionPipeline::new(config(), RecordedDetector::new(whole_frame_detection())).unwrap();
        let out = pipeline.process(&frame(), false).unwrap();

        assert_eq!(out.obstacles.header, frame().header);
        assert_eq!(out.obstacles.obstacles.len(), 1);
        let o = out.obstacles.obstacles[0];
        assert_eq!(o.score, 0.9);
        assert!((o.position.x - 0.5).abs() < 1e-6);
        assert!((o.position.y - 0.5).abs() < 1e-6);
        assert!((o.position.z - 1.5).abs() < 1e-6);
        assert!((o.size.x - 1.0).abs() < 1e-6);
        assert!((o.size.y - 1.0).abs() < 1e-6);
        assert!((o.size.z - 1.0).abs() < 1e-6);
        assert!(out.image.is_none());
    }

    #[test]
    fn image_falls_back_to_decoded_colours() {
        let pipeline =
            FusionPipeline::new(config(), RecordedDetector::new(whole_frame_detection())).unwrap();
        let image = pipeline.process(&frame(), true).unwrap().image.unwrap();
        assert_eq!(image.encoding, "rgb8");
        assert_eq!((image.height, image.width, image.step), (2, 2, 6));
        assert_eq!(image.header, frame().header);
        assert_eq!(&image.data[..6], &[10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn detector_visualisation_wins_when_present() {
        let mut detection = whole_frame_detection();
        detection.image = Some(RgbImage::new(2, 2, vec![255; 12]));
        let pipeline = FusionPipeline::new(config(), RecordedDetector::new(detection)).unwrap();
        let image = pipeline.process(&frame(), true).unwrap().image.unwrap();
        assert_eq!(image.data, vec![255; 12]);
    }

    #[test]
    fn image_disabled_by_config() {
        let cfg = FusionConfig {
            publish_image: false,
            ..config()
        };
        let pipeline = FusionPipeline::new(cfg, RecordedDetector::new(whole_frame_detection())).unwrap();
        assert!(pipeline.process(&frame(), true).unwrap().image.is_none());
    }

    #[test]
    fn no_detections_is_an_empty_result() {
        let empty = DetectionResult {
            height: 2,
            width: 2,
            ..Default::default()
        };
        let pipeline = FusionPipeline::new(config(), RecordedDetector::new(empty)).unwrap();
        let out = pipeline.process(&frame(), false).unwrap();
        assert!(out.obstacles.obstacles.is_empty());
        assert_eq!(out.obstacles.header.stamp.sec, 42);
    }

    #[test]
    fn detector_failure_is_detection_unavailable() {
        let pipeline = FusionPipeline::new(config(), FailingDetector).unwrap();
        match pipeline.process(&frame(), false) {
            Err(FuseError::DetectionUnavailable(msg)) => assert!(msg.contains("socket closed")),
            other => panic!("expected DetectionUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_detector_output_is_rejected() {
        let mut short_mask = whole_frame_detection();
        short_mask.masks = vec![vec![true; 3]];
        let pipeline = FusionPipeline::new(config(), RecordedDetector::new(short_mask)).unwrap();
        assert!(matches!(
            pipeline.process(&frame(), false),
            Err(FuseError::DetectionUnavailable(_))
        ));

        let wrong_grid = DetectionResult {
            height: 1,
            width: 4,
            ..whole_frame_detection()
        };
        let pipeline = FusionPipeline::new(config(), RecordedDetector::new(wrong_grid)).unwrap();
        assert!(matches!(
            pipeline.process(&frame(), false),
            Err(FuseError::DetectionUnavailable(_))
        ));
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let pipeline =
            FusionPipeline::new(config(), RecordedDetector::new(whole_frame_detection())).unwrap();
        let mut bad = frame();
        bad.data.truncate(40);
        assert!(matches!(
            pipeline.process(&bad, false),
            Err(FuseError::MalformedFrame(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut cfg = config();
        cfg.estimator.downsample_factor = 0;
        assert!(matches!(
            FusionPipeline::new(cfg, RecordedDetector::default()),
            Err(FuseError::InvalidConfig(_))
        ));
    }
}
