//! Object estimator.
//!
//! For every detected instance, in detector order:
//!
//! 1. skip it if a category filter is set and its class is not listed;
//! 2. down-sample its mask with the same factor as the coordinates and take
//!    the indices of the set entries;
//! 3. run the [outlier filter][crate::outlier::filter] over those points;
//! 4. discard it if fewer than `min_mask` points survive;
//! 5. otherwise emit an [`Obstacle`] spanning the surviving points.
//!
//! Instances only read the shared coordinate channels, so with the
//! `parallel` feature they are estimated on the rayon pool.  Results are
//! gathered back in detector order either way.

use std::collections::BTreeSet;

use segfuse_types::{DetectionResult, FuseError, Obstacle};
use tracing::{debug, instrument};

use crate::bbox::BoundingBox;
use crate::decoder::DecodedChannels;
use crate::outlier;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Fixed per-process estimation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// Keep every `downsample_factor`-th point (≥ 1).
    pub downsample_factor: usize,
    /// Minimum surviving points for an instance to be reported.
    pub min_mask: usize,
    /// Class ids to keep.  Empty keeps every class.
    pub categories: BTreeSet<u32>,
    /// Gaussian density cut-off for the outlier filter.
    pub outlier_threshold: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            downsample_factor: 16,
            min_mask: 20,
            categories: BTreeSet::from([0]),
            outlier_threshold: 0.5,
        }
    }
}

impl EstimatorConfig {
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidConfig`] for a zero down-sample factor or
    /// a non-finite threshold.
    pub fn validate(&self) -> Result<(), FuseError> {
        if self.downsample_factor == 0 {
            return Err(FuseError::InvalidConfig(
                "downsample_factor must be at least 1".to_string(),
            ));
        }
        if self.min_mask == 0 {
            return Err(FuseError::InvalidConfig("min_mask must be at least 1".to_string()));
        }
        if !self.outlier_threshold.is_finite() {
            return Err(FuseError::InvalidConfig(format!(
                "outlier_threshold must be finite, got {}",
                self.outlier_threshold
            )));
        }
        Ok(())
    }

    /// True when instances of `class_id` should be considered.
    pub fn accepts(&self, class_id: u32) -> bool {
        self.categories.is_empty() || self.categories.contains(&class_id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Estimation
// ────────────────────────────────────────────────────────────────────────────

/// Estimate one [`Obstacle`] per surviving instance.
///
/// Zero instances yield an empty vector without touching the filter.  Masks
/// are expected to have been checked with [`DetectionResult::validate`].
#[instrument(level = "debug", skip_all, fields(instances = detection.len(), points = channels.len()))]
pub fn estimate(
    detection: &DetectionResult,
    channels: &DecodedChannels,
    config: &EstimatorConfig,
) -> Vec<Obstacle> {
    if detection.is_empty() {
        return Vec::new();
    }

    let per_instance = |i: usize| estimate_instance(detection, i, channels, config);

    #[cfg(feature = "parallel")]
    let results: Vec<Option<Obstacle>> = {
        use rayon::prelude::*;
        (0..detection.len()).into_par_iter().map(per_instance).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let results: Vec<Option<Obstacle>> = (0..detection.len()).map(per_instance).collect();

    results.into_iter().flatten().collect()
}

/// Candidate point indices for `mask`: every `factor`-th entry that is set,
/// re-indexed into the down-sampled grid and clipped to `len` points.
pub fn mask_indices(mask: &[bool], factor: usize, len: usize) -> Vec<usize> {
    mask.iter()
        .step_by(factor.max(1))
        .take(len)
        .enumerate()
        .filter_map(|(i, set)| set.then_some(i))
        .collect()
}

fn estimate_instance(
    detection: &DetectionResult,
    i: usize,
    channels: &DecodedChannels,
    config: &EstimatorConfig,
) -> Option<Obstacle> {
    let class_id = *detection.classes.get(i)?;
    if !config.accepts(class_id) {
        debug!(instance = i, class_id, "instance outside category filter");
        return None;
    }

    let mask = detection.masks.get(i)?;
    let candidates = mask_indices(mask, config.downsample_factor, channels.len());
    let xs: Vec<f64> = candidates.iter().map(|&j| channels.x[j]).collect();
    let ys: Vec<f64> = candidates.iter().map(|&j| channels.y[j]).collect();
    let zs: Vec<f64> = candidates.iter().map(|&j| channels.z[j]).collect();

    let kept = outlier::filter(&xs, &ys, &zs, &candidates, config.outlier_threshold);
    if kept.len() < config.min_mask {
        debug!(
            instance = i,
            candidates = candidates.len(),
            kept = kept.len(),
            min_mask = config.min_mask,
            "instance below min_mask"
        );
        return None;
    }

    let bbox = BoundingBox::from_points(kept.iter().filter_map(|&j| channels.point(j)))?;
    Some(Obstacle {
        score: *detection.scores.get(i)?,
        position: bbox.centre(),
        size: bbox.size(),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode, tests::xyz_rgb_frame};
    use segfuse_types::{RgbImage, Vec3};

    fn channels(points: &[[f64; 3]]) -> DecodedChannels {
        DecodedChannels {
            image: RgbImage::default(),
            x: points.iter().map(|p| p[0]).collect(),
            y: points.iter().map(|p| p[1]).collect(),
            z: points.iter().map(|p| p[2]).collect(),
        }
    }

    fn detection(width: u32, instances: Vec<(u32, f64, Vec<bool>)>) -> DetectionResult {
        let mut det = DetectionResult {
            height: 1,
            width,
            ..Default::default()
        };
        for (class, score, mask) in instances {
            det.classes.push(class);
            det.scores.push(score);
            det.masks.push(mask);
        }
        det
    }

    fn config(min_mask: usize, categories: &[u32]) -> EstimatorConfig {
        EstimatorConfig {
            downsample_factor: 1,
            min_mask,
            categories: categories.iter().copied().collect(),
            outlier_threshold: 0.0,
        }
    }

    /// Five points in a tight cluster.
    fn cluster() -> Vec<[f64; 3]> {
        vec![
            [1.0, 2.0, 3.0],
            [1.1, 2.0, 3.0],
            [1.0, 2.1, 3.0],
            [1.0, 2.0, 3.1],
            [1.05, 2.05, 3.05],
        ]
    }

    #[test]
    fn zero_instances_yield_nothing() {
        let det = detection(5, vec![]);
        assert!(estimate(&det, &channels(&cluster()), &config(1, &[])).is_empty());
    }

    #[test]
    fn bounding_box_uses_range_midpoint() {
        let det = detection(5, vec![(0, 0.75, vec![true; 5])]);
        let out = estimate(&det, &channels(&cluster()), &config(1, &[]));
        assert_eq!(out.len(), 1);
        let o = out[0];
        assert_eq!(o.score, 0.75);
        assert_eq!(o.position, Vec3::new((1.1 + 1.0) / 2.0, (2.1 + 2.0) / 2.0, (3.1 + 3.0) / 2.0));
        assert_eq!(o.size, Vec3::new(1.1 - 1.0, 2.1 - 2.0, 3.1 - 3.0));
    }

    #[test]
    fn min_mask_boundary() {
        let det = detection(5, vec![(0, 0.9, vec![true; 5])]);
        let pts = channels(&cluster());
        assert_eq!(estimate(&det, &pts, &config(5, &[])).len(), 1);
        assert!(estimate(&det, &pts, &config(6, &[])).is_empty());
    }

    #[test]
    fn category_filter() {
        let det = detection(5, vec![(3, 0.9, vec![true; 5])]);
        let pts = channels(&cluster());
        assert_eq!(estimate(&det, &pts, &config(1, &[])).len(), 1);
        assert!(estimate(&det, &pts, &config(1, &[2])).is_empty());
        assert_eq!(estimate(&det, &pts, &config(1, &[2, 3])).len(), 1);
    }

    #[test]
    fn output_preserves_detector_order_without_placeholders() {
        let det = detection(
            5,
            vec![
                (0, 0.1, vec![true, true, false, false, false]),
                (1, 0.2, vec![true; 5]),
                (0, 0.3, vec![false, false, true, true, true]),
                (0, 0.4, vec![false; 5]),
            ],
        );
        let out = estimate(&det, &channels(&cluster()), &config(2, &[0]));
        let scores: Vec<f64> = out.iter().map(|o| o.score).collect();
        assert_eq!(scores, vec![0.1, 0.3]);
    }

    #[test]
    fn outlier_is_excluded_from_box() {
        let mut pts = cluster();
        pts.push([50.0, 50.0, 50.0]);
        let det = detection(6, vec![(0, 0.9, vec![true; 6])]);
        let cfg = EstimatorConfig {
            outlier_threshold: 1e-6,
            ..config(1, &[])
        };
        // A single far point inflates the variance; the filter must still
        // drop it, otherwise the box would span 50 m.
        let out = estimate(&det, &channels(&pts), &cfg);
        assert_eq!(out.len(), 1);
        assert!(out[0].size.x < 1.0, "size {:?}", out[0].size);
    }

    #[test]
    fn mask_is_downsampled_like_the_coordinates() {
        assert_eq!(
            mask_indices(&[true, false, false, true, true, false, false, false], 2, 4),
            vec![0, 2]
        );
        // Entries past the decoded length are ignored.
        assert_eq!(mask_indices(&[true, true, true, true, true], 2, 2), vec![0, 1]);
    }

    #[test]
    fn sizes_are_never_negative() {
        let det = detection(5, vec![(0, 0.9, vec![true; 5])]);
        let out = estimate(&det, &channels(&cluster()), &config(1, &[]));
        let s = out[0].size;
        assert!(s.x >= 0.0 && s.y >= 0.0 && s.z >= 0.0);
    }

    #[test]
    fn config_validation() {
        assert!(EstimatorConfig::default().validate().is_ok());
        let bad = EstimatorConfig {
            downsample_factor: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(FuseError::InvalidConfig(_))));
        let bad = EstimatorConfig {
            outlier_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn zero_min_mask_is_rejected() {
        let bad = EstimatorConfig {
            min_mask: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(FuseError::InvalidConfig(msg)) if msg.contains("min_mask")));
        let ok = EstimatorConfig {
            min_mask: 1,
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn two_by_two_frame_end_to_end() {
        let pts = [
            ([0.0f32, 0.0, 1.0], [255u8, 0, 0]),
            ([1.0, 0.0, 1.5], [0, 255, 0]),
            ([0.0, 2.0, 2.0], [0, 0, 255]),
            ([1.0, 2.0, 1.0], [9, 9, 9]),
        ];
        let frame = xyz_rgb_frame(2, 2, &pts);
        let ch = decode(&frame, 1).unwrap();
        let det = DetectionResult {
            height: 2,
            width: 2,
            classes: vec![0],
            scores: vec![0.9],
            masks: vec![vec![true; 4]],
            image: None,
        };
        let out = estimate(&det, &ch, &config(1, &[0]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 0.9);
        assert_eq!(out[0].position, Vec3::new(0.5, 1.0, 1.5));
        assert_eq!(out[0].size, Vec3::new(1.0, 2.0, 1.0));
    }

    #[test]
    fn downsampled_frame_uses_matching_mask_entries() {
        let pts: Vec<([f32; 3], [u8; 3])> = (0..8)
            .map(|i| ([i as f32 * 0.01, 0.0, 1.0], [0, 0, 0]))
            .collect();
        let frame = xyz_rgb_frame(2, 4, &pts);
        let ch = decode(&frame, 2).unwrap();
        assert_eq!(ch.len(), 4);
        // Mask set on records 2..=5 → kept records 2 and 4 → x in {0.02, 0.04}.
        let mut mask = vec![false; 8];
        mask[2..=5].fill(true);
        let det = DetectionResult {
            height: 2,
            width: 4,
            classes: vec![0],
            scores: vec![0.5],
            masks: vec![mask],
            image: None,
        };
        let cfg = EstimatorConfig {
            downsample_factor: 2,
            ..config(2, &[])
        };
        let out = estimate(&det, &ch, &cfg);
        assert_eq!(out.len(), 1);
        let lo = f64::from(2.0f32 * 0.01);
        let hi = f64::from(4.0f32 * 0.01);
        assert_eq!(out[0].size.x, hi - lo);
        assert_eq!(out[0].position.x, (hi + lo) / 2.0);
    }
}
