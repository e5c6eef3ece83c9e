//! `segfuse-perception` – geometric fusion core.
//!
//! Turns a packed point-cloud buffer and a 2-D instance segmentation into
//! axis-aligned 3-D boxes, one per detected object.
//!
//! # Modules
//!
//! - [`decoder`] – [`ChannelDecoder`][decoder::ChannelDecoder]: splits a
//!   `PointCloud2` byte buffer into an RGB image and down-sampled x/y/z
//!   coordinate channels.
//! - [`outlier`] – [`DiagonalGaussian`][outlier::DiagonalGaussian] and
//!   [`filter`][outlier::filter]: drops points whose Gaussian density falls
//!   below a threshold.
//! - [`bbox`] – [`BoundingBox`][bbox::BoundingBox]: min/max extent of a point
//!   subset.
//! - [`estimator`] – [`estimate`][estimator::estimate]: associates each mask
//!   with its points and emits one [`Obstacle`][segfuse_types::Obstacle] per
//!   surviving instance.

pub mod bbox;
pub mod decoder;
pub mod estimator;
pub mod outlier;

pub use decoder::{ChannelDecoder, DecodedChannels};
pub use estimator::{EstimatorConfig, estimate};
