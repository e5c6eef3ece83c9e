//! Point-cloud channel decoder.
//!
//! Splits a packed `sensor_msgs/PointCloud2` buffer into:
//! - an RGB image of shape `height × width × 3`, read from three consecutive
//!   colour bytes in every record, and
//! - three coordinate channels (x, y, z) holding every `k`-th record, where
//!   `k` is the configured down-sample factor.
//!
//! The numeric width of the coordinates is selected from the datatype code
//! of the **first** field descriptor (see [`numeric_width`]).  Elements are
//! then read as IEEE floats of that width (8 → f64, 4 → f32, 2 → binary16);
//! 1-byte elements have no float encoding and are read as plain integers.
//!
//! # Example
//!
//! ```rust
//! use segfuse_perception::decoder::ChannelDecoder;
//! use segfuse_types::{FieldDescriptor, Header, PointCloudFrame, PointFieldType};
//!
//! let mut data = Vec::new();
//! for v in [1.0f32, 2.0, 3.0] {
//!     data.extend_from_slice(&v.to_le_bytes());
//! }
//! data.extend_from_slice(&[10, 20, 30, 0]);
//!
//! let frame = PointCloudFrame {
//!     header: Header::default(),
//!     height: 1,
//!     width: 1,
//!     fields: vec![
//!         FieldDescriptor::new("x", 0, PointFieldType::Float32),
//!         FieldDescriptor::new("y", 4, PointFieldType::Float32),
//!         FieldDescriptor::new("z", 8, PointFieldType::Float32),
//!         FieldDescriptor::new("rgb", 12, PointFieldType::Float32),
//!     ],
//!     is_bigendian: false,
//!     point_step: 16,
//!     row_step: 16,
//!     data,
//!     is_dense: true,
//! };
//!
//! let channels = ChannelDecoder::new(1).unwrap().decode(&frame).unwrap();
//! assert_eq!(channels.z, vec![3.0]);
//! assert_eq!(channels.image.pixel(0, 0), Some([10, 20, 30]));
//! ```

use segfuse_types::{FuseError, PointCloudFrame, PointFieldType, RgbImage, numeric_width};
use tracing::instrument;

// ────────────────────────────────────────────────────────────────────────────
// Output type
// ────────────────────────────────────────────────────────────────────────────

/// Channels decoded from one frame. Produced fresh per frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedChannels {
    /// Full-resolution colour image.
    pub image: RgbImage,
    /// Down-sampled coordinates; all three have the same length.
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl DecodedChannels {
    /// Number of retained (down-sampled) points.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Coordinates of retained point `i`.
    pub fn point(&self, i: usize) -> Option<[f64; 3]> {
        Some([*self.x.get(i)?, *self.y.get(i)?, *self.z.get(i)?])
    }
}

/// Number of records kept when taking every `factor`-th of `total` records.
pub fn downsampled_len(total: usize, factor: usize) -> usize {
    if factor == 0 { 0 } else { total / factor }
}

// ────────────────────────────────────────────────────────────────────────────
// Scalar element encoding
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    I8,
    U8,
    F16,
    F32,
    F64,
}

impl Scalar {
    fn for_datatype(code: u8) -> Result<Self, FuseError> {
        Ok(match numeric_width(code)? {
            1 if code == PointFieldType::Int8 as u8 => Scalar::I8,
            1 => Scalar::U8,
            2 => Scalar::F16,
            4 => Scalar::F32,
            _ => Scalar::F64,
        })
    }

    fn width(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::F16 => 2,
            Scalar::F32 => 4,
            Scalar::F64 => 8,
        }
    }

    /// Read one element from the front of `bytes` (bounds already checked).
    fn read(self, bytes: &[u8], big_endian: bool) -> f64 {
        match self {
            Scalar::I8 => f64::from(bytes[0] as i8),
            Scalar::U8 => f64::from(bytes[0]),
            Scalar::F16 => {
                let b = array::<2>(bytes);
                let bits = if big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) };
                f64::from(f16_to_f32(bits))
            }
            Scalar::F32 => {
                let b = array::<4>(bytes);
                let v = if big_endian { f32::from_be_bytes(b) } else { f32::from_le_bytes(b) };
                f64::from(v)
            }
            Scalar::F64 => {
                let b = array::<8>(bytes);
                if big_endian { f64::from_be_bytes(b) } else { f64::from_le_bytes(b) }
            }
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// IEEE 754 binary16 → binary32.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1f);
    let frac = u32::from(bits & 0x3ff);
    match (exp, frac) {
        (0, 0) => f32::from_bits(sign),
        (0, _) => {
            // Subnormal: frac · 2⁻²⁴
            let v = frac as f32 / 16_777_216.0;
            if sign != 0 { -v } else { v }
        }
        (0x1f, 0) => f32::from_bits(sign | 0x7f80_0000),
        (0x1f, _) => f32::from_bits(sign | 0x7fc0_0000 | (frac << 13)),
        _ => f32::from_bits(sign | ((exp + 112) << 23) | (frac << 13)),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ChannelDecoder
// ────────────────────────────────────────────────────────────────────────────

/// Stateless decoder bound to a down-sample factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDecoder {
    downsample_factor: usize,
}

impl ChannelDecoder {
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidConfig`] when `downsample_factor` is 0.
    pub fn new(downsample_factor: usize) -> Result<Self, FuseError> {
        if downsample_factor == 0 {
            return Err(FuseError::InvalidConfig(
                "downsample_factor must be at least 1".to_string(),
            ));
        }
        Ok(Self { downsample_factor })
    }

    pub fn downsample_factor(&self) -> usize {
        self.downsample_factor
    }

    /// Decode the RGB image and down-sampled coordinates of `frame`.
    ///
    /// # Errors
    ///
    /// - [`FuseError::MalformedFrame`] if the buffer size disagrees with the
    ///   declared geometry or a channel does not fit inside a record.
    /// - [`FuseError::UnsupportedDatatype`] if the first field's datatype code
    ///   has no known width.
    #[instrument(level = "debug", skip_all, fields(height = frame.height, width = frame.width, point_step = frame.point_step))]
    pub fn decode(&self, frame: &PointCloudFrame) -> Result<DecodedChannels, FuseError> {
        let image = decode_image(frame)?;
        let [x, y, z] = self.decode_coordinates(frame)?;
        Ok(DecodedChannels { image, x, y, z })
    }

    /// Decode only the x/y/z channels, keeping records `0, k, 2k, …`.
    ///
    /// x, y and z are the first three `w`-byte slots of every record, where
    /// `w` is the width of the first field's datatype. Field names are not
    /// consulted.
    pub fn decode_coordinates(&self, frame: &PointCloudFrame) -> Result<[Vec<f64>; 3], FuseError> {
        let total = check_geometry(frame)?;
        let point_step = frame.point_step as usize;

        let first = frame
            .fields
            .first()
            .ok_or_else(|| FuseError::MalformedFrame("frame declares no fields".to_string()))?;
        let scalar = Scalar::for_datatype(first.datatype)?;
        let width = scalar.width();

        if 3 * width > point_step {
            return Err(FuseError::MalformedFrame(format!(
                "three {width}-byte coordinates do not fit in point_step {point_step}"
            )));
        }

        let kept = downsampled_len(total, self.downsample_factor);
        let mut channels = [
            Vec::with_capacity(kept),
            Vec::with_capacity(kept),
            Vec::with_capacity(kept),
        ];
        let records = frame
            .data
            .chunks_exact(point_step)
            .step_by(self.downsample_factor)
            .take(kept);
        for record in records {
            for (channel, slot) in channels.iter_mut().zip(record.chunks_exact(width)) {
                channel.push(scalar.read(slot, frame.is_bigendian));
            }
        }
        Ok(channels)
    }
}

/// Convenience wrapper: `ChannelDecoder::new(downsample_factor)?.decode(frame)`.
pub fn decode(frame: &PointCloudFrame, downsample_factor: usize) -> Result<DecodedChannels, FuseError> {
    ChannelDecoder::new(downsample_factor)?.decode(frame)
}

/// Extract the full-resolution RGB image from the colour field.
///
/// The colour field is looked up as `rgb`, then `rgba`, then the fourth
/// descriptor.  Its three bytes at `offset`, `offset + 1`, `offset + 2` are
/// taken as r, g, b.
pub fn decode_image(frame: &PointCloudFrame) -> Result<RgbImage, FuseError> {
    let total = check_geometry(frame)?;
    let point_step = frame.point_step as usize;
    let rgb = frame
        .field("rgb")
        .or_else(|| frame.field("rgba"))
        .or_else(|| frame.fields.get(3))
        .ok_or_else(|| FuseError::MalformedFrame("frame has no colour field".to_string()))?;
    let offset = rgb.offset as usize;
    if offset + 2 >= point_step {
        return Err(FuseError::MalformedFrame(format!(
            "colour offset {offset} does not leave three bytes inside point_step {point_step}"
        )));
    }

    let mut data = Vec::with_capacity(total * 3);
    for record in frame.data.chunks_exact(point_step) {
        data.extend_from_slice(&record[offset..offset + 3]);
    }
    Ok(RgbImage::new(frame.height, frame.width, data))
}

/// Check the buffer against the declared geometry and return the record
/// count. Every later index stays inside `data` once this passes.
fn check_geometry(frame: &PointCloudFrame) -> Result<usize, FuseError> {
    if frame.point_step == 0 {
        return Err(FuseError::MalformedFrame("point_step is 0".to_string()));
    }
    let (Some(total), Some(expected)) = (frame.total_points(), frame.expected_data_len()) else {
        return Err(FuseError::MalformedFrame(format!(
            "geometry {}x{} with point_step {} overflows",
            frame.height, frame.width, frame.point_step
        )));
    };
    if frame.data.len() != expected {
        return Err(FuseError::MalformedFrame(format!(
            "buffer holds {} bytes, geometry {}x{} with point_step {} needs {}",
            frame.data.len(),
            frame.height,
            frame.width,
            frame.point_step,
            expected
        )));
    }
    Ok(total)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
