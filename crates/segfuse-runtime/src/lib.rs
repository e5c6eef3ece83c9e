//! `segfuse-runtime` – runs the fusion pipeline against live traffic.
//!
//! # Modules
//!
//! - [`detector`] – the [`Detector`] seam, with
//!   [`RemoteDetector`][detector::RemoteDetector] (HTTP model server) and
//!   [`RecordedDetector`][detector::RecordedDetector] (replay).
//! - [`pipeline`] – [`FusionPipeline`]: decode → detect → estimate for one
//!   frame, configured by an immutable [`FusionConfig`].
//! - [`frame_gate`] – [`FrameGate`]: keeps at most one frame in flight and
//!   drops the rest.
//! - [`node`] – [`FusionNode`]: pulls frames from a
//!   [`TransportAdapter`][segfuse_middleware::TransportAdapter], runs the
//!   pipeline on a blocking worker and publishes the results.
//! - [`telemetry`] – [`init_tracing`]: console logging plus optional OTLP
//!   span export.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable export.

pub mod detector;
pub mod frame_gate;
pub mod node;
pub mod pipeline;
pub mod telemetry;

pub use detector::{Detector, DetectorSettings, RecordedDetector, RemoteDetector};
pub use frame_gate::{FrameGate, FramePermit};
pub use node::{FusionNode, NodeStats};
pub use pipeline::{FusionConfig, FusionOutput, FusionPipeline};
pub use telemetry::{TracerProviderGuard, init_tracing};
