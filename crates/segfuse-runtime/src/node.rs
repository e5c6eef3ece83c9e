//! [`FusionNode`] – drives the pipeline from a transport.
//!
//! For every inbound frame:
//!
//! 1. **Skip** it when nobody listens for obstacles or images.  Nothing is
//!    decoded.
//! 2. **Gate** it through [`FrameGate`]; if a frame is already in flight the
//!    new one is dropped and reported on the transport.
//! 3. **Process** it with [`FusionPipeline::process`] on a blocking worker.
//! 4. **Publish** the obstacles, and the image when someone wants it.
//!
//! A failed frame is logged and reported; the next frame is processed
//! independently.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use segfuse_middleware::TransportAdapter;
use segfuse_types::{FuseError, PointCloudFrame};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::detector::Detector;
use crate::frame_gate::{FrameGate, FramePermit};
use crate::pipeline::{FusionOutput, FusionPipeline};

/// Reason attached to frames dropped by the gate.
pub const DROP_BUSY: &str = "busy";

// ─────────────────────────────────────────────────────────────────────────────
// Counters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped_busy: AtomicU64,
    skipped_idle: AtomicU64,
}

/// Snapshot of the node's frame counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStats {
    pub processed: u64,
    pub failed: u64,
    /// Dropped because another frame was in flight.
    pub dropped_busy: u64,
    /// Skipped because nobody was listening.
    pub skipped_idle: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// FusionNode
// ─────────────────────────────────────────────────────────────────────────────

pub struct FusionNode<D> {
    pipeline: Arc<FusionPipeline<D>>,
    gate: FrameGate,
    counters: Arc<Counters>,
}

impl<D> Clone for FusionNode<D> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            gate: self.gate.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<D: Detector + 'static> FusionNode<D> {
    pub fn new(pipeline: FusionPipeline<D>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            gate: FrameGate::new(),
            counters: Arc::default(),
        }
    }

    pub fn pipeline(&self) -> &FusionPipeline<D> {
        &self.pipeline
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped_busy: self.counters.dropped_busy.load(Ordering::Relaxed),
            skipped_idle: self.counters.skipped_idle.load(Ordering::Relaxed),
        }
    }

    /// Process a single frame synchronously, image included.
    pub fn process_one(&self, frame: &PointCloudFrame) -> Result<FusionOutput, FuseError> {
        self.pipeline.process(frame, true)
    }

    /// Consume the adapter's frame stream until it ends.
    pub async fn run<A>(&self, adapter: Arc<A>)
    where
        A: TransportAdapter + ?Sized + 'static,
    {
        self.run_until(adapter, std::future::pending()).await;
    }

    /// Consume the adapter's frame stream until it ends or `shutdown`
    /// resolves.  A frame still in flight at shutdown is allowed to finish.
    pub async fn run_until<A, F>(&self, adapter: Arc<A>, shutdown: F)
    where
        A: TransportAdapter + ?Sized + 'static,
        F: Future<Output = ()>,
    {
        let mut frames = adapter.frame_stream().await;
        let mut in_flight: Option<JoinHandle<()>> = None;
        tokio::pin!(shutdown);
        info!("fusion node started");

        loop {
            let frame = tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                next = frames.next() => match next {
                    Some(frame) => frame,
                    None => {
                        info!("frame stream closed");
                        break;
                    }
                },
            };

            let want_obstacles = adapter.has_obstacle_consumers();
            let want_image = adapter.has_image_consumers();
            if !want_obstacles && !want_image {
                debug!(frame_id = %frame.header.frame_id, "no consumers; frame skipped");
                self.counters.skipped_idle.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let Some(permit) = self.gate.try_acquire() else {
                debug!(frame_id = %frame.header.frame_id, "frame in flight; frame dropped");
                self.counters.dropped_busy.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = adapter.frame_dropped(frame.header.clone(), DROP_BUSY).await {
                    warn!(error = %e, "could not report dropped frame");
                }
                continue;
            };

            in_flight = Some(tokio::spawn(handle_frame(
                Arc::clone(&self.pipeline),
                Arc::clone(&adapter),
                Arc::clone(&self.counters),
                frame,
                want_image,
                permit,
            )));
        }

        if let Some(handle) = in_flight
            && let Err(e) = handle.await
        {
            error!(error = %e, "in-flight frame task failed");
        }
        info!(stats = ?self.stats(), "fusion node stopped");
    }
}

async fn handle_frame<D, A>(
    pipeline: Arc<FusionPipeline<D>>,
    adapter: Arc<A>,
    counters: Arc<Counters>,
    frame: Arc<PointCloudFrame>,
    want_image: bool,
    permit: FramePermit,
) where
    D: Detector + 'static,
    A: TransportAdapter + ?Sized + 'static,
{
    let header = frame.header.clone();
    let worker = tokio::task::spawn_blocking(move || (pipeline.process(&frame, want_image), permit));

    match worker.await {
        Ok((Ok(output), _permit)) => {
            counters.processed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = adapter.publish_obstacles(output.obstacles).await {
                warn!(frame_id = %header.frame_id, error = %e, "failed to publish obstacles");
            }
            if let Some(image) = output.image
                && let Err(e) = adapter.publish_image(image).await
            {
                warn!(frame_id = %header.frame_id, error = %e, "failed to publish image");
            }
        }
        Ok((Err(e), _permit)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(frame_id = %header.frame_id, error = %e, "frame failed");
            if let Err(report) = adapter.frame_dropped(header, &e.to_string()).await {
                warn!(error = %report, "could not report failed frame");
            }
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(frame_id = %header.frame_id, error = %e, "frame worker panicked");
        }
    }
}
