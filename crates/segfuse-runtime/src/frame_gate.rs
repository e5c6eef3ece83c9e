//! [`FrameGate`] – at most one frame in flight.
//!
//! Frames that arrive while another is being processed are dropped, never
//! queued: a stale point cloud is worth nothing once a newer one exists.
//!
//! # Example
//!
//! ```rust
//! use segfuse_runtime::frame_gate::FrameGate;
//!
//! let gate = FrameGate::new();
//!
//! let permit = gate.try_acquire().expect("gate is idle");
//! assert!(gate.try_acquire().is_none()); // second frame is dropped
//!
//! drop(permit);
//! assert!(gate.try_acquire().is_some());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared in-flight flag.  Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct FrameGate {
    in_flight: Arc<AtomicBool>,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate for one frame.
    ///
    /// Returns `None` when a frame is already in flight.  The gate reopens
    /// when the returned [`FramePermit`] is dropped.
    pub fn try_acquire(&self) -> Option<FramePermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FramePermit {
                in_flight: Arc::clone(&self.in_flight),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Proof that the holder owns the gate.  Releases it on drop, including
/// during unwinding.
#[derive(Debug)]
#[must_use = "the gate reopens as soon as the permit is dropped"]
pub struct FramePermit {
    in_flight: Arc<AtomicBool>,
}

impl Drop for FramePermit {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}
