//! Timeline fences shared between the render and compute APIs.
//!
//! A timeline fence carries one monotonically increasing 64-bit value. The
//! producer signals a new value after submitting its work; the consumer waits
//! for that value before launching dependent work. Signals must strictly
//! increase and observed values must never go backwards; either violation
//! is a logic bug and panics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::resource::{Exported, Imported};
use crate::{ExternalHandle, InteropError, InteropResult};

/// Which API performs a fence operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Host rendering API (Vulkan, D3D12).
    Render,
    /// Compute API (CUDA, HIP, SYCL).
    Compute,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Render => "render",
            Self::Compute => "compute",
        })
    }
}

/// Result of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Host wait completed; the fence held this value afterwards.
    Observed(u64),
    /// Device-side wait recorded on a queue/stream; the host did not block.
    Enqueued,
}

/// One API's handle on a timeline fence.
pub trait TimelineEndpoint: Send + Sync {
    /// Signal `value` from this API.
    fn signal(&self, value: u64) -> InteropResult<()>;

    /// Wait until the fence reaches `value`.
    fn wait(&self, value: u64) -> InteropResult<WaitOutcome>;

    /// Current value, `None` when this API cannot query it.
    fn current_value(&self) -> Option<u64>;
}

/// Monotonicity bookkeeping for one fence.
#[derive(Debug)]
pub struct TimelineCursor {
    last_signaled: AtomicU64,
    last_observed: AtomicU64,
}

impl TimelineCursor {
    /// Cursor starting at `initial`.
    pub fn new(initial: u64) -> Self {
        Self {
            last_signaled: AtomicU64::new(initial),
            last_observed: AtomicU64::new(initial),
        }
    }

    /// Claim `value` as the next signal. Returns the previous value.
    ///
    /// # Panics
    ///
    /// If `value` is not strictly greater than every earlier signal.
    pub fn advance(&self, value: u64) -> u64 {
        let mut current = self.last_signaled.load(Ordering::Acquire);
        loop {
            assert!(
                value > current,
                "timeline regression: signal {value} after {current}"
            );
            match self.last_signaled.compare_exchange_weak(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// Undo a claim of `value` whose signal never reached the fence.
    /// A no-op when a later signal has already been claimed.
    pub fn rollback(&self, value: u64, previous: u64) {
        let _ = self
            .last_signaled
            .compare_exchange(value, previous, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Lowest value any wait may observe from now on.
    pub fn observed_floor(&self) -> u64 {
        self.last_observed.load(Ordering::Acquire)
    }

    /// Record an observation made after reading `floor`.
    ///
    /// # Panics
    ///
    /// If `observed` is below `floor` or below `target`.
    pub fn observe(&self, target: u64, floor: u64, observed: u64) {
        assert!(
            observed >= target,
            "timeline wait for {target} returned at {observed}"
        );
        assert!(
            observed >= floor,
            "timeline went backwards: observed {observed} after {floor}"
        );
        self.last_observed.fetch_max(observed, Ordering::AcqRel);
    }

    /// Last signaled value.
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    /// Highest observed value.
    pub fn last_observed(&self) -> u64 {
        self.last_observed.load(Ordering::Acquire)
    }
}

/// A timeline fence exported by the render side and optionally imported
/// by the compute side.
///
/// Share it by `Arc` between the render thread and compute workers once
/// [`import_fence`](crate::InteropBridge::import_fence) has run.
pub struct InteropFence<N, P> {
    // Declared before `native` so the import is destroyed first.
    peer: Option<Imported<P>>,
    native: Exported<N>,
    foreign: Option<ExternalHandle>,
    cursor: TimelineCursor,
}

impl<N: TimelineEndpoint, P: TimelineEndpoint> InteropFence<N, P> {
    pub(crate) fn new(native: N, handle: ExternalHandle, initial: u64) -> Self {
        Self {
            peer: None,
            native: Exported::new(native, "timeline fence"),
            foreign: Some(handle),
            cursor: TimelineCursor::new(initial),
        }
    }

    pub(crate) fn take_foreign(&mut self) -> InteropResult<ExternalHandle> {
        self.foreign.take().ok_or(InteropError::HandleConsumed)
    }

    pub(crate) fn attach_peer(&mut self, peer: P) {
        self.peer = Some(self.native.lease(peer));
    }

    /// True once the compute side has imported the fence.
    pub fn is_imported(&self) -> bool {
        self.peer.is_some()
    }

    fn endpoint(&self, side: Side) -> InteropResult<&dyn TimelineEndpoint> {
        match side {
            Side::Render => Ok(self.native.get() as &dyn TimelineEndpoint),
            Side::Compute => self
                .peer
                .as_ref()
                .map(|p| p.get() as &dyn TimelineEndpoint)
                .ok_or_else(|| InteropError::Import("fence has not been imported".into())),
        }
    }

    /// Signal `value` from `side`.
    ///
    /// # Panics
    ///
    /// If `value` does not exceed the last signaled value. A signal the
    /// endpoint rejected does not count.
    pub fn signal(&self, side: Side, value: u64) -> InteropResult<()> {
        let endpoint = self.endpoint(side)?;
        let previous = self.cursor.advance(value);
        trace!(%side, value, "fence signal");
        endpoint.signal(value).inspect_err(|_| self.cursor.rollback(value, previous))
    }

    /// Wait from `side` until the fence reaches `value`.
    ///
    /// Host waits block with no timeout.
    ///
    /// # Panics
    ///
    /// If a host wait observes a value below `value` or below an earlier
    /// observation.
    pub fn wait(&self, side: Side, value: u64) -> InteropResult<WaitOutcome> {
        let endpoint = self.endpoint(side)?;
        let floor = self.cursor.observed_floor();
        let outcome = endpoint.wait(value)?;
        if let WaitOutcome::Observed(observed) = outcome {
            self.cursor.observe(value, floor, observed);
        }
        trace!(%side, value, ?outcome, "fence wait");
        Ok(outcome)
    }

    /// Last value signaled through this fence.
    pub fn last_signaled_value(&self) -> u64 {
        self.cursor.last_signaled()
    }

    /// Highest value observed by a host wait.
    pub fn last_observed_value(&self) -> u64 {
        self.cursor.last_observed()
    }

    /// Native (render-side) semaphore.
    pub fn native(&self) -> &N {
        self.native.get()
    }

    /// Destroy the import (if any), then hand back the native semaphore.
    pub fn release(self) -> N {
        let Self { peer, native, .. } = self;
        if let Some(peer) = peer {
            peer.release();
        }
        native.release()
    }
}

impl<N, P> fmt::Debug for InteropFence<N, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteropFence")
            .field("imported", &self.peer.is_some())
            .field("handle_pending", &self.foreign.is_some())
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostHandle;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_advance_strictly_increasing() {
        let c = TimelineCursor::new(0);
        c.advance(1);
        c.advance(5);
        assert_eq!(c.last_signaled(), 5);
    }

    #[test]
    #[should_panic(expected = "timeline regression")]
    fn test_repeat_signal_panics() {
        let c = TimelineCursor::new(0);
        c.advance(2);
        c.advance(2);
    }

    #[test]
    #[should_panic(expected = "timeline regression")]
    fn test_signal_at_initial_panics() {
        TimelineCursor::new(3).advance(3);
    }

    #[test]
    fn test_rollback_only_undoes_latest_claim() {
        let c = TimelineCursor::new(0);
        let prev = c.advance(4);
        c.rollback(4, prev);
        assert_eq!(c.last_signaled(), 0);

        let prev = c.advance(2);
        c.advance(3);
        c.rollback(2, prev);
        assert_eq!(c.last_signaled(), 3);
    }

    /// Endpoint whose native signal fails until `healthy` is set.
    struct FlakyEndpoint {
        healthy: AtomicBool,
        value: AtomicU64,
    }

    impl TimelineEndpoint for FlakyEndpoint {
        fn signal(&self, value: u64) -> InteropResult<()> {
            if !self.healthy.load(Ordering::Acquire) {
                return Err(InteropError::driver("vkSignalSemaphore", "ERROR_DEVICE_LOST"));
            }
            self.value.store(value, Ordering::Release);
            Ok(())
        }

        fn wait(&self, _value: u64) -> InteropResult<WaitOutcome> {
            Ok(WaitOutcome::Observed(self.value.load(Ordering::Acquire)))
        }

        fn current_value(&self) -> Option<u64> {
            Some(self.value.load(Ordering::Acquire))
        }
    }

    #[test]
    fn test_failed_native_signal_keeps_value_available() {
        let endpoint = FlakyEndpoint { healthy: AtomicBool::new(false), value: AtomicU64::new(0) };
        let fence: InteropFence<FlakyEndpoint, FlakyEndpoint> =
            InteropFence::new(endpoint, ExternalHandle::Host(HostHandle::detached(1)), 0);

        assert!(matches!(fence.signal(Side::Render, 1), Err(InteropError::Driver { .. })));
        assert_eq!(fence.last_signaled_value(), 0);

        fence.native().healthy.store(true, Ordering::Release);
        fence.signal(Side::Render, 1).unwrap();
        assert_eq!(fence.last_signaled_value(), 1);
        assert_eq!(fence.native().current_value(), Some(1));
        assert_eq!(fence.release().value.load(Ordering::Acquire), 1);
    }

    #[test]
    #[should_panic(expected = "went backwards")]
    fn test_observation_below_floor_panics() {
        let c = TimelineCursor::new(0);
        c.observe(1, 0, 4);
        let floor = c.observed_floor();
        c.observe(1, floor, 3);
    }

    #[test]
    #[should_panic(expected = "returned at")]
    fn test_observation_below_target_panics() {
        TimelineCursor::new(0).observe(5, 0, 4);
    }
}
