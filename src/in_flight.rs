use std::sync::atomic::{AtomicBool, Ordering};

/// Claim on a single-slot in-flight flag, released on drop.
///
/// Dropping the owning future releases the slot too, so an abandoned fetch or
/// submission never leaves its controller stuck in the busy state.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
