//! Refcounted sync objects shared across the IPC boundary.

use std::{os::fd::OwnedFd, sync::Arc};

use crate::bundle::{BundleError, FenceHandle, GraphicsBundle, SemaphoreHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// A timeline semaphore with an exported native sync handle. Cloned via
/// `Arc`; the underlying primitive is destroyed when the last owner drops.
pub struct CompositorSemaphore {
    handle: SemaphoreHandle,
    native: OwnedFd,
    bundle: Arc<dyn GraphicsBundle>,
}

impl CompositorSemaphore {
    pub fn create(bundle: Arc<dyn GraphicsBundle>) -> Result<Arc<Self>, BundleError> {
        let (handle, native) = bundle.create_semaphore()?;
        Ok(Arc::new(Self {
            handle,
            native,
            bundle,
        }))
    }

    pub fn handle(&self) -> SemaphoreHandle {
        self.handle
    }

    /// A dup of the exported native sync handle, for the IPC reply.
    pub fn export_native(&self) -> std::io::Result<OwnedFd> {
        use std::os::fd::AsFd;
        self.native.as_fd().try_clone_to_owned()
    }

    pub fn signal(&self, value: u64) -> Result<(), BundleError> {
        self.bundle.signal_semaphore(self.handle, value)
    }

    /// Waits for the timeline to reach `value`. A timeout is an expected
    /// outcome, not an error.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<WaitOutcome, BundleError> {
        match self.bundle.wait_semaphore(self.handle, value, timeout_ns) {
            Ok(()) => Ok(WaitOutcome::Signaled),
            Err(BundleError::Timeout) => Ok(WaitOutcome::TimedOut),
            Err(other) => Err(other),
        }
    }
}

impl Drop for CompositorSemaphore {
    fn drop(&mut self) {
        self.bundle.destroy_semaphore(self.handle);
    }
}

/// A fence imported from a client's native sync handle. Its only operation
/// is waiting for the signal.
pub struct ImportedFence {
    handle: FenceHandle,
    bundle: Arc<dyn GraphicsBundle>,
}

impl ImportedFence {
    pub fn import(bundle: Arc<dyn GraphicsBundle>, native: OwnedFd) -> Result<Self, BundleError> {
        let handle = bundle.import_fence(native)?;
        Ok(Self { handle, bundle })
    }

    pub fn wait(&self, timeout_ns: u64) -> Result<WaitOutcome, BundleError> {
        match self.bundle.wait_fence(self.handle, timeout_ns) {
            Ok(()) => Ok(WaitOutcome::Signaled),
            Err(BundleError::Timeout) => Ok(WaitOutcome::TimedOut),
            Err(other) => Err(other),
        }
    }
}

impl Drop for ImportedFence {
    fn drop(&mut self) {
        self.bundle.destroy_fence(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBundle;

    #[test]
    fn semaphore_wait_distinguishes_timeout() {
        let bundle: Arc<dyn GraphicsBundle> = Arc::new(HeadlessBundle::new());
        let semaphore = CompositorSemaphore::create(bundle).unwrap();

        assert_eq!(
            semaphore.wait(1, 2_000_000).unwrap(),
            WaitOutcome::TimedOut
        );
        semaphore.signal(1).unwrap();
        assert_eq!(
            semaphore.wait(1, 2_000_000).unwrap(),
            WaitOutcome::Signaled
        );
    }

    #[test]
    fn imported_fence_waits_for_signal() {
        let bundle: Arc<dyn GraphicsBundle> = Arc::new(HeadlessBundle::new());
        let native = nix::sys::memfd::memfd_create(
            c"setsuna-fence-test",
            nix::sys::memfd::MemFdCreateFlag::empty(),
        )
        .unwrap();
        let fence = ImportedFence::import(bundle, native).unwrap();
        // Headless submissions complete synchronously.
        assert_eq!(fence.wait(1_000_000).unwrap(), WaitOutcome::Signaled);
    }

    #[test]
    fn dropping_the_last_owner_destroys_the_primitive() {
        let headless = Arc::new(HeadlessBundle::new());
        let bundle: Arc<dyn GraphicsBundle> = headless.clone();
        let semaphore = CompositorSemaphore::create(bundle).unwrap();
        let handle = semaphore.handle();
        let second = semaphore.clone();

        drop(semaphore);
        assert!(headless.semaphore_value(handle).is_some());
        drop(second);
        assert!(headless.semaphore_value(handle).is_none());
    }
}
