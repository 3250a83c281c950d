//! Frame completion tokens.
//!
//! Buffers handed out during a frame may still be read by the device after the frame has been
//! submitted. Evicting them is only allowed once the frame is known to have completed, which is
//! expressed with two tokens:
//!
//! - [`FrameInFlight`] is returned when a frame is finished. It remembers the frame's generation
//!   and the fence that the caller's submission signals.
//! - [`CompletedFrame`] can only be obtained from a `FrameInFlight`, either by waiting on its
//!   fence or by unsafely asserting that the frame has completed. Evicting operations require
//!   one, and check that its generation is the one they expect.

use crate::{device::DeviceFunctions, VulkanError};
use ash::vk;

/// A frame that has been finished on the host and may still be executing on the device.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "the frame's resources can't be evicted without waiting for the frame"]
pub struct FrameInFlight {
    generation: u64,
    fence: vk::Fence,
}

impl FrameInFlight {
    pub(crate) fn new(generation: u64, fence: vk::Fence) -> Self {
        FrameInFlight { generation, fence }
    }

    /// Returns the generation of the frame.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the fence that is signaled when the frame's submission completes.
    #[inline]
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the frame's fence is signaled, for at most `timeout` nanoseconds.
    ///
    /// # Safety
    ///
    /// - The frame's fence must have been created from `device` and must not have been destroyed.
    ///
    /// # Panics
    ///
    /// - Panics if the frame was finished with a null fence.
    pub unsafe fn wait(
        &self,
        device: &dyn DeviceFunctions,
        timeout: u64,
    ) -> Result<CompletedFrame, VulkanError> {
        assert!(
            self.fence != vk::Fence::null(),
            "the frame was finished without a fence, use `assume_completed` instead",
        );

        unsafe { device.wait_for_fence(self.fence, timeout) }?;

        Ok(CompletedFrame {
            generation: self.generation,
        })
    }

    /// Returns a `CompletedFrame` without waiting.
    ///
    /// # Safety
    ///
    /// - Every submission that references resources handed out during this frame must have
    ///   completed execution on the device.
    #[inline]
    pub unsafe fn assume_completed(&self) -> CompletedFrame {
        CompletedFrame {
            generation: self.generation,
        }
    }
}

/// Proof that a frame has completed execution on the device.
#[derive(Debug, PartialEq, Eq)]
pub struct CompletedFrame {
    generation: u64,
}

impl CompletedFrame {
    /// Returns the generation of the completed frame.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{Call, MockDevice};
    use ash::vk::Handle;

    #[test]
    fn wait_uses_the_fence() {
        let device = MockDevice::new();
        let frame = FrameInFlight::new(3, vk::Fence::from_raw(11));

        let completed = unsafe { frame.wait(&*device, 1_000) }.unwrap();
        assert_eq!(completed.generation(), 3);
        assert_eq!(
            device.calls(),
            [Call::WaitForFence(vk::Fence::from_raw(11))],
        );
    }

    #[test]
    fn wait_propagates_timeouts() {
        let device = MockDevice::new();
        let frame = FrameInFlight::new(0, vk::Fence::from_raw(11));

        device.fail_next(VulkanError::Timeout);
        assert_eq!(
            unsafe { frame.wait(&*device, 0) },
            Err(VulkanError::Timeout),
        );
    }

    #[test]
    #[should_panic(expected = "without a fence")]
    fn wait_without_fence_panics() {
        let device = MockDevice::new();
        let frame = FrameInFlight::new(0, vk::Fence::null());

        let _ = unsafe { frame.wait(&*device, 0) };
    }
}
