//! Queues where command buffers are submitted.
//!
//! Vulkan requires host access to a queue to be externally synchronized. A [`Queue`] owns the
//! native handle behind a lock and every submission-class call takes that lock for exactly the
//! duration of the native call.

use crate::{device::DeviceFunctions, VulkanError};
use ash::vk;
use parking_lot::Mutex;
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Represents a queue where commands can be submitted.
///
/// Two `Queue` values never share a lock, even if they wrap the same native queue. Create a
/// single `Queue` per native queue and share it with an `Arc`.
pub struct Queue {
    handle: Mutex<vk::Queue>,
    device: Arc<dyn DeviceFunctions>,
    queue_family_index: u32,
    queue_index: u32,
}

impl Queue {
    /// Wraps a native queue.
    ///
    /// # Safety
    ///
    /// - `handle` must be a queue of `device`, retrieved with `queue_family_index` and
    ///   `queue_index`.
    /// - No other code may access `handle` except through the returned `Queue`.
    pub unsafe fn from_handle(
        device: Arc<dyn DeviceFunctions>,
        handle: vk::Queue,
        queue_family_index: u32,
        queue_index: u32,
    ) -> Arc<Queue> {
        Arc::new(Queue {
            handle: Mutex::new(handle),
            device,
            queue_family_index,
            queue_index,
        })
    }

    /// Returns the device that owns `self`.
    #[inline]
    pub fn device(&self) -> &Arc<dyn DeviceFunctions> {
        &self.device
    }

    /// Returns the index of the queue family that this queue belongs to.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Returns the index of this queue within its queue family.
    #[inline]
    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    /// Submits command buffers, signaling `fence` once all of them have completed.
    ///
    /// # Safety
    ///
    /// - Every handle referenced by `submits` must be valid and must stay alive until the
    ///   submission completes.
    pub unsafe fn submit(
        &self,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        self.with(|queue| unsafe { self.device.queue_submit(queue, submits, fence) })
    }

    /// Binds device memory to sparse resources.
    ///
    /// # Safety
    ///
    /// - Every handle referenced by `bind_infos` must be valid.
    pub unsafe fn bind_sparse(
        &self,
        bind_infos: &[vk::BindSparseInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        self.with(|queue| unsafe { self.device.queue_bind_sparse(queue, bind_infos, fence) })
    }

    /// Queues swapchain images for presentation. Returns `true` if the swapchain is suboptimal
    /// for the surface.
    ///
    /// # Safety
    ///
    /// - Every swapchain and semaphore referenced by `present_info` must be valid.
    pub unsafe fn present(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, VulkanError> {
        self.with(|queue| unsafe { self.device.queue_present(queue, present_info) })
    }

    /// Waits until all work on this queue has finished.
    ///
    /// This stalls the whole queue and every thread that wants to submit to it in the meantime.
    /// It is meant for teardown, for example before destroying the resources that in-flight
    /// frames may reference. Steady-state rendering should wait on per-frame fences instead.
    pub fn wait_idle(&self) -> Result<(), VulkanError> {
        // SAFETY: The queue handle belongs to `self.device`.
        self.with(|queue| unsafe { self.device.queue_wait_idle(queue) })
    }

    /// Locks the queue and runs `func` with the native handle.
    ///
    /// The lock is held until `func` returns. `func` must not call back into `self`, since the
    /// lock is not reentrant.
    #[inline]
    pub fn with<R>(&self, func: impl FnOnce(vk::Queue) -> R) -> R {
        let handle = self.handle.lock();

        func(*handle)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("handle", &self.handle)
            .field("queue_family_index", &self.queue_family_index)
            .field("queue_index", &self.queue_index)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Queue {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for Queue {}

impl Hash for Queue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self, state);
    }
}
