//! Buffers and their upload.
//!
//! - [`staging`] copies host data into device-local buffers through a ring of host-visible
//!   staging memory.
//! - [`cache`] deduplicates per-frame vertex and index payloads by content.

pub use self::{
    cache::BufferCache,
    staging::{StagingBelt, StagingBeltCreateInfo, Upload},
};
use crate::{DeviceSize, ValidationError};
use ash::vk;

pub mod cache;
pub mod staging;

/// A buffer together with the memory bound to it.
///
/// A `RawBuffer` does not destroy itself when dropped. It must be handed back to
/// [`DeviceFunctions::destroy_buffer`](crate::device::DeviceFunctions::destroy_buffer).
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RawBuffer {
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    create_info: BufferCreateInfo,
}

impl RawBuffer {
    /// Assembles a `RawBuffer` from raw handles.
    ///
    /// # Safety
    ///
    /// - `handle` must have been created from `create_info`, with `memory` bound to it.
    /// - `memory` must have been allocated from a memory type matching `create_info.location`.
    #[inline]
    pub unsafe fn from_raw(
        handle: vk::Buffer,
        memory: vk::DeviceMemory,
        create_info: BufferCreateInfo,
    ) -> Self {
        RawBuffer {
            handle,
            memory,
            create_info,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.create_info.size
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.create_info.usage
    }

    /// Returns where the memory of the buffer lives. Only
    /// [`HostVisible`](MemoryLocation::HostVisible) buffers can be written from the host.
    #[inline]
    pub fn location(&self) -> MemoryLocation {
        self.create_info.location
    }
}

/// Where the memory of a new buffer should live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Fastest for the device, not accessible from the host.
    #[default]
    DeviceLocal,

    /// Mappable and coherent, used for staging.
    HostVisible,
}

/// Parameters to create a new [`RawBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: DeviceSize,

    /// How the buffer is going to be used.
    ///
    /// The default value is empty, which must be overridden.
    pub usage: vk::BufferUsageFlags,

    /// The default value is [`MemoryLocation::DeviceLocal`].
    pub location: MemoryLocation,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            location: MemoryLocation::DeviceLocal,
        }
    }
}

impl BufferCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.size == 0 {
            return Err(ValidationError::new("size", "is zero"));
        }

        if self.usage.is_empty() {
            return Err(ValidationError::new("usage", "is empty"));
        }

        Ok(())
    }
}
