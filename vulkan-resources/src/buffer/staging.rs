use super::{BufferCreateInfo, MemoryLocation, RawBuffer};
use crate::{
    device::DeviceFunctions,
    image::{ImageRegion, TextureId, TextureRegistry},
    memory::{RingAllocator, RingAllocatorError},
    queue::Queue,
    DeviceSize, Validated, ValidationError, VulkanError,
};
use ash::vk;
use std::{fmt, ops::Range, sync::Arc};

/// Copies host data into new device-local buffers.
pub trait Upload {
    /// Creates a device-local buffer with `usage` (plus `TRANSFER_DST`) and fills it with `data`.
    ///
    /// The upload has completed on the device when this returns.
    fn stage_and_copy(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<RawBuffer, Validated<VulkanError>>;
}

/// Parameters to create a new [`StagingBelt`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingBeltCreateInfo {
    /// The size in bytes of the host-visible staging buffer. Must be a power of two.
    ///
    /// Uploads bigger than this go through a temporary staging buffer of their own.
    ///
    /// The default value is 4 MiB.
    pub size: DeviceSize,
}

impl Default for StagingBeltCreateInfo {
    #[inline]
    fn default() -> Self {
        Self { size: 1 << 22 }
    }
}

/// An [`Upload`] implementation that stages data in a host-visible buffer whose space is
/// managed by a [`RingAllocator`].
///
/// Every upload records a copy into a single reusable command buffer, submits it to the queue
/// and waits for it on a fence before returning.
pub struct StagingBelt {
    device: Arc<dyn DeviceFunctions>,
    queue: Arc<Queue>,
    ring: RingAllocator,
    staging_buffer: Option<RawBuffer>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl StagingBelt {
    /// Creates a new `StagingBelt` that submits to `queue`.
    pub fn new(
        queue: Arc<Queue>,
        create_info: StagingBeltCreateInfo,
    ) -> Result<Self, Validated<VulkanError>> {
        let StagingBeltCreateInfo { size } = create_info;
        let ring = RingAllocator::new(size).map_err(|err| err.add_context("create_info"))?;
        let device = queue.device().clone();

        let staging_info = BufferCreateInfo {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::HostVisible,
        };
        let staging_buffer = unsafe { device.create_buffer(&staging_info) }?;

        // Built up one object at a time, so that `Drop` cleans up whatever was created if a
        // later step fails.
        let mut belt = StagingBelt {
            device,
            queue,
            ring,
            staging_buffer: Some(staging_buffer),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
        };

        let queue_family_index = belt.queue.queue_family_index();
        // SAFETY: The queue family index belongs to the queue of this device.
        belt.command_pool = unsafe { belt.device.create_command_pool(queue_family_index) }?;
        belt.command_buffer = unsafe { belt.device.allocate_command_buffer(belt.command_pool) }?;
        belt.fence = unsafe { belt.device.create_fence(false) }?;

        Ok(belt)
    }

    /// Returns the allocator managing the staging buffer.
    #[inline]
    pub fn ring(&self) -> &RingAllocator {
        &self.ring
    }

    /// Returns the queue that uploads are submitted to.
    #[inline]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    fn staging_buffer(&self) -> &RawBuffer {
        // Only taken out in `drop`.
        self.staging_buffer.as_ref().unwrap()
    }

    /// Copies `data` into `region` of texture `id`, and leaves the texture ready to be sampled.
    ///
    /// `data` holds the texels of the region, tightly packed, and must be exactly
    /// [`region_size`](TextureRegistry::region_size) bytes long. The upload has completed on the
    /// device when this returns.
    ///
    /// If the upload fails after the copy was recorded, the layout of the texture is invalidated
    /// and its contents are undefined.
    pub fn upload_texture(
        &mut self,
        textures: &mut TextureRegistry,
        id: TextureId,
        data: &[u8],
        region: ImageRegion,
    ) -> Result<(), Validated<VulkanError>> {
        let required = textures.region_size(id, region)?;

        if data.len() as DeviceSize != required {
            return Err(ValidationError::new(
                "data",
                format!(
                    "is {} bytes long, but the region requires {} bytes",
                    data.len(),
                    required,
                ),
            )
            .into());
        }

        let mut recorded = false;
        let result = self.stage(data, |_, command_buffer, src, src_range| {
            recorded = true;

            // SAFETY: `stage` hands out a recording command buffer of this device, and `src_range`
            // lies within a staging buffer created with `TRANSFER_SRC`. If the command buffer
            // doesn't complete, the layout is invalidated below.
            unsafe { textures.draw_into(command_buffer, id, src, src_range, region) }?;
            unsafe { textures.prepare(command_buffer, id) }?;

            Ok(())
        });

        if let Err(err) = result {
            if recorded {
                textures.invalidate_layout(id);
            }

            return Err(err);
        }

        tracing::debug!(%id, size = data.len(), "uploaded texture");

        Ok(())
    }

    // Writes `data` to staging memory, then records the copy out of it with `record` and waits
    // for the submission to complete.
    fn stage(
        &mut self,
        data: &[u8],
        record: impl FnOnce(
            &dyn DeviceFunctions,
            vk::CommandBuffer,
            vk::Buffer,
            Range<DeviceSize>,
        ) -> Result<(), Validated<VulkanError>>,
    ) -> Result<(), Validated<VulkanError>> {
        let size = data.len() as DeviceSize;

        match self.ring.allocate(size) {
            Ok(allocation) => {
                let staging_buffer = self.staging_buffer();
                let src = staging_buffer.handle();
                let offset = allocation.offset();
                let range = offset..offset + size;
                // SAFETY: The allocation is not in use by the device until it is freed.
                let written = unsafe { self.device.write_buffer(staging_buffer, offset, data) };
                let result = written.and_then(|()| {
                    self.record_and_wait(|device, command_buffer| {
                        record(device, command_buffer, src, range)
                    })
                });
                self.ring.free(allocation);

                result
            }
            Err(Validated::Error(RingAllocatorError::OutOfRingMemory)) => {
                tracing::warn!(
                    size,
                    ring_size = self.ring.size(),
                    "upload does not fit in the staging ring, using a temporary staging buffer",
                );

                let temporary_info = BufferCreateInfo {
                    size,
                    usage: vk::BufferUsageFlags::TRANSFER_SRC,
                    location: MemoryLocation::HostVisible,
                };
                let temporary = unsafe { self.device.create_buffer(&temporary_info) }?;
                let src = temporary.handle();
                // SAFETY: The temporary buffer was just created, and is destroyed only after the
                // submission has completed or failed.
                let written = unsafe { self.device.write_buffer(&temporary, 0, data) };
                let result = written.and_then(|()| {
                    self.record_and_wait(|device, command_buffer| {
                        record(device, command_buffer, src, 0..size)
                    })
                });
                unsafe { self.device.destroy_buffer(temporary) };

                result
            }
            Err(Validated::ValidationError(err)) => {
                unreachable!("empty uploads are rejected before staging: {}", err)
            }
        }
    }

    fn record_and_wait(
        &self,
        record: impl FnOnce(
            &dyn DeviceFunctions,
            vk::CommandBuffer,
        ) -> Result<(), Validated<VulkanError>>,
    ) -> Result<(), Validated<VulkanError>> {
        // SAFETY: The command buffer was allocated from the belt's pool, and is never pending
        // here since every submission is waited for before returning.
        unsafe { self.device.begin_commands(self.command_buffer) }?;
        record(&*self.device, self.command_buffer)?;
        unsafe { self.device.end_commands(self.command_buffer) }?;

        let command_buffers = [self.command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);

        // SAFETY: the command buffer and everything it references outlive the submission, since
        // we wait on the fence before returning.
        unsafe { self.queue.submit(&[submit], self.fence) }?;
        // SAFETY: The fence belongs to the belt.
        unsafe { self.device.wait_for_fence(self.fence, u64::MAX) }?;
        unsafe { self.device.reset_fence(self.fence) }?;

        Ok(())
    }
}

impl Upload for StagingBelt {
    fn stage_and_copy(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<RawBuffer, Validated<VulkanError>> {
        let create_info = BufferCreateInfo {
            size: data.len() as DeviceSize,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        };
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let dst = unsafe { self.device.create_buffer(&create_info) }?;

        let dst_handle = dst.handle();
        let result = self.stage(data, |device, command_buffer, src, src_range| {
            let region = vk::BufferCopy {
                src_offset: src_range.start,
                dst_offset: 0,
                size: create_info.size,
            };
            // SAFETY: Both buffers outlive the submission, and `dst` was created with
            // `TRANSFER_DST` and the size of the copy.
            unsafe { device.cmd_copy_buffer(command_buffer, src, dst_handle, &[region]) };

            Ok(())
        });

        if let Err(err) = result {
            unsafe { self.device.destroy_buffer(dst) };
            return Err(err);
        }

        tracing::debug!(size = data.len(), buffer = ?dst.handle(), "uploaded buffer");

        Ok(dst)
    }
}

impl Drop for StagingBelt {
    fn drop(&mut self) {
        // Every submission is waited for before returning, so nothing is in use.
        if self.fence != vk::Fence::null() {
            unsafe { self.device.destroy_fence(self.fence) };
        }

        // Frees the command buffer as well.
        if self.command_pool != vk::CommandPool::null() {
            unsafe { self.device.destroy_command_pool(self.command_pool) };
        }

        if let Some(staging_buffer) = self.staging_buffer.take() {
            unsafe { self.device.destroy_buffer(staging_buffer) };
        }
    }
}

impl fmt::Debug for StagingBelt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingBelt")
            .field("queue", &self.queue)
            .field("ring", &self.ring)
            .field("staging_buffer", &self.staging_buffer)
            .finish_non_exhaustive()
    }
}
