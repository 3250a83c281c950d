//! The owner of every cache.
//!
//! A [`RenderResourceContext`] is created once per device and owned by the render thread. It
//! ties the frame protocol of the individual caches together:
//!
//! ```text
//! loop {
//!     // Record the frame, requesting buffers, pipelines, descriptor sets and textures.
//!     let frame = context.finish_frame(fence)?;
//!     // Submit the frame, signaling `fence`.
//!     let completed = unsafe { frame.wait(&**context.device(), u64::MAX) }?;
//!     context.post_frame(completed)?;
//! }
//! ```

use crate::{
    buffer::{BufferCache, StagingBelt, StagingBeltCreateInfo},
    descriptor_set::{
        DescriptorSetAllocator, DescriptorSetAllocatorCreateInfo, DescriptorSetLayoutKey,
    },
    device::DeviceFunctions,
    image::{ImageCreateInfo, ImageRegion, TextureId, TextureRegistry},
    memory::RingAllocator,
    pipeline::{GraphicsPipelineKey, PipelineCache},
    queue::Queue,
    sync::{CompletedFrame, FrameInFlight},
    DeviceSize, Validated, ValidationError, VulkanError,
};
use ash::vk;
use std::{fmt, sync::Arc};

/// Parameters to create a new [`RenderResourceContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceContextCreateInfo {
    /// The size in bytes of the staging ring. Must be a power of two.
    ///
    /// The default value is 4 MiB.
    pub ring_size: DeviceSize,

    /// The maximum number of descriptor sets of a single layout used during one frame.
    ///
    /// The default value is `256`.
    pub max_objects: u32,

    /// The number of frames whose descriptor sets are kept apart.
    ///
    /// The default value is `2`.
    pub frames_in_flight: u32,
}

impl Default for ResourceContextCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            ring_size: StagingBeltCreateInfo::default().size,
            max_objects: DescriptorSetAllocatorCreateInfo::default().max_objects,
            frames_in_flight: DescriptorSetAllocatorCreateInfo::default().frames_in_flight,
        }
    }
}

impl ResourceContextCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        RingAllocator::validate_size(self.ring_size)
            .map_err(|err| ValidationError::new("ring_size", err.problem))?;

        self.descriptor_set_allocator_create_info().validate()
    }

    fn descriptor_set_allocator_create_info(&self) -> DescriptorSetAllocatorCreateInfo {
        DescriptorSetAllocatorCreateInfo {
            max_objects: self.max_objects,
            frames_in_flight: self.frames_in_flight,
        }
    }
}

/// Owns the staging belt, the buffer cache, the pipeline cache, the descriptor set allocator and
/// the texture registry of a device.
///
/// None of these are internally synchronized. The context is meant to live on the render thread;
/// only the [`Queue`] it submits uploads to may be shared with other threads.
pub struct RenderResourceContext {
    queue: Arc<Queue>,
    frames_in_flight: u32,
    staging: StagingBelt,
    buffers: BufferCache,
    pipelines: PipelineCache,
    descriptor_sets: DescriptorSetAllocator,
    textures: TextureRegistry,
}

impl RenderResourceContext {
    /// Creates every cache, and fills the blank texture with opaque white.
    pub fn new(
        queue: Arc<Queue>,
        create_info: ResourceContextCreateInfo,
    ) -> Result<Self, Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let device = queue.device().clone();
        let mut staging = StagingBelt::new(
            queue.clone(),
            StagingBeltCreateInfo {
                size: create_info.ring_size,
            },
        )?;
        let buffers = BufferCache::new(device.clone());
        let pipelines = PipelineCache::new(device.clone());
        let descriptor_sets = DescriptorSetAllocator::new(
            device.clone(),
            create_info.descriptor_set_allocator_create_info(),
        )?;
        let mut textures = TextureRegistry::new(device)?;

        staging.upload_texture(
            &mut textures,
            TextureId::BLANK,
            &[0xff; 4],
            ImageRegion::whole([1, 1]),
        )?;

        tracing::info!(
            ring_size = create_info.ring_size,
            max_objects = create_info.max_objects,
            frames_in_flight = create_info.frames_in_flight,
            "created render resource context",
        );

        Ok(RenderResourceContext {
            queue,
            frames_in_flight: create_info.frames_in_flight,
            staging,
            buffers,
            pipelines,
            descriptor_sets,
            textures,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn DeviceFunctions> {
        self.queue.device()
    }

    #[inline]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Returns the generation of the frame being recorded.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.buffers.generation()
    }

    /// Returns the descriptor set slot of the frame being recorded.
    #[inline]
    pub fn frame_slot(&self) -> u32 {
        (self.generation() % u64::from(self.frames_in_flight)) as u32
    }

    #[inline]
    pub fn staging(&self) -> &StagingBelt {
        &self.staging
    }

    #[inline]
    pub fn buffers(&self) -> &BufferCache {
        &self.buffers
    }

    #[inline]
    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    #[inline]
    pub fn descriptor_sets(&self) -> &DescriptorSetAllocator {
        &self.descriptor_sets
    }

    #[inline]
    pub fn textures(&self) -> &TextureRegistry {
        &self.textures
    }

    #[inline]
    pub fn textures_mut(&mut self) -> &mut TextureRegistry {
        &mut self.textures
    }

    /// Returns a buffer holding `data`, uploading it only if it isn't cached yet.
    ///
    /// See [`BufferCache::get_or_create`].
    pub fn buffer(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer, Validated<VulkanError>> {
        self.buffers.get_or_create(&mut self.staging, data, usage)
    }

    /// Returns the pipeline for `key`, building it if needed.
    ///
    /// # Safety
    ///
    /// - See [`PipelineCache::get_or_build`].
    pub unsafe fn pipeline(
        &mut self,
        key: &GraphicsPipelineKey,
    ) -> Result<vk::Pipeline, VulkanError> {
        unsafe { self.pipelines.get_or_build(key) }
    }

    /// Returns the next descriptor set of `key` for the frame being recorded.
    ///
    /// # Safety
    ///
    /// - See [`DescriptorSetAllocator::get_or_build`].
    ///
    /// # Panics
    ///
    /// - Panics if more than `max_objects` sets of `key` are requested during one frame.
    pub unsafe fn descriptor_set(
        &mut self,
        key: &DescriptorSetLayoutKey,
    ) -> Result<vk::DescriptorSet, Validated<VulkanError>> {
        let frame_slot = self.frame_slot();

        unsafe { self.descriptor_sets.next_set(key, frame_slot) }
    }

    /// Allocates a texture and fills it with `data`, leaving it ready to be sampled.
    pub fn create_texture(
        &mut self,
        format: vk::Format,
        extent: [u32; 2],
        data: &[u8],
    ) -> Result<TextureId, Validated<VulkanError>> {
        let id = self.textures.allocate(ImageCreateInfo {
            format,
            extent,
            ..Default::default()
        })?;

        if let Err(err) = self.upload_texture(id, data, ImageRegion::whole(extent)) {
            // SAFETY: the image was never submitted successfully.
            unsafe { self.textures.release_id(id) };

            return Err(err);
        }

        Ok(id)
    }

    /// Copies `data` into `region` of texture `id`, waiting for the upload to complete.
    pub fn upload_texture(
        &mut self,
        id: TextureId,
        data: &[u8],
        region: ImageRegion,
    ) -> Result<(), Validated<VulkanError>> {
        self.staging
            .upload_texture(&mut self.textures, id, data, region)
    }

    /// Ends the frame being recorded. See [`BufferCache::finish_frame`].
    pub fn finish_frame(
        &mut self,
        fence: vk::Fence,
    ) -> Result<FrameInFlight, Box<ValidationError>> {
        self.buffers.finish_frame(fence)
    }

    /// Evicts the buffers the completed frame didn't use and starts recording the next frame,
    /// making the descriptor sets of its slot available again.
    pub fn post_frame(&mut self, completed: CompletedFrame) -> Result<(), Box<ValidationError>> {
        self.buffers.post_frame(completed)?;

        let frame_slot = self.frame_slot();
        self.descriptor_sets.begin_frame(frame_slot);

        Ok(())
    }

    /// Destroys every pipeline and descriptor set. Must be called whenever the render pass or
    /// the swapchain images are recreated.
    ///
    /// # Safety
    ///
    /// - None of the pipelines or descriptor sets may be in use by the device.
    pub unsafe fn invalidate_render_targets(&mut self) {
        tracing::debug!("invalidating render target dependent objects");

        unsafe {
            self.pipelines.invalidate_all();
            self.descriptor_sets.invalidate_all();
        }
    }
}

impl fmt::Debug for RenderResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderResourceContext")
            .field("queue", &self.queue)
            .field("frames_in_flight", &self.frames_in_flight)
            .field("staging", &self.staging)
            .field("buffers", &self.buffers)
            .field("pipelines", &self.pipelines)
            .field("descriptor_sets", &self.descriptor_sets)
            .field("textures", &self.textures)
            .finish()
    }
}
