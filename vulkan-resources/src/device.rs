//! The boundary between the caches and the native graphics API.
//!
//! Everything in this crate talks to the GPU through [`DeviceFunctions`]. The trait only covers
//! what the allocation and caching core needs: creating and destroying buffers, images,
//! pipelines and descriptor pools, recording a handful of transfer commands and the four
//! submission-class queue calls. [`AshDevice`] is the implementation backed by an `ash` device.
//!
//! Every fallible call reports the native status as a [`VulkanError`]. None of them retry.
//!
//! Like the native functions they wrap, the methods of [`DeviceFunctions`] are `unsafe`: they
//! take raw handles and perform no validation of their own, apart from
//! [`write_buffer`](DeviceFunctions::write_buffer). The safe types of this crate only ever pass
//! handles that they created through the same device.

use crate::{
    buffer::{BufferCreateInfo, MemoryLocation, RawBuffer},
    descriptor_set::DescriptorPoolCreateInfo,
    image::{ImageCreateInfo, RawImage},
    pipeline::GraphicsPipelineKey,
    DeviceSize, Validated, ValidationError, VulkanError,
};
use ash::vk;
use smallvec::SmallVec;
use std::{fmt, ptr};

/// Native functions used by the resource caches.
///
/// All methods are called from the render thread, except the `queue_*` methods, which [`Queue`]
/// calls while holding the queue's lock.
///
/// # Safety
///
/// Every method has the valid usage requirements of the native command it wraps. In particular:
///
/// - Every handle passed in must have been created from this device and must not have been
///   destroyed.
/// - Create infos must have passed their `validate` method.
/// - An object must not be destroyed while the device may still access it.
/// - A command buffer passed to a `cmd_*` method must be in the recording state, and every object
///   that the recorded command references must stay alive until the command buffer completes.
///
/// [`Queue`]: crate::queue::Queue
pub trait DeviceFunctions: Send + Sync {
    /// Creates a buffer and binds freshly allocated memory to it.
    unsafe fn create_buffer(
        &self,
        create_info: &BufferCreateInfo,
    ) -> Result<RawBuffer, VulkanError>;

    /// Destroys a buffer and frees its memory.
    unsafe fn destroy_buffer(&self, buffer: RawBuffer);

    /// Copies `data` into the memory of `buffer`, starting at `offset`.
    ///
    /// # Safety
    ///
    /// - `buffer` must have been created from `self`.
    /// - The device must not access the written range while it is being written.
    unsafe fn write_buffer(
        &self,
        buffer: &RawBuffer,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), Validated<VulkanError>> {
        validate_write_buffer(buffer, offset, data)?;

        unsafe { self.write_buffer_unchecked(buffer, offset, data) }?;

        Ok(())
    }

    /// Copies `data` into host-visible `buffer` memory at `offset`.
    ///
    /// # Safety
    ///
    /// - Everything required by [`write_buffer`](Self::write_buffer).
    /// - `buffer` must be [`HostVisible`](MemoryLocation::HostVisible) and
    ///   `offset + data.len()` must not exceed its size.
    unsafe fn write_buffer_unchecked(
        &self,
        buffer: &RawBuffer,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), VulkanError>;

    /// Creates a 2D image and binds device-local memory to it.
    unsafe fn create_image(&self, create_info: &ImageCreateInfo) -> Result<RawImage, VulkanError>;

    /// Destroys an image and frees its memory.
    unsafe fn destroy_image(&self, image: RawImage);

    /// Compiles a graphics pipeline described by `key`.
    unsafe fn create_graphics_pipeline(
        &self,
        key: &GraphicsPipelineKey,
    ) -> Result<vk::Pipeline, VulkanError>;

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    unsafe fn create_descriptor_pool(
        &self,
        create_info: &DescriptorPoolCreateInfo,
    ) -> Result<vk::DescriptorPool, VulkanError>;

    /// Destroys a descriptor pool, implicitly freeing every set allocated from it.
    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocates one descriptor set per entry of `layouts` from `pool`.
    unsafe fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>, VulkanError>;

    unsafe fn create_command_pool(
        &self,
        queue_family_index: u32,
    ) -> Result<vk::CommandPool, VulkanError>;

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocates a primary command buffer from `pool`.
    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, VulkanError>;

    /// Resets `command_buffer` and begins recording for a single submission.
    unsafe fn begin_commands(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError>;

    unsafe fn end_commands(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError>;

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// Records a copy into `dst`, which must be in `TRANSFER_DST_OPTIMAL` layout.
    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    );

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence, VulkanError>;

    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Blocks until `fence` is signaled or `timeout` nanoseconds have passed.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> Result<(), VulkanError>;

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError>;

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError>;

    unsafe fn queue_bind_sparse(
        &self,
        queue: vk::Queue,
        bind_infos: &[vk::BindSparseInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError>;

    /// Queues images for presentation. Returns whether the swapchain is suboptimal.
    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, VulkanError>;

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), VulkanError>;
}

fn validate_write_buffer(
    buffer: &RawBuffer,
    offset: DeviceSize,
    data: &[u8],
) -> Result<(), Box<ValidationError>> {
    if buffer.location() != MemoryLocation::HostVisible {
        return Err(ValidationError::new(
            "buffer",
            "was not created with `MemoryLocation::HostVisible`",
        ));
    }

    let end = offset.checked_add(data.len() as DeviceSize);

    if end.is_none_or(|end| end > buffer.size()) {
        return Err(ValidationError::new(
            "data",
            format!(
                "written at offset {} extends past the end of the buffer ({} bytes)",
                offset,
                buffer.size(),
            ),
        ));
    }

    Ok(())
}

/// [`DeviceFunctions`] implemented with an `ash` logical device.
///
/// Every buffer and image gets a dedicated memory allocation. The core only creates a small
/// number of long-lived objects, so no suballocation happens at this level.
pub struct AshDevice {
    device: ash::Device,
    swapchain_fns: Option<ash::khr::swapchain::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl AshDevice {
    /// Wraps an existing logical device.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to
    ///   `instance`.
    /// - `device` must outlive every object created through the returned `AshDevice`, and must
    ///   not be destroyed while any of them are alive.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        khr_swapchain_enabled: bool,
    ) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let swapchain_fns = khr_swapchain_enabled
            .then(|| ash::khr::swapchain::Device::new(instance, &device));

        AshDevice {
            device,
            swapchain_fns,
            memory_properties,
        }
    }

    /// Returns the wrapped `ash` device.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    fn memory_type_index(&self, type_bits: u32, location: MemoryLocation) -> Option<u32> {
        let required = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let count = self.memory_properties.memory_type_count as usize;

        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|&(index, memory_type)| {
                type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
            })
            .map(|(index, _)| index as u32)
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let memory_type_index = self
            .memory_type_index(requirements.memory_type_bits, location)
            .ok_or(VulkanError::OutOfDeviceMemory)?;
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        Ok(unsafe { self.device.allocate_memory(&allocate_info, None) }?)
    }
}

impl fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDevice")
            .field("handle", &self.device.handle())
            .field("khr_swapchain", &self.swapchain_fns.is_some())
            .finish_non_exhaustive()
    }
}

impl DeviceFunctions for AshDevice {
    unsafe fn create_buffer(
        &self,
        create_info: &BufferCreateInfo,
    ) -> Result<RawBuffer, VulkanError> {
        let &BufferCreateInfo {
            size,
            usage,
            location,
        } = create_info;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };

        let memory = match self.allocate_memory(requirements, location) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe { self.device.bind_buffer_memory(handle, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(handle, None);
                self.device.free_memory(memory, None);
            }
            return Err(err.into());
        }

        Ok(unsafe { RawBuffer::from_raw(handle, memory, *create_info) })
    }

    unsafe fn destroy_buffer(&self, buffer: RawBuffer) {
        unsafe {
            self.device.destroy_buffer(buffer.handle(), None);
            self.device.free_memory(buffer.memory(), None);
        }
    }

    unsafe fn write_buffer_unchecked(
        &self,
        buffer: &RawBuffer,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), VulkanError> {
        if data.is_empty() {
            return Ok(());
        }

        unsafe {
            let mapped = self.device.map_memory(
                buffer.memory(),
                offset,
                data.len() as DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
            self.device.unmap_memory(buffer.memory());
        }

        Ok(())
    }

    unsafe fn create_image(&self, create_info: &ImageCreateInfo) -> Result<RawImage, VulkanError> {
        let &ImageCreateInfo {
            format,
            extent,
            usage,
        } = create_info;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent[0],
                height: extent[1],
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { self.device.create_image(&image_info, None) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(handle) };

        let memory = match self.allocate_memory(requirements, MemoryLocation::DeviceLocal) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_image(handle, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe { self.device.bind_image_memory(handle, memory, 0) } {
            unsafe {
                self.device.destroy_image(handle, None);
                self.device.free_memory(memory, None);
            }
            return Err(err.into());
        }

        Ok(unsafe { RawImage::from_raw(handle, memory, *create_info) })
    }

    unsafe fn destroy_image(&self, image: RawImage) {
        unsafe {
            self.device.destroy_image(image.handle(), None);
            self.device.free_memory(image.memory(), None);
        }
    }

    unsafe fn create_graphics_pipeline(
        &self,
        key: &GraphicsPipelineKey,
    ) -> Result<vk::Pipeline, VulkanError> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(key.program.vertex)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(key.program.fragment)
                .name(c"main"),
        ];

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: key.vertex_layout.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes: SmallVec<[vk::VertexInputAttributeDescription; 8]> = key
            .vertex_layout
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: 0,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect();
        let vertex_input = if key.vertex_layout.attributes.is_empty() {
            vk::PipelineVertexInputStateCreateInfo::default()
        } else {
            vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes)
        };

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(key.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(key.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(key.depth.test)
            .depth_write_enable(key.depth.write)
            .depth_compare_op(key.depth.compare_op);

        let mut color_attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        if let Some(blend) = &key.blend {
            color_attachment = color_attachment
                .blend_enable(true)
                .src_color_blend_factor(blend.src_color)
                .dst_color_blend_factor(blend.dst_color)
                .color_blend_op(blend.color_op)
                .src_alpha_blend_factor(blend.src_alpha)
                .dst_alpha_blend_factor(blend.dst_alpha)
                .alpha_blend_op(blend.alpha_op);
        }
        let color_attachments = [color_attachment];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(key.layout)
            .render_pass(key.render_pass)
            .subpass(key.subpass);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, err)| VulkanError::from(err))?;

        pipelines
            .into_iter()
            .next()
            .ok_or(VulkanError::InitializationFailed)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    unsafe fn create_descriptor_pool(
        &self,
        create_info: &DescriptorPoolCreateInfo,
    ) -> Result<vk::DescriptorPool, VulkanError> {
        let pool_sizes: SmallVec<[vk::DescriptorPoolSize; 8]> = create_info
            .pool_sizes
            .iter()
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(create_info.max_sets)
            .pool_sizes(&pool_sizes);

        Ok(unsafe { self.device.create_descriptor_pool(&pool_info, None) }?)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>, VulkanError> {
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);

        Ok(unsafe { self.device.allocate_descriptor_sets(&allocate_info) }?)
    }

    unsafe fn create_command_pool(
        &self,
        queue_family_index: u32,
    ) -> Result<vk::CommandPool, VulkanError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        Ok(unsafe { self.device.create_command_pool(&pool_info, None) }?)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, VulkanError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe { self.device.allocate_command_buffers(&allocate_info) }?;

        command_buffers
            .into_iter()
            .next()
            .ok_or(VulkanError::OutOfHostMemory)
    }

    unsafe fn begin_commands(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(command_buffer, &begin_info)?;
        }

        Ok(())
    }

    unsafe fn end_commands(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        Ok(unsafe { self.device.end_command_buffer(command_buffer) }?)
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        };
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src_stage_mask,
                dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_barriers,
            )
        };
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence, VulkanError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        Ok(unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }?)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> Result<(), VulkanError> {
        Ok(unsafe { self.device.wait_for_fences(&[fence], true, timeout) }?)
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError> {
        Ok(unsafe { self.device.reset_fences(&[fence]) }?)
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        Ok(unsafe { self.device.queue_submit(queue, submits, fence) }?)
    }

    unsafe fn queue_bind_sparse(
        &self,
        queue: vk::Queue,
        bind_infos: &[vk::BindSparseInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        Ok(unsafe { self.device.queue_bind_sparse(queue, bind_infos, fence) }?)
    }

    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, VulkanError> {
        let extension_not_present = VulkanError::Unnamed(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        let swapchain_fns = self.swapchain_fns.as_ref().ok_or(extension_not_present)?;

        Ok(unsafe { swapchain_fns.queue_present(queue, present_info) }?)
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), VulkanError> {
        Ok(unsafe { self.device.queue_wait_idle(queue) }?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{Call, MockDevice};
    use ash::vk::Handle;

    fn buffer(size: DeviceSize, location: MemoryLocation) -> RawBuffer {
        unsafe {
            RawBuffer::from_raw(
                vk::Buffer::from_raw(1),
                vk::DeviceMemory::from_raw(2),
                BufferCreateInfo {
                    size,
                    usage: vk::BufferUsageFlags::TRANSFER_SRC,
                    location,
                },
            )
        }
    }

    fn context(result: Result<(), Validated<VulkanError>>) -> String {
        match result {
            Err(Validated::ValidationError(err)) => err.context.into_owned(),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn write_buffer_requires_host_visible_memory() {
        let device = MockDevice::new();
        let device_local = buffer(16, MemoryLocation::DeviceLocal);

        assert_eq!(
            context(unsafe { device.write_buffer(&device_local, 0, &[1; 4]) }),
            "buffer",
        );
        assert!(device.calls().is_empty());
    }

    #[test]
    fn write_buffer_stays_in_bounds() {
        let device = MockDevice::new();
        let host_visible = buffer(8, MemoryLocation::HostVisible);

        assert_eq!(
            context(unsafe { device.write_buffer(&host_visible, 4, &[1; 5]) }),
            "data",
        );
        assert_eq!(
            context(unsafe { device.write_buffer(&host_visible, u64::MAX, &[1]) }),
            "data",
        );
        assert!(device.calls().is_empty());

        unsafe { device.write_buffer(&host_visible, 4, &[1; 4]) }.unwrap();
        assert_eq!(
            device.calls(),
            [Call::WriteBuffer {
                buffer: vk::Buffer::from_raw(1),
                offset: 4,
                data: vec![1; 4],
            }],
        );
    }
}
