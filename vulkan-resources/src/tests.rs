// Copyright (c) 2026 The vulkan-resources developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

use crate::{
    buffer::{BufferCreateInfo, MemoryLocation, RawBuffer, Upload},
    descriptor_set::DescriptorPoolCreateInfo,
    device::DeviceFunctions,
    image::{ImageCreateInfo, RawImage},
    pipeline::GraphicsPipelineKey,
    DeviceSize, Validated, VulkanError,
};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::{
    slice,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

macro_rules! assert_should_panic {
    ($msg:expr, $code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("Test expected to panic but didn't"),
            Err(err) => {
                if let Some(msg) = err.downcast_ref::<String>() {
                    assert!(msg.contains($msg));
                } else if let Some(&msg) = err.downcast_ref::<&str>() {
                    assert!(msg.contains($msg));
                } else {
                    panic!("Couldn't decipher the panic message of the test")
                }
            }
        }
    }};

    ($code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("Test expected to panic but didn't"),
            Err(_) => {}
        }
    }};
}

/// A call made to a [`MockDevice`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    CreateBuffer(BufferCreateInfo),
    DestroyBuffer(vk::Buffer),
    WriteBuffer {
        buffer: vk::Buffer,
        offset: DeviceSize,
        data: Vec<u8>,
    },
    CreateImage(ImageCreateInfo),
    DestroyImage(vk::Image),
    CreateGraphicsPipeline(GraphicsPipelineKey),
    DestroyPipeline(vk::Pipeline),
    CreateDescriptorPool(DescriptorPoolCreateInfo),
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSets {
        pool: vk::DescriptorPool,
        count: usize,
    },
    CreateCommandPool(u32),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandPool),
    BeginCommands(vk::CommandBuffer),
    EndCommands(vk::CommandBuffer),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: DeviceSize,
        size: DeviceSize,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        offset: [i32; 2],
        extent: [u32; 2],
    },
    ImageBarrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    CreateFence,
    DestroyFence(vk::Fence),
    WaitForFence(vk::Fence),
    ResetFence(vk::Fence),
    QueueSubmit {
        queue: vk::Queue,
        command_buffers: Vec<vk::CommandBuffer>,
        fence: vk::Fence,
    },
    QueueBindSparse,
    QueuePresent,
    QueueWaitIdle,
}

type CallFilter = Box<dyn Fn(&Call) -> bool + Send>;

/// A [`DeviceFunctions`] implementation that hands out fake handles and records every call.
pub(crate) struct MockDevice {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Vec<(CallFilter, VulkanError)>>,
    next_handle: AtomicU64,
    in_queue_call: AtomicBool,
    queue_overlaps: AtomicUsize,
}

impl MockDevice {
    pub(crate) fn new() -> Arc<MockDevice> {
        Arc::new(MockDevice {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            // Tests use small raw values for handles they make up themselves.
            next_handle: AtomicU64::new(0x1000),
            in_queue_call: AtomicBool::new(false),
            queue_overlaps: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|&call| pred(call)).count()
    }

    pub(crate) fn calls_matching(&self, pred: impl Fn(&Call) -> bool) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|&call| pred(call))
            .cloned()
            .collect()
    }

    /// Makes the next fallible call fail with `err`.
    pub(crate) fn fail_next(&self, err: VulkanError) {
        self.fail_on(|_| true, err);
    }

    /// Makes the next fallible call that matches `pred` fail with `err`.
    pub(crate) fn fail_on(&self, pred: impl Fn(&Call) -> bool + Send + 'static, err: VulkanError) {
        self.failures.lock().push((Box::new(pred), err));
    }

    /// Returns how many times a queue call started while another one was still running.
    pub(crate) fn queue_overlaps(&self) -> usize {
        self.queue_overlaps.load(Ordering::SeqCst)
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn push(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn record(&self, call: Call) -> Result<(), VulkanError> {
        let mut failures = self.failures.lock();
        let failure = failures.iter().position(|(pred, _)| pred(&call));
        self.push(call);

        match failure {
            Some(index) => Err(failures.remove(index).1),
            None => Ok(()),
        }
    }

    fn queue_call(&self, call: Call) -> Result<(), VulkanError> {
        if self.in_queue_call.swap(true, Ordering::SeqCst) {
            self.queue_overlaps.fetch_add(1, Ordering::SeqCst);
        }

        // Widens the window in which an unsynchronized caller would be caught.
        thread::yield_now();
        let result = self.record(call);
        self.in_queue_call.store(false, Ordering::SeqCst);

        result
    }
}

impl DeviceFunctions for MockDevice {
    unsafe fn create_buffer(
        &self,
        create_info: &BufferCreateInfo,
    ) -> Result<RawBuffer, VulkanError> {
        self.record(Call::CreateBuffer(*create_info))?;

        Ok(unsafe { RawBuffer::from_raw(self.handle(), self.handle(), *create_info) })
    }

    unsafe fn destroy_buffer(&self, buffer: RawBuffer) {
        self.push(Call::DestroyBuffer(buffer.handle()));
    }

    unsafe fn write_buffer_unchecked(
        &self,
        buffer: &RawBuffer,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), VulkanError> {
        assert_eq!(buffer.location(), MemoryLocation::HostVisible);
        assert!(offset + data.len() as DeviceSize <= buffer.size());

        self.record(Call::WriteBuffer {
            buffer: buffer.handle(),
            offset,
            data: data.to_vec(),
        })
    }

    unsafe fn create_image(&self, create_info: &ImageCreateInfo) -> Result<RawImage, VulkanError> {
        self.record(Call::CreateImage(*create_info))?;

        Ok(unsafe { RawImage::from_raw(self.handle(), self.handle(), *create_info) })
    }

    unsafe fn destroy_image(&self, image: RawImage) {
        self.push(Call::DestroyImage(image.handle()));
    }

    unsafe fn create_graphics_pipeline(
        &self,
        key: &GraphicsPipelineKey,
    ) -> Result<vk::Pipeline, VulkanError> {
        self.record(Call::CreateGraphicsPipeline(key.clone()))?;

        Ok(self.handle())
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.push(Call::DestroyPipeline(pipeline));
    }

    unsafe fn create_descriptor_pool(
        &self,
        create_info: &DescriptorPoolCreateInfo,
    ) -> Result<vk::DescriptorPool, VulkanError> {
        self.record(Call::CreateDescriptorPool(create_info.clone()))?;

        Ok(self.handle())
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.push(Call::DestroyDescriptorPool(pool));
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>, VulkanError> {
        self.record(Call::AllocateDescriptorSets {
            pool,
            count: layouts.len(),
        })?;

        Ok(layouts.iter().map(|_| self.handle()).collect())
    }

    unsafe fn create_command_pool(
        &self,
        queue_family_index: u32,
    ) -> Result<vk::CommandPool, VulkanError> {
        self.record(Call::CreateCommandPool(queue_family_index))?;

        Ok(self.handle())
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.push(Call::DestroyCommandPool(pool));
    }

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, VulkanError> {
        self.record(Call::AllocateCommandBuffer(pool))?;

        Ok(self.handle())
    }

    unsafe fn begin_commands(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        self.record(Call::BeginCommands(command_buffer))
    }

    unsafe fn end_commands(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        self.record(Call::EndCommands(command_buffer))
    }

    unsafe fn cmd_copy_buffer(
        &self,
        _command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        for region in regions {
            self.push(Call::CopyBuffer {
                src,
                dst,
                src_offset: region.src_offset,
                size: region.size,
            });
        }
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        _command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        for region in regions {
            self.push(Call::CopyBufferToImage {
                src,
                dst,
                offset: [region.image_offset.x, region.image_offset.y],
                extent: [region.image_extent.width, region.image_extent.height],
            });
        }
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        _command_buffer: vk::CommandBuffer,
        _src_stage_mask: vk::PipelineStageFlags,
        _dst_stage_mask: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        for barrier in image_barriers {
            self.push(Call::ImageBarrier {
                image: barrier.image,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
            });
        }
    }

    unsafe fn create_fence(&self, _signaled: bool) -> Result<vk::Fence, VulkanError> {
        self.record(Call::CreateFence)?;

        Ok(self.handle())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.push(Call::DestroyFence(fence));
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> Result<(), VulkanError> {
        self.record(Call::WaitForFence(fence))
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError> {
        self.record(Call::ResetFence(fence))
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        let command_buffers = submits
            .iter()
            .filter(|submit| submit.command_buffer_count != 0)
            .flat_map(|submit| unsafe {
                slice::from_raw_parts(
                    submit.p_command_buffers,
                    submit.command_buffer_count as usize,
                )
            })
            .copied()
            .collect();

        self.queue_call(Call::QueueSubmit {
            queue,
            command_buffers,
            fence,
        })
    }

    unsafe fn queue_bind_sparse(
        &self,
        _queue: vk::Queue,
        _bind_infos: &[vk::BindSparseInfo<'_>],
        _fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        self.queue_call(Call::QueueBindSparse)
    }

    unsafe fn queue_present(
        &self,
        _queue: vk::Queue,
        _present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, VulkanError> {
        self.queue_call(Call::QueuePresent).map(|()| false)
    }

    unsafe fn queue_wait_idle(&self, _queue: vk::Queue) -> Result<(), VulkanError> {
        self.queue_call(Call::QueueWaitIdle)
    }
}

/// An [`Upload`] implementation that creates buffers on a [`MockDevice`] without staging.
pub(crate) struct MockUploader {
    device: Arc<MockDevice>,
    uploads: usize,
    fail_next: Option<VulkanError>,
}

impl MockUploader {
    pub(crate) fn new(device: &Arc<MockDevice>) -> Self {
        MockUploader {
            device: device.clone(),
            uploads: 0,
            fail_next: None,
        }
    }

    pub(crate) fn uploads(&self) -> usize {
        self.uploads
    }

    pub(crate) fn fail_next(&mut self, err: VulkanError) {
        self.fail_next = Some(err);
    }
}

impl Upload for MockUploader {
    fn stage_and_copy(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<RawBuffer, Validated<VulkanError>> {
        if let Some(err) = self.fail_next.take() {
            return Err(err.into());
        }

        let create_info = BufferCreateInfo {
            size: data.len() as DeviceSize,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        };
        let buffer = unsafe { self.device.create_buffer(&create_info) }?;
        self.uploads += 1;

        Ok(buffer)
    }
}
