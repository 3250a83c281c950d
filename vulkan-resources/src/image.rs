//! Texture identities and image layouts.
//!
//! Shaders refer to textures by small integers, which index a descriptor array. The
//! [`TextureRegistry`] hands those out as [`TextureId`]s, always reusing the smallest released id
//! before growing, so that the array stays as short as possible.
//!
//! Id 0 is [`TextureId::BLANK`], a 1×1 placeholder that exists for as long as the registry does
//! and that is bound wherever no real texture is available.
//!
//! # Layouts
//!
//! Every texture is in one of three layouts, tracked by [`ImageLayoutState`]:
//!
//! ```text
//! Uninitialized ──▶ TransferDst ◀──▶ ShaderReadOnly
//!        └──────────────────────────────▲
//! ```
//!
//! [`draw_into`](TextureRegistry::draw_into) moves a texture to `TransferDst` before recording a
//! copy into it, and [`prepare`](TextureRegistry::prepare) moves it to `ShaderReadOnly` before it
//! is sampled. A barrier is recorded only when the layout actually changes, so both can be called
//! as often as needed.
//!
//! The layout is updated when a command is recorded, not when it executes. If the submission
//! fails, the texture must be reset with [`invalidate_layout`](TextureRegistry::invalidate_layout)
//! so that the next transition starts from `UNDEFINED`.

use crate::{device::DeviceFunctions, DeviceSize, Validated, ValidationError, VulkanError};
use ash::vk;
use std::{cmp::Reverse, collections::BinaryHeap, fmt, ops::Range, sync::Arc};

/// Returns the size in bytes of one texel of `format`.
///
/// Returns `None` for formats that textures can't be created with: depth/stencil, compressed,
/// multi-planar and 24/48/96-bit formats.
pub fn texel_size(format: vk::Format) -> Option<DeviceSize> {
    use vk::Format as F;

    let size = match format {
        F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT | F::R8_SRGB => 1,
        F::R8G8_UNORM | F::R8G8_SNORM | F::R8G8_UINT | F::R8G8_SINT | F::R8G8_SRGB => 2,
        F::R16_UNORM | F::R16_SNORM | F::R16_UINT | F::R16_SINT | F::R16_SFLOAT => 2,
        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SNORM
        | F::R8G8B8A8_UINT
        | F::R8G8B8A8_SINT
        | F::R8G8B8A8_SRGB
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SRGB
        | F::A2B10G10R10_UNORM_PACK32
        | F::B10G11R11_UFLOAT_PACK32 => 4,
        F::R16G16_UNORM | F::R16G16_SNORM | F::R16G16_UINT | F::R16G16_SINT | F::R16G16_SFLOAT => 4,
        F::R32_UINT | F::R32_SINT | F::R32_SFLOAT => 4,
        F::R16G16B16A16_UNORM
        | F::R16G16B16A16_SNORM
        | F::R16G16B16A16_UINT
        | F::R16G16B16A16_SINT
        | F::R16G16B16A16_SFLOAT => 8,
        F::R32G32_UINT | F::R32G32_SINT | F::R32G32_SFLOAT => 8,
        F::R32G32B32A32_UINT | F::R32G32B32A32_SINT | F::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };

    Some(size)
}

/// Parameters to create a new [`RawImage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageCreateInfo {
    /// The default value is [`vk::Format::UNDEFINED`], which must be overridden.
    pub format: vk::Format,

    /// The width and height of the image.
    ///
    /// The default value is `[0; 2]`, which must be overridden.
    pub extent: [u32; 2],

    /// The default value is `SAMPLED | TRANSFER_DST`.
    pub usage: vk::ImageUsageFlags,
}

impl Default for ImageCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            extent: [0; 2],
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

impl ImageCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.format == vk::Format::UNDEFINED {
            return Err(ValidationError::new("format", "is `Format::UNDEFINED`"));
        }

        if texel_size(self.format).is_none() {
            return Err(ValidationError::new(
                "format",
                format!("{:?} is not an uncompressed color format", self.format),
            ));
        }

        if self.extent.contains(&0) {
            return Err(ValidationError::new(
                "extent",
                "one of the elements is zero",
            ));
        }

        if !self.usage.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            return Err(ValidationError::new(
                "usage",
                "does not contain `ImageUsageFlags::TRANSFER_DST`",
            ));
        }

        Ok(())
    }
}

/// An image together with the memory bound to it.
///
/// A `RawImage` does not destroy itself when dropped. It must be handed back to
/// [`DeviceFunctions::destroy_image`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RawImage {
    handle: vk::Image,
    memory: vk::DeviceMemory,
    create_info: ImageCreateInfo,
}

impl RawImage {
    /// Assembles a `RawImage` from raw handles.
    ///
    /// # Safety
    ///
    /// - `handle` must have been created from `create_info`, with `memory` bound to it.
    #[inline]
    pub unsafe fn from_raw(
        handle: vk::Image,
        memory: vk::DeviceMemory,
        create_info: ImageCreateInfo,
    ) -> Self {
        RawImage {
            handle,
            memory,
            create_info,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.create_info.format
    }

    #[inline]
    pub fn extent(&self) -> [u32; 2] {
        self.create_info.extent
    }
}

/// Identifies a texture within a [`TextureRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TextureId(u32);

impl TextureId {
    /// The permanent 1×1 placeholder texture.
    pub const BLANK: TextureId = TextureId(0);

    /// Returns the index of the texture in the shaders' texture array.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The layout a texture is known to be in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayoutState {
    /// Freshly created, the contents are undefined.
    #[default]
    Uninitialized,
    /// Ready to be copied into.
    TransferDst,
    /// Ready to be sampled from shaders.
    ShaderReadOnly,
}

impl ImageLayoutState {
    /// Returns the native layout.
    #[inline]
    pub fn vk_layout(self) -> vk::ImageLayout {
        match self {
            Self::Uninitialized => vk::ImageLayout::UNDEFINED,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    // The stage and access that must complete before the image leaves this layout.
    fn src_scope(self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        match self {
            Self::Uninitialized => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
            Self::TransferDst => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
            Self::ShaderReadOnly => (
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
        }
    }

    // The stage and access that wait for the image to enter this layout.
    fn dst_scope(self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        match self {
            Self::Uninitialized => unreachable!(),
            Self::TransferDst => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
            Self::ShaderReadOnly => (
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
        }
    }
}

/// A rectangle of texels in a texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ImageRegion {
    pub offset: [u32; 2],
    pub extent: [u32; 2],
}

impl ImageRegion {
    /// The region covering a whole image of `extent`.
    #[inline]
    pub fn whole(extent: [u32; 2]) -> Self {
        ImageRegion {
            offset: [0; 2],
            extent,
        }
    }

    /// Returns the number of texels in the region.
    #[inline]
    pub fn texel_count(&self) -> u64 {
        u64::from(self.extent[0]) * u64::from(self.extent[1])
    }

    fn validate(&self, image_extent: [u32; 2]) -> Result<(), Box<ValidationError>> {
        if self.extent.contains(&0) {
            return Err(ValidationError::new(
                "extent",
                "one of the elements is zero",
            ));
        }

        for axis in 0..2 {
            let end = u64::from(self.offset[axis]) + u64::from(self.extent[axis]);

            if end > u64::from(image_extent[axis]) {
                return Err(ValidationError::new(
                    "offset",
                    format!(
                        "`offset[{0}] + extent[{0}]` ({1}) is greater than the image's extent \
                        ({2})",
                        axis, end, image_extent[axis],
                    ),
                ));
            }
        }

        Ok(())
    }
}

/// A texture owned by a [`TextureRegistry`].
#[derive(Debug)]
pub struct Texture {
    image: RawImage,
    layout: ImageLayoutState,
}

impl Texture {
    #[inline]
    pub fn image(&self) -> &RawImage {
        &self.image
    }

    #[inline]
    pub fn layout(&self) -> ImageLayoutState {
        self.layout
    }
}

#[derive(Debug)]
enum Slot {
    Free,
    // Allocated, but no image has been created for it yet.
    Reserved,
    Occupied(Texture),
}

/// Issues [`TextureId`]s and owns the image of each one.
pub struct TextureRegistry {
    device: Arc<dyn DeviceFunctions>,
    slots: Vec<Slot>,
    free_ids: BinaryHeap<Reverse<u32>>,
}

impl TextureRegistry {
    /// The format of the blank texture.
    pub const BLANK_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    /// Creates a registry holding only the blank texture, whose contents are undefined until
    /// something is drawn into it.
    pub fn new(device: Arc<dyn DeviceFunctions>) -> Result<Self, VulkanError> {
        let create_info = ImageCreateInfo {
            format: Self::BLANK_FORMAT,
            extent: [1, 1],
            ..Default::default()
        };
        debug_assert!(create_info.validate().is_ok());
        let blank = unsafe { device.create_image(&create_info) }?;

        Ok(TextureRegistry {
            device,
            slots: vec![Slot::Occupied(Texture {
                image: blank,
                layout: ImageLayoutState::Uninitialized,
            })],
            free_ids: BinaryHeap::new(),
        })
    }

    /// Returns the number of ids currently allocated, including [`TextureId::BLANK`].
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_ids.len()
    }

    /// Returns the texture of `id`, if it has one.
    #[inline]
    pub fn texture(&self, id: TextureId) -> Option<&Texture> {
        match self.slots.get(id.0 as usize)? {
            Slot::Occupied(texture) => Some(texture),
            Slot::Free | Slot::Reserved => None,
        }
    }

    /// Returns the native image of `id`, if it has one.
    #[inline]
    pub fn image(&self, id: TextureId) -> Option<vk::Image> {
        self.texture(id).map(|texture| texture.image.handle())
    }

    /// Returns the layout that `id` is known to be in, if it has an image.
    #[inline]
    pub fn layout(&self, id: TextureId) -> Option<ImageLayoutState> {
        self.texture(id).map(Texture::layout)
    }

    /// Reserves an id without creating an image for it.
    ///
    /// The smallest released id is reused first. A new id is only issued when none is free.
    pub fn allocate_id(&mut self) -> TextureId {
        if let Some(Reverse(index)) = self.free_ids.pop() {
            self.slots[index as usize] = Slot::Reserved;

            return TextureId(index);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Reserved);

        TextureId(index)
    }

    /// Creates the image of a reserved `id`. The texture starts out
    /// [`Uninitialized`](ImageLayoutState::Uninitialized).
    pub fn create(
        &mut self,
        id: TextureId,
        create_info: ImageCreateInfo,
    ) -> Result<(), Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        match self.slots.get(id.0 as usize) {
            Some(Slot::Reserved) => {}
            Some(Slot::Occupied(_)) => {
                return Err(ValidationError::new("id", "already has an image").into());
            }
            Some(Slot::Free) | None => {
                return Err(ValidationError::new("id", "has not been allocated").into());
            }
        }

        let image = unsafe { self.device.create_image(&create_info) }?;
        tracing::debug!(
            %id,
            image = ?image.handle(),
            format = ?create_info.format,
            extent = ?create_info.extent,
            "created texture",
        );

        self.slots[id.0 as usize] = Slot::Occupied(Texture {
            image,
            layout: ImageLayoutState::Uninitialized,
        });

        Ok(())
    }

    /// Allocates an id and creates its image. The id is given back if creation fails.
    pub fn allocate(
        &mut self,
        create_info: ImageCreateInfo,
    ) -> Result<TextureId, Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let id = self.allocate_id();

        if let Err(err) = self.create(id, create_info) {
            self.slots[id.0 as usize] = Slot::Free;
            self.free_ids.push(Reverse(id.0));

            return Err(err);
        }

        Ok(id)
    }

    /// Destroys the image of `id`, if any, and makes the id available for reuse.
    ///
    /// # Safety
    ///
    /// - The image must not be in use by the device.
    /// - `id` must not be used again until it is reissued.
    ///
    /// # Panics
    ///
    /// - Panics if `id` is [`TextureId::BLANK`].
    /// - Panics if `id` is not allocated.
    pub unsafe fn release_id(&mut self, id: TextureId) {
        assert!(
            id != TextureId::BLANK,
            "the blank texture can't be released",
        );

        let slot = match self.slots.get_mut(id.0 as usize) {
            Some(slot) if !matches!(slot, Slot::Free) => slot,
            _ => panic!("texture {} has not been allocated", id),
        };

        if let Slot::Occupied(texture) = std::mem::replace(slot, Slot::Free) {
            unsafe { self.device.destroy_image(texture.image) };
        }

        self.free_ids.push(Reverse(id.0));
        tracing::trace!(%id, "released texture id");
    }

    /// Returns the number of bytes that [`draw_into`](Self::draw_into) copies into `region` of
    /// texture `id`.
    pub fn region_size(
        &self,
        id: TextureId,
        region: ImageRegion,
    ) -> Result<DeviceSize, Box<ValidationError>> {
        let Some(texture) = self.texture(id) else {
            return Err(ValidationError::new(
                "id",
                "does not refer to a texture with an image",
            ));
        };
        region
            .validate(texture.image.extent())
            .map_err(|err| err.add_context("region"))?;

        // Formats without a texel size are rejected when the image is created.
        let texel_size = texel_size(texture.image.format()).unwrap_or(0);

        region.texel_count().checked_mul(texel_size).ok_or_else(|| {
            ValidationError::new("region.extent", "the size of the region overflows a `u64`")
        })
    }

    /// Records the transition of `id` to [`ShaderReadOnly`](ImageLayoutState::ShaderReadOnly)
    /// into `command_buffer`. Nothing is recorded if the texture is already in that layout.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be a command buffer of the device in the recording state.
    /// - Command buffers recorded by the registry must be executed in the order they were
    ///   recorded. If one is never executed, call [`invalidate_layout`](Self::invalidate_layout)
    ///   on every texture it touched.
    pub unsafe fn prepare(
        &mut self,
        command_buffer: vk::CommandBuffer,
        id: TextureId,
    ) -> Result<(), Box<ValidationError>> {
        let texture = self.texture_mut(id)?;

        if texture.layout != ImageLayoutState::ShaderReadOnly {
            let image = texture.image.handle();
            let old_layout = texture.layout;
            texture.layout = ImageLayoutState::ShaderReadOnly;

            unsafe {
                self.transition(
                    command_buffer,
                    image,
                    old_layout,
                    ImageLayoutState::ShaderReadOnly,
                )
            };
        }

        Ok(())
    }

    /// Records a copy of `region` from `src_range` of `src` into `id`.
    ///
    /// The texture is transitioned to [`TransferDst`](ImageLayoutState::TransferDst) first if it
    /// isn't already. Texels in `src` are tightly packed, so `src_range` must be at least
    /// [`region_size`](Self::region_size) bytes long.
    ///
    /// # Safety
    ///
    /// - Everything required by [`prepare`](Self::prepare).
    /// - `src` must be a buffer of the device created with `TRANSFER_SRC` usage, and `src_range`
    ///   must lie within it.
    pub unsafe fn draw_into(
        &mut self,
        command_buffer: vk::CommandBuffer,
        id: TextureId,
        src: vk::Buffer,
        src_range: Range<DeviceSize>,
        region: ImageRegion,
    ) -> Result<(), Box<ValidationError>> {
        let required = self.region_size(id, region)?;
        let available = src_range.end.saturating_sub(src_range.start);

        if available < required {
            return Err(ValidationError::new(
                "src_range",
                format!(
                    "is {} bytes long, but the region requires {} bytes",
                    available, required,
                ),
            ));
        }

        let texture = self.texture_mut(id)?;
        let image = texture.image.handle();
        let old_layout = texture.layout;
        texture.layout = ImageLayoutState::TransferDst;

        if old_layout != ImageLayoutState::TransferDst {
            unsafe {
                self.transition(
                    command_buffer,
                    image,
                    old_layout,
                    ImageLayoutState::TransferDst,
                )
            };
        }

        let copy = vk::BufferImageCopy {
            buffer_offset: src_range.start,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D {
                x: region.offset[0] as i32,
                y: region.offset[1] as i32,
                z: 0,
            },
            image_extent: vk::Extent3D {
                width: region.extent[0],
                height: region.extent[1],
                depth: 1,
            },
        };
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, src, image, &[copy])
        };

        Ok(())
    }

    /// Forgets the layout of `id`, so that the next transition starts from `UNDEFINED`.
    ///
    /// The contents of the texture are undefined afterwards. This is how a texture is recovered
    /// after a command buffer that transitioned it failed to execute.
    pub fn invalidate_layout(&mut self, id: TextureId) {
        if let Ok(texture) = self.texture_mut(id) {
            if texture.layout != ImageLayoutState::Uninitialized {
                tracing::debug!(%id, layout = ?texture.layout, "invalidated texture layout");
                texture.layout = ImageLayoutState::Uninitialized;
            }
        }
    }

    /// Releases every id except [`TextureId::BLANK`].
    ///
    /// # Safety
    ///
    /// - None of the images may be in use by the device.
    pub unsafe fn clear(&mut self) {
        for slot in self.slots.drain(1..) {
            if let Slot::Occupied(texture) = slot {
                unsafe { self.device.destroy_image(texture.image) };
            }
        }

        self.free_ids.clear();
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut Texture, Box<ValidationError>> {
        match self.slots.get_mut(id.0 as usize) {
            Some(Slot::Occupied(texture)) => Ok(texture),
            _ => Err(ValidationError::new(
                "id",
                "does not refer to a texture with an image",
            )),
        }
    }

    unsafe fn transition(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        old: ImageLayoutState,
        new: ImageLayoutState,
    ) {
        let (src_stage, src_access) = old.src_scope();
        let (dst_stage, dst_access) = new.dst_scope();
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old.vk_layout())
            .new_layout(new.vk_layout())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe {
            self.device
                .cmd_pipeline_barrier(command_buffer, src_stage, dst_stage, &[barrier])
        };
    }
}

impl Drop for TextureRegistry {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            if let Slot::Occupied(texture) = slot {
                unsafe { self.device.destroy_image(texture.image) };
            }
        }
    }
}

impl fmt::Debug for TextureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureRegistry")
            .field("slots", &self.slots)
            .field("free_ids", &self.free_ids)
            .finish_non_exhaustive()
    }
}
