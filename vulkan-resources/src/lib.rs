// Copyright (c) 2026 The vulkan-resources developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Resource lifecycle and allocation core for a Vulkan renderer.
//!
//! # Overview
//!
//! - The [`RingAllocator`](crate::memory::ring::RingAllocator) carves variable-size byte ranges
//!   out of a fixed, power-of-two sized arena. It is used for transient data such as staging
//!   uploads.
//!
//! - The [`Queue`](crate::queue::Queue) wraps a native queue handle behind a lock, so that
//!   submissions from several threads never race on the same queue.
//!
//! - The [`BufferCache`](crate::buffer::cache::BufferCache) deduplicates vertex and index
//!   payloads by content. Identical data requested in consecutive frames is uploaded once and
//!   buffers that stop being requested are evicted at the frame boundary.
//!
//! - The [`PipelineCache`](crate::pipeline::PipelineCache) and the
//!   [`DescriptorSetAllocator`](crate::descriptor_set::DescriptorSetAllocator) map immutable
//!   creation keys to lazily built objects. Each distinct key is built at most once until the
//!   cache is invalidated, which must happen whenever the render targets are recreated.
//!
//! - The [`TextureRegistry`](crate::image::TextureRegistry) hands out small integer ids for
//!   textures, reuses released ids smallest-first and tracks the layout of every image so that
//!   transitions are recorded exactly when they are needed.
//!
//! - The [`RenderResourceContext`](crate::context::RenderResourceContext) owns all of the above.
//!   It is meant to be owned by the render thread; none of the caches are internally
//!   synchronized.
//!
//! All native calls go through the [`DeviceFunctions`](crate::device::DeviceFunctions) trait.
//! [`AshDevice`](crate::device::AshDevice) implements it on top of `ash`.

pub use ash::vk;
use std::{borrow::Cow, error::Error, fmt};

#[macro_use]
mod tests;
pub mod buffer;
pub mod cache;
pub mod context;
pub mod descriptor_set;
pub mod device;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod sync;

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

/// Error type returned by native Vulkan calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VulkanError {
    NotReady,
    Timeout,
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    TooManyObjects,
    FormatNotSupported,
    FragmentedPool,
    Unknown,
    OutOfPoolMemory,
    Fragmentation,
    SurfaceLost,
    OutOfDate,
    /// An error code that has no dedicated variant.
    Unnamed(vk::Result),
}

impl From<vk::Result> for VulkanError {
    fn from(val: vk::Result) -> VulkanError {
        match val {
            vk::Result::NOT_READY => Self::NotReady,
            vk::Result::TIMEOUT => Self::Timeout,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Self::FormatNotSupported,
            vk::Result::ERROR_FRAGMENTED_POOL => Self::FragmentedPool,
            vk::Result::ERROR_UNKNOWN => Self::Unknown,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::OutOfPoolMemory,
            vk::Result::ERROR_FRAGMENTATION => Self::Fragmentation,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            x => Self::Unnamed(x),
        }
    }
}

impl Error for VulkanError {}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VulkanError::NotReady => write!(f, "A fence or query has not yet completed."),
            VulkanError::Timeout => write!(
                f,
                "A wait operation has not completed in the specified time.",
            ),
            VulkanError::OutOfHostMemory => write!(f, "A host memory allocation has failed."),
            VulkanError::OutOfDeviceMemory => {
                write!(f, "A device memory allocation has failed.")
            }
            VulkanError::InitializationFailed => write!(
                f,
                "Initialization of an object could not be completed for implementation-specific \
                reasons.",
            ),
            VulkanError::DeviceLost => write!(f, "The logical or physical device has been lost."),
            VulkanError::MemoryMapFailed => write!(f, "Mapping of a memory object has failed."),
            VulkanError::TooManyObjects => write!(
                f,
                "Too many objects of the type have already been created.",
            ),
            VulkanError::FormatNotSupported => write!(
                f,
                "A requested format is not supported on this device.",
            ),
            VulkanError::FragmentedPool => write!(
                f,
                "A pool allocation has failed due to fragmentation of the pool's memory.",
            ),
            VulkanError::Unknown => write!(
                f,
                "An unknown error has occurred; either the application has provided invalid \
                input, or an implementation failure has occurred.",
            ),
            VulkanError::OutOfPoolMemory => write!(f, "A pool memory allocation has failed."),
            VulkanError::Fragmentation => write!(
                f,
                "A descriptor pool creation has failed due to fragmentation.",
            ),
            VulkanError::SurfaceLost => write!(f, "A surface is no longer available."),
            VulkanError::OutOfDate => write!(
                f,
                "A surface has changed in such a way that it is no longer compatible with the \
                swapchain, and further presentation requests using the swapchain will fail.",
            ),
            VulkanError::Unnamed(result) => {
                write!(f, "Unnamed error, VkResult value {}", result.as_raw())
            }
        }
    }
}

/// A wrapper for error types of functions that can return validation errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Validated<E> {
    /// A non-validation error occurred.
    Error(E),

    /// A validation error occurred.
    ValidationError(Box<ValidationError>),
}

impl<E> Validated<E> {
    /// Maps the inner `Error` value using the provided function, or does nothing if the value is
    /// `ValidationError`.
    #[inline]
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Validated<F> {
        match self {
            Self::Error(err) => Validated::Error(f(err)),
            Self::ValidationError(err) => Validated::ValidationError(err),
        }
    }

    /// Returns the inner `Error` value, or panics if it contains `ValidationError`.
    #[inline(always)]
    #[track_caller]
    pub fn unwrap(self) -> E {
        match self {
            Self::Error(err) => err,
            Self::ValidationError(err) => {
                panic!(
                    "called `Validated::unwrap` on a `ValidationError` value: {:?}",
                    err
                )
            }
        }
    }
}

impl<E> Error for Validated<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Error(err) => Some(err),
            Self::ValidationError(err) => Some(err),
        }
    }
}

impl<E> fmt::Display for Validated<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(_) => write!(f, "a non-validation error occurred"),
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
        }
    }
}

impl<E> From<Box<ValidationError>> for Validated<E> {
    fn from(err: Box<ValidationError>) -> Self {
        Self::ValidationError(err)
    }
}

impl From<VulkanError> for Validated<VulkanError> {
    fn from(err: VulkanError) -> Self {
        Self::Error(err)
    }
}

/// The arguments or other context of a call did not match the requirements of the API.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationError {
    /// The context in which the problem exists (e.g. a specific parameter).
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,
}

impl ValidationError {
    pub(crate) fn new(
        context: impl Into<Cow<'static, str>>,
        problem: impl Into<Cow<'static, str>>,
    ) -> Box<Self> {
        Box::new(ValidationError {
            context: context.into(),
            problem: problem.into(),
        })
    }

    pub(crate) fn add_context(self: Box<Self>, context: impl Into<Cow<'static, str>>) -> Box<Self> {
        let context = context.into();

        if self.context.is_empty() {
            Box::new(Self { context, ..*self })
        } else {
            Box::new(Self {
                context: format!("{}.{}", context, self.context).into(),
                ..*self
            })
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)
        } else {
            write!(f, "{}: {}", self.context, self.problem)
        }
    }
}

impl Error for ValidationError {}

/// Rounds `val` up to the next multiple of `alignment`, which must be a power of two.
#[inline(always)]
pub(crate) const fn align_up(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    (val + alignment - 1) & !(alignment - 1)
}
