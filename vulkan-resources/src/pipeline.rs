//! Graphics pipelines, built once per distinct configuration.
//!
//! Compiling a pipeline is expensive, so the [`PipelineCache`] keeps every pipeline it builds,
//! keyed by the [`GraphicsPipelineKey`] that describes it. Two keys that compare equal always
//! produce the same `vk::Pipeline`.
//!
//! Pipelines are tied to the render pass they were built for. When the render targets are
//! recreated, for example after a resize, the cache must be invalidated with
//! [`PipelineCache::invalidate_all`].

use crate::{cache::KeyedObjectCache, device::DeviceFunctions, VulkanError};
use ash::vk;
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

/// The shader modules of a pipeline. Both use `main` as their entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderProgram {
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
}

/// A vertex attribute read from binding 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// The layout of the vertices in binding 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    /// The distance in bytes between two consecutive vertices.
    pub stride: u32,
    pub attributes: SmallVec<[VertexAttribute; 8]>,
}

/// Color blending for the single color attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
}

impl BlendState {
    /// Standard "source over" alpha blending.
    pub const ALPHA: BlendState = BlendState {
        src_color: vk::BlendFactor::SRC_ALPHA,
        dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_op: vk::BlendOp::ADD,
        src_alpha: vk::BlendFactor::ONE,
        dst_alpha: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_op: vk::BlendOp::ADD,
    };
}

/// Depth testing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthState {
    #[inline]
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
        }
    }
}

/// Everything that determines a graphics pipeline.
///
/// Viewport and scissor are always dynamic, so they are not part of the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineKey {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub layout: vk::PipelineLayout,
    pub program: ShaderProgram,
    pub topology: vk::PrimitiveTopology,
    pub vertex_layout: VertexLayout,
    /// `None` disables blending.
    pub blend: Option<BlendState>,
    pub depth: DepthState,
    pub cull_mode: vk::CullModeFlags,
}

/// Builds and owns graphics pipelines, at most one per distinct [`GraphicsPipelineKey`].
pub struct PipelineCache {
    device: Arc<dyn DeviceFunctions>,
    pipelines: KeyedObjectCache<GraphicsPipelineKey, vk::Pipeline>,
}

impl PipelineCache {
    /// Creates an empty `PipelineCache`.
    pub fn new(device: Arc<dyn DeviceFunctions>) -> Self {
        PipelineCache {
            device,
            pipelines: KeyedObjectCache::new(),
        }
    }

    /// Returns the number of pipelines that have been built.
    #[inline]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Returns the pipeline for `key`, if it has been built.
    #[inline]
    pub fn get(&self, key: &GraphicsPipelineKey) -> Option<vk::Pipeline> {
        self.pipelines.get(key).copied()
    }

    /// Returns the pipeline for `key`, building it first if needed.
    ///
    /// A build failure means the key can't be rendered with on this device. Nothing is cached
    /// in that case.
    ///
    /// # Safety
    ///
    /// - The render pass, pipeline layout and shader modules of `key` must be valid objects of
    ///   the device.
    /// - The render pass and pipeline layout must outlive the cached pipeline. Call
    ///   [`invalidate_all`](Self::invalidate_all) before destroying them.
    pub unsafe fn get_or_build(
        &mut self,
        key: &GraphicsPipelineKey,
    ) -> Result<vk::Pipeline, VulkanError> {
        let device = &self.device;

        self.pipelines
            .get_or_try_insert(key, |key| {
                let pipeline = unsafe { device.create_graphics_pipeline(key) }?;
                tracing::debug!(
                    ?pipeline,
                    render_pass = ?key.render_pass,
                    topology = ?key.topology,
                    "built graphics pipeline",
                );

                Ok(pipeline)
            })
            .copied()
    }

    /// Destroys every pipeline.
    ///
    /// # Safety
    ///
    /// - None of the pipelines may be in use by the device.
    pub unsafe fn invalidate_all(&mut self) {
        if !self.pipelines.is_empty() {
            tracing::debug!(
                count = self.pipelines.len(),
                "invalidating graphics pipelines",
            );
        }

        let device = &self.device;
        self.pipelines
            .invalidate_all(|_, pipeline| unsafe { device.destroy_pipeline(pipeline) });
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe { self.invalidate_all() };
    }
}

impl fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("pipelines", &self.pipelines)
            .finish_non_exhaustive()
    }
}
