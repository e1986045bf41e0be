// Automatic image layout tracking
//
// Every texture carries its authoritative current layout. Barriers
// are derived from fixed per-layout source scope tables, so callers
// only ever say where an image is headed, never where it has been.
// Transitions requested while a render pass may be active are
// parked on a deferred queue and flushed right before the next
// vkCmdBeginRenderPass.
//
// Austin Shafer - 2024

use ash::vk;

use crate::device::Device;
use crate::texture::{Texture, TextureFlags, TextureInternal};

/// The pipeline stages and access masks writers of a layout used
///
/// This is the fixed source-scope table for the standard layouts.
/// Transient discard attachments never consult it, their old layout
/// is always UNDEFINED.
pub(crate) fn src_scope(old: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match old {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::GENERAL => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty())
        }
        _ => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
    }
}

impl Device {
    /// Transition `tex` to `new_layout`
    ///
    /// A no-op when the tracked layout already matches, unless the
    /// texture is transient discard, whose contents are thrown away
    /// on every transition.
    pub(crate) fn transition_image(
        &self,
        tex: &mut TextureInternal,
        cbuf: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let old_layout = match tex.t_transient {
            // A transient discard attachment is conceptually always
            // UNDEFINED between passes
            true => vk::ImageLayout::UNDEFINED,
            false => tex.t_layout,
        };

        if old_layout == new_layout && !tex.t_transient {
            return;
        }

        let (src_stage, src_access) = src_scope(old_layout);

        let barrier = vk::ImageMemoryBarrier::builder()
            .image(tex.t_image)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(tex.t_aspect)
                    .level_count(tex.t_mips)
                    .layer_count(tex.t_layers)
                    .build(),
            )
            .build();

        unsafe {
            self.dev.cmd_pipeline_barrier(
                cbuf,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        if !tex.t_transient {
            tex.t_layout = new_layout;
        }
        tex.t_first_use = false;
    }

    /// Transition `tex` so a shader at `dst_stage` can sample it
    ///
    /// Storage-compute textures live in GENERAL, everything else in
    /// SHADER_READ_ONLY_OPTIMAL.
    pub(crate) fn transition_for_shader_read(
        &self,
        tex: &mut TextureInternal,
        cbuf: vk::CommandBuffer,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let target = match tex.t_flags.contains(TextureFlags::COMPUTE) {
            true => vk::ImageLayout::GENERAL,
            false => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        self.transition_image(tex, cbuf, target, dst_stage, vk::AccessFlags::SHADER_READ);
    }

    /// Transition `tex` for storage image access from compute
    pub(crate) fn transition_for_storage(&self, tex: &mut TextureInternal, cbuf: vk::CommandBuffer) {
        self.transition_image(
            tex,
            cbuf,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        );
    }

    /// Release `tex` from its current queue family
    ///
    /// Queue family transfers are two-sided: this barrier is
    /// recorded on the releasing queue's command buffer, the
    /// matching acquire on the receiving queue's.
    pub(crate) fn release_to_queue(
        &self,
        tex: &mut TextureInternal,
        cbuf: vk::CommandBuffer,
        dst_family: u32,
    ) {
        let (src_stage, src_access) = src_scope(tex.t_layout);

        let barrier = vk::ImageMemoryBarrier::builder()
            .image(tex.t_image)
            .src_access_mask(src_access)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(tex.t_layout)
            .new_layout(tex.t_layout)
            .src_queue_family_index(tex.t_queue_family)
            .dst_queue_family_index(dst_family)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(tex.t_aspect)
                    .level_count(tex.t_mips)
                    .layer_count(tex.t_layers)
                    .build(),
            )
            .build();

        unsafe {
            self.dev.cmd_pipeline_barrier(
                cbuf,
                src_stage,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Acquire `tex` on a new queue family
    pub(crate) fn acquire_from_queue(
        &self,
        tex: &mut TextureInternal,
        cbuf: vk::CommandBuffer,
        dst_family: u32,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .image(tex.t_image)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(dst_access)
            .old_layout(tex.t_layout)
            .new_layout(tex.t_layout)
            .src_queue_family_index(tex.t_queue_family)
            .dst_queue_family_index(dst_family)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(tex.t_aspect)
                    .level_count(tex.t_mips)
                    .layer_count(tex.t_layers)
                    .build(),
            )
            .build();

        unsafe {
            self.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        tex.t_queue_family = dst_family;
    }
}

/// What a deferred transition is targeting
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PendingKind {
    /// SHADER_READ_ONLY (or GENERAL for compute textures)
    ShaderRead,
    /// GENERAL with compute read|write
    Storage,
}

/// The process-wide deferred transition queue
///
/// Barriers are illegal inside a render pass without
/// self-dependencies, so transitions requested by binding calls are
/// queued here and hoisted out to the top of the next begin_pass.
/// Entries are deduplicated per texture, storage wins over shader
/// read when both were requested.
pub(crate) struct PendingTransitions {
    pt_pending: Vec<(Texture, PendingKind)>,
}

impl PendingTransitions {
    pub(crate) fn new() -> Self {
        Self {
            pt_pending: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, tex: &Texture, kind: PendingKind) {
        for (t, k) in self.pt_pending.iter_mut() {
            if t.same_texture(tex) {
                if kind == PendingKind::Storage {
                    *k = PendingKind::Storage;
                }
                return;
            }
        }
        self.pt_pending.push((tex.clone(), kind));
    }

    pub(crate) fn len(&self) -> usize {
        self.pt_pending.len()
    }

    /// Emit every queued barrier into `cbuf` and clear the queue
    pub(crate) fn flush(&mut self, dev: &Device, cbuf: vk::CommandBuffer) {
        for (tex, kind) in self.pt_pending.drain(..) {
            let mut internal = tex.t_internal.write().unwrap();
            if internal.t_destroyed {
                continue;
            }
            match kind {
                PendingKind::ShaderRead => dev.transition_for_shader_read(
                    &mut internal,
                    cbuf,
                    vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                ),
                PendingKind::Storage => dev.transition_for_storage(&mut internal, cbuf),
            }
        }
    }
}
