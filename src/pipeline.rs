// The pipeline, render pass and vertex format cache
//
// Materials, render pass formats and vertex formats are interned
// into three fixed-capacity tables and assigned stable indices.
// Graphics pipelines are created lazily at the intersection of the
// three and destroyed eagerly when any of their inputs is
// unregistered.
//
// Austin Shafer - 2024

use ash::vk;

use crate::deletion_queue::DestroyItem;
use crate::device::Device;
use crate::mesh::VertexFormat;
use crate::shader::Shader;
use crate::{Result, SleetError};
use utils::log;

use std::ffi::CString;
use std::sync::{Arc, Mutex};

/// Interning table maxima
pub(crate) const MAX_MATERIALS: usize = 256;
pub(crate) const MAX_RENDERPASSES: usize = 64;
pub(crate) const MAX_VERTFORMATS: usize = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

impl CullMode {
    fn vk(&self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    fn vk(&self) -> vk::CompareOp {
        match self {
            CompareOp::Never => vk::CompareOp::NEVER,
            CompareOp::Less => vk::CompareOp::LESS,
            CompareOp::Equal => vk::CompareOp::EQUAL,
            CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOp::Greater => vk::CompareOp::GREATER,
            CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOp::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

impl BlendFactor {
    fn vk(&self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
            BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        }
    }
}

/// Color blend state for the single color attachment
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlendState {
    pub enable: bool,
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub src_alpha_factor: BlendFactor,
    pub dst_alpha_factor: BlendFactor,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enable: false,
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            src_alpha_factor: BlendFactor::One,
            dst_alpha_factor: BlendFactor::Zero,
        }
    }
}

impl BlendState {
    pub fn alpha() -> Self {
        Self {
            enable: true,
            src_factor: BlendFactor::SrcAlpha,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            src_alpha_factor: BlendFactor::One,
            dst_alpha_factor: BlendFactor::OneMinusSrcAlpha,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
}

impl StencilOp {
    fn vk(&self) -> vk::StencilOp {
        match self {
            StencilOp::Keep => vk::StencilOp::KEEP,
            StencilOp::Zero => vk::StencilOp::ZERO,
            StencilOp::Replace => vk::StencilOp::REPLACE,
            StencilOp::IncrementClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
            StencilOp::DecrementClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
            StencilOp::Invert => vk::StencilOp::INVERT,
        }
    }
}

/// Stencil configuration for one face
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StencilOps {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl StencilOps {
    fn vk(&self) -> vk::StencilOpState {
        vk::StencilOpState::builder()
            .fail_op(self.fail_op.vk())
            .pass_op(self.pass_op.vk())
            .depth_fail_op(self.depth_fail_op.vk())
            .compare_op(self.compare.vk())
            .compare_mask(self.compare_mask)
            .write_mask(self.write_mask)
            .reference(self.reference)
            .build()
    }
}

bitflags::bitflags! {
    /// What the material is allowed to write
    pub struct WriteMask: u32 {
        const RED = 1;
        const GREEN = 2;
        const BLUE = 4;
        const ALPHA = 8;
        const DEPTH = 16;
        const COLOR = Self::RED.bits | Self::GREEN.bits | Self::BLUE.bits | Self::ALPHA.bits;
    }
}

impl WriteMask {
    fn vk_color(&self) -> vk::ColorComponentFlags {
        let mut ret = vk::ColorComponentFlags::empty();
        if self.contains(WriteMask::RED) {
            ret |= vk::ColorComponentFlags::R;
        }
        if self.contains(WriteMask::GREEN) {
            ret |= vk::ColorComponentFlags::G;
        }
        if self.contains(WriteMask::BLUE) {
            ret |= vk::ColorComponentFlags::B;
        }
        if self.contains(WriteMask::ALPHA) {
            ret |= vk::ColorComponentFlags::A;
        }
        ret
    }
}

/// The immutable pipeline-affecting state of a material
///
/// queue_offset only orders render list items, it is deliberately
/// not part of the interning key.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MaterialStateInfo {
    pub cull: CullMode,
    pub write_mask: WriteMask,
    pub depth_test: bool,
    pub depth_compare: CompareOp,
    pub blend: BlendState,
    pub alpha_to_coverage: bool,
    pub stencil_front: Option<StencilOps>,
    pub stencil_back: Option<StencilOps>,
    pub queue_offset: u32,
}

impl Default for MaterialStateInfo {
    fn default() -> Self {
        Self {
            cull: CullMode::Back,
            write_mask: WriteMask::COLOR | WriteMask::DEPTH,
            depth_test: true,
            depth_compare: CompareOp::LessOrEqual,
            blend: BlendState::default(),
            alpha_to_coverage: false,
            stencil_front: None,
            stencil_back: None,
            queue_offset: 0,
        }
    }
}

/// The interning key for a material
#[derive(Copy, Clone, PartialEq)]
pub(crate) struct MaterialKey {
    pub(crate) mk_shader: usize,
    pub(crate) mk_cull: CullMode,
    pub(crate) mk_write_mask: WriteMask,
    pub(crate) mk_depth_test: bool,
    pub(crate) mk_depth_compare: CompareOp,
    pub(crate) mk_blend: BlendState,
    pub(crate) mk_alpha_to_coverage: bool,
    pub(crate) mk_stencil_front: Option<StencilOps>,
    pub(crate) mk_stencil_back: Option<StencilOps>,
}

impl MaterialKey {
    pub(crate) fn new(shader: &Shader, state: &MaterialStateInfo) -> Self {
        Self {
            mk_shader: shader.id(),
            mk_cull: state.cull,
            mk_write_mask: state.write_mask,
            mk_depth_test: state.depth_test,
            mk_depth_compare: state.depth_compare,
            mk_blend: state.blend,
            mk_alpha_to_coverage: state.alpha_to_coverage,
            mk_stencil_front: state.stencil_front,
            mk_stencil_back: state.stencil_back,
        }
    }
}

/// The interning key for a render pass
#[derive(Copy, Clone, PartialEq)]
pub(crate) struct RenderPassKey {
    /// UNDEFINED when the attachment is absent
    pub(crate) rp_color_fmt: vk::Format,
    pub(crate) rp_depth_fmt: vk::Format,
    pub(crate) rp_resolve_fmt: vk::Format,
    pub(crate) rp_samples: vk::SampleCountFlags,
    pub(crate) rp_depth_store: bool,
    pub(crate) rp_color_clear: bool,
}

struct MaterialEntry {
    me_key: MaterialKey,
    me_refcount: u32,
    me_shader: Shader,
    me_desc_layout: vk::DescriptorSetLayout,
    me_pipe_layout: vk::PipelineLayout,
}

struct PassEntry {
    pe_key: RenderPassKey,
    pe_pass: vk::RenderPass,
    /// Cache epoch this pass was registered at, recorded beside
    /// cached framebuffers to detect index reuse
    pe_epoch: u64,
}

struct VertFmtEntry {
    ve_fmt: VertexFormat,
    ve_refcount: u32,
}

struct CacheInternal {
    ci_epoch: u64,
    ci_materials: Vec<Option<MaterialEntry>>,
    ci_passes: Vec<Option<PassEntry>>,
    ci_vertfmts: Vec<Option<VertFmtEntry>>,
    /// The lazy pipeline table, indexed [material][pass][vertfmt].
    /// Inner vectors grow on demand, a null entry means the pipeline
    /// has not been created yet.
    ci_pipelines: Vec<Vec<Vec<vk::Pipeline>>>,
}

/// The 3D pipeline cache
///
/// Registration takes the cache lock. Lookups do too, which keeps
/// the documented contract (reads race-free against concurrent
/// registration) trivially true.
pub(crate) struct PipelineCache {
    pc_dev: Arc<Device>,
    pc_internal: Mutex<CacheInternal>,
}

impl PipelineCache {
    pub(crate) fn new(dev: Arc<Device>) -> Arc<Self> {
        Arc::new(Self {
            pc_dev: dev,
            pc_internal: Mutex::new(CacheInternal {
                ci_epoch: 1,
                ci_materials: Vec::new(),
                ci_passes: Vec::new(),
                ci_vertfmts: Vec::new(),
                ci_pipelines: Vec::new(),
            }),
        })
    }

    pub(crate) fn dev(&self) -> &Arc<Device> {
        &self.pc_dev
    }

    /// Intern a material key
    ///
    /// Bytewise-equal keys intern to the same index, and the
    /// descriptor set layout and pipeline layout for the key are
    /// created exactly once.
    pub(crate) fn register_material(&self, key: MaterialKey, shader: &Shader) -> Result<u32> {
        let mut internal = self.pc_internal.lock().unwrap();

        for (i, entry) in internal.ci_materials.iter_mut().enumerate() {
            if let Some(e) = entry {
                if e.me_key == key {
                    e.me_refcount += 1;
                    return Ok(i as u32);
                }
            }
        }

        let idx = match internal.ci_materials.iter().position(|e| e.is_none()) {
            Some(i) => i,
            None => {
                if internal.ci_materials.len() >= MAX_MATERIALS {
                    log::error!("The material table is full ({} entries)", MAX_MATERIALS);
                    return Err(SleetError::OUT_OF_MEMORY);
                }
                internal.ci_materials.push(None);
                internal.ci_materials.len() - 1
            }
        };

        let (desc_layout, pipe_layout) = self.create_layouts(shader)?;
        internal.ci_materials[idx] = Some(MaterialEntry {
            me_key: key,
            me_refcount: 1,
            me_shader: shader.clone(),
            me_desc_layout: desc_layout,
            me_pipe_layout: pipe_layout,
        });

        Ok(idx as u32)
    }

    /// Build the descriptor set and pipeline layouts from reflection
    ///
    /// Every reflected binding becomes one VkDescriptorSetLayoutBinding
    /// whose binding number is the shifted slot and whose descriptor
    /// type derives from the register kind. The layout carries the
    /// push-descriptor bit when the device supports it.
    fn create_layouts(
        &self,
        shader: &Shader,
    ) -> Result<(vk::DescriptorSetLayout, vk::PipelineLayout)> {
        let mut bindings = Vec::new();
        for bind in shader.meta().binds.iter() {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(bind.slot)
                    .descriptor_type(bind.kind.descriptor_type())
                    .stage_flags(bind.stages.vk_stages())
                    .descriptor_count(1)
                    .build(),
            );
        }

        let mut flags = vk::DescriptorSetLayoutCreateFlags::empty();
        if self.pc_dev.dev_features.vkc_supports_push_descriptors {
            flags |= vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR;
        }

        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(flags)
            .bindings(&bindings);

        unsafe {
            let desc_layout = self
                .pc_dev
                .dev
                .create_descriptor_set_layout(&info, None)
                .or(Err(SleetError::DEVICE_ERROR))?;

            let layouts = [desc_layout];
            let pipe_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts);
            let pipe_layout = match self.pc_dev.dev.create_pipeline_layout(&pipe_info, None) {
                Ok(l) => l,
                Err(_) => {
                    self.pc_dev.dev.destroy_descriptor_set_layout(desc_layout, None);
                    return Err(SleetError::DEVICE_ERROR);
                }
            };

            Ok((desc_layout, pipe_layout))
        }
    }

    /// Destroy a retired cache object now or through the destroy list
    ///
    /// `eager` is used when we are already draining a destroy list
    /// whose fence has signaled, where going back through the ring
    /// would self-deadlock.
    fn retire(&self, eager: bool, item: DestroyItem) {
        if !eager {
            self.pc_dev.destroy_or_defer(item);
            return;
        }

        unsafe {
            match item {
                DestroyItem::Pipeline(p) => self.pc_dev.dev.destroy_pipeline(p, None),
                DestroyItem::PipelineLayout(l) => self.pc_dev.dev.destroy_pipeline_layout(l, None),
                DestroyItem::DescriptorSetLayout(l) => {
                    self.pc_dev.dev.destroy_descriptor_set_layout(l, None)
                }
                DestroyItem::RenderPass(r) => self.pc_dev.dev.destroy_render_pass(r, None),
                _ => unreachable!("Unexpected cache destroy item"),
            }
        }
    }

    /// Drop one reference on a material index
    ///
    /// The last unregister destroys every pipeline depending on this
    /// index plus the material's layouts.
    pub(crate) fn unregister_material(&self, idx: u32, eager: bool) {
        let mut internal = self.pc_internal.lock().unwrap();
        let idx = idx as usize;

        let last = match internal.ci_materials.get_mut(idx) {
            Some(Some(e)) => {
                e.me_refcount -= 1;
                e.me_refcount == 0
            }
            _ => {
                log::error!("Unregistering unknown material index {}", idx);
                return;
            }
        };
        if !last {
            return;
        }

        if let Some(entry) = internal.ci_materials[idx].take() {
            self.retire(eager, DestroyItem::PipelineLayout(entry.me_pipe_layout));
            self.retire(eager, DestroyItem::DescriptorSetLayout(entry.me_desc_layout));
        }

        // Destroy the whole [idx][*][*] plane
        if let Some(plane) = internal.ci_pipelines.get_mut(idx) {
            for row in plane.iter_mut() {
                for pipe in row.iter_mut() {
                    if *pipe != vk::Pipeline::null() {
                        self.retire(eager, DestroyItem::Pipeline(*pipe));
                        *pipe = vk::Pipeline::null();
                    }
                }
            }
        }
    }

    /// Intern a render pass key, building the pass on first sight
    pub(crate) fn register_renderpass(&self, key: RenderPassKey) -> Result<u32> {
        let mut internal = self.pc_internal.lock().unwrap();

        for (i, entry) in internal.ci_passes.iter().enumerate() {
            if let Some(e) = entry {
                if e.pe_key == key {
                    return Ok(i as u32);
                }
            }
        }

        let idx = match internal.ci_passes.iter().position(|e| e.is_none()) {
            Some(i) => i,
            None => {
                if internal.ci_passes.len() >= MAX_RENDERPASSES {
                    log::error!("The render pass table is full ({} entries)", MAX_RENDERPASSES);
                    return Err(SleetError::OUT_OF_MEMORY);
                }
                internal.ci_passes.push(None);
                internal.ci_passes.len() - 1
            }
        };

        let pass = self.create_renderpass(&key)?;
        let epoch = internal.ci_epoch;
        internal.ci_passes[idx] = Some(PassEntry {
            pe_key: key,
            pe_pass: pass,
            pe_epoch: epoch,
        });

        Ok(idx as u32)
    }

    /// Build a VkRenderPass for `key`
    ///
    /// Up to three attachments in (color, resolve, depth) order and
    /// two external dependencies covering color output and the
    /// depth/stencil tests.
    fn create_renderpass(&self, key: &RenderPassKey) -> Result<vk::RenderPass> {
        let mut attachments = Vec::new();
        let mut color_ref = None;
        let mut resolve_ref = None;
        let mut depth_ref = None;

        if key.rp_color_fmt != vk::Format::UNDEFINED {
            color_ref = Some(
                vk::AttachmentReference::builder()
                    .attachment(attachments.len() as u32)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(key.rp_color_fmt)
                    .samples(key.rp_samples)
                    .load_op(match key.rp_color_clear {
                        true => vk::AttachmentLoadOp::CLEAR,
                        false => vk::AttachmentLoadOp::LOAD,
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(match key.rp_color_clear {
                        true => vk::ImageLayout::UNDEFINED,
                        false => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    })
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        if key.rp_resolve_fmt != vk::Format::UNDEFINED {
            resolve_ref = Some(
                vk::AttachmentReference::builder()
                    .attachment(attachments.len() as u32)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(key.rp_resolve_fmt)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        if key.rp_depth_fmt != vk::Format::UNDEFINED {
            depth_ref = Some(
                vk::AttachmentReference::builder()
                    .attachment(attachments.len() as u32)
                    .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(key.rp_depth_fmt)
                    .samples(key.rp_samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(match key.rp_depth_store {
                        true => vk::AttachmentStoreOp::STORE,
                        false => vk::AttachmentStoreOp::DONT_CARE,
                    })
                    .stencil_load_op(vk::AttachmentLoadOp::CLEAR)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS);
        let color_refs;
        let resolve_refs;
        if let Some(c) = color_ref {
            color_refs = [c];
            subpass = subpass.color_attachments(&color_refs);
        }
        if let Some(r) = resolve_ref {
            resolve_refs = [r];
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let depth_ref_built;
        if let Some(d) = depth_ref {
            depth_ref_built = d;
            subpass = subpass.depth_stencil_attachment(&depth_ref_built);
        }
        let subpasses = [subpass.build()];

        let dependencies = [
            vk::SubpassDependency::builder()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_access_mask(
                    vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                )
                .build(),
            vk::SubpassDependency::builder()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                )
                .src_access_mask(vk::AccessFlags::empty())
                .dst_stage_mask(
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                )
                .dst_access_mask(
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .build(),
        ];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe {
            self.pc_dev
                .dev
                .create_render_pass(&info, None)
                .or(Err(SleetError::DEVICE_ERROR))
        }
    }

    /// Unregister a render pass index
    ///
    /// Destroys every pipeline created against it and bumps the
    /// cache epoch so cached framebuffers for this index are
    /// invalidated lazily.
    pub(crate) fn unregister_renderpass(&self, idx: u32) {
        let mut internal = self.pc_internal.lock().unwrap();
        let idx = idx as usize;

        let entry = match internal.ci_passes.get_mut(idx).and_then(|e| e.take()) {
            Some(e) => e,
            None => {
                log::error!("Unregistering unknown render pass index {}", idx);
                return;
            }
        };
        self.retire(false, DestroyItem::RenderPass(entry.pe_pass));
        internal.ci_epoch += 1;

        // Destroy the whole [*][idx][*] plane
        for plane in internal.ci_pipelines.iter_mut() {
            if let Some(row) = plane.get_mut(idx) {
                for pipe in row.iter_mut() {
                    if *pipe != vk::Pipeline::null() {
                        self.retire(false, DestroyItem::Pipeline(*pipe));
                        *pipe = vk::Pipeline::null();
                    }
                }
            }
        }
    }

    /// Intern a vertex format
    pub(crate) fn register_vertfmt(&self, fmt: &VertexFormat) -> Result<u32> {
        let mut internal = self.pc_internal.lock().unwrap();

        for (i, entry) in internal.ci_vertfmts.iter_mut().enumerate() {
            if let Some(e) = entry {
                if e.ve_fmt == *fmt {
                    e.ve_refcount += 1;
                    return Ok(i as u32);
                }
            }
        }

        let idx = match internal.ci_vertfmts.iter().position(|e| e.is_none()) {
            Some(i) => i,
            None => {
                if internal.ci_vertfmts.len() >= MAX_VERTFORMATS {
                    log::error!("The vertex format table is full ({} entries)", MAX_VERTFORMATS);
                    return Err(SleetError::OUT_OF_MEMORY);
                }
                internal.ci_vertfmts.push(None);
                internal.ci_vertfmts.len() - 1
            }
        };

        internal.ci_vertfmts[idx] = Some(VertFmtEntry {
            ve_fmt: fmt.clone(),
            ve_refcount: 1,
        });

        Ok(idx as u32)
    }

    pub(crate) fn unregister_vertfmt(&self, idx: u32, eager: bool) {
        let mut internal = self.pc_internal.lock().unwrap();
        let idx = idx as usize;

        let last = match internal.ci_vertfmts.get_mut(idx) {
            Some(Some(e)) => {
                e.ve_refcount -= 1;
                e.ve_refcount == 0
            }
            _ => {
                log::error!("Unregistering unknown vertex format index {}", idx);
                return;
            }
        };
        if !last {
            return;
        }

        internal.ci_vertfmts[idx] = None;

        // Destroy the whole [*][*][idx] column
        for plane in internal.ci_pipelines.iter_mut() {
            for row in plane.iter_mut() {
                if let Some(pipe) = row.get_mut(idx) {
                    if *pipe != vk::Pipeline::null() {
                        self.retire(eager, DestroyItem::Pipeline(*pipe));
                        *pipe = vk::Pipeline::null();
                    }
                }
            }
        }
    }

    /// The render pass and registration epoch behind an index
    pub(crate) fn pass_info(&self, idx: u32) -> Option<(vk::RenderPass, u64, RenderPassKey)> {
        let internal = self.pc_internal.lock().unwrap();
        internal
            .ci_passes
            .get(idx as usize)
            .and_then(|e| e.as_ref())
            .map(|e| (e.pe_pass, e.pe_epoch, e.pe_key))
    }

    /// The layouts behind a material index
    pub(crate) fn material_layouts(
        &self,
        idx: u32,
    ) -> Option<(vk::DescriptorSetLayout, vk::PipelineLayout)> {
        let internal = self.pc_internal.lock().unwrap();
        internal
            .ci_materials
            .get(idx as usize)
            .and_then(|e| e.as_ref())
            .map(|e| (e.me_desc_layout, e.me_pipe_layout))
    }

    /// Look up (or lazily create) the pipeline at [m][r][v]
    ///
    /// Returns None when any of the three indices is not registered.
    pub(crate) fn pipeline_get(&self, m: u32, r: u32, v: u32) -> Option<vk::Pipeline> {
        let mut internal = self.pc_internal.lock().unwrap();
        let (m, r, v) = (m as usize, r as usize, v as usize);

        // All three records must be present
        if internal.ci_materials.get(m).and_then(|e| e.as_ref()).is_none()
            || internal.ci_passes.get(r).and_then(|e| e.as_ref()).is_none()
            || internal.ci_vertfmts.get(v).and_then(|e| e.as_ref()).is_none()
        {
            return None;
        }

        // Grow the table out to the requested triple
        if internal.ci_pipelines.len() <= m {
            internal.ci_pipelines.resize_with(m + 1, Vec::new);
        }
        if internal.ci_pipelines[m].len() <= r {
            internal.ci_pipelines[m].resize_with(r + 1, Vec::new);
        }
        if internal.ci_pipelines[m][r].len() <= v {
            internal.ci_pipelines[m][r].resize(v + 1, vk::Pipeline::null());
        }

        if internal.ci_pipelines[m][r][v] != vk::Pipeline::null() {
            return Some(internal.ci_pipelines[m][r][v]);
        }

        let pipeline = {
            let mat = internal.ci_materials[m].as_ref().unwrap();
            let pass = internal.ci_passes[r].as_ref().unwrap();
            let fmt = internal.ci_vertfmts[v].as_ref().unwrap();
            match self.create_pipeline(mat, pass, fmt) {
                Ok(p) => p,
                Err(_) => {
                    log::error!("Could not create pipeline for ({}, {}, {})", m, r, v);
                    return None;
                }
            }
        };

        internal.ci_pipelines[m][r][v] = pipeline;
        Some(pipeline)
    }

    /// Assemble a graphics pipeline from the three records
    fn create_pipeline(
        &self,
        mat: &MaterialEntry,
        pass: &PassEntry,
        fmt: &VertFmtEntry,
    ) -> Result<vk::Pipeline> {
        let shader = &mat.me_shader.sh_internal;
        let key = &mat.me_key;

        let vs_entry = CString::new("vs").unwrap();
        let ps_entry = CString::new("ps").unwrap();

        let mut stages = Vec::new();
        if shader.sh_vert != vk::ShaderModule::null() {
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::VERTEX)
                    .module(shader.sh_vert)
                    .name(&vs_entry)
                    .build(),
            );
        }
        if shader.sh_pix != vk::ShaderModule::null() {
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(shader.sh_pix)
                    .name(&ps_entry)
                    .build(),
            );
        }
        if stages.is_empty() {
            log::error!("Material shader has no graphics stages");
            return Err(SleetError::INVALID_PARAMETER);
        }

        let attribs = fmt.ve_fmt.vk_attributes()?;
        let bindings;
        let mut vert_input = vk::PipelineVertexInputStateCreateInfo::builder();
        if !fmt.ve_fmt.is_empty() {
            bindings = [vk::VertexInputBindingDescription::builder()
                .binding(0)
                .stride(fmt.ve_fmt.stride())
                .input_rate(vk::VertexInputRate::VERTEX)
                .build()];
            vert_input = vert_input
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attribs);
        }
        let vert_input = vert_input.build();

        let assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .build();

        // Viewport and scissor are dynamic, only the counts matter
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();

        let raster = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(key.mk_cull.vk())
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(pass.pe_key.rp_samples)
            .alpha_to_coverage_enable(key.mk_alpha_to_coverage)
            .build();

        let mut depth_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(key.mk_depth_test)
            .depth_write_enable(key.mk_write_mask.contains(WriteMask::DEPTH))
            .depth_compare_op(key.mk_depth_compare.vk())
            .stencil_test_enable(key.mk_stencil_front.is_some() || key.mk_stencil_back.is_some());
        if let Some(front) = key.mk_stencil_front {
            depth_state = depth_state.front(front.vk());
        }
        if let Some(back) = key.mk_stencil_back {
            depth_state = depth_state.back(back.vk());
        }
        let depth_state = depth_state.build();

        // A single color attachment. With blending effectively off we
        // still pass an explicit ONE/ZERO pass-through state.
        let blend = &key.mk_blend;
        let blend_attachment = match blend.enable {
            true => vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(true)
                .src_color_blend_factor(blend.src_factor.vk())
                .dst_color_blend_factor(blend.dst_factor.vk())
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(blend.src_alpha_factor.vk())
                .dst_alpha_blend_factor(blend.dst_alpha_factor.vk())
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(key.mk_write_mask.vk_color())
                .build(),
            false => vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(false)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ZERO)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(key.mk_write_mask.vk_color())
                .build(),
        };
        let blend_attachments = match pass.pe_key.rp_color_fmt != vk::Format::UNDEFINED {
            true => vec![blend_attachment],
            false => Vec::new(),
        };
        let blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments)
            .build();

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vert_input)
            .input_assembly_state(&assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_state)
            .color_blend_state(&blend_state)
            .dynamic_state(&dynamic)
            .layout(mat.me_pipe_layout)
            .render_pass(pass.pe_pass)
            .subpass(0)
            .build();

        unsafe {
            match self.pc_dev.dev.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[info],
                None,
            ) {
                Ok(pipelines) => Ok(pipelines[0]),
                Err((_, e)) => {
                    log::error!("vkCreateGraphicsPipelines failed: {:?}", e);
                    Err(SleetError::DEVICE_ERROR)
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn material_refcount(&self, idx: u32) -> Option<u32> {
        let internal = self.pc_internal.lock().unwrap();
        internal
            .ci_materials
            .get(idx as usize)
            .and_then(|e| e.as_ref())
            .map(|e| e.me_refcount)
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        let internal = self.pc_internal.lock().unwrap();
        unsafe {
            for plane in internal.ci_pipelines.iter() {
                for row in plane.iter() {
                    for pipe in row.iter() {
                        if *pipe != vk::Pipeline::null() {
                            self.pc_dev.dev.destroy_pipeline(*pipe, None);
                        }
                    }
                }
            }
            for entry in internal.ci_materials.iter().flatten() {
                self.pc_dev
                    .dev
                    .destroy_pipeline_layout(entry.me_pipe_layout, None);
                self.pc_dev
                    .dev
                    .destroy_descriptor_set_layout(entry.me_desc_layout, None);
            }
            for entry in internal.ci_passes.iter().flatten() {
                self.pc_dev.dev.destroy_render_pass(entry.pe_pass, None);
            }
        }
    }
}
