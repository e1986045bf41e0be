// Shaders
//
// A shader is an immutable compiled artifact: up to three SPIR-V
// stages plus the reflection metadata the binding machinery needs.
// Parsing the on-disk shader container is not our job, callers hand
// over the SPIR-V words and reflection tables it produced.
//
// Austin Shafer - 2024

use ash::vk;

use crate::deletion_queue::DestroyItem;
use crate::device::Device;
use crate::{Result, SleetError};
use utils::log;

use std::sync::Arc;

/// HLSL-style register classification
///
/// The register kind decides both the descriptor type and the slot
/// window the binding lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterKind {
    /// Constant/uniform buffers (`b` registers)
    Constant,
    /// Sampled textures (`t` registers)
    Texture,
    /// Read-only structured buffers (`t` registers)
    ReadBuffer,
    /// Read/write storage buffers (`u` registers)
    ReadWrite,
    /// Read/write storage images (`u` registers)
    ReadWriteTex,
}

/// Slot shift for constant registers
pub const SLOT_SHIFT_CONSTANT: u32 = 0;
/// Slot shift for sampled/structured registers
pub const SLOT_SHIFT_RESOURCE: u32 = 100;
/// Slot shift for UAV/storage registers
pub const SLOT_SHIFT_READWRITE: u32 = 200;

impl RegisterKind {
    /// The base of the slot window this kind's registers occupy
    pub fn shift(&self) -> u32 {
        match self {
            RegisterKind::Constant => SLOT_SHIFT_CONSTANT,
            RegisterKind::Texture | RegisterKind::ReadBuffer => SLOT_SHIFT_RESOURCE,
            RegisterKind::ReadWrite | RegisterKind::ReadWriteTex => SLOT_SHIFT_READWRITE,
        }
    }

    pub(crate) fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            RegisterKind::Constant => vk::DescriptorType::UNIFORM_BUFFER,
            RegisterKind::Texture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            RegisterKind::ReadBuffer | RegisterKind::ReadWrite => vk::DescriptorType::STORAGE_BUFFER,
            RegisterKind::ReadWriteTex => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    /// Does this register bind a buffer (as opposed to an image)?
    pub fn is_buffer(&self) -> bool {
        match self {
            RegisterKind::Constant | RegisterKind::ReadBuffer | RegisterKind::ReadWrite => true,
            RegisterKind::Texture | RegisterKind::ReadWriteTex => false,
        }
    }
}

bitflags::bitflags! {
    /// Which stages reference a binding
    pub struct StageMask: u32 {
        const VERTEX = 1;
        const PIXEL = 2;
        const COMPUTE = 4;
    }
}

impl StageMask {
    pub(crate) fn vk_stages(&self) -> vk::ShaderStageFlags {
        let mut ret = vk::ShaderStageFlags::empty();
        if self.contains(StageMask::VERTEX) {
            ret |= vk::ShaderStageFlags::VERTEX;
        }
        if self.contains(StageMask::PIXEL) {
            ret |= vk::ShaderStageFlags::FRAGMENT;
        }
        if self.contains(StageMask::COMPUTE) {
            ret |= vk::ShaderStageFlags::COMPUTE;
        }
        ret
    }
}

/// Declared type of a `$Global` parameter
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParamType {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Int2,
    Int3,
    Int4,
    UInt,
    Matrix,
    /// Raw bytes escape hatch, matches any declared type
    Uint8,
}

impl ParamType {
    /// Size in bytes of one element
    pub fn size(&self) -> usize {
        match self {
            ParamType::Uint8 => 1,
            ParamType::Float | ParamType::Int | ParamType::UInt => 4,
            ParamType::Float2 | ParamType::Int2 => 8,
            ParamType::Float3 | ParamType::Int3 => 12,
            ParamType::Float4 | ParamType::Int4 => 16,
            ParamType::Matrix => 64,
        }
    }
}

/// One named `$Global` variable
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: String,
    pub ptype: ParamType,
    pub offset: u32,
    pub count: u32,
}

/// One named resource binding
#[derive(Debug, Clone)]
pub struct BindInfo {
    pub name: String,
    /// Shifted slot index, see RegisterKind::shift
    pub slot: u32,
    pub kind: RegisterKind,
    pub stages: StageMask,
    /// A stock texture name ("white", "black", "gray") to seed the
    /// binding with
    pub default_tex: Option<String>,
}

/// Everything the caller's shader container reflected
pub struct ShaderInfo {
    pub vertex_spirv: Option<Vec<u32>>,
    pub pixel_spirv: Option<Vec<u32>>,
    pub compute_spirv: Option<Vec<u32>>,
    pub params: Vec<ParamInfo>,
    pub binds: Vec<BindInfo>,
    /// Size of the `$Global` uniform block, 0 when absent
    pub global_size: u32,
    /// Default contents for `$Global`
    pub global_defaults: Option<Vec<u8>>,
    /// Per-instance data stride the vertex stage expects, 0 when
    /// the shader does not read instance data
    pub instance_stride: u32,
    /// Does the shader declare the per-draw system buffer?
    pub uses_system_buffer: bool,
}

/// The retained reflection tables
pub(crate) struct ShaderMeta {
    pub(crate) params: Vec<ParamInfo>,
    pub(crate) binds: Vec<BindInfo>,
    pub(crate) global_size: u32,
    pub(crate) global_defaults: Option<Vec<u8>>,
    pub(crate) instance_stride: u32,
    pub(crate) uses_system_buffer: bool,
}

impl ShaderMeta {
    #[cfg(test)]
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Self {
            params: Vec::new(),
            binds: Vec::new(),
            global_size: 0,
            global_defaults: None,
            instance_stride: 0,
            uses_system_buffer: false,
        })
    }
}

pub(crate) struct ShaderInternal {
    sh_dev: Arc<Device>,
    pub(crate) sh_vert: vk::ShaderModule,
    pub(crate) sh_pix: vk::ShaderModule,
    pub(crate) sh_comp: vk::ShaderModule,
    pub(crate) sh_meta: Arc<ShaderMeta>,
}

/// A compiled shader handle
#[derive(Clone)]
pub struct Shader {
    pub(crate) sh_internal: Arc<ShaderInternal>,
}

fn create_module(dev: &Device, spirv: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::builder().code(spirv);
    unsafe {
        dev.dev.create_shader_module(&info, None).map_err(|e| {
            log::error!("vkCreateShaderModule failed: {:?}", e);
            SleetError::DEVICE_ERROR
        })
    }
}

impl Shader {
    pub(crate) fn new(dev: Arc<Device>, info: ShaderInfo) -> Result<Shader> {
        if info.vertex_spirv.is_none() && info.pixel_spirv.is_none() && info.compute_spirv.is_none()
        {
            log::error!("A shader needs at least one stage");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if let Some(defaults) = info.global_defaults.as_ref() {
            if defaults.len() != info.global_size as usize {
                log::error!("$Global defaults do not match the declared block size");
                return Err(SleetError::INVALID_PARAMETER);
            }
        }

        let mut vert = vk::ShaderModule::null();
        let mut pix = vk::ShaderModule::null();
        let mut comp = vk::ShaderModule::null();

        let destroy_all = |dev: &Device, mods: &[vk::ShaderModule]| unsafe {
            for m in mods {
                if *m != vk::ShaderModule::null() {
                    dev.dev.destroy_shader_module(*m, None);
                }
            }
        };

        if let Some(spirv) = info.vertex_spirv.as_ref() {
            vert = create_module(&dev, spirv)?;
        }
        if let Some(spirv) = info.pixel_spirv.as_ref() {
            match create_module(&dev, spirv) {
                Ok(m) => pix = m,
                Err(e) => {
                    destroy_all(&dev, &[vert]);
                    return Err(e);
                }
            }
        }
        if let Some(spirv) = info.compute_spirv.as_ref() {
            match create_module(&dev, spirv) {
                Ok(m) => comp = m,
                Err(e) => {
                    destroy_all(&dev, &[vert, pix]);
                    return Err(e);
                }
            }
        }

        Ok(Shader {
            sh_internal: Arc::new(ShaderInternal {
                sh_dev: dev,
                sh_vert: vert,
                sh_pix: pix,
                sh_comp: comp,
                sh_meta: Arc::new(ShaderMeta {
                    params: info.params,
                    binds: info.binds,
                    global_size: info.global_size,
                    global_defaults: info.global_defaults,
                    instance_stride: info.instance_stride,
                    uses_system_buffer: info.uses_system_buffer,
                }),
            }),
        })
    }

    /// A stable identity for pipeline cache keys
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.sh_internal) as usize
    }

    pub(crate) fn meta(&self) -> &ShaderMeta {
        &self.sh_internal.sh_meta
    }

    pub(crate) fn meta_arc(&self) -> Arc<ShaderMeta> {
        self.sh_internal.sh_meta.clone()
    }

    pub fn has_compute(&self) -> bool {
        self.sh_internal.sh_comp != vk::ShaderModule::null()
    }

    pub(crate) fn find_bind(&self, name: &str) -> Option<(usize, &BindInfo)> {
        self.meta()
            .binds
            .iter()
            .enumerate()
            .find(|(_, b)| b.name == name)
    }

    pub(crate) fn find_param(&self, name: &str) -> Option<&ParamInfo> {
        self.meta().params.iter().find(|p| p.name == name)
    }

    /// Number of bind pool slots a material for this shader rents
    pub(crate) fn bind_count(&self) -> u32 {
        self.meta().binds.len() as u32
    }
}

impl Drop for ShaderInternal {
    fn drop(&mut self) {
        for m in [self.sh_vert, self.sh_pix, self.sh_comp] {
            if m != vk::ShaderModule::null() {
                self.sh_dev.destroy_or_defer(DestroyItem::ShaderModule(m));
            }
        }
    }
}
