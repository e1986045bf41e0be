// Compute programs
//
// A compute program is a shader's compute stage wired to its own
// pipeline, bind table and $Global mirror. Dispatch transitions the
// bound textures automatically and fences its results against the
// following graphics or compute work.
//
// Austin Shafer - 2024

use ash::vk;

use crate::bindpool::BindResource;
use crate::buffer::{BufType, BufUse, Buffer};
use crate::deletion_queue::DestroyItem;
use crate::device::Device;
use crate::material::DescWriteBuilder;
use crate::renderer::Renderer;
use crate::shader::{ParamType, RegisterKind, Shader};
use crate::texture::Texture;
use crate::{Result, SleetError};
use utils::log;

use std::ffi::CString;
use std::sync::{Arc, RwLock};

pub(crate) struct ComputeInternal {
    cp_dev: Arc<Device>,
    pub(crate) cp_shader: Shader,
    cp_desc_layout: vk::DescriptorSetLayout,
    cp_pipe_layout: vk::PipelineLayout,
    cp_pipeline: vk::Pipeline,
    cp_bind_start: u32,
    cp_bind_count: u32,
    /// CPU copy of $Global plus its GPU mirror
    cp_global: Vec<u8>,
    cp_global_buf: Option<Buffer>,
    cp_global_dirty: bool,
    cp_destroyed: bool,
}

/// A compute program handle
#[derive(Clone)]
pub struct ComputeProgram {
    pub(crate) cp_internal: Arc<RwLock<ComputeInternal>>,
}

impl ComputeProgram {
    pub(crate) fn new(dev: Arc<Device>, shader: &Shader) -> Result<ComputeProgram> {
        if !shader.has_compute() {
            log::error!("Shader has no compute stage");
            return Err(SleetError::INVALID_PARAMETER);
        }

        // Compute-only descriptor layout from reflection, with the
        // push descriptor bit when available
        let mut bindings = Vec::new();
        for bind in shader.meta().binds.iter() {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(bind.slot)
                    .descriptor_type(bind.kind.descriptor_type())
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .descriptor_count(1)
                    .build(),
            );
        }

        let mut flags = vk::DescriptorSetLayoutCreateFlags::empty();
        if dev.dev_features.vkc_supports_push_descriptors {
            flags |= vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR;
        }
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(flags)
            .bindings(&bindings);

        let (desc_layout, pipe_layout, pipeline) = unsafe {
            let desc_layout = dev
                .dev
                .create_descriptor_set_layout(&layout_info, None)
                .or(Err(SleetError::DEVICE_ERROR))?;

            let layouts = [desc_layout];
            let pipe_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts);
            let pipe_layout = match dev.dev.create_pipeline_layout(&pipe_info, None) {
                Ok(l) => l,
                Err(_) => {
                    dev.dev.destroy_descriptor_set_layout(desc_layout, None);
                    return Err(SleetError::DEVICE_ERROR);
                }
            };

            let entry = CString::new("cs").unwrap();
            let stage = vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(shader.sh_internal.sh_comp)
                .name(&entry)
                .build();
            let info = vk::ComputePipelineCreateInfo::builder()
                .stage(stage)
                .layout(pipe_layout)
                .build();

            let pipeline = match dev.dev.create_compute_pipelines(
                vk::PipelineCache::null(),
                &[info],
                None,
            ) {
                Ok(p) => p[0],
                Err((_, e)) => {
                    log::error!("vkCreateComputePipelines failed: {:?}", e);
                    dev.dev.destroy_pipeline_layout(pipe_layout, None);
                    dev.dev.destroy_descriptor_set_layout(desc_layout, None);
                    return Err(SleetError::DEVICE_ERROR);
                }
            };

            (desc_layout, pipe_layout, pipeline)
        };

        // Rent the binding table and seed it from reflection
        let bind_count = shader.bind_count();
        let bind_start = match bind_count {
            0 => 0,
            n => dev.d_bind_pool.alloc(n),
        };
        for (i, bind) in shader.meta().binds.iter().enumerate() {
            dev.d_bind_pool
                .set_slot(bind_start + i as u32, Some(bind.clone()), BindResource::None);
        }

        let global_size = shader.meta().global_size as usize;
        let global = match shader.meta().global_defaults.as_ref() {
            Some(defaults) => defaults.clone(),
            None => vec![0; global_size],
        };

        Ok(ComputeProgram {
            cp_internal: Arc::new(RwLock::new(ComputeInternal {
                cp_dev: dev,
                cp_shader: shader.clone(),
                cp_desc_layout: desc_layout,
                cp_pipe_layout: pipe_layout,
                cp_pipeline: pipeline,
                cp_bind_start: bind_start,
                cp_bind_count: bind_count,
                cp_global: global,
                cp_global_buf: None,
                cp_global_dirty: global_size > 0,
                cp_destroyed: false,
            })),
        })
    }

    pub fn set_tex(&self, name: &str, tex: &Texture) -> Result<()> {
        let internal = self.cp_internal.read().unwrap();

        let (idx, bind) = match internal.cp_shader.find_bind(name) {
            Some(b) => b,
            None => {
                log::error!("Unknown compute texture binding '{}'", name);
                return Err(SleetError::INVALID_PARAMETER);
            }
        };
        if bind.kind.is_buffer() {
            log::error!("Binding '{}' is not a texture", name);
            return Err(SleetError::INVALID_PARAMETER);
        }

        internal.cp_dev.d_bind_pool.set_resource(
            internal.cp_bind_start + idx as u32,
            BindResource::Texture(tex.clone()),
        );
        Ok(())
    }

    pub fn set_buffer(&self, name: &str, buf: &Buffer) -> Result<()> {
        let internal = self.cp_internal.read().unwrap();

        let (idx, bind) = match internal.cp_shader.find_bind(name) {
            Some(b) => b,
            None => {
                log::error!("Unknown compute buffer binding '{}'", name);
                return Err(SleetError::INVALID_PARAMETER);
            }
        };
        if !bind.kind.is_buffer() {
            log::error!("Binding '{}' is not a buffer", name);
            return Err(SleetError::INVALID_PARAMETER);
        }

        internal.cp_dev.d_bind_pool.set_resource(
            internal.cp_bind_start + idx as u32,
            BindResource::Buffer(buf.clone()),
        );
        Ok(())
    }

    pub fn set_param(&self, name: &str, ptype: ParamType, count: u32, data: &[u8]) -> Result<()> {
        let mut internal = self.cp_internal.write().unwrap();

        let param = match internal.cp_shader.find_param(name) {
            Some(p) => p.clone(),
            None => {
                log::error!("Unknown compute parameter '{}'", name);
                return Err(SleetError::INVALID_PARAMETER);
            }
        };
        if param.ptype != ptype && ptype != ParamType::Uint8 {
            log::error!(
                "Parameter '{}' is declared {:?}, not {:?}",
                name,
                param.ptype,
                ptype
            );
            return Err(SleetError::INVALID_PARAMETER);
        }

        let size = ptype.size() * count as usize;
        let offset = param.offset as usize;
        if data.len() < size || offset + size > internal.cp_global.len() {
            log::error!("Parameter '{}' write is out of bounds", name);
            return Err(SleetError::INVALID_PARAMETER);
        }

        internal.cp_global[offset..offset + size].copy_from_slice(&data[..size]);
        internal.cp_global_dirty = true;
        Ok(())
    }

    pub fn set_params(&self, data: &[u8]) -> Result<()> {
        let mut internal = self.cp_internal.write().unwrap();

        if data.len() != internal.cp_global.len() {
            log::error!(
                "$Global is {} bytes, caller wrote {}",
                internal.cp_global.len(),
                data.len()
            );
            return Err(SleetError::INVALID_PARAMETER);
        }

        internal.cp_global.copy_from_slice(data);
        internal.cp_global_dirty = true;
        Ok(())
    }

    /// Dispatch `x * y * z` workgroups
    pub(crate) fn execute(&self, rend: &Renderer, x: u32, y: u32, z: u32) -> Result<()> {
        self.execute_common(rend, |dev, cbuf| unsafe {
            dev.dev.cmd_dispatch(cbuf, x, y, z);

            // Make the results visible to whatever pass comes next
            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
                .build();
            dev.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER
                    | vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        })
    }

    /// Dispatch with GPU-provided group counts
    ///
    /// No trailing barrier: indirect dispatches are followed by
    /// another pass that inserts its own.
    pub(crate) fn execute_indirect(&self, rend: &Renderer, args: &Buffer) -> Result<()> {
        if args.buf_type() != BufType::Storage {
            log::error!("Indirect dispatch args must live in a storage buffer");
            return Err(SleetError::INVALID_PARAMETER);
        }
        let args_buf = args.vk_current();

        self.execute_common(rend, |dev, cbuf| unsafe {
            dev.dev.cmd_dispatch_indirect(cbuf, args_buf, 0);
        })
    }

    fn execute_common(
        &self,
        rend: &Renderer,
        record: impl FnOnce(&Device, vk::CommandBuffer),
    ) -> Result<()> {
        let mut internal = self.cp_internal.write().unwrap();
        let dev = internal.cp_dev.clone();

        if internal.cp_destroyed {
            return Err(SleetError::INVALID_PARAMETER);
        }

        // Sync the $Global GPU mirror
        if internal.cp_global_dirty && !internal.cp_global.is_empty() {
            match internal.cp_global_buf.as_ref() {
                Some(buf) => buf.set(&internal.cp_global)?,
                None => {
                    let buf = Buffer::new(
                        dev.clone(),
                        Some(&internal.cp_global),
                        internal.cp_global.len(),
                        1,
                        BufType::Constant,
                        BufUse::DYNAMIC,
                    )?;
                    internal.cp_global_buf = Some(buf);
                }
            }
            internal.cp_global_dirty = false;

            // Auto-bind the mirror into the reserved global slot
            let slots = rend.bind_slots();
            if let Some((idx, _)) = internal
                .cp_shader
                .meta()
                .binds
                .iter()
                .enumerate()
                .find(|(_, b)| b.kind == RegisterKind::Constant && b.slot == slots.material_slot)
            {
                dev.d_bind_pool.set_resource(
                    internal.cp_bind_start + idx as u32,
                    BindResource::Buffer(internal.cp_global_buf.as_ref().unwrap().clone()),
                );
            }
        }

        let cbuf = dev.cmd_acquire()?;

        // Auto-transition every bound texture
        let bound_texs: Vec<(Texture, RegisterKind)> = {
            let pool = dev.d_bind_pool.lock();
            internal
                .cp_shader
                .meta()
                .binds
                .iter()
                .enumerate()
                .filter_map(|(i, bind)| {
                    match &pool.slot(internal.cp_bind_start + i as u32).bs_res {
                        BindResource::Texture(t) => Some((t.clone(), bind.kind)),
                        _ => None,
                    }
                })
                .collect()
        };
        for (tex, kind) in bound_texs.iter() {
            let mut tex_internal = tex.t_internal.write().unwrap();
            match kind {
                RegisterKind::ReadWriteTex => dev.transition_for_storage(&mut tex_internal, cbuf),
                _ => dev.transition_for_shader_read(
                    &mut tex_internal,
                    cbuf,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                ),
            }
        }

        unsafe {
            dev.dev
                .cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::COMPUTE, internal.cp_pipeline);
        }

        // Resolve the binding table, failing early on a hole
        let mut builder = DescWriteBuilder::new();
        let resolve = {
            let pool = dev.d_bind_pool.lock();
            builder.add_shader_binds(
                internal.cp_shader.meta(),
                internal.cp_bind_start,
                &pool,
                rend.globals(),
                &[],
            )
        };
        if let Err(missing) = resolve {
            log::critical!(
                "missing binding '{}' in compute shader",
                internal.cp_shader.meta().binds[missing].name
            );
            dev.cmd_release()?;
            return Ok(());
        }

        builder.push(
            &dev,
            cbuf,
            vk::PipelineBindPoint::COMPUTE,
            internal.cp_pipe_layout,
            internal.cp_desc_layout,
        )?;

        record(&dev, cbuf);

        dev.cmd_release()?;
        Ok(())
    }

    /// Destroy the program
    pub fn destroy(&self) {
        self.cp_internal.write().unwrap().destroy();
    }
}

impl ComputeInternal {
    fn destroy(&mut self) {
        if self.cp_destroyed {
            return;
        }
        self.cp_destroyed = true;

        self.cp_dev
            .destroy_or_defer(DestroyItem::Pipeline(self.cp_pipeline));
        self.cp_dev
            .destroy_or_defer(DestroyItem::PipelineLayout(self.cp_pipe_layout));
        self.cp_dev
            .destroy_or_defer(DestroyItem::DescriptorSetLayout(self.cp_desc_layout));
        if self.cp_bind_count > 0 {
            self.cp_dev
                .destroy_or_defer(DestroyItem::BindRange(self.cp_bind_start, self.cp_bind_count));
        }
        if let Some(buf) = self.cp_global_buf.take() {
            buf.destroy();
        }
    }
}

impl Drop for ComputeInternal {
    fn drop(&mut self) {
        self.destroy();
    }
}
