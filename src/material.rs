// Materials and descriptor write resolution
//
// A material pairs a shader with immutable pipeline state, a CPU
// mirror of the shader's $Global block, and a rented range of bind
// pool slots seeded from reflection. At draw time the descriptor
// write builder merges per-material bindings, process-wide globals
// and shader defaults into one push-descriptor batch.
//
// Austin Shafer - 2024

use ash::vk;

use crate::bindpool::{BindPool, BindPoolInternal, BindResource};
use crate::buffer::Buffer;
use crate::deletion_queue::DestroyItem;
use crate::device::Device;
use crate::layout::{PendingKind, PendingTransitions};
use crate::pipeline::{MaterialKey, MaterialStateInfo, PipelineCache};
use crate::shader::{ParamType, RegisterKind, Shader, ShaderMeta};
use crate::texture::{StockTextures, Texture};
use crate::{Result, SleetError, MAX_GLOBALS};
use utils::log;

use std::sync::{Arc, Mutex, RwLock};

/// The fixed tables `set_global_*` writes into
///
/// Globals are looked up by `slot - register_kind_shift`, one table
/// for buffers and one for textures. Entries are non-owning in
/// spirit, the handles only pin the CPU bookkeeping.
pub(crate) struct GlobalTable {
    g_buffers: Vec<Option<Buffer>>,
    g_textures: Vec<Option<Texture>>,
}

impl GlobalTable {
    pub(crate) fn new() -> Self {
        Self {
            g_buffers: (0..MAX_GLOBALS).map(|_| None).collect(),
            g_textures: (0..MAX_GLOBALS).map(|_| None).collect(),
        }
    }

    pub(crate) fn set_buffer(&mut self, slot: u32, buf: Option<Buffer>) -> Result<()> {
        if slot as usize >= MAX_GLOBALS {
            log::error!("Global slot {} is out of range", slot);
            return Err(SleetError::INVALID_PARAMETER);
        }
        self.g_buffers[slot as usize] = buf;
        Ok(())
    }

    pub(crate) fn set_texture(&mut self, slot: u32, tex: Option<Texture>) -> Result<()> {
        if slot as usize >= MAX_GLOBALS {
            log::error!("Global slot {} is out of range", slot);
            return Err(SleetError::INVALID_PARAMETER);
        }
        self.g_textures[slot as usize] = tex;
        Ok(())
    }

    fn buffer_at(&self, idx: u32) -> Option<&Buffer> {
        self.g_buffers.get(idx as usize).and_then(|b| b.as_ref())
    }

    fn texture_at(&self, idx: u32) -> Option<&Texture> {
        self.g_textures.get(idx as usize).and_then(|t| t.as_ref())
    }
}

pub(crate) struct MaterialInternal {
    mt_dev: Arc<Device>,
    mt_cache: Arc<PipelineCache>,
    mt_pool: Arc<BindPool>,
    mt_pending: Arc<Mutex<PendingTransitions>>,
    pub(crate) mt_shader: Shader,
    /// Sort bias for render lists, not part of the pipeline key
    pub(crate) mt_queue_offset: u32,
    pub(crate) mt_pipe_idx: u32,
    /// CPU mirror of the shader's $Global block
    mt_params: Vec<u8>,
    pub(crate) mt_bind_start: u32,
    pub(crate) mt_bind_count: u32,
    mt_destroyed: bool,
}

/// A material handle
#[derive(Clone)]
pub struct Material {
    pub(crate) mt_internal: Arc<RwLock<MaterialInternal>>,
}

impl Material {
    pub(crate) fn new(
        dev: Arc<Device>,
        cache: Arc<PipelineCache>,
        pool: Arc<BindPool>,
        pending: Arc<Mutex<PendingTransitions>>,
        stock: &StockTextures,
        shader: &Shader,
        state: &MaterialStateInfo,
    ) -> Result<Material> {
        let key = MaterialKey::new(shader, state);

        // The $Global mirror starts from the shader's defaults
        let params = match shader.meta().global_defaults.as_ref() {
            Some(defaults) => defaults.clone(),
            None => vec![0; shader.meta().global_size as usize],
        };

        // Rent bind slots for every reflected binding and seed their
        // shader-bind descriptors
        let bind_count = shader.bind_count();
        let bind_start = match bind_count {
            0 => 0,
            n => pool.alloc(n),
        };
        for (i, bind) in shader.meta().binds.iter().enumerate() {
            let res = match bind
                .default_tex
                .as_ref()
                .and_then(|name| stock.lookup(name))
            {
                Some(tex) => BindResource::Texture(tex.clone()),
                None => BindResource::None,
            };
            pool.set_slot(bind_start + i as u32, Some(bind.clone()), res);
        }

        let pipe_idx = match cache.register_material(key, shader) {
            Ok(idx) => idx,
            Err(e) => {
                if bind_count > 0 {
                    pool.free(bind_start, bind_count);
                }
                return Err(e);
            }
        };

        Ok(Material {
            mt_internal: Arc::new(RwLock::new(MaterialInternal {
                mt_dev: dev,
                mt_cache: cache,
                mt_pool: pool,
                mt_pending: pending,
                mt_shader: shader.clone(),
                mt_queue_offset: state.queue_offset,
                mt_pipe_idx: pipe_idx,
                mt_params: params,
                mt_bind_start: bind_start,
                mt_bind_count: bind_count,
                mt_destroyed: false,
            })),
        })
    }

    /// A stable identity used as a render list sort key
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.mt_internal) as usize
    }

    /// Bind a texture to the named slot
    pub fn set_tex(&self, name: &str, tex: &Texture) -> Result<()> {
        let internal = self.mt_internal.read().unwrap();

        let (idx, bind) = match internal.mt_shader.find_bind(name) {
            Some(b) => b,
            None => {
                log::error!("Unknown texture binding '{}'", name);
                return Err(SleetError::INVALID_PARAMETER);
            }
        };
        if bind.kind.is_buffer() {
            log::error!("Binding '{}' is not a texture", name);
            return Err(SleetError::INVALID_PARAMETER);
        }

        let kind = match bind.kind {
            RegisterKind::ReadWriteTex => PendingKind::Storage,
            _ => PendingKind::ShaderRead,
        };

        internal.mt_pool.set_resource(
            internal.mt_bind_start + idx as u32,
            BindResource::Texture(tex.clone()),
        );

        // Barriers are not legal inside a pass, park the transition
        // until the next begin_pass
        internal.mt_pending.lock().unwrap().push(tex, kind);

        Ok(())
    }

    /// Bind a buffer to the named slot
    pub fn set_buffer(&self, name: &str, buf: &Buffer) -> Result<()> {
        let internal = self.mt_internal.read().unwrap();

        let (idx, bind) = match internal.mt_shader.find_bind(name) {
            Some(b) => b,
            None => {
                log::error!("Unknown buffer binding '{}'", name);
                return Err(SleetError::INVALID_PARAMETER);
            }
        };
        if !bind.kind.is_buffer() {
            log::error!("Binding '{}' is not a buffer", name);
            return Err(SleetError::INVALID_PARAMETER);
        }

        internal.mt_pool.set_resource(
            internal.mt_bind_start + idx as u32,
            BindResource::Buffer(buf.clone()),
        );

        Ok(())
    }

    /// Write one named parameter into the $Global mirror
    ///
    /// The declared type has to match, except for the Uint8 raw
    /// bytes escape hatch.
    pub fn set_param(&self, name: &str, ptype: ParamType, count: u32, data: &[u8]) -> Result<()> {
        let mut internal = self.mt_internal.write().unwrap();

        let param = match internal.mt_shader.find_param(name) {
            Some(p) => p.clone(),
            None => {
                log::error!("Unknown shader parameter '{}'", name);
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
        if data.len() < size || offset + size > internal.mt_params.len() {
            log::error!("Parameter '{}' write is out of bounds", name);
            return Err(SleetError::INVALID_PARAMETER);
        }

        internal.mt_params[offset..offset + size].copy_from_slice(&data[..size]);
        Ok(())
    }

    /// Replace the whole $Global block
    pub fn set_params(&self, data: &[u8]) -> Result<()> {
        let mut internal = self.mt_internal.write().unwrap();

        if data.len() != internal.mt_params.len() {
            log::error!(
                "$Global is {} bytes, caller wrote {}",
                internal.mt_params.len(),
                data.len()
            );
            return Err(SleetError::INVALID_PARAMETER);
        }

        internal.mt_params.copy_from_slice(data);
        Ok(())
    }

    /// A copy of the current $Global contents
    pub(crate) fn params_snapshot(&self) -> Vec<u8> {
        self.mt_internal.read().unwrap().mt_params.clone()
    }

    pub(crate) fn queue_offset(&self) -> u32 {
        self.mt_internal.read().unwrap().mt_queue_offset
    }

    pub(crate) fn shader(&self) -> Shader {
        self.mt_internal.read().unwrap().mt_shader.clone()
    }

    /// Destroy the material
    ///
    /// The CPU parameter mirror is released immediately. The bind
    /// pool range and the pipeline cache registration ride the
    /// destroy list so items recorded this frame keep resolving.
    pub fn destroy(&self) {
        let mut internal = self.mt_internal.write().unwrap();
        if internal.mt_destroyed {
            return;
        }
        internal.mt_destroyed = true;

        internal.mt_params = Vec::new();

        internal.mt_dev.destroy_or_defer(DestroyItem::MaterialUnregister(
            internal.mt_cache.clone(),
            internal.mt_pipe_idx,
        ));
        if internal.mt_bind_count > 0 {
            internal.mt_dev.destroy_or_defer(DestroyItem::BindRange(
                internal.mt_bind_start,
                internal.mt_bind_count,
            ));
        }
    }
}

impl Drop for MaterialInternal {
    fn drop(&mut self) {
        if self.mt_destroyed {
            return;
        }
        self.mt_destroyed = true;

        self.mt_dev.destroy_or_defer(DestroyItem::MaterialUnregister(
            self.mt_cache.clone(),
            self.mt_pipe_idx,
        ));
        if self.mt_bind_count > 0 {
            self.mt_dev.destroy_or_defer(DestroyItem::BindRange(
                self.mt_bind_start,
                self.mt_bind_count,
            ));
        }
    }
}

// ----------------------------------------------------------------------
// descriptor write builder
// ----------------------------------------------------------------------

enum WriteSpec {
    Buffer {
        binding: u32,
        dtype: vk::DescriptorType,
        info: usize,
    },
    Image {
        binding: u32,
        dtype: vk::DescriptorType,
        info: usize,
    },
}

/// Accumulates descriptor writes for one draw or dispatch
///
/// Infos are kept in flat arrays, the final VkWriteDescriptorSet
/// batch is assembled in `push` once nothing can reallocate them.
pub(crate) struct DescWriteBuilder {
    dw_writes: Vec<WriteSpec>,
    dw_buf_infos: Vec<vk::DescriptorBufferInfo>,
    dw_img_infos: Vec<vk::DescriptorImageInfo>,
}

impl DescWriteBuilder {
    pub(crate) fn new() -> Self {
        Self {
            dw_writes: Vec::new(),
            dw_buf_infos: Vec::new(),
            dw_img_infos: Vec::new(),
        }
    }

    pub(crate) fn add_buffer(
        &mut self,
        binding: u32,
        dtype: vk::DescriptorType,
        buf: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        self.dw_buf_infos.push(
            vk::DescriptorBufferInfo::builder()
                .buffer(buf)
                .offset(offset)
                .range(range)
                .build(),
        );
        self.dw_writes.push(WriteSpec::Buffer {
            binding: binding,
            dtype: dtype,
            info: self.dw_buf_infos.len() - 1,
        });
    }

    pub(crate) fn add_image(
        &mut self,
        binding: u32,
        dtype: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) {
        self.dw_img_infos.push(
            vk::DescriptorImageInfo::builder()
                .sampler(sampler)
                .image_view(view)
                .image_layout(layout)
                .build(),
        );
        self.dw_writes.push(WriteSpec::Image {
            binding: binding,
            dtype: dtype,
            info: self.dw_img_infos.len() - 1,
        });
    }

    fn add_resource(&mut self, bind_slot: u32, kind: RegisterKind, res: ResolvedResource) {
        match res {
            ResolvedResource::Buf(buf) => {
                self.add_buffer(bind_slot, kind.descriptor_type(), buf, 0, vk::WHOLE_SIZE);
            }
            ResolvedResource::Tex {
                view,
                sampler,
                compute,
            } => {
                let (dtype, layout) = match kind {
                    RegisterKind::ReadWriteTex => {
                        (vk::DescriptorType::STORAGE_IMAGE, vk::ImageLayout::GENERAL)
                    }
                    _ => (
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        match compute {
                            true => vk::ImageLayout::GENERAL,
                            false => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        },
                    ),
                };
                self.add_image(bind_slot, dtype, view, sampler, layout);
            }
        }
    }

    /// Resolve every reflected binding of `shader`
    ///
    /// Slots listed in `ignore` are handled separately by the
    /// caller. Globals win over material bindings. A binding with
    /// neither returns the failing reflection index so the caller
    /// can name it in the log.
    pub(crate) fn add_shader_binds(
        &mut self,
        meta: &ShaderMeta,
        bind_start: u32,
        pool: &BindPoolInternal,
        globals: &GlobalTable,
        ignore: &[u32],
    ) -> std::result::Result<(), usize> {
        for (i, bind) in meta.binds.iter().enumerate() {
            if ignore.contains(&bind.slot) {
                continue;
            }

            // Process-wide globals take precedence. Slots outside
            // the shifted window simply have no global.
            let gidx = bind.slot.wrapping_sub(bind.kind.shift());
            let global = match (gidx as usize) < MAX_GLOBALS {
                true => match bind.kind.is_buffer() {
                    true => globals.buffer_at(gidx).map(|b| ResolvedResource::Buf(b.vk_current())),
                    false => globals.texture_at(gidx).map(|t| ResolvedResource::Tex {
                        view: t.vk_view(),
                        sampler: t.vk_sampler(),
                        compute: t.is_compute(),
                    }),
                },
                false => None,
            };

            let resolved = match global {
                Some(r) => Some(r),
                None => match &pool.slot(bind_start + i as u32).bs_res {
                    BindResource::Buffer(b) => Some(ResolvedResource::Buf(b.vk_current())),
                    BindResource::Texture(t) => Some(ResolvedResource::Tex {
                        view: t.vk_view(),
                        sampler: t.vk_sampler(),
                        compute: t.is_compute(),
                    }),
                    BindResource::None => None,
                },
            };

            match resolved {
                Some(r) => self.add_resource(bind.slot, bind.kind, r),
                None => return Err(i),
            }
        }

        Ok(())
    }

    fn build_writes(&self, dst_set: vk::DescriptorSet) -> Vec<vk::WriteDescriptorSet> {
        self.dw_writes
            .iter()
            .map(|w| match w {
                WriteSpec::Buffer {
                    binding,
                    dtype,
                    info,
                } => vk::WriteDescriptorSet::builder()
                    .dst_set(dst_set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*dtype)
                    .buffer_info(std::slice::from_ref(&self.dw_buf_infos[*info]))
                    .build(),
                WriteSpec::Image {
                    binding,
                    dtype,
                    info,
                } => vk::WriteDescriptorSet::builder()
                    .dst_set(dst_set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*dtype)
                    .image_info(std::slice::from_ref(&self.dw_img_infos[*info]))
                    .build(),
            })
            .collect()
    }

    /// Submit the batch
    ///
    /// Push descriptors when the device has them, otherwise a
    /// one-shot set from the command slot's descriptor pool.
    pub(crate) fn push(
        &self,
        dev: &Device,
        cbuf: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipe_layout: vk::PipelineLayout,
        desc_layout: vk::DescriptorSetLayout,
    ) -> Result<()> {
        if self.dw_writes.is_empty() {
            return Ok(());
        }

        if let Some(loader) = dev.push_desc_loader.as_ref() {
            let writes = self.build_writes(vk::DescriptorSet::null());
            unsafe {
                loader.cmd_push_descriptor_set(cbuf, bind_point, pipe_layout, 0, &writes);
            }
            return Ok(());
        }

        let pool = dev.slot_desc_pool()?;
        let layouts = [desc_layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .build();
        let set = unsafe {
            dev.dev
                .allocate_descriptor_sets(&info)
                .or(Err(SleetError::OUT_OF_MEMORY))?[0]
        };

        let writes = self.build_writes(set);
        unsafe {
            dev.dev.update_descriptor_sets(&writes, &[]);
            dev.dev
                .cmd_bind_descriptor_sets(cbuf, bind_point, pipe_layout, 0, &[set], &[]);
        }

        Ok(())
    }
}

enum ResolvedResource {
    Buf(vk::Buffer),
    Tex {
        view: vk::ImageView,
        sampler: vk::Sampler,
        compute: bool,
    },
}
