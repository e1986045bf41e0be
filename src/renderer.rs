// The frame renderer
//
// This layer drives the frame loop: it opens the per-frame command
// batch, begins and ends render passes through the pipeline cache,
// resolves material bindings, walks sorted render lists into
// batched draws, and stamps each frame with GPU timestamps.
//
// Austin Shafer - 2024

use ash::vk;

use crate::bindpool::BindPool;
use crate::buffer::{BufType, BufUse, Buffer};
use crate::deletion_queue::DestroyItem;
use crate::device::Device;
use crate::display::Display;
use crate::instance::Instance;
use crate::layout::PendingTransitions;
use crate::list::RenderList;
use crate::material::{DescWriteBuilder, GlobalTable, Material};
use crate::pipeline::{PipelineCache, RenderPassKey};
use crate::texture::{StockTextures, Texture, TextureFlags};
use crate::{BindSlots, CreateInfo, Future, Rect, Result, SleetError};
use utils::log;

use std::sync::{Arc, Mutex};

/// The render pass currently being recorded
struct ActivePass {
    ap_pass_idx: u32,
    ap_cbuf: vk::CommandBuffer,
    ap_extent: vk::Extent2D,
    ap_color: Option<Texture>,
    ap_resolve: Option<Texture>,
    ap_depth: Option<Texture>,
}

/// Per-frame GPU timestamps
///
/// Two queries per flight slot. Results are read back once that
/// flight's ring has come around again.
struct GpuTimer {
    gt_pool: vk::QueryPool,
    gt_period: f32,
    gt_written: Vec<bool>,
    gt_last_ms: f32,
    gt_supported: bool,
}

pub struct Renderer {
    r_inst: Arc<Instance>,
    r_dev: Arc<Device>,
    r_pipe_cache: Arc<PipelineCache>,
    r_bind_pool: Arc<BindPool>,
    r_bind_slots: BindSlots,
    r_globals: GlobalTable,
    r_pending: Arc<Mutex<PendingTransitions>>,
    r_stock: StockTextures,
    r_display: Option<Display>,

    r_in_frame: bool,
    r_frame_num: u64,
    r_flight_idx: usize,
    r_frames_in_flight: usize,
    r_current_pass: Option<ActivePass>,
    /// The submission of the frame that last used each flight slot.
    /// frame_begin waits on its own slot's future, which is both the
    /// frames-in-flight throttle and what makes resetting that
    /// slot's timestamp queries legal.
    r_frame_futures: Vec<Option<Future>>,
    /// Interned index of the empty vertex format, used by blit
    r_blit_vfmt: u32,
    r_timer: GpuTimer,
}

impl Renderer {
    pub(crate) fn new(info: &CreateInfo) -> Result<Self> {
        let instance = Arc::new(Instance::new(info)?);
        let bind_pool = Arc::new(BindPool::new());
        let dev = Device::new(instance.clone(), bind_pool.clone(), info)?;

        // The main thread records implicitly, reserve its ring now
        dev.thread_init()?;

        let pipe_cache = PipelineCache::new(dev.clone());
        let stock = StockTextures::new(&dev)?;
        let blit_vfmt = pipe_cache.register_vertfmt(&crate::mesh::VertexFormat::empty())?;

        let display = match info.surface {
            Some(surface) => Some(Display::new(&instance, dev.clone(), surface)?),
            None => None,
        };

        let fif = info.frames_in_flight as usize;
        let timer = GpuTimer::new(&dev, fif)?;

        Ok(Self {
            r_inst: instance,
            r_dev: dev,
            r_pipe_cache: pipe_cache,
            r_bind_pool: bind_pool,
            r_bind_slots: info.bind_slots,
            r_globals: GlobalTable::new(),
            r_pending: Arc::new(Mutex::new(PendingTransitions::new())),
            r_stock: stock,
            r_display: display,
            r_in_frame: false,
            r_frame_num: 0,
            r_flight_idx: 0,
            r_frames_in_flight: fif,
            r_current_pass: None,
            r_frame_futures: (0..fif).map(|_| None).collect(),
            r_blit_vfmt: blit_vfmt,
            r_timer: timer,
        })
    }

    pub(crate) fn dev(&self) -> &Device {
        &self.r_dev
    }

    pub(crate) fn dev_arc(&self) -> Arc<Device> {
        self.r_dev.clone()
    }

    pub(crate) fn pipe_cache(&self) -> Arc<PipelineCache> {
        self.r_pipe_cache.clone()
    }

    pub(crate) fn bind_pool(&self) -> Arc<BindPool> {
        self.r_bind_pool.clone()
    }

    pub(crate) fn pending(&self) -> Arc<Mutex<PendingTransitions>> {
        self.r_pending.clone()
    }

    pub(crate) fn stock_textures(&self) -> &StockTextures {
        &self.r_stock
    }

    pub(crate) fn globals(&self) -> &GlobalTable {
        &self.r_globals
    }

    pub(crate) fn bind_slots(&self) -> BindSlots {
        self.r_bind_slots
    }

    // ------------------------------------------------------------------
    // frame loop
    // ------------------------------------------------------------------

    /// Open the frame's command batch
    ///
    /// Blocks until the frame that last used this flight slot has
    /// retired, then collects its timestamps and resets them for
    /// this frame.
    pub(crate) fn frame_begin(&mut self) -> Result<()> {
        if self.r_in_frame {
            log::error!("frame_begin called twice without frame_end");
            return Err(SleetError::INVALID_PARAMETER);
        }

        if let Some(future) = self.r_frame_futures[self.r_flight_idx].take() {
            future.wait();
        }
        self.r_timer.collect(&self.r_dev, self.r_flight_idx);

        let cbuf = self.r_dev.cmd_acquire()?;
        self.r_timer.frame_start(&self.r_dev, cbuf, self.r_flight_idx);
        self.r_in_frame = true;

        Ok(())
    }

    /// Close and submit the frame
    ///
    /// When a surface is attached its wait/signal semaphores ride
    /// the submission and the acquired image is moved to PRESENT_SRC
    /// first. Advances the flight index and reads back the finished
    /// flight's timestamps.
    pub(crate) fn frame_end(&mut self) -> Result<()> {
        if !self.r_in_frame {
            log::error!("frame_end called outside a frame");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if self.r_current_pass.is_some() {
            log::error!("frame_end called with a render pass still active");
            return Err(SleetError::INVALID_PARAMETER);
        }
        self.r_in_frame = false;

        let cbuf = self.r_dev.cmd_acquire()?;

        // Presentable images have to leave the color-attachment
        // layout before the flip
        let presenting = match self.r_display.as_ref() {
            Some(d) => d.current_tex(),
            None => None,
        };
        if let Some(tex) = presenting.as_ref() {
            let mut internal = tex.t_internal.write().unwrap();
            self.r_dev.transition_image(
                &mut internal,
                cbuf,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            );
        }

        self.r_timer.frame_end(&self.r_dev, cbuf, self.r_flight_idx);

        // Balance frame_begin's acquire
        self.r_dev.cmd_release()?;

        let future = match (self.r_display.as_ref(), presenting.is_some()) {
            (Some(d), true) => {
                let wait = [d.d_present_sema];
                let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
                let signal = [d.d_render_sema];
                self.r_dev.cmd_end_submit(&wait, &stages, &signal)?
            }
            _ => self.r_dev.cmd_end_submit(&[], &[], &[])?,
        };
        self.r_frame_futures[self.r_flight_idx] = Some(future);

        self.r_frame_num += 1;
        self.r_flight_idx = (self.r_frame_num % self.r_frames_in_flight as u64) as usize;

        // Best effort readback for the flight about to be reused,
        // frame_begin picks it up if the GPU is still behind
        self.r_timer.collect(&self.r_dev, self.r_flight_idx);

        Ok(())
    }

    // ------------------------------------------------------------------
    // render passes
    // ------------------------------------------------------------------

    /// Begin a render pass over the given attachments
    ///
    /// Flushes the deferred transition queue first, then interns the
    /// pass format and begins it against a framebuffer cached on the
    /// color (or depth) texture.
    pub(crate) fn begin_pass(
        &mut self,
        color: Option<&Texture>,
        depth: Option<&Texture>,
        resolve: Option<&Texture>,
        clear_color: Option<[f32; 4]>,
        clear_depth: Option<f32>,
        clear_stencil: Option<u32>,
    ) -> Result<()> {
        if self.r_current_pass.is_some() {
            log::error!("begin_pass called inside an active pass");
            return Err(SleetError::INVALID_PARAMETER);
        }
        let fb_owner = match color.or(depth) {
            Some(t) => t,
            None => {
                log::error!("begin_pass needs at least one attachment");
                return Err(SleetError::INVALID_PARAMETER);
            }
        };

        let cbuf = self.r_dev.cmd_acquire()?;

        // Barriers are illegal once the pass begins, emit everything
        // that was parked since the last one
        self.r_pending.lock().unwrap().flush(&self.r_dev, cbuf);

        // Each lock is taken and dropped in turn, a texture may well
        // serve as more than one of these arguments
        let fmt_of = |t: Option<&Texture>| {
            t.map(|t| t.t_internal.read().unwrap().t_vkfmt)
                .unwrap_or(vk::Format::UNDEFINED)
        };
        let extent = {
            let owner = fb_owner.t_internal.read().unwrap();
            vk::Extent2D {
                width: owner.t_size.0,
                height: owner.t_size.1,
            }
        };
        let samples = color
            .or(depth)
            .map(|t| t.t_internal.read().unwrap().t_samples)
            .unwrap_or(1);
        let depth_store = depth
            .map(|t| {
                let d = t.t_internal.read().unwrap();
                d.t_flags.contains(TextureFlags::READABLE) && !d.t_transient
            })
            .unwrap_or(false);

        let key = RenderPassKey {
            rp_color_fmt: fmt_of(color),
            rp_depth_fmt: fmt_of(depth),
            rp_resolve_fmt: fmt_of(resolve),
            rp_samples: match samples {
                2 => vk::SampleCountFlags::TYPE_2,
                4 => vk::SampleCountFlags::TYPE_4,
                8 => vk::SampleCountFlags::TYPE_8,
                _ => vk::SampleCountFlags::TYPE_1,
            },
            rp_depth_store: depth_store,
            rp_color_clear: clear_color.is_some(),
        };

        let pass_idx = self.r_pipe_cache.register_renderpass(key)?;
        let (render_pass, epoch, _) = self
            .r_pipe_cache
            .pass_info(pass_idx)
            .ok_or(SleetError::INVALID)?;

        // Attachment order is (color, resolve, depth)
        let mut views = Vec::new();
        if let Some(t) = color {
            views.push(t.vk_view());
        }
        if let Some(t) = resolve {
            views.push(t.vk_view());
        }
        if let Some(t) = depth {
            views.push(t.vk_view());
        }
        let fb = fb_owner.get_framebuffer(pass_idx, epoch, render_pass, &views, extent)?;

        // A loaded (non-cleared) color target must already be in the
        // attachment layout when the pass begins
        if clear_color.is_none() {
            if let Some(t) = color {
                let mut internal = t.t_internal.write().unwrap();
                self.r_dev.transition_image(
                    &mut internal,
                    cbuf,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                );
            }
        }

        // One clear value per attachment, in attachment order
        let mut clears = Vec::new();
        if color.is_some() {
            clears.push(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color.unwrap_or([0.0; 4]),
                },
            });
        }
        if resolve.is_some() {
            clears.push(vk::ClearValue {
                color: vk::ClearColorValue { float32: [0.0; 4] },
            });
        }
        if depth.is_some() {
            clears.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: clear_depth.unwrap_or(1.0),
                    stencil: clear_stencil.unwrap_or(0),
                },
            });
        }

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(fb)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: extent,
            })
            .clear_values(&clears);

        unsafe {
            self.r_dev
                .dev
                .cmd_begin_render_pass(cbuf, &begin_info, vk::SubpassContents::INLINE);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: extent,
            };
            self.r_dev.dev.cmd_set_viewport(cbuf, 0, &[viewport]);
            self.r_dev.dev.cmd_set_scissor(cbuf, 0, &[scissor]);
        }

        // The pass itself performed an implicit transition, teach
        // the tracker about the new layouts
        for (tex, layout) in [
            (color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            (resolve, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            (depth, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ] {
            if let Some(t) = tex {
                let mut internal = t.t_internal.write().unwrap();
                if !internal.t_transient {
                    internal.t_layout = layout;
                }
                internal.t_first_use = false;
            }
        }

        self.r_current_pass = Some(ActivePass {
            ap_pass_idx: pass_idx,
            ap_cbuf: cbuf,
            ap_extent: extent,
            ap_color: color.cloned(),
            ap_resolve: resolve.cloned(),
            ap_depth: depth.cloned(),
        });

        Ok(())
    }

    /// End the active pass
    ///
    /// Readable attachments are moved to SHADER_READ_ONLY so the
    /// next pass can sample them without thinking about it.
    pub(crate) fn end_pass(&mut self) -> Result<()> {
        let pass = match self.r_current_pass.take() {
            Some(p) => p,
            None => {
                log::error!("end_pass called without an active pass");
                return Err(SleetError::INVALID_PARAMETER);
            }
        };

        unsafe {
            self.r_dev.dev.cmd_end_render_pass(pass.ap_cbuf);
        }

        for tex in [&pass.ap_color, &pass.ap_resolve, &pass.ap_depth] {
            if let Some(t) = tex {
                let readable = {
                    let internal = t.t_internal.read().unwrap();
                    internal.t_flags.contains(TextureFlags::READABLE) && !internal.t_transient
                };
                if readable {
                    let mut internal = t.t_internal.write().unwrap();
                    self.r_dev.transition_for_shader_read(
                        &mut internal,
                        pass.ap_cbuf,
                        vk::PipelineStageFlags::VERTEX_SHADER
                            | vk::PipelineStageFlags::FRAGMENT_SHADER,
                    );
                }
            }
        }

        // Balance begin_pass's acquire
        self.r_dev.cmd_release()?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // drawing
    // ------------------------------------------------------------------

    /// Record a render list into the active pass
    ///
    /// Sorts the list, uploads its system and instance data, then
    /// walks the items batching consecutive compatible runs into
    /// single instanced draws.
    pub(crate) fn draw(
        &mut self,
        list: &mut RenderList,
        system_data: &[u8],
        instance_multiplier: u32,
    ) -> Result<()> {
        let (cbuf, pass_idx) = match self.r_current_pass.as_ref() {
            Some(p) => (p.ap_cbuf, p.ap_pass_idx),
            None => {
                log::error!("draw called outside a render pass");
                return Err(SleetError::INVALID_PARAMETER);
            }
        };
        if instance_multiplier == 0 {
            log::error!("instance_multiplier may not be zero");
            return Err(SleetError::INVALID_PARAMETER);
        }

        // Per-draw system data rides a list-owned dynamic buffer
        // bound at the reserved system slot
        if !system_data.is_empty() {
            Self::ensure_list_buffer(
                &self.r_dev,
                &mut list.l_sysbuf,
                system_data.len(),
                BufType::Constant,
            )?;
            let buf = list.l_sysbuf.as_ref().unwrap();
            buf.set(system_data)?;
            self.r_globals
                .set_buffer(self.r_bind_slots.system_slot, Some(buf.clone()))?;
        }

        list.sort();

        // Same deal for the sorted instance payloads, at the
        // reserved instance slot
        if !list.l_inst_data.is_empty() {
            Self::ensure_list_buffer(
                &self.r_dev,
                &mut list.l_instbuf,
                list.l_inst_data.len(),
                BufType::Storage,
            )?;
            let buf = list.l_instbuf.as_ref().unwrap();
            buf.set(&list.l_inst_data)?;
            self.r_globals
                .set_buffer(self.r_bind_slots.instance_slot, Some(buf.clone()))?;
        }

        let mut bound_pipeline = vk::Pipeline::null();
        let mut i = 0;
        while i < list.l_items.len() {
            // Fold consecutive compatible items into one batch
            let mut batch_end = i + 1;
            let mut total_instances = list.l_items[i].ri_inst_count;
            while batch_end < list.l_items.len()
                && list.l_items[i].batches_with(&list.l_items[batch_end])
            {
                total_instances += list.l_items[batch_end].ri_inst_count;
                batch_end += 1;
            }

            let item = &list.l_items[i];

            let pipeline = match self
                .r_pipe_cache
                .pipeline_get(item.ri_mat_idx, pass_idx, item.ri_vfmt_idx)
            {
                Some(p) => p,
                None => {
                    log::error!(
                        "No pipeline for material {} in this pass, skipping draw",
                        item.ri_mat_idx
                    );
                    i = batch_end;
                    continue;
                }
            };
            let (desc_layout, pipe_layout) = match self
                .r_pipe_cache
                .material_layouts(item.ri_mat_idx)
            {
                Some(l) => l,
                None => {
                    i = batch_end;
                    continue;
                }
            };

            if pipeline != bound_pipeline {
                unsafe {
                    self.r_dev.dev.cmd_bind_pipeline(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline,
                    );
                }
                bound_pipeline = pipeline;
            }

            // The material's $Global snapshot goes through the frame
            // bump allocator, everything else resolves through the
            // bind pool and the global tables
            let mut builder = DescWriteBuilder::new();
            let ignore = [self.r_bind_slots.material_slot];
            if item.ri_mat_size > 0 {
                let data = &list.l_mat_data[item.ri_mat_offset..item.ri_mat_offset + item.ri_mat_size];
                let (bump_buf, offset) = self.r_dev.bump_alloc_const(data)?;
                builder.add_buffer(
                    self.r_bind_slots.material_slot,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    bump_buf,
                    offset,
                    item.ri_mat_size as u64,
                );
            }

            let resolved = {
                let pool = self.r_bind_pool.lock();
                builder.add_shader_binds(
                    &item.ri_meta,
                    item.ri_bind_start,
                    &pool,
                    &self.r_globals,
                    &ignore,
                )
            };
            if let Err(missing) = resolved {
                log::critical!(
                    "missing binding '{}' in shader, skipping draw",
                    item.ri_meta.binds[missing].name
                );
                i = batch_end;
                continue;
            }

            builder.push(
                &self.r_dev,
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                pipe_layout,
                desc_layout,
            )?;

            let first_instance = match item.ri_inst_stride {
                0 => 0,
                stride => (item.ri_inst_offset / stride as usize) as u32,
            };

            unsafe {
                if item.ri_vbuf != vk::Buffer::null() {
                    self.r_dev
                        .dev
                        .cmd_bind_vertex_buffers(cbuf, 0, &[item.ri_vbuf], &[0]);
                }

                if item.ri_ibuf != vk::Buffer::null() && item.ri_index_count > 0 {
                    self.r_dev.dev.cmd_bind_index_buffer(
                        cbuf,
                        item.ri_ibuf,
                        0,
                        item.ri_index_type,
                    );
                    self.r_dev.dev.cmd_draw_indexed(
                        cbuf,
                        item.ri_index_count,
                        total_instances * instance_multiplier,
                        item.ri_first_index,
                        item.ri_vertex_offset,
                        first_instance,
                    );
                } else {
                    self.r_dev.dev.cmd_draw(
                        cbuf,
                        item.ri_vert_count,
                        total_instances * instance_multiplier,
                        0,
                        first_instance,
                    );
                }
            }

            i = batch_end;
        }

        Ok(())
    }

    /// Make sure a list-owned dynamic buffer can hold `size` bytes
    fn ensure_list_buffer(
        dev: &Arc<Device>,
        slot: &mut Option<Buffer>,
        size: usize,
        btype: BufType,
    ) -> Result<()> {
        let needs_new = match slot.as_ref() {
            Some(buf) => (buf.size() as usize) < size,
            None => true,
        };
        if needs_new {
            if let Some(old) = slot.take() {
                old.destroy();
            }
            *slot = Some(Buffer::new(
                dev.clone(),
                None,
                size,
                1,
                btype,
                BufUse::DYNAMIC,
            )?);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // blit
    // ------------------------------------------------------------------

    /// Render a fullscreen triangle into `target` with `mat`
    ///
    /// Cubemaps and array textures get one pass per layer through
    /// per-layer views and framebuffers, all of which ride the
    /// command slot's destroy list.
    pub(crate) fn blit(
        &mut self,
        mat: &Material,
        target: &Texture,
        bounds: Option<Rect<i32>>,
    ) -> Result<()> {
        if self.r_current_pass.is_some() {
            log::error!("blit may not be called inside a render pass");
            return Err(SleetError::INVALID_PARAMETER);
        }

        let (mat_idx, bind_start, shader) = {
            let mt = mat.mt_internal.read().unwrap();
            (mt.mt_pipe_idx, mt.mt_bind_start, mt.mt_shader.clone())
        };

        let (extent, layers, vkfmt, samples) = {
            let t = target.t_internal.read().unwrap();
            if !t.t_flags.contains(TextureFlags::WRITEABLE) || t.t_format.has_depth() {
                log::error!("blit target must be a writeable color texture");
                return Err(SleetError::INVALID_PARAMETER);
            }
            (
                vk::Extent2D {
                    width: t.t_size.0,
                    height: t.t_size.1,
                },
                t.t_layers,
                t.t_vkfmt,
                t.t_samples,
            )
        };

        let key = RenderPassKey {
            rp_color_fmt: vkfmt,
            rp_depth_fmt: vk::Format::UNDEFINED,
            rp_resolve_fmt: vk::Format::UNDEFINED,
            rp_samples: match samples {
                2 => vk::SampleCountFlags::TYPE_2,
                4 => vk::SampleCountFlags::TYPE_4,
                8 => vk::SampleCountFlags::TYPE_8,
                _ => vk::SampleCountFlags::TYPE_1,
            },
            rp_depth_store: false,
            rp_color_clear: true,
        };
        let pass_idx = self.r_pipe_cache.register_renderpass(key)?;
        let (render_pass, epoch, _) = self
            .r_pipe_cache
            .pass_info(pass_idx)
            .ok_or(SleetError::INVALID)?;

        let pipeline = match self
            .r_pipe_cache
            .pipeline_get(mat_idx, pass_idx, self.r_blit_vfmt)
        {
            Some(p) => p,
            None => {
                log::error!("No pipeline for blit material");
                return Err(SleetError::INVALID);
            }
        };
        let (desc_layout, pipe_layout) = self
            .r_pipe_cache
            .material_layouts(mat_idx)
            .ok_or(SleetError::INVALID)?;

        let cbuf = self.r_dev.cmd_acquire()?;
        self.r_pending.lock().unwrap().flush(&self.r_dev, cbuf);

        let (vx, vy, vw, vh) = match bounds {
            Some(r) => (
                r.r_pos.0 as f32,
                r.r_pos.1 as f32,
                r.r_size.0 as f32,
                r.r_size.1 as f32,
            ),
            None => (0.0, 0.0, extent.width as f32, extent.height as f32),
        };

        for layer in 0..layers {
            // Layer zero of a plain 2D target can use the cached
            // framebuffer, array layers get one-shot views
            let fb = match layers {
                1 => target.get_framebuffer(
                    pass_idx,
                    epoch,
                    render_pass,
                    &[target.vk_view()],
                    extent,
                )?,
                _ => {
                    let view = target.create_layer_view(layer)?;
                    let views = [view];
                    let info = vk::FramebufferCreateInfo::builder()
                        .render_pass(render_pass)
                        .attachments(&views)
                        .width(extent.width)
                        .height(extent.height)
                        .layers(1);
                    let fb = unsafe {
                        self.r_dev
                            .dev
                            .create_framebuffer(&info, None)
                            .or(Err(SleetError::DEVICE_ERROR))?
                    };
                    self.r_dev.defer_destroy(DestroyItem::ImageView(view))?;
                    self.r_dev.defer_destroy(DestroyItem::Framebuffer(fb))?;
                    fb
                }
            };

            let clears = [vk::ClearValue {
                color: vk::ClearColorValue { float32: [0.0; 4] },
            }];
            let begin_info = vk::RenderPassBeginInfo::builder()
                .render_pass(render_pass)
                .framebuffer(fb)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: extent,
                })
                .clear_values(&clears);

            // The material's current parameters, at this layer's own
            // offset in the frame bump buffer
            let mut builder = DescWriteBuilder::new();
            let params = mat.params_snapshot();
            if !params.is_empty() {
                let (bump_buf, offset) = self.r_dev.bump_alloc_const(&params)?;
                builder.add_buffer(
                    self.r_bind_slots.material_slot,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    bump_buf,
                    offset,
                    params.len() as u64,
                );
            }
            let resolved = {
                let pool = self.r_bind_pool.lock();
                builder.add_shader_binds(
                    shader.meta(),
                    bind_start,
                    &pool,
                    &self.r_globals,
                    &[self.r_bind_slots.material_slot],
                )
            };
            if let Err(missing) = resolved {
                log::critical!(
                    "missing binding '{}' in shader, skipping blit",
                    shader.meta().binds[missing].name
                );
                self.r_dev.cmd_release()?;
                return Ok(());
            }

            unsafe {
                self.r_dev
                    .dev
                    .cmd_begin_render_pass(cbuf, &begin_info, vk::SubpassContents::INLINE);

                let viewport = vk::Viewport {
                    x: vx,
                    y: vy,
                    width: vw,
                    height: vh,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: extent,
                };
                self.r_dev.dev.cmd_set_viewport(cbuf, 0, &[viewport]);
                self.r_dev.dev.cmd_set_scissor(cbuf, 0, &[scissor]);

                self.r_dev
                    .dev
                    .cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);

                builder.push(
                    &self.r_dev,
                    cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipe_layout,
                    desc_layout,
                )?;

                // Three vertices, positions derived from the vertex id
                self.r_dev.dev.cmd_draw(cbuf, 3, 1, 0, 0);
                self.r_dev.dev.cmd_end_render_pass(cbuf);
            }
        }

        // Track the layout change the passes performed, and hand the
        // result to samplers if the target is readable
        {
            let mut internal = target.t_internal.write().unwrap();
            if !internal.t_transient {
                internal.t_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
            }
            if internal.t_flags.contains(TextureFlags::READABLE) && !internal.t_transient {
                self.r_dev.transition_for_shader_read(
                    &mut internal,
                    cbuf,
                    vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                );
            }
        }

        self.r_dev.cmd_release()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // globals and timing
    // ------------------------------------------------------------------

    pub(crate) fn set_global_constants(&mut self, slot: u32, buf: Option<&Buffer>) -> Result<()> {
        self.r_globals.set_buffer(slot, buf.cloned())
    }

    /// Bind a process-wide texture
    ///
    /// The layout transition is parked on the deferred queue and
    /// emitted by the next begin_pass.
    pub(crate) fn set_global_texture(&mut self, slot: u32, tex: Option<&Texture>) -> Result<()> {
        self.r_globals.set_texture(slot, tex.cloned())?;

        if let Some(t) = tex {
            let kind = match t.is_compute() {
                true => crate::layout::PendingKind::Storage,
                false => crate::layout::PendingKind::ShaderRead,
            };
            self.r_pending.lock().unwrap().push(t, kind);
        }

        Ok(())
    }

    pub(crate) fn get_gpu_time_ms(&self) -> f32 {
        self.r_timer.gt_last_ms
    }

    // ------------------------------------------------------------------
    // surface
    // ------------------------------------------------------------------

    pub(crate) fn surface_next_tex(&mut self) -> Result<Texture> {
        match self.r_display.as_mut() {
            Some(d) => d.next_tex(),
            None => {
                log::error!("No surface was provided at init");
                return Err(SleetError::INVALID_PARAMETER);
            }
        }
    }

    pub(crate) fn surface_resize(&mut self) -> Result<()> {
        match self.r_display.as_mut() {
            Some(d) => d.resize(),
            None => Err(SleetError::INVALID_PARAMETER),
        }
    }

    pub(crate) fn surface_present(&mut self) -> Result<()> {
        match self.r_display.as_mut() {
            Some(d) => d.present(),
            None => Err(SleetError::INVALID_PARAMETER),
        }
    }
}

impl GpuTimer {
    fn new(dev: &Arc<Device>, frames_in_flight: usize) -> Result<Self> {
        let supported = dev.dev_features.vkc_supports_timestamps;
        let pool = match supported {
            true => {
                let info = vk::QueryPoolCreateInfo::builder()
                    .query_type(vk::QueryType::TIMESTAMP)
                    .query_count(2 * frames_in_flight as u32)
                    .build();
                unsafe {
                    dev.dev
                        .create_query_pool(&info, None)
                        .or(Err(SleetError::DEVICE_ERROR))?
                }
            }
            false => vk::QueryPool::null(),
        };

        Ok(Self {
            gt_pool: pool,
            gt_period: dev.dev_features.vkc_timestamp_period,
            gt_written: vec![false; frames_in_flight],
            gt_last_ms: 0.0,
            gt_supported: supported,
        })
    }

    fn frame_start(&mut self, dev: &Device, cbuf: vk::CommandBuffer, flight: usize) {
        if !self.gt_supported {
            return;
        }
        unsafe {
            dev.dev
                .cmd_reset_query_pool(cbuf, self.gt_pool, flight as u32 * 2, 2);
            dev.dev.cmd_write_timestamp(
                cbuf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.gt_pool,
                flight as u32 * 2,
            );
        }
    }

    fn frame_end(&mut self, dev: &Device, cbuf: vk::CommandBuffer, flight: usize) {
        if !self.gt_supported {
            return;
        }
        unsafe {
            dev.dev.cmd_write_timestamp(
                cbuf,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.gt_pool,
                flight as u32 * 2 + 1,
            );
        }
        self.gt_written[flight] = true;
    }

    /// Read back the timestamp pair of a retired flight
    fn collect(&mut self, dev: &Device, flight: usize) {
        if !self.gt_supported || !self.gt_written[flight] {
            return;
        }

        let mut results = [0u64; 2];
        let res = unsafe {
            dev.dev.get_query_pool_results(
                self.gt_pool,
                flight as u32 * 2,
                2,
                &mut results,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        if res.is_ok() {
            let delta = results[1].saturating_sub(results[0]);
            self.gt_last_ms = (delta as f64 * self.gt_period as f64 / 1_000_000.0) as f32;
            self.gt_written[flight] = false;
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Everything in flight has to retire before the caches and
        // pools underneath it go away
        self.r_dev.wait_idle();
        self.r_dev.drain_all_destroy_lists();

        if self.r_timer.gt_pool != vk::QueryPool::null() {
            unsafe {
                self.r_dev.dev.destroy_query_pool(self.r_timer.gt_pool, None);
            }
        }
    }
}
