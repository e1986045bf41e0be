// Textures
//
// A texture owns its image, memory and default view, references an
// interned sampler, and carries the layout tracking state the
// barrier machinery feeds on. Color targets also cache their
// framebuffers here, keyed by render pass index and pipeline cache
// epoch.
//
// Austin Shafer - 2024

use ash::vk;

use crate::deletion_queue::DestroyItem;
use crate::device::Device;
use crate::{Result, SleetError};
use utils::log;

use std::sync::{Arc, RwLock};

/// Texture formats supported by the library
///
/// Format enum mappings are deliberately small, this covers the
/// formats the renderer itself needs. Unknown combinations report
/// UNSUPPORTED at creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    Rgba8Srgb,
    Rgba8Unorm,
    Bgra8Srgb,
    Bgra8Unorm,
    R8Unorm,
    Rg8Unorm,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
    Depth24Stencil8,
}

impl Format {
    pub(crate) fn vk_format(&self) -> vk::Format {
        match self {
            Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::R8Unorm => vk::Format::R8_UNORM,
            Format::Rg8Unorm => vk::Format::R8G8_UNORM,
            Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Format::Depth32Float => vk::Format::D32_SFLOAT,
            Format::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
        }
    }

    pub(crate) fn from_vk(fmt: vk::Format) -> Option<Format> {
        match fmt {
            vk::Format::R8G8B8A8_SRGB => Some(Format::Rgba8Srgb),
            vk::Format::R8G8B8A8_UNORM => Some(Format::Rgba8Unorm),
            vk::Format::B8G8R8A8_SRGB => Some(Format::Bgra8Srgb),
            vk::Format::B8G8R8A8_UNORM => Some(Format::Bgra8Unorm),
            vk::Format::R8_UNORM => Some(Format::R8Unorm),
            vk::Format::R8G8_UNORM => Some(Format::Rg8Unorm),
            vk::Format::R16G16B16A16_SFLOAT => Some(Format::Rgba16Float),
            vk::Format::R32G32B32A32_SFLOAT => Some(Format::Rgba32Float),
            vk::Format::D32_SFLOAT => Some(Format::Depth32Float),
            vk::Format::D24_UNORM_S8_UINT => Some(Format::Depth24Stencil8),
            _ => None,
        }
    }

    pub fn has_depth(&self) -> bool {
        match self {
            Format::Depth32Float | Format::Depth24Stencil8 => true,
            _ => false,
        }
    }

    pub fn has_stencil(&self) -> bool {
        match self {
            Format::Depth24Stencil8 => true,
            _ => false,
        }
    }

    pub(crate) fn bytes_per_pixel(&self) -> usize {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm => 2,
            Format::Rgba8Srgb | Format::Rgba8Unorm | Format::Bgra8Srgb | Format::Bgra8Unorm => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
            Format::Depth32Float => 4,
            Format::Depth24Stencil8 => 4,
        }
    }

    pub(crate) fn aspect(&self) -> vk::ImageAspectFlags {
        let mut aspect = vk::ImageAspectFlags::empty();
        if self.has_depth() {
            aspect |= vk::ImageAspectFlags::DEPTH;
            if self.has_stencil() {
                aspect |= vk::ImageAspectFlags::STENCIL;
            }
        } else {
            aspect |= vk::ImageAspectFlags::COLOR;
        }
        aspect
    }
}

bitflags::bitflags! {
    pub struct TextureFlags: u32 {
        /// Can be rendered or computed into
        const WRITEABLE = 1;
        /// Can be sampled from a shader
        const READABLE = 2;
        /// Is a storage image for compute, sampled in GENERAL
        const COMPUTE = 4;
        /// Reserve and fill a full mip chain
        const GEN_MIPS = 8;
        /// Six layer cube texture
        const CUBEMAP = 16;
        /// Volume texture
        const TEX3D = 32;
    }
}

/// Sampler parameters, interned by the Device's sampler cache
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SamplerInfo {
    pub linear_filter: bool,
    pub linear_mips: bool,
    pub clamp_to_edge: bool,
    pub anisotropy: u32,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            linear_filter: true,
            linear_mips: true,
            clamp_to_edge: false,
            anisotropy: 1,
        }
    }
}

impl SamplerInfo {
    pub(crate) fn filter(&self) -> vk::Filter {
        match self.linear_filter {
            true => vk::Filter::LINEAR,
            false => vk::Filter::NEAREST,
        }
    }

    pub(crate) fn mip_mode(&self) -> vk::SamplerMipmapMode {
        match self.linear_mips {
            true => vk::SamplerMipmapMode::LINEAR,
            false => vk::SamplerMipmapMode::NEAREST,
        }
    }

    pub(crate) fn address_mode(&self) -> vk::SamplerAddressMode {
        match self.clamp_to_edge {
            true => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            false => vk::SamplerAddressMode::REPEAT,
        }
    }
}

/// Texture creation parameters
#[derive(Debug, Copy, Clone)]
pub struct TextureInfo {
    pub size: (u32, u32, u32),
    pub format: Format,
    pub flags: TextureFlags,
    pub sample_count: u32,
    /// 0 or 1 means a single level, unless GEN_MIPS is set in which
    /// case the full chain is reserved.
    pub mip_count: u32,
    pub sampler: SamplerInfo,
}

impl Default for TextureInfo {
    fn default() -> Self {
        Self {
            size: (1, 1, 1),
            format: Format::Rgba8Srgb,
            flags: TextureFlags::READABLE,
            sample_count: 1,
            mip_count: 1,
            sampler: SamplerInfo::default(),
        }
    }
}

/// A cached framebuffer for one (render pass, attachment set)
struct FbEntry {
    fe_pass_idx: u32,
    /// Pipeline cache epoch the render pass was registered at. A
    /// stale epoch means the pass index may have been reused and the
    /// framebuffer must be rebuilt.
    fe_epoch: u64,
    fe_views: Vec<vk::ImageView>,
    fe_fb: vk::Framebuffer,
}

pub(crate) struct TextureInternal {
    pub(crate) t_dev: Arc<Device>,
    pub(crate) t_image: vk::Image,
    pub(crate) t_view: vk::ImageView,
    t_mem: vk::DeviceMemory,
    pub(crate) t_sampler: vk::Sampler,
    t_sampler_info: SamplerInfo,

    pub(crate) t_size: (u32, u32, u32),
    pub(crate) t_format: Format,
    pub(crate) t_vkfmt: vk::Format,
    pub(crate) t_flags: TextureFlags,
    pub(crate) t_samples: u32,
    pub(crate) t_mips: u32,
    pub(crate) t_layers: u32,
    pub(crate) t_aspect: vk::ImageAspectFlags,

    /// layout tracking state
    pub(crate) t_layout: vk::ImageLayout,
    pub(crate) t_queue_family: u32,
    pub(crate) t_first_use: bool,
    pub(crate) t_transient: bool,

    t_fbs: Vec<FbEntry>,
    /// Swapchain images are owned by the swapchain, we only own the
    /// view.
    t_swapchain_image: bool,
    pub(crate) t_destroyed: bool,
}

/// A GPU texture handle
#[derive(Clone)]
pub struct Texture {
    pub(crate) t_internal: Arc<RwLock<TextureInternal>>,
}

fn samples_to_vk(samples: u32) -> Result<vk::SampleCountFlags> {
    match samples {
        0 | 1 => Ok(vk::SampleCountFlags::TYPE_1),
        2 => Ok(vk::SampleCountFlags::TYPE_2),
        4 => Ok(vk::SampleCountFlags::TYPE_4),
        8 => Ok(vk::SampleCountFlags::TYPE_8),
        _ => Err(SleetError::UNSUPPORTED),
    }
}

pub(crate) fn full_mip_chain(size: (u32, u32, u32)) -> u32 {
    let max_dim = size.0.max(size.1).max(1);
    32 - max_dim.leading_zeros()
}

impl Texture {
    /// Create a new texture, optionally filled with `data`
    ///
    /// The initial data covers mip zero. It is copied in through a
    /// staging buffer recorded on the calling thread's command slot
    /// and the image is left in SHADER_READ_ONLY.
    pub(crate) fn new(dev: Arc<Device>, info: &TextureInfo, data: Option<&[u8]>) -> Result<Texture> {
        if info.size.0 == 0 || info.size.1 == 0 || info.size.2 == 0 {
            log::error!("Texture dimensions may not be zero");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if info.flags.contains(TextureFlags::CUBEMAP | TextureFlags::TEX3D) {
            log::error!("A texture can not be both a cubemap and 3D");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if !info.flags.contains(TextureFlags::TEX3D) && info.size.2 != 1 {
            log::error!("Only 3D textures may have a depth greater than one");
            return Err(SleetError::INVALID_PARAMETER);
        }

        let format = info.format;
        let vkfmt = format.vk_format();
        let aspect = format.aspect();
        let is_depth = format.has_depth();
        let samples = samples_to_vk(info.sample_count)?;

        let layers = match info.flags.contains(TextureFlags::CUBEMAP) {
            true => 6,
            false => 1,
        };
        let mips = match info.flags.contains(TextureFlags::GEN_MIPS) {
            true => full_mip_chain(info.size).max(info.mip_count),
            false => info.mip_count.max(1),
        };

        // Writeable but never readable MSAA color and depth targets
        // keep no contents between passes. On tiled GPUs they never
        // have to leave tile memory.
        let is_transient = info.flags.contains(TextureFlags::WRITEABLE)
            && !info.flags.contains(TextureFlags::READABLE)
            && ((info.sample_count > 1 && !is_depth) || is_depth);

        let mut usage = vk::ImageUsageFlags::empty();
        if info.flags.contains(TextureFlags::WRITEABLE) {
            usage |= match is_depth {
                true => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                false => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            };
        }
        if info.flags.contains(TextureFlags::COMPUTE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        if is_transient {
            usage |= vk::ImageUsageFlags::TRANSIENT_ATTACHMENT;
        } else {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
            if info.flags.contains(TextureFlags::READABLE) {
                usage |= vk::ImageUsageFlags::SAMPLED;
            }
            if info.flags.contains(TextureFlags::GEN_MIPS) {
                usage |= vk::ImageUsageFlags::TRANSFER_SRC;
            }
        }

        let mem_flags = match is_transient && dev.dev_features.vkc_supports_lazy_memory {
            true => vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
            false => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };

        let create_flags = match info.flags.contains(TextureFlags::CUBEMAP) {
            true => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            false => vk::ImageCreateFlags::empty(),
        };

        let (image, mem) = dev.create_image(
            vk::Extent3D {
                width: info.size.0,
                height: info.size.1,
                depth: info.size.2,
            },
            vkfmt,
            usage,
            mem_flags,
            mips,
            layers,
            samples,
            create_flags,
            info.flags.contains(TextureFlags::TEX3D),
        )?;

        let view_type = if info.flags.contains(TextureFlags::CUBEMAP) {
            vk::ImageViewType::CUBE
        } else if info.flags.contains(TextureFlags::TEX3D) {
            vk::ImageViewType::TYPE_3D
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .level_count(mips)
                    .layer_count(layers)
                    .build(),
            )
            .image(image)
            .format(vkfmt)
            .view_type(view_type);

        let view = match unsafe { dev.dev.create_image_view(&view_info, None) } {
            Ok(v) => v,
            Err(e) => {
                log::error!("vkCreateImageView failed: {:?}", e);
                unsafe {
                    dev.dev.destroy_image(image, None);
                    dev.dev.free_memory(mem, None);
                }
                return Err(SleetError::DEVICE_ERROR);
            }
        };

        let sampler = dev.get_sampler(&info.sampler)?;

        let ret = Texture {
            t_internal: Arc::new(RwLock::new(TextureInternal {
                t_dev: dev.clone(),
                t_image: image,
                t_view: view,
                t_mem: mem,
                t_sampler: sampler,
                t_sampler_info: info.sampler,
                t_size: info.size,
                t_format: format,
                t_vkfmt: vkfmt,
                t_flags: info.flags,
                t_samples: info.sample_count.max(1),
                t_mips: mips,
                t_layers: layers,
                t_aspect: aspect,
                t_layout: vk::ImageLayout::UNDEFINED,
                t_queue_family: dev.graphics_queue.q_family,
                t_first_use: true,
                t_transient: is_transient,
                t_fbs: Vec::new(),
                t_swapchain_image: false,
                t_destroyed: false,
            })),
        };

        if let Some(data) = data {
            if is_transient {
                log::error!("Transient discard textures can not take initial data");
                return Err(SleetError::INVALID_PARAMETER);
            }
            ret.upload(data)?;
        }

        Ok(ret)
    }

    /// Wrap a swapchain image
    ///
    /// The image itself belongs to the swapchain, destroy only takes
    /// down the view.
    pub(crate) fn new_from_swapchain_image(
        dev: Arc<Device>,
        image: vk::Image,
        vkfmt: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Texture> {
        let format = Format::from_vk(vkfmt).ok_or(SleetError::UNSUPPORTED)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .image(image)
            .format(vkfmt)
            .view_type(vk::ImageViewType::TYPE_2D);
        let view = unsafe {
            dev.dev
                .create_image_view(&view_info, None)
                .or(Err(SleetError::DEVICE_ERROR))?
        };
        let sampler = dev.get_sampler(&SamplerInfo::default())?;

        Ok(Texture {
            t_internal: Arc::new(RwLock::new(TextureInternal {
                t_dev: dev.clone(),
                t_image: image,
                t_view: view,
                t_mem: vk::DeviceMemory::null(),
                t_sampler: sampler,
                t_sampler_info: SamplerInfo::default(),
                t_size: (extent.width, extent.height, 1),
                t_format: format,
                t_vkfmt: vkfmt,
                t_flags: TextureFlags::WRITEABLE,
                t_samples: 1,
                t_mips: 1,
                t_layers: 1,
                t_aspect: vk::ImageAspectFlags::COLOR,
                t_layout: vk::ImageLayout::UNDEFINED,
                t_queue_family: dev.graphics_queue.q_family,
                t_first_use: true,
                t_transient: false,
                t_fbs: Vec::new(),
                t_swapchain_image: true,
                t_destroyed: false,
            })),
        })
    }

    /// Copy `data` into mip zero through a staging buffer
    fn upload(&self, data: &[u8]) -> Result<()> {
        let mut internal = self.t_internal.write().unwrap();
        let dev = internal.t_dev.clone();

        let bytes_per_layer = (internal.t_size.0 * internal.t_size.1 * internal.t_size.2) as usize
            * internal.t_format.bytes_per_pixel();
        if bytes_per_layer == 0 || data.len() % bytes_per_layer != 0 {
            log::error!("Texture data size does not match the image dimensions");
            return Err(SleetError::INVALID_PARAMETER);
        }
        let layer_count = (data.len() / bytes_per_layer) as u32;
        if layer_count > internal.t_layers {
            log::error!("Texture data covers more layers than the image has");
            return Err(SleetError::INVALID_PARAMETER);
        }

        let (staging, staging_mem) = dev.create_buffer_with_size(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data.len() as u64,
        )?;
        dev.update_memory(staging_mem, 0, data)?;

        let cbuf = dev.cmd_acquire()?;

        dev.transition_image(
            &mut internal,
            cbuf,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        );

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            // 0 means tightly packed
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(internal.t_aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(layer_count)
                    .build(),
            )
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: internal.t_size.0,
                height: internal.t_size.1,
                depth: internal.t_size.2,
            })
            .build();

        unsafe {
            dev.dev.cmd_copy_buffer_to_image(
                cbuf,
                staging,
                internal.t_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        dev.transition_for_shader_read(
            &mut internal,
            cbuf,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        );

        dev.defer_destroy(DestroyItem::Buffer(staging))?;
        dev.defer_destroy(DestroyItem::Memory(staging_mem))?;
        dev.cmd_release()?;

        Ok(())
    }

    /// Fill the mip chain by blitting each level from the previous
    ///
    /// Valid on GEN_MIPS textures. The image ends up in
    /// SHADER_READ_ONLY with every level populated.
    pub(crate) fn generate_mips(&self) -> Result<()> {
        let mut internal = self.t_internal.write().unwrap();
        let dev = internal.t_dev.clone();

        if !internal.t_flags.contains(TextureFlags::GEN_MIPS) {
            log::error!("generate_mips requires the GEN_MIPS texture flag");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if internal.t_mips < 2 {
            return Ok(());
        }

        let cbuf = dev.cmd_acquire()?;

        // Move the whole chain into TRANSFER_DST, then walk the
        // levels, flipping each source level to TRANSFER_SRC.
        dev.transition_image(
            &mut internal,
            cbuf,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        );

        let mut width = internal.t_size.0 as i32;
        let mut height = internal.t_size.1 as i32;

        for level in 1..internal.t_mips {
            let level_barrier = |old, new, src_access, dst_access, mip| {
                vk::ImageMemoryBarrier::builder()
                    .image(internal.t_image)
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(old)
                    .new_layout(new)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(internal.t_aspect)
                            .base_mip_level(mip)
                            .level_count(1)
                            .layer_count(internal.t_layers)
                            .build(),
                    )
                    .build()
            };

            unsafe {
                // level - 1 was just written, make it the blit source
                dev.dev.cmd_pipeline_barrier(
                    cbuf,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[level_barrier(
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::TRANSFER_READ,
                        level - 1,
                    )],
                );

                let next_width = (width / 2).max(1);
                let next_height = (height / 2).max(1);

                let blit = vk::ImageBlit::builder()
                    .src_subresource(
                        vk::ImageSubresourceLayers::builder()
                            .aspect_mask(internal.t_aspect)
                            .mip_level(level - 1)
                            .layer_count(internal.t_layers)
                            .build(),
                    )
                    .src_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: width,
                            y: height,
                            z: 1,
                        },
                    ])
                    .dst_subresource(
                        vk::ImageSubresourceLayers::builder()
                            .aspect_mask(internal.t_aspect)
                            .mip_level(level)
                            .layer_count(internal.t_layers)
                            .build(),
                    )
                    .dst_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: next_width,
                            y: next_height,
                            z: 1,
                        },
                    ])
                    .build();

                dev.dev.cmd_blit_image(
                    cbuf,
                    internal.t_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    internal.t_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );

                width = next_width;
                height = next_height;
            }
        }

        // Levels 0..n-1 sit in TRANSFER_SRC, the last in
        // TRANSFER_DST. Fold them all into SHADER_READ_ONLY.
        let mips = internal.t_mips;
        unsafe {
            let barriers = [
                vk::ImageMemoryBarrier::builder()
                    .image(internal.t_image)
                    .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(internal.t_aspect)
                            .base_mip_level(0)
                            .level_count(mips - 1)
                            .layer_count(internal.t_layers)
                            .build(),
                    )
                    .build(),
                vk::ImageMemoryBarrier::builder()
                    .image(internal.t_image)
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(internal.t_aspect)
                            .base_mip_level(mips - 1)
                            .level_count(1)
                            .layer_count(internal.t_layers)
                            .build(),
                    )
                    .build(),
            ];

            dev.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }

        // The pass above did the per-level work by hand, record the
        // final state with the tracker
        internal.t_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

        dev.cmd_release()?;
        Ok(())
    }

    /// Get a framebuffer binding this texture (plus the optional
    /// depth/resolve views) for `pass_idx`
    ///
    /// Framebuffers are cached per render pass. The epoch detects
    /// render pass indices that were unregistered and reused, stale
    /// entries are retired onto the destroy list.
    pub(crate) fn get_framebuffer(
        &self,
        pass_idx: u32,
        epoch: u64,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let mut internal = self.t_internal.write().unwrap();
        let dev = internal.t_dev.clone();

        // Retire entries whose render pass index was unregistered
        // and reused at a newer epoch
        let mut stale = Vec::new();
        internal.t_fbs.retain(|fb| {
            if fb.fe_pass_idx == pass_idx && fb.fe_epoch != epoch {
                stale.push(fb.fe_fb);
                return false;
            }
            true
        });
        for fb in stale {
            dev.destroy_or_defer(DestroyItem::Framebuffer(fb));
        }

        if let Some(entry) = internal
            .t_fbs
            .iter()
            .find(|fb| fb.fe_pass_idx == pass_idx && fb.fe_views.as_slice() == views)
        {
            return Ok(entry.fe_fb);
        }

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let fb = unsafe {
            dev.dev
                .create_framebuffer(&info, None)
                .or(Err(SleetError::DEVICE_ERROR))?
        };

        internal.t_fbs.push(FbEntry {
            fe_pass_idx: pass_idx,
            fe_epoch: epoch,
            fe_views: views.to_vec(),
            fe_fb: fb,
        });

        Ok(fb)
    }

    /// Create a view of a single layer, used for per-layer blits
    /// into cubemaps and array textures. The caller owns the view.
    pub(crate) fn create_layer_view(&self, layer: u32) -> Result<vk::ImageView> {
        let internal = self.t_internal.read().unwrap();
        if layer >= internal.t_layers {
            return Err(SleetError::INVALID_PARAMETER);
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(internal.t_aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(layer)
                    .layer_count(1)
                    .build(),
            )
            .image(internal.t_image)
            .format(internal.t_vkfmt)
            .view_type(vk::ImageViewType::TYPE_2D);

        unsafe {
            internal
                .t_dev
                .dev
                .create_image_view(&view_info, None)
                .or(Err(SleetError::DEVICE_ERROR))
        }
    }

    pub fn get_size(&self) -> (u32, u32, u32) {
        self.t_internal.read().unwrap().t_size
    }

    pub fn get_format(&self) -> Format {
        self.t_internal.read().unwrap().t_format
    }

    pub fn get_mip_count(&self) -> u32 {
        self.t_internal.read().unwrap().t_mips
    }

    pub fn get_flags(&self) -> TextureFlags {
        self.t_internal.read().unwrap().t_flags
    }

    /// The tracked image layout, exposed for diagnostics
    pub fn current_layout_raw(&self) -> ash::vk::ImageLayout {
        self.t_internal.read().unwrap().t_layout
    }

    pub(crate) fn same_texture(&self, other: &Texture) -> bool {
        Arc::ptr_eq(&self.t_internal, &other.t_internal)
    }

    pub(crate) fn is_compute(&self) -> bool {
        self.t_internal
            .read()
            .unwrap()
            .t_flags
            .contains(TextureFlags::COMPUTE)
    }

    /// Destroy the texture
    ///
    /// Idempotent. GPU objects ride the active command slot's
    /// destroy list when one is recording.
    pub fn destroy(&self) {
        self.t_internal.write().unwrap().destroy();
    }
}

impl Texture {
    pub(crate) fn vk_view(&self) -> vk::ImageView {
        self.t_internal.read().unwrap().t_view
    }

    pub(crate) fn vk_sampler(&self) -> vk::Sampler {
        self.t_internal.read().unwrap().t_sampler
    }
}

/// The process-wide default textures
///
/// Shader reflection can name one of these as a binding's default
/// value, materials are seeded with them at creation.
pub(crate) struct StockTextures {
    st_white: Texture,
    st_black: Texture,
    st_gray: Texture,
}

impl StockTextures {
    pub(crate) fn new(dev: &Arc<Device>) -> Result<Self> {
        let info = TextureInfo {
            size: (1, 1, 1),
            format: Format::Rgba8Unorm,
            flags: TextureFlags::READABLE,
            sample_count: 1,
            mip_count: 1,
            sampler: SamplerInfo::default(),
        };

        Ok(Self {
            st_white: Texture::new(dev.clone(), &info, Some(&[0xff, 0xff, 0xff, 0xff]))?,
            st_black: Texture::new(dev.clone(), &info, Some(&[0, 0, 0, 0xff]))?,
            st_gray: Texture::new(dev.clone(), &info, Some(&[0x80, 0x80, 0x80, 0xff]))?,
        })
    }

    /// Resolve a reflection default value to a stock texture
    pub(crate) fn lookup(&self, name: &str) -> Option<&Texture> {
        match name {
            "white" => Some(&self.st_white),
            "black" => Some(&self.st_black),
            "gray" | "grey" => Some(&self.st_gray),
            _ => None,
        }
    }
}

impl TextureInternal {
    fn destroy(&mut self) {
        if self.t_destroyed {
            return;
        }
        self.t_destroyed = true;

        for fb in self.t_fbs.drain(..) {
            self.t_dev.destroy_or_defer(DestroyItem::Framebuffer(fb.fe_fb));
        }
        self.t_dev.destroy_or_defer(DestroyItem::ImageView(self.t_view));
        if !self.t_swapchain_image {
            self.t_dev.destroy_or_defer(DestroyItem::Image(self.t_image));
            self.t_dev.destroy_or_defer(DestroyItem::Memory(self.t_mem));
        }
    }
}

impl Drop for TextureInternal {
    fn drop(&mut self) {
        self.destroy();
    }
}
