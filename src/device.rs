// Vulkan device representation
//
// This stores per-GPU state, such as the Vulkan Device objects and
// logic to create buffers and images on this GPU.
//
// Austin Shafer - 2024

use ash::extensions::khr;
use ash::vk;

use crate::bindpool::BindPool;
use crate::cmdring::ThreadTable;
use crate::instance::Instance;
use crate::texture::SamplerInfo;
use crate::{CreateInfo, GpuPreference, Result, SleetError};
use utils::log;

use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Hands out Device identities for the per-thread ring tables
static DEVICE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// The available vulkan capabilities.
///
/// This is composed of two parts: flags for available features, and
/// limits the rest of the crate sizes its allocations against.
pub struct VKDeviceFeatures {
    /// Can descriptors be pushed inline in the command buffer, or do
    /// we have to allocate per-command descriptor sets?
    pub vkc_supports_push_descriptors: bool,
    /// Does the device expose LAZILY_ALLOCATED memory for transient
    /// attachments (tiled GPUs)?
    pub vkc_supports_lazy_memory: bool,
    /// Do the graphics queues support timestamp queries?
    pub vkc_supports_timestamps: bool,

    pub vkc_min_ubo_align: u64,
    pub vkc_min_ssbo_align: u64,
    pub vkc_timestamp_period: f32,

    vkc_push_desc_exts: [*const i8; 1],
}

unsafe impl Send for VKDeviceFeatures {}
unsafe impl Sync for VKDeviceFeatures {}

fn contains_extensions(exts: &[vk::ExtensionProperties], req: &[*const i8]) -> bool {
    let mut count = 0;

    for r in req.iter() {
        let rstr = unsafe { CStr::from_ptr(*r as *const std::os::raw::c_char) };

        for e in exts {
            let estr = unsafe { CStr::from_ptr(&e.extension_name as *const std::os::raw::c_char) };
            if rstr == estr {
                count += 1;
                if count == req.len() {
                    return true;
                }
                break;
            }
        }
    }

    return false;
}

impl VKDeviceFeatures {
    fn new(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Self {
        let mut ret = Self {
            vkc_supports_push_descriptors: false,
            vkc_supports_lazy_memory: false,
            vkc_supports_timestamps: false,
            vkc_min_ubo_align: 256,
            vkc_min_ssbo_align: 256,
            vkc_timestamp_period: 1.0,
            vkc_push_desc_exts: [vk::KhrPushDescriptorFn::name().as_ptr()],
        };

        unsafe {
            let exts = inst.enumerate_device_extension_properties(pdev).unwrap();
            ret.vkc_supports_push_descriptors =
                contains_extensions(exts.as_slice(), &ret.vkc_push_desc_exts);
            if !ret.vkc_supports_push_descriptors {
                log::info!("This vulkan device does not support push descriptors");
            }

            let props = inst.get_physical_device_properties(pdev);
            ret.vkc_min_ubo_align = props.limits.min_uniform_buffer_offset_alignment;
            ret.vkc_min_ssbo_align = props.limits.min_storage_buffer_offset_alignment;
            ret.vkc_timestamp_period = props.limits.timestamp_period;
            ret.vkc_supports_timestamps = props.limits.timestamp_compute_and_graphics != 0;

            let mem_props = inst.get_physical_device_memory_properties(pdev);
            for i in 0..mem_props.memory_type_count as usize {
                if mem_props.memory_types[i]
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED)
                {
                    ret.vkc_supports_lazy_memory = true;
                }
            }
        }

        return ret;
    }

    fn get_device_extensions(&self, with_surface: bool) -> Vec<*const i8> {
        let mut ret = Vec::new();

        if with_surface {
            ret.push(khr::Swapchain::name().as_ptr());
        }
        if self.vkc_supports_push_descriptors {
            for e in self.vkc_push_desc_exts.iter() {
                ret.push(*e);
            }
        }

        return ret;
    }
}

/// A submission queue and the mutex serializing access to it
///
/// Two command buffers submitted to the same queue execute in
/// submission order, the mutex only keeps the vkQueueSubmit calls
/// themselves from racing.
pub struct Queue {
    pub(crate) q_queue: vk::Queue,
    pub(crate) q_family: u32,
    pub(crate) q_lock: Mutex<()>,
}

/// Sleet Device
///
/// This holds all of the Vulkan logic for one GPU. The fields are
/// immutable after initialization, the mutable pieces (sampler
/// cache, thread table) sit behind their own locks.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// Details about what this device supports
    pub(crate) dev_features: VKDeviceFeatures,
    /// the physical device selected to display to
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    /// Loader for vkCmdPushDescriptorSetKHR
    pub(crate) push_desc_loader: Option<khr::PushDescriptor>,

    pub(crate) graphics_queue: Queue,
    pub(crate) transfer_queue: Queue,

    /// The process-wide material binding slab. The destroy lists
    /// return rented ranges here once their fences signal.
    pub(crate) d_bind_pool: Arc<BindPool>,
    /// Interned samplers, keyed by their creation parameters
    d_sampler_cache: Mutex<Vec<(SamplerInfo, vk::Sampler)>>,
    /// Per thread command rings
    pub(crate) d_threads: ThreadTable,

    pub(crate) frames_in_flight: u32,

    /// Process-unique identity, keys the thread-local ring indices
    pub(crate) d_id: u64,
    /// Back reference handed to Futures
    d_self: Weak<Device>,
}

impl Device {
    /// Choose a vkPhysicalDevice honoring the caller's preference
    ///
    /// `require` preferences fail when nothing matches, `prefer`
    /// preferences fall back to the first enumerated device.
    fn select_pdev(inst: &ash::Instance, info: &CreateInfo) -> Result<vk::PhysicalDevice> {
        if let Some(pdev) = info.physical_device {
            return Ok(pdev);
        }

        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .or(Err(SleetError::DEVICE_ERROR))?
        };
        if pdevices.is_empty() {
            return Err(SleetError::UNSUPPORTED);
        }

        let wanted = match info.gpu_preference {
            GpuPreference::Any => None,
            GpuPreference::RequireDiscrete | GpuPreference::PreferDiscrete => {
                Some(vk::PhysicalDeviceType::DISCRETE_GPU)
            }
            GpuPreference::RequireIntegrated | GpuPreference::PreferIntegrated => {
                Some(vk::PhysicalDeviceType::INTEGRATED_GPU)
            }
        };

        if let Some(dev_type) = wanted {
            for pdev in pdevices.iter() {
                let props = unsafe { inst.get_physical_device_properties(*pdev) };
                if props.device_type == dev_type {
                    return Ok(*pdev);
                }
            }

            match info.gpu_preference {
                GpuPreference::RequireDiscrete | GpuPreference::RequireIntegrated => {
                    log::error!("No physical device of the required type was found");
                    return Err(SleetError::UNSUPPORTED);
                }
                _ => {}
            }
        }

        Ok(pdevices[0])
    }

    /// Choose a queue family
    ///
    /// returns an index into the array of queue types.
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        flags: vk::QueueFlags,
    ) -> Result<u32> {
        // get the properties per queue family
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .filter_map(|(index, info)| match info.queue_flags.contains(flags) {
                true => Some(index as u32),
                false => None,
            })
            .nth(0)
            .ok_or(SleetError::UNSUPPORTED)
    }

    /// Create a logical device for interfacing with the physical device.
    fn create_device(
        dev_features: &VKDeviceFeatures,
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queues: &[u32],
        with_surface: bool,
        extra_exts: &[std::ffi::CString],
    ) -> Result<ash::Device> {
        let mut dev_extension_names = dev_features.get_device_extensions(with_surface);
        for ext in extra_exts.iter() {
            dev_extension_names.push(ext.as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::builder()
            .fragment_stores_and_atomics(true)
            .vertex_pipeline_stores_and_atomics(true)
            .build();

        // for now we only have one queue per family, so one priority
        let priorities = [1.0];
        let mut queue_infos = Vec::new();
        for i in queues {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*i)
                    .queue_priorities(&priorities)
                    .build(),
            );
        }

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_infos.as_ref())
            .enabled_extension_names(dev_extension_names.as_slice())
            .enabled_features(&features)
            .build();

        unsafe {
            inst.create_device(pdev, &dev_create_info, None).map_err(|e| {
                log::error!("vkCreateDevice failed: {:?}", e);
                SleetError::DEVICE_ERROR
            })
        }
    }

    /// Create a new Device for the physical device chosen from `info`
    pub fn new(
        instance: Arc<Instance>,
        bind_pool: Arc<BindPool>,
        info: &CreateInfo,
    ) -> Result<Arc<Self>> {
        let pdev = Self::select_pdev(&instance.inst, info)?;
        let dev_features = VKDeviceFeatures::new(&instance.inst, pdev);
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };

        let graphics_family =
            Self::select_queue_family(&instance.inst, pdev, vk::QueueFlags::GRAPHICS)?;
        let transfer_family =
            Self::select_queue_family(&instance.inst, pdev, vk::QueueFlags::TRANSFER)?;

        let mut families = vec![graphics_family];
        if transfer_family != graphics_family {
            families.push(transfer_family);
        }

        // The caller gets a say in device extensions before the
        // device exists
        let extra_exts = match info.device_init_callback.as_ref() {
            Some(cb) => cb(pdev),
            None => Vec::new(),
        };

        let dev = Self::create_device(
            &dev_features,
            &instance.inst,
            pdev,
            families.as_slice(),
            info.surface.is_some(),
            extra_exts.as_slice(),
        )?;

        let graphics_queue = unsafe { dev.get_device_queue(graphics_family, 0) };
        let transfer_queue = unsafe { dev.get_device_queue(transfer_family, 0) };

        let push_desc_loader = match dev_features.vkc_supports_push_descriptors {
            true => Some(khr::PushDescriptor::new(&instance.inst, &dev)),
            false => None,
        };

        Ok(Arc::new_cyclic(|weak| Self {
            inst: instance,
            dev: dev,
            dev_features: dev_features,
            pdev: pdev,
            mem_props: mem_props,
            push_desc_loader: push_desc_loader,
            graphics_queue: Queue {
                q_queue: graphics_queue,
                q_family: graphics_family,
                q_lock: Mutex::new(()),
            },
            transfer_queue: Queue {
                q_queue: transfer_queue,
                q_family: transfer_family,
                q_lock: Mutex::new(()),
            },
            d_bind_pool: bind_pool,
            d_sampler_cache: Mutex::new(Vec::new()),
            d_threads: ThreadTable::new(),
            frames_in_flight: info.frames_in_flight,
            d_id: DEVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            d_self: weak.clone(),
        }))
    }

    /// An owning handle to this Device
    pub(crate) fn self_arc(&self) -> Arc<Self> {
        self.d_self.upgrade().unwrap()
    }

    /// Returns an index into the array of memory types for the memory
    /// properties
    ///
    /// Memory types specify the location and accessability of memory. Device
    /// local memory is resident on the GPU, while host visible memory can be
    /// read from the system side.
    pub(crate) fn find_memory_type_index(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, ref mem_type) in self.mem_props.memory_types.iter().enumerate() {
            // Bit i of memoryBitTypes will be set if the resource supports
            // the ith memory type in props.
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Allocates a buffer/memory pair of size `size`.
    ///
    /// This does not fill the buffer with anything.
    pub(crate) fn create_buffer_with_size(
        &self,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        unsafe {
            let buffer = self
                .dev
                .create_buffer(&create_info, None)
                .or(Err(SleetError::DEVICE_ERROR))?;
            let req = self.dev.get_buffer_memory_requirements(buffer);
            let index = match self.find_memory_type_index(&req, flags) {
                Some(i) => i,
                None => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(SleetError::UNSUPPORTED);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo {
                allocation_size: req.size,
                memory_type_index: index,
                ..Default::default()
            };

            let memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(SleetError::OUT_OF_MEMORY);
                }
            };
            if let Err(_) = self.dev.bind_buffer_memory(buffer, memory, 0) {
                self.dev.destroy_buffer(buffer, None);
                self.dev.free_memory(memory, None);
                return Err(SleetError::DEVICE_ERROR);
            }

            Ok((buffer, memory))
        }
    }

    /// Writes `data` to `memory` at `offset`
    ///
    /// This is a helper method for mapping and updating the value stored
    /// in device memory. Memory needs to be host visible and coherent.
    pub(crate) fn update_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.len() == 0 {
            return Ok(());
        }

        unsafe {
            let ptr = self
                .dev
                .map_memory(memory, offset, data.len() as u64, vk::MemoryMapFlags::empty())
                .or(Err(SleetError::DEVICE_ERROR))?;

            // rust doesn't have a raw memcpy, so we need to transform the void
            // ptr to a slice. This is unsafe as the length needs to be correct
            let dst = std::slice::from_raw_parts_mut(ptr as *mut u8, data.len());
            dst.copy_from_slice(data);

            self.dev.unmap_memory(memory);
        }
        Ok(())
    }

    /// Create a vkImage and the memory needed to use it
    ///
    /// In vulkan memory management is hands on, so we allocate
    /// device memory to back the image ourselves. Transient discard
    /// attachments get LAZILY_ALLOCATED memory when the device has
    /// it.
    pub(crate) fn create_image(
        &self,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mem_flags: vk::MemoryPropertyFlags,
        mip_levels: u32,
        array_layers: u32,
        samples: vk::SampleCountFlags,
        create_flags: vk::ImageCreateFlags,
        is_3d: bool,
    ) -> Result<(vk::Image, vk::DeviceMemory)> {
        let create_info = vk::ImageCreateInfo::builder()
            .flags(create_flags)
            .image_type(match is_3d {
                true => vk::ImageType::TYPE_3D,
                false => vk::ImageType::TYPE_2D,
            })
            .format(format)
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(array_layers)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        unsafe {
            let image = self
                .dev
                .create_image(&create_info, None)
                .or(Err(SleetError::UNSUPPORTED))?;

            let mem_reqs = self.dev.get_image_memory_requirements(image);
            let memtype_index = match self
                .find_memory_type_index(&mem_reqs, mem_flags)
                // lazy memory may be missing, retry with plain device local
                .or_else(|| {
                    self.find_memory_type_index(&mem_reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                }) {
                Some(i) => i,
                None => {
                    self.dev.destroy_image(image, None);
                    return Err(SleetError::UNSUPPORTED);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(mem_reqs.size)
                .memory_type_index(memtype_index);

            let image_memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_image(image, None);
                    return Err(SleetError::OUT_OF_MEMORY);
                }
            };
            if let Err(_) = self.dev.bind_image_memory(image, image_memory, 0) {
                self.dev.destroy_image(image, None);
                self.dev.free_memory(image_memory, None);
                return Err(SleetError::DEVICE_ERROR);
            }

            Ok((image, image_memory))
        }
    }

    /// Get a sampler matching `info` from the cache
    ///
    /// Samplers are interned process-wide. They are destroyed all at
    /// once when the Device is dropped, textures hold non-owning
    /// copies.
    pub(crate) fn get_sampler(&self, info: &SamplerInfo) -> Result<vk::Sampler> {
        let mut cache = self.d_sampler_cache.lock().unwrap();

        if let Some((_, sampler)) = cache.iter().find(|(key, _)| key == info) {
            return Ok(*sampler);
        }

        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(info.filter())
            .min_filter(info.filter())
            .address_mode_u(info.address_mode())
            .address_mode_v(info.address_mode())
            .address_mode_w(info.address_mode())
            .anisotropy_enable(info.anisotropy > 1)
            .max_anisotropy(info.anisotropy as f32)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(info.mip_mode())
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        let sampler = unsafe {
            self.dev
                .create_sampler(&create_info, None)
                .or(Err(SleetError::DEVICE_ERROR))?
        };
        cache.push((*info, sampler));

        Ok(sampler)
    }

    /// Wait for all GPU work to complete
    pub(crate) fn wait_idle(&self) {
        unsafe {
            self.dev.device_wait_idle().unwrap();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // first wait for the device to finish working
            self.dev.device_wait_idle().unwrap();

            self.d_threads.destroy(&self.dev, &self.d_bind_pool);

            for (_, sampler) in self.d_sampler_cache.lock().unwrap().drain(..) {
                self.dev.destroy_sampler(sampler, None);
            }

            self.dev.destroy_device(None);
        }
    }
}
