// The presentation surface
//
// A slim swapchain wrapper. It owns the VkSurfaceKHR handed over at
// init, the swapchain built on it, and textures wrapping the
// swapchain images. Out-of-date and lost surfaces are reported as
// distinct errors so the caller can resize or bail.
//
// Austin Shafer - 2024

use ash::extensions::khr;
use ash::vk;

use crate::device::Device;
use crate::instance::Instance;
use crate::texture::Texture;
use crate::{Result, SleetError};
use utils::log;

use std::sync::Arc;

pub struct Display {
    d_dev: Arc<Device>,
    d_surface_loader: khr::Surface,
    d_swapchain_loader: khr::Swapchain,
    d_surface: vk::SurfaceKHR,
    d_surface_format: vk::SurfaceFormatKHR,
    d_present_mode: vk::PresentModeKHR,
    pub(crate) d_resolution: vk::Extent2D,
    d_swapchain: vk::SwapchainKHR,
    pub(crate) d_images: Vec<Texture>,
    /// Signaled by vkAcquireNextImageKHR, consumed by the frame's
    /// submission
    pub(crate) d_present_sema: vk::Semaphore,
    /// Signaled by the frame's submission, consumed by present
    pub(crate) d_render_sema: vk::Semaphore,
    /// The image index acquired for the current frame
    pub(crate) d_current: Option<u32>,
}

impl Display {
    pub(crate) fn new(
        inst: &Arc<Instance>,
        dev: Arc<Device>,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let surface_loader = khr::Surface::new(&inst.loader, &inst.inst);
        let swapchain_loader = khr::Swapchain::new(&inst.inst, &dev.dev);

        unsafe {
            let supported = surface_loader
                .get_physical_device_surface_support(
                    dev.pdev,
                    dev.graphics_queue.q_family,
                    surface,
                )
                .or(Err(SleetError::SURFACE_LOST))?;
            if !supported {
                log::error!("The graphics queue can not present to this surface");
                return Err(SleetError::UNSUPPORTED);
            }

            let formats = surface_loader
                .get_physical_device_surface_formats(dev.pdev, surface)
                .or(Err(SleetError::SURFACE_LOST))?;
            let surface_format = *formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        || f.format == vk::Format::R8G8B8A8_SRGB
                })
                .unwrap_or(&formats[0]);

            let sema_info = vk::SemaphoreCreateInfo::default();
            let present_sema = dev
                .dev
                .create_semaphore(&sema_info, None)
                .or(Err(SleetError::DEVICE_ERROR))?;
            let render_sema = dev
                .dev
                .create_semaphore(&sema_info, None)
                .or(Err(SleetError::DEVICE_ERROR))?;

            let mut ret = Self {
                d_dev: dev,
                d_surface_loader: surface_loader,
                d_swapchain_loader: swapchain_loader,
                d_surface: surface,
                d_surface_format: surface_format,
                // FIFO is always available
                d_present_mode: vk::PresentModeKHR::FIFO,
                d_resolution: vk::Extent2D::default(),
                d_swapchain: vk::SwapchainKHR::null(),
                d_images: Vec::new(),
                d_present_sema: present_sema,
                d_render_sema: render_sema,
                d_current: None,
            };
            ret.create_swapchain()?;

            Ok(ret)
        }
    }

    /// Build (or rebuild) the swapchain at the surface's current size
    fn create_swapchain(&mut self) -> Result<()> {
        unsafe {
            let caps = self
                .d_surface_loader
                .get_physical_device_surface_capabilities(self.d_dev.pdev, self.d_surface)
                .or(Err(SleetError::SURFACE_LOST))?;

            let mut desired_image_count = caps.min_image_count + 1;
            if caps.max_image_count > 0 && desired_image_count > caps.max_image_count {
                desired_image_count = caps.max_image_count;
            }

            let transform = match caps
                .supported_transforms
                .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
            {
                true => vk::SurfaceTransformFlagsKHR::IDENTITY,
                false => caps.current_transform,
            };

            self.d_resolution = caps.current_extent;

            let old_swapchain = self.d_swapchain;
            let info = vk::SwapchainCreateInfoKHR::builder()
                .surface(self.d_surface)
                .min_image_count(desired_image_count)
                .image_color_space(self.d_surface_format.color_space)
                .image_format(self.d_surface_format.format)
                .image_extent(self.d_resolution)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(self.d_present_mode)
                .clipped(true)
                .image_array_layers(1)
                .old_swapchain(old_swapchain);

            let swapchain = self
                .d_swapchain_loader
                .create_swapchain(&info, None)
                .or(Err(SleetError::DEVICE_ERROR))?;

            if old_swapchain != vk::SwapchainKHR::null() {
                for tex in self.d_images.drain(..) {
                    tex.destroy();
                }
                self.d_swapchain_loader.destroy_swapchain(old_swapchain, None);
            }
            self.d_swapchain = swapchain;

            let images = self
                .d_swapchain_loader
                .get_swapchain_images(swapchain)
                .or(Err(SleetError::DEVICE_ERROR))?;
            for image in images {
                self.d_images.push(Texture::new_from_swapchain_image(
                    self.d_dev.clone(),
                    image,
                    self.d_surface_format.format,
                    self.d_resolution,
                )?);
            }

            Ok(())
        }
    }

    /// Acquire the next swapchain image
    ///
    /// NEEDS_RESIZE means the caller should resize and try again,
    /// SURFACE_LOST that the surface itself went away.
    pub(crate) fn next_tex(&mut self) -> Result<Texture> {
        unsafe {
            match self.d_swapchain_loader.acquire_next_image(
                self.d_swapchain,
                std::u64::MAX,
                self.d_present_sema,
                vk::Fence::null(),
            ) {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        return Err(SleetError::NEEDS_RESIZE);
                    }
                    self.d_current = Some(index);
                    Ok(self.d_images[index as usize].clone())
                }
                Err(vk::Result::NOT_READY) => Err(SleetError::NOT_READY),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SleetError::NEEDS_RESIZE),
                Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(SleetError::SURFACE_LOST),
                Err(e) => {
                    log::error!("vkAcquireNextImageKHR failed: {:?}", e);
                    Err(SleetError::COULD_NOT_ACQUIRE_NEXT_IMAGE)
                }
            }
        }
    }

    /// Recreate the swapchain at the surface's current size
    pub(crate) fn resize(&mut self) -> Result<()> {
        self.d_dev.wait_idle();
        self.d_current = None;
        self.create_swapchain()
    }

    /// Flip the acquired image onto the screen
    pub(crate) fn present(&mut self) -> Result<()> {
        let index = match self.d_current.take() {
            Some(i) => i,
            None => {
                log::error!("present called without an acquired image");
                return Err(SleetError::INVALID_PARAMETER);
            }
        };

        let wait_semas = [self.d_render_sema];
        let swapchains = [self.d_swapchain];
        let indices = [index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        unsafe {
            let queue = &self.d_dev.graphics_queue;
            let _guard = queue.q_lock.lock().unwrap();
            match self
                .d_swapchain_loader
                .queue_present(queue.q_queue, &info)
            {
                Ok(_) => Ok(()),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SleetError::NEEDS_RESIZE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(SleetError::NEEDS_RESIZE),
                Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(SleetError::SURFACE_LOST),
                Err(_) => Err(SleetError::PRESENT_FAILED),
            }
        }
    }

    /// The texture for the currently acquired image
    pub(crate) fn current_tex(&self) -> Option<Texture> {
        self.d_current
            .map(|idx| self.d_images[idx as usize].clone())
    }

    pub fn get_resolution(&self) -> (u32, u32) {
        (self.d_resolution.width, self.d_resolution.height)
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        unsafe {
            self.d_dev.wait_idle();

            for tex in self.d_images.drain(..) {
                tex.destroy();
            }
            self.d_dev.dev.destroy_semaphore(self.d_present_sema, None);
            self.d_dev.dev.destroy_semaphore(self.d_render_sema, None);
            self.d_swapchain_loader
                .destroy_swapchain(self.d_swapchain, None);
            self.d_surface_loader.destroy_surface(self.d_surface, None);
        }
    }
}
