// Fence protected destroy lists
//
// GPU resources can not be destroyed while a command buffer
// referencing them is in flight. Each command ring slot owns one of
// these lists, destruction is queued here and replayed once the
// slot's fence has signaled.
//
// Austin Shafer - 2024
use ash::vk;

use crate::bindpool::BindPool;
use crate::pipeline::PipelineCache;
use crate::Droppable;

use std::sync::{Arc, Mutex};

/// One entry to be destroyed later
///
/// This is a tagged sum over the Vulkan object kinds we defer, plus
/// bind pool ranges rented by materials and arbitrary boxed state
/// (release infos, staging CPU copies).
pub enum DestroyItem {
    Buffer(vk::Buffer),
    Memory(vk::DeviceMemory),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Framebuffer(vk::Framebuffer),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    RenderPass(vk::RenderPass),
    ShaderModule(vk::ShaderModule),
    BindRange(u32, u32),
    /// Unregister a material index once its last frame retires.
    /// Holding this off keeps the pipelines at [idx][*][*] alive for
    /// render items recorded before the material was destroyed.
    MaterialUnregister(Arc<PipelineCache>, u32),
    /// Same deal for a mesh's vertex format index
    VertFmtUnregister(Arc<PipelineCache>, u32),
    Boxed(Box<dyn Droppable + Send + Sync>),
}

/// A typed queue of pending destructions
///
/// Entries are executed in insertion order. Queuing the same handle
/// twice is a caller bug.
pub struct DestroyList {
    dl_items: Mutex<Vec<DestroyItem>>,
}

impl DestroyList {
    pub fn new() -> Self {
        Self {
            dl_items: Mutex::new(Vec::new()),
        }
    }

    /// Append an entry to be destroyed when the owning fence signals
    pub fn add(&self, item: DestroyItem) {
        self.dl_items.lock().unwrap().push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.dl_items.lock().unwrap().is_empty()
    }

    /// Destroy every queued entry, in insertion order
    ///
    /// The caller must guarantee that the owning fence has signaled,
    /// or that the device is otherwise idle.
    pub fn execute(&self, dev: &ash::Device, pool: &BindPool) {
        let mut items = self.dl_items.lock().unwrap();

        for item in items.drain(..) {
            unsafe {
                match item {
                    DestroyItem::Buffer(b) => dev.destroy_buffer(b, None),
                    DestroyItem::Memory(m) => dev.free_memory(m, None),
                    DestroyItem::Image(i) => dev.destroy_image(i, None),
                    DestroyItem::ImageView(v) => dev.destroy_image_view(v, None),
                    DestroyItem::Framebuffer(f) => dev.destroy_framebuffer(f, None),
                    DestroyItem::Pipeline(p) => dev.destroy_pipeline(p, None),
                    DestroyItem::PipelineLayout(l) => dev.destroy_pipeline_layout(l, None),
                    DestroyItem::DescriptorSetLayout(l) => {
                        dev.destroy_descriptor_set_layout(l, None)
                    }
                    DestroyItem::RenderPass(r) => dev.destroy_render_pass(r, None),
                    DestroyItem::ShaderModule(s) => dev.destroy_shader_module(s, None),
                    DestroyItem::BindRange(start, count) => pool.free(start, count),
                    DestroyItem::MaterialUnregister(cache, idx) => {
                        cache.unregister_material(idx, true)
                    }
                    DestroyItem::VertFmtUnregister(cache, idx) => {
                        cache.unregister_vertfmt(idx, true)
                    }
                    DestroyItem::Boxed(b) => drop(b),
                }
            }
        }
    }
}
