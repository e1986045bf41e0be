// The Sleet rendering library
//
// A low-overhead Vulkan renderer: textures, buffers, meshes,
// shaders, materials, compute programs, render lists and a
// frame-level renderer. All wire-level Vulkan work is performed
// by the modules in this crate, nothing unsafe/vulkan/ash/etc
// should be exposed to upper layers.
//
// Austin Shafer - 2024
#![allow(dead_code)]
extern crate utils;

mod bindpool;
mod buffer;
mod cmdring;
mod compute;
mod deletion_queue;
mod device;
mod display;
mod instance;
mod layout;
mod list;
mod material;
mod mesh;
mod pipeline;
mod renderer;
mod shader;
mod texture;

#[cfg(test)]
mod tests;

pub use buffer::{BufType, BufUse, Buffer};
pub use cmdring::Future;
pub use compute::ComputeProgram;
pub use display::Display;
pub use list::RenderList;
pub use material::Material;
pub use mesh::{Mesh, VertCompFormat, VertComponent, VertSemantic, VertexFormat};
pub use pipeline::{
    BlendFactor, BlendState, CompareOp, CullMode, MaterialStateInfo, StencilOp, StencilOps,
    WriteMask,
};
pub use renderer::Renderer;
pub use shader::{BindInfo, ParamInfo, ParamType, RegisterKind, Shader, ShaderInfo, StageMask};
pub use texture::{Format, SamplerInfo, Texture, TextureFlags, TextureInfo};
pub use utils::region::Rect;

use utils::log;

/// Errors returned from the sleet API
///
/// These match the status codes of the C-style surface: every
/// fallible operation reports one of a small set of stable kinds.
#[allow(non_camel_case_types)]
#[derive(thiserror::Error, Debug, PartialEq, Eq, Copy, Clone)]
pub enum SleetError {
    #[error("Operation failed")]
    INVALID,
    #[error("Invalid parameter")]
    INVALID_PARAMETER,
    #[error("Out of memory")]
    OUT_OF_MEMORY,
    #[error("Operation is not supported on this device")]
    UNSUPPORTED,
    #[error("The Vulkan device reported an error")]
    DEVICE_ERROR,
    #[error("Result is not ready")]
    NOT_READY,
    #[error("The surface needs to be resized")]
    NEEDS_RESIZE,
    #[error("The surface was lost")]
    SURFACE_LOST,
    #[error("Could not acquire the next surface image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Presentation failed")]
    PRESENT_FAILED,
    #[error("Recording is not active on this thread")]
    RECORDING_NOT_IN_PROGRESS,
    #[error("Not all required Vulkan extensions are available")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
}

pub type Result<T> = std::result::Result<T, SleetError>;

/// Objects that can be deferred onto a destroy list
///
/// Anything that needs its resources to outlive the frame in
/// flight can be boxed up and attached to the active command
/// slot. The box is dropped once the slot's fence has signaled.
pub trait Droppable {}
impl<T> Droppable for T {}

/// The number of binding slots addressable by `set_global_*`
pub const MAX_GLOBALS: usize = 16;

/// Fixed size of the recording-thread table
pub const MAX_THREADS: usize = 8;

/// Reserved binding slots shared with the shader compiler
///
/// These give the well-known slots used for the material's
/// `$Global` parameter block, the per-draw system data and the
/// per-draw instance data. They must match the conventions the
/// shaders were compiled against.
#[derive(Debug, Copy, Clone)]
pub struct BindSlots {
    pub material_slot: u32,
    pub system_slot: u32,
    pub instance_slot: u32,
}

impl Default for BindSlots {
    fn default() -> Self {
        Self {
            material_slot: 0,
            system_slot: 1,
            instance_slot: 2,
        }
    }
}

/// GPU selection preferences for device creation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GpuPreference {
    Any,
    RequireDiscrete,
    RequireIntegrated,
    PreferDiscrete,
    PreferIntegrated,
}

/// Parameters for Sleet initialization
///
/// These will be set by Sleet based on the Builders values
#[derive(Clone)]
pub struct CreateInfo {
    pub app_name: String,
    pub app_version: u32,
    pub enable_validation: bool,
    /// Extra instance extensions the caller's windowing needs
    pub instance_extensions: Vec<std::ffi::CString>,
    pub gpu_preference: GpuPreference,
    /// Overrides gpu_preference when set
    pub physical_device: Option<ash::vk::PhysicalDevice>,
    /// An already created VkSurfaceKHR to present to. Headless
    /// when absent.
    pub surface: Option<ash::vk::SurfaceKHR>,
    /// Invoked after instance creation and before device creation,
    /// returning extra device extensions to enable
    pub device_init_callback:
        Option<std::sync::Arc<dyn Fn(ash::vk::PhysicalDevice) -> Vec<std::ffi::CString> + Send + Sync>>,
    pub frames_in_flight: u32,
    pub bind_slots: BindSlots,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo {
                app_name: "sleet".to_string(),
                app_version: 0,
                enable_validation: cfg!(debug_assertions),
                instance_extensions: Vec::new(),
                gpu_preference: GpuPreference::Any,
                physical_device: None,
                surface: None,
                device_init_callback: None,
                frames_in_flight: 2,
                bind_slots: BindSlots::default(),
            },
        }
    }
}

pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn app_name(mut self, name: &str) -> Self {
        self.ci.app_name = name.to_string();
        self
    }

    pub fn app_version(mut self, version: u32) -> Self {
        self.ci.app_version = version;
        self
    }

    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.ci.enable_validation = enable;
        self
    }

    pub fn instance_extension(mut self, name: &std::ffi::CStr) -> Self {
        self.ci.instance_extensions.push(name.to_owned());
        self
    }

    pub fn gpu_preference(mut self, pref: GpuPreference) -> Self {
        self.ci.gpu_preference = pref;
        self
    }

    pub fn physical_device(mut self, pdev: ash::vk::PhysicalDevice) -> Self {
        self.ci.physical_device = Some(pdev);
        self
    }

    pub fn surface(mut self, surface: ash::vk::SurfaceKHR) -> Self {
        self.ci.surface = Some(surface);
        self
    }

    pub fn device_init_callback(
        mut self,
        cb: std::sync::Arc<dyn Fn(ash::vk::PhysicalDevice) -> Vec<std::ffi::CString> + Send + Sync>,
    ) -> Self {
        self.ci.device_init_callback = Some(cb);
        self
    }

    pub fn frames_in_flight(mut self, count: u32) -> Self {
        self.ci.frames_in_flight = count;
        self
    }

    pub fn bind_slots(mut self, slots: BindSlots) -> Self {
        self.ci.bind_slots = slots;
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}

/// The public sleet context
///
/// This is the top level handle that all operations are threaded
/// through. It wraps the internal Renderer, which holds the Vulkan
/// device, the pipeline cache, the bind pool and the per-frame
/// state.
pub struct Sleet {
    s_rend: Renderer,
}

impl Sleet {
    /// Create a new sleet context
    ///
    /// This brings up the Vulkan instance and device, the pipeline
    /// cache, the process-wide bind pool and the stock textures.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        if info.frames_in_flight == 0 {
            log::error!("frames_in_flight must be at least 1");
            return Err(SleetError::INVALID_PARAMETER);
        }

        Ok(Self {
            s_rend: Renderer::new(info)?,
        })
    }

    /// Register the calling thread for command recording
    pub fn thread_init(&self) -> Result<()> {
        self.s_rend.dev().thread_init()
    }

    /// Unregister the calling thread
    pub fn thread_shutdown(&self) {
        self.s_rend.dev().thread_shutdown();
    }

    /// Get a Future observing the submission state of the calling
    /// thread's most recent command slot.
    pub fn cmd_future_get(&self) -> Result<Future> {
        self.s_rend.dev().future_get()
    }

    // ------------------------------------------------------------------
    // resource creation
    // ------------------------------------------------------------------

    pub fn create_texture(&mut self, info: &TextureInfo, data: Option<&[u8]>) -> Result<Texture> {
        Texture::new(self.s_rend.dev_arc(), info, data)
    }

    /// Destroy a texture
    ///
    /// This is idempotent. The GPU objects are attached to the
    /// active command slot when one is recording and survive until
    /// its fence signals.
    pub fn destroy_texture(&mut self, tex: &Texture) {
        tex.destroy();
    }

    /// Populate the mip chain of a `GEN_MIPS` texture by blitting
    /// each level from the one above it.
    pub fn generate_mips(&mut self, tex: &Texture) -> Result<()> {
        tex.generate_mips()
    }

    pub fn create_buffer(
        &mut self,
        data: Option<&[u8]>,
        count: usize,
        stride: usize,
        btype: BufType,
        buse: BufUse,
    ) -> Result<Buffer> {
        Buffer::new(self.s_rend.dev_arc(), data, count, stride, btype, buse)
    }

    /// Update the contents of a dynamic buffer
    pub fn buffer_set(&mut self, buf: &Buffer, data: &[u8]) -> Result<()> {
        buf.set(data)
    }

    pub fn destroy_buffer(&mut self, buf: &Buffer) {
        buf.destroy();
    }

    pub fn create_mesh(
        &mut self,
        fmt: &VertexFormat,
        vert_data: &[u8],
        vert_count: u32,
        index_data: Option<&[u8]>,
        index_count: u32,
    ) -> Result<Mesh> {
        Mesh::new(
            self.s_rend.dev_arc(),
            self.s_rend.pipe_cache(),
            fmt,
            vert_data,
            vert_count,
            index_data,
            index_count,
        )
    }

    /// Create a mesh as a view over externally owned buffers
    ///
    /// The mesh will not destroy the buffers when it is destroyed.
    pub fn create_mesh_external(
        &mut self,
        fmt: &VertexFormat,
        vert_buf: &Buffer,
        vert_count: u32,
        index_buf: Option<&Buffer>,
        index_count: u32,
    ) -> Result<Mesh> {
        Mesh::new_external(
            self.s_rend.pipe_cache(),
            fmt,
            vert_buf,
            vert_count,
            index_buf,
            index_count,
        )
    }

    pub fn destroy_mesh(&mut self, mesh: &Mesh) {
        mesh.destroy();
    }

    pub fn create_shader(&mut self, info: ShaderInfo) -> Result<Shader> {
        Shader::new(self.s_rend.dev_arc(), info)
    }

    pub fn create_material(&mut self, shader: &Shader, state: &MaterialStateInfo) -> Result<Material> {
        Material::new(
            self.s_rend.dev_arc(),
            self.s_rend.pipe_cache(),
            self.s_rend.bind_pool(),
            self.s_rend.pending(),
            self.s_rend.stock_textures(),
            shader,
            state,
        )
    }

    pub fn destroy_material(&mut self, mat: &Material) {
        mat.destroy();
    }

    pub fn create_compute(&mut self, shader: &Shader) -> Result<ComputeProgram> {
        ComputeProgram::new(self.s_rend.dev_arc(), shader)
    }

    pub fn destroy_compute(&mut self, prog: &ComputeProgram) {
        prog.destroy();
    }

    /// Dispatch a compute program
    ///
    /// Bound textures are transitioned automatically and the results
    /// are made visible to the following graphics or compute work.
    pub fn compute_execute(&mut self, prog: &ComputeProgram, x: u32, y: u32, z: u32) -> Result<()> {
        prog.execute(&self.s_rend, x, y, z)
    }

    /// Dispatch a compute program with GPU-provided group counts
    pub fn compute_execute_indirect(&mut self, prog: &ComputeProgram, args: &Buffer) -> Result<()> {
        prog.execute_indirect(&self.s_rend, args)
    }

    // ------------------------------------------------------------------
    // frame loop
    // ------------------------------------------------------------------

    pub fn frame_begin(&mut self) -> Result<()> {
        self.s_rend.frame_begin()
    }

    pub fn frame_end(&mut self) -> Result<()> {
        self.s_rend.frame_end()
    }

    pub fn begin_pass(
        &mut self,
        color: Option<&Texture>,
        depth: Option<&Texture>,
        resolve: Option<&Texture>,
        clear_color: Option<[f32; 4]>,
        clear_depth: Option<f32>,
        clear_stencil: Option<u32>,
    ) -> Result<()> {
        self.s_rend
            .begin_pass(color, depth, resolve, clear_color, clear_depth, clear_stencil)
    }

    pub fn end_pass(&mut self) -> Result<()> {
        self.s_rend.end_pass()
    }

    /// Sort, batch and record a render list into the current pass
    pub fn draw(
        &mut self,
        list: &mut RenderList,
        system_data: &[u8],
        instance_multiplier: u32,
    ) -> Result<()> {
        self.s_rend.draw(list, system_data, instance_multiplier)
    }

    /// Render a fullscreen triangle into `target` using `mat`
    pub fn blit(&mut self, mat: &Material, target: &Texture, bounds: Option<Rect<i32>>) -> Result<()> {
        self.s_rend.blit(mat, target, bounds)
    }

    pub fn set_global_constants(&mut self, slot: u32, buf: Option<&Buffer>) -> Result<()> {
        self.s_rend.set_global_constants(slot, buf)
    }

    pub fn set_global_texture(&mut self, slot: u32, tex: Option<&Texture>) -> Result<()> {
        self.s_rend.set_global_texture(slot, tex)
    }

    /// Number of layout transitions parked for the next begin_pass
    ///
    /// Deduplicated per texture, diagnostics only.
    pub fn pending_transition_count(&self) -> usize {
        self.s_rend.pending().lock().unwrap().len()
    }

    /// GPU time of the most recently completed frame, in ms
    pub fn get_gpu_time_ms(&self) -> f32 {
        self.s_rend.get_gpu_time_ms()
    }

    // ------------------------------------------------------------------
    // surface
    // ------------------------------------------------------------------

    /// Acquire the next swapchain image
    ///
    /// Returns NEEDS_RESIZE when the swapchain is out of date, and
    /// SURFACE_LOST when the surface itself went away.
    pub fn surface_next_tex(&mut self) -> Result<Texture> {
        self.s_rend.surface_next_tex()
    }

    pub fn surface_resize(&mut self) -> Result<()> {
        self.s_rend.surface_resize()
    }

    pub fn surface_present(&mut self) -> Result<()> {
        self.s_rend.surface_present()
    }
}
