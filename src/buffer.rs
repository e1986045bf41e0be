// GPU buffers and the per-frame bump allocator
//
// Buffers come in two flavors: static device-local buffers filled
// through a staging upload, and dynamic host-mapped buffers. A
// dynamic buffer that keeps getting rewritten migrates onto a small
// ring of host-visible slots so in-flight GPU reads always see the
// copy that was current when their draw was recorded.
//
// Austin Shafer - 2024

use ash::vk;

use crate::deletion_queue::DestroyItem;
use crate::device::Device;
use crate::{Result, SleetError};
use utils::log;

use std::sync::{Arc, RwLock};

/// What the buffer binds as
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufType {
    Vertex,
    Index,
    Constant,
    Storage,
}

bitflags::bitflags! {
    /// How the buffer will be used
    pub struct BufUse: u32 {
        const STATIC = 1;
        const DYNAMIC = 2;
        const COMPUTE_READ = 4;
        const COMPUTE_WRITE = 8;
    }
}

/// One host-visible (or device-local) allocation backing a Buffer
pub(crate) struct BufSlot {
    pub(crate) bs_buf: vk::Buffer,
    pub(crate) bs_mem: vk::DeviceMemory,
    /// Persistently mapped pointer. Null for device-local slots.
    bs_mapped: *mut u8,
}

pub(crate) struct BufferInternal {
    b_dev: Arc<Device>,
    /// One slot until the buffer migrates to a dynamic ring, then
    /// up to frames_in_flight of them.
    pub(crate) b_slots: Vec<BufSlot>,
    pub(crate) b_active: usize,
    pub(crate) b_size: u64,
    pub(crate) b_type: BufType,
    pub(crate) b_use: BufUse,
    b_write_count: u64,
    b_destroyed: bool,
}

unsafe impl Send for BufferInternal {}
unsafe impl Sync for BufferInternal {}

/// A GPU buffer handle
#[derive(Clone)]
pub struct Buffer {
    pub(crate) b_internal: Arc<RwLock<BufferInternal>>,
}

fn usage_for(btype: BufType, buse: BufUse) -> vk::BufferUsageFlags {
    let mut usage = match btype {
        BufType::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
        BufType::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        BufType::Constant => vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufType::Storage => {
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER
        }
    };

    if buse.intersects(BufUse::COMPUTE_READ | BufUse::COMPUTE_WRITE) {
        usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    usage |= vk::BufferUsageFlags::TRANSFER_DST;

    usage
}

/// The access mask readers of this buffer type will use
fn read_access_for(btype: BufType) -> vk::AccessFlags {
    match btype {
        BufType::Vertex => vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        BufType::Index => vk::AccessFlags::INDEX_READ,
        BufType::Constant => vk::AccessFlags::UNIFORM_READ,
        BufType::Storage => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
    }
}

fn read_stage_for(btype: BufType) -> vk::PipelineStageFlags {
    match btype {
        BufType::Vertex | BufType::Index => vk::PipelineStageFlags::VERTEX_INPUT,
        BufType::Constant | BufType::Storage => {
            vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER
        }
    }
}

impl Buffer {
    /// Create a new buffer of `count * stride` bytes
    ///
    /// Static buffers with initial data are uploaded through a
    /// staging buffer recorded on the calling thread's command slot,
    /// neither the caller nor the GPU is blocked. Dynamic buffers
    /// are host-visible and stay mapped for their whole lifetime.
    pub(crate) fn new(
        dev: Arc<Device>,
        data: Option<&[u8]>,
        count: usize,
        stride: usize,
        btype: BufType,
        buse: BufUse,
    ) -> Result<Buffer> {
        let size = (count * stride) as u64;
        if size == 0 {
            log::error!("Refusing to create an empty buffer");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if let Some(d) = data {
            if d.len() as u64 > size {
                log::error!("Initial data does not fit the buffer");
                return Err(SleetError::INVALID_PARAMETER);
            }
        }

        let usage = usage_for(btype, buse);
        let dynamic = buse.contains(BufUse::DYNAMIC);

        let slot = if dynamic {
            let (buf, mem) = dev.create_buffer_with_size(
                usage,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                size,
            )?;
            let mapped = unsafe {
                dev.dev
                    .map_memory(mem, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .or(Err(SleetError::DEVICE_ERROR))? as *mut u8
            };
            if let Some(d) = data {
                unsafe { std::ptr::copy_nonoverlapping(d.as_ptr(), mapped, d.len()) };
            }
            BufSlot {
                bs_buf: buf,
                bs_mem: mem,
                bs_mapped: mapped,
            }
        } else {
            let (buf, mem) = dev.create_buffer_with_size(
                usage,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                size,
            )?;

            if let Some(d) = data {
                if let Err(e) = Self::upload_static(&dev, buf, d, btype) {
                    unsafe {
                        dev.dev.destroy_buffer(buf, None);
                        dev.dev.free_memory(mem, None);
                    }
                    return Err(e);
                }
            }
            BufSlot {
                bs_buf: buf,
                bs_mem: mem,
                bs_mapped: std::ptr::null_mut(),
            }
        };

        Ok(Buffer {
            b_internal: Arc::new(RwLock::new(BufferInternal {
                b_dev: dev,
                b_slots: vec![slot],
                b_active: 0,
                b_size: size,
                b_type: btype,
                b_use: buse,
                b_write_count: 0,
                b_destroyed: false,
            })),
        })
    }

    /// Record a staging copy of `data` into `buf`
    ///
    /// The staging buffer rides the active command slot's destroy
    /// list so it survives until the copy's fence signals.
    fn upload_static(dev: &Arc<Device>, buf: vk::Buffer, data: &[u8], btype: BufType) -> Result<()> {
        let (staging, staging_mem) = dev.create_buffer_with_size(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data.len() as u64,
        )?;
        dev.update_memory(staging_mem, 0, data)?;

        let cbuf = dev.cmd_acquire()?;
        unsafe {
            let region = vk::BufferCopy::builder().size(data.len() as u64).build();
            dev.dev.cmd_copy_buffer(cbuf, staging, buf, &[region]);

            let barrier = vk::BufferMemoryBarrier::builder()
                .buffer(buf)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(read_access_for(btype))
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build();
            dev.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::TRANSFER,
                read_stage_for(btype),
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }

        dev.defer_destroy(DestroyItem::Buffer(staging))?;
        dev.defer_destroy(DestroyItem::Memory(staging_mem))?;
        dev.cmd_release()?;

        Ok(())
    }

    /// Update the contents of a dynamic buffer
    ///
    /// The first rewrite migrates the buffer onto a ring of up to
    /// frames_in_flight host-visible slots. Each update advances to
    /// the next slot, so a concurrent in-flight GPU read keeps the
    /// copy that was active when its draw was recorded.
    pub(crate) fn set(&self, data: &[u8]) -> Result<()> {
        let mut internal = self.b_internal.write().unwrap();

        if !internal.b_use.contains(BufUse::DYNAMIC) {
            log::error!("buffer_set is only valid for dynamic buffers");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if data.len() as u64 > internal.b_size {
            log::error!("buffer_set data does not fit the buffer");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if internal.b_destroyed {
            return Err(SleetError::INVALID_PARAMETER);
        }

        let ring_len = internal.b_dev.frames_in_flight as usize;
        if internal.b_write_count >= 1 && internal.b_slots.len() == 1 && ring_len > 1 {
            // Migrate to the dynamic ring
            let usage = usage_for(internal.b_type, internal.b_use);
            for _ in 1..ring_len {
                let (buf, mem) = internal.b_dev.create_buffer_with_size(
                    usage,
                    vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    internal.b_size,
                )?;
                let mapped = unsafe {
                    internal
                        .b_dev
                        .dev
                        .map_memory(mem, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                        .or(Err(SleetError::DEVICE_ERROR))? as *mut u8
                };
                internal.b_slots.push(BufSlot {
                    bs_buf: buf,
                    bs_mem: mem,
                    bs_mapped: mapped,
                });
            }
        }

        if internal.b_slots.len() > 1 {
            internal.b_active = (internal.b_active + 1) % internal.b_slots.len();
        }

        let active = internal.b_active;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                internal.b_slots[active].bs_mapped,
                data.len(),
            );
        }
        internal.b_write_count += 1;

        Ok(())
    }

    /// The vk::Buffer of the currently active slot
    pub(crate) fn vk_current(&self) -> vk::Buffer {
        let internal = self.b_internal.read().unwrap();
        internal.b_slots[internal.b_active].bs_buf
    }

    pub(crate) fn size(&self) -> u64 {
        self.b_internal.read().unwrap().b_size
    }

    pub(crate) fn buf_type(&self) -> BufType {
        self.b_internal.read().unwrap().b_type
    }

    pub(crate) fn buf_use(&self) -> BufUse {
        self.b_internal.read().unwrap().b_use
    }

    /// Is this handle backed by mapped host memory?
    pub fn is_mapped(&self) -> bool {
        let internal = self.b_internal.read().unwrap();
        !internal.b_slots[internal.b_active].bs_mapped.is_null()
    }

    /// How many host-visible slots back this buffer
    ///
    /// One until a dynamic buffer's first rewrite migrates it onto
    /// the frames-in-flight ring.
    pub fn ring_len(&self) -> usize {
        self.b_internal.read().unwrap().b_slots.len()
    }

    /// Destroy the buffer
    ///
    /// Idempotent. GPU objects are deferred onto the active command
    /// slot when one is recording.
    pub fn destroy(&self) {
        self.b_internal.write().unwrap().destroy();
    }
}

impl BufferInternal {
    fn destroy(&mut self) {
        if self.b_destroyed {
            return;
        }
        self.b_destroyed = true;

        // The slot entries are kept readable: render items and bind
        // pool slots recorded against this buffer may still be
        // resolved this frame, the handles stay valid until the
        // owning fence signals.
        for slot in self.b_slots.iter() {
            self.b_dev.destroy_or_defer(DestroyItem::Buffer(slot.bs_buf));
            self.b_dev.destroy_or_defer(DestroyItem::Memory(slot.bs_mem));
        }
    }
}

impl Drop for BufferInternal {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ----------------------------------------------------------------------
// bump allocator
// ----------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BumpKind {
    Const,
    Storage,
}

struct BumpBuf {
    bb_buf: vk::Buffer,
    bb_mem: vk::DeviceMemory,
    bb_mapped: *mut u8,
    bb_size: u64,
}

/// A frame-scoped linear allocator
///
/// Hands out (buffer, offset) pairs aligned to the device's minimum
/// UBO/SSBO offset alignment. When the main buffer runs out the
/// request is satisfied from a one-off overflow buffer and the
/// high-water mark keeps growing, so the next reset sizes the main
/// buffer to fit the whole frame again.
pub(crate) struct BumpAlloc {
    ba_kind: BumpKind,
    ba_main: Option<BumpBuf>,
    ba_used: u64,
    ba_hwm: u64,
    ba_overflow: Vec<(vk::Buffer, vk::DeviceMemory)>,
}

unsafe impl Send for BumpAlloc {}

/// Minimum size of the main bump buffer
const BUMP_MIN_SIZE: u64 = 4096;

/// The offset the next bump allocation lands at
pub(crate) fn bump_offset(used: u64, align: u64) -> u64 {
    (used + align - 1) / align * align
}

/// The main buffer size the frame after a high-water mark of `hwm`
/// will start with
pub(crate) fn bump_regrow_size(hwm: u64) -> u64 {
    BUMP_MIN_SIZE.max(hwm + hwm / 4)
}

impl BumpAlloc {
    pub(crate) fn new_const() -> Self {
        Self::new(BumpKind::Const)
    }

    pub(crate) fn new_storage() -> Self {
        Self::new(BumpKind::Storage)
    }

    fn new(kind: BumpKind) -> Self {
        Self {
            ba_kind: kind,
            ba_main: None,
            ba_used: 0,
            ba_hwm: 0,
            ba_overflow: Vec::new(),
        }
    }

    fn usage(&self) -> vk::BufferUsageFlags {
        match self.ba_kind {
            BumpKind::Const => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BumpKind::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        }
    }

    fn align(&self, dev: &Device) -> u64 {
        match self.ba_kind {
            BumpKind::Const => dev.dev_features.vkc_min_ubo_align,
            BumpKind::Storage => dev.dev_features.vkc_min_ssbo_align,
        }
        .max(1)
    }

    fn create_buf(&self, dev: &Device, size: u64) -> Result<BumpBuf> {
        let (buf, mem) = dev.create_buffer_with_size(
            self.usage(),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            size,
        )?;
        let mapped = unsafe {
            dev.dev
                .map_memory(mem, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .or(Err(SleetError::DEVICE_ERROR))? as *mut u8
        };
        Ok(BumpBuf {
            bb_buf: buf,
            bb_mem: mem,
            bb_mapped: mapped,
            bb_size: size,
        })
    }

    /// Write `data` into this frame's bump area
    ///
    /// Returns the (buffer, offset) the data landed at.
    pub(crate) fn alloc_write(&mut self, dev: &Device, data: &[u8]) -> Result<(vk::Buffer, u64)> {
        let align = self.align(dev);
        let len = data.len() as u64;

        if self.ba_main.is_none() {
            let size = BUMP_MIN_SIZE.max(len);
            self.ba_main = Some(self.create_buf(dev, size)?);
        }

        let offset = bump_offset(self.ba_used, align);
        self.ba_used = offset + len;
        self.ba_hwm = self.ba_hwm.max(self.ba_used);

        let main = self.ba_main.as_ref().unwrap();
        if offset + len <= main.bb_size {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    main.bb_mapped.offset(offset as isize),
                    data.len(),
                );
            }
            return Ok((main.bb_buf, offset));
        }

        // The main buffer is full. Satisfy this request from a
        // one-off overflow buffer, retired at the next reset.
        let overflow = self.create_buf(dev, len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), overflow.bb_mapped, data.len());
        }
        self.ba_overflow.push((overflow.bb_buf, overflow.bb_mem));
        Ok((overflow.bb_buf, 0))
    }

    /// Start a fresh frame
    ///
    /// The caller guarantees the owning slot's fence has signaled.
    /// Overflow buffers from the previous frame are destroyed, and
    /// the main buffer is regrown when the last frame outgrew it.
    pub(crate) fn reset(&mut self, dev: &Device) {
        unsafe {
            for (buf, mem) in self.ba_overflow.drain(..) {
                dev.dev.destroy_buffer(buf, None);
                dev.dev.free_memory(mem, None);
            }

            let needs_regrow = match self.ba_main.as_ref() {
                Some(main) => self.ba_hwm > main.bb_size,
                None => false,
            };
            if needs_regrow {
                let main = self.ba_main.take().unwrap();
                dev.dev.destroy_buffer(main.bb_buf, None);
                dev.dev.free_memory(main.bb_mem, None);

                // Allocation failure here just means we fall back to
                // overflow buffers next frame
                self.ba_main = self.create_buf(dev, bump_regrow_size(self.ba_hwm)).ok();
            }
        }

        self.ba_used = 0;
        self.ba_hwm = 0;
    }

    pub(crate) fn used(&self) -> u64 {
        self.ba_used
    }

    pub(crate) fn high_water_mark(&self) -> u64 {
        self.ba_hwm
    }

    pub(crate) fn main_size(&self) -> u64 {
        self.ba_main.as_ref().map(|m| m.bb_size).unwrap_or(0)
    }

    pub(crate) fn overflow_count(&self) -> usize {
        self.ba_overflow.len()
    }

    pub(crate) fn destroy(&mut self, dev: &ash::Device) {
        unsafe {
            for (buf, mem) in self.ba_overflow.drain(..) {
                dev.destroy_buffer(buf, None);
                dev.free_memory(mem, None);
            }
            if let Some(main) = self.ba_main.take() {
                dev.destroy_buffer(main.bb_buf, None);
                dev.free_memory(main.bb_mem, None);
            }
        }
    }
}
