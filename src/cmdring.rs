// Per thread command buffer rings
//
// Each recording thread owns a command pool and a small ring of
// command buffer slots. A slot carries the fence protecting it, a
// destroy list for resources retired while it was recording, and
// the frame-scoped bump allocators. Acquire/release is reentrant
// and submission happens on the outermost release.
//
// Austin Shafer - 2024

use ash::vk;

use crate::bindpool::BindPool;
use crate::buffer::BumpAlloc;
use crate::deletion_queue::{DestroyItem, DestroyList};
use crate::device::Device;
use crate::{Result, SleetError, MAX_THREADS};
use utils::log;

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Ring depth per thread. Acquire blocks on the oldest slot's fence
/// once all of these are in flight.
pub(crate) const RING_SIZE: usize = 4;

/// How many descriptors a slot's fallback pool holds. Only used on
/// devices without push descriptors.
const DESC_POOL_SETS: u32 = 256;

thread_local! {
    /// (device id, thread table index) pairs for every Device this
    /// thread has called thread_init on. Keyed by id so one thread
    /// can drive more than one context.
    static THREAD_SLOTS: RefCell<Vec<(u64, usize)>> = RefCell::new(Vec::new());
}

fn lookup_thread_slot(dev_id: u64) -> Option<usize> {
    THREAD_SLOTS.with(|slots| {
        slots
            .borrow()
            .iter()
            .find(|(id, _)| *id == dev_id)
            .map(|(_, idx)| *idx)
    })
}

/// Fence and generation shared with Futures
///
/// The generation is the sole authority on whether a slot has been
/// reused: a Future whose generation disagrees with the slot's knows
/// its submission has long since completed.
pub(crate) struct SlotSync {
    pub(crate) ss_fence: vk::Fence,
    pub(crate) ss_generation: AtomicU64,
}

unsafe impl Send for SlotSync {}
unsafe impl Sync for SlotSync {}

impl SlotSync {
    /// Has the slot moved past the generation a future captured?
    ///
    /// A retired generation means the destroy list has run and the
    /// submission is long done, the fence must not be consulted.
    pub(crate) fn retired(&self, generation: u64) -> bool {
        self.ss_generation.load(Ordering::Acquire) != generation
    }
}

/// A completion handle for one command ring submission
///
/// `check` never blocks. `wait` blocks on the slot's fence only as
/// long as the generations still agree.
pub struct Future {
    f_dev: Arc<Device>,
    f_sync: Arc<SlotSync>,
    f_generation: u64,
}

impl Future {
    /// Has the submission this future observes completed?
    pub fn check(&self) -> bool {
        if self.f_sync.retired(self.f_generation) {
            // The slot was reused, our submission is long done
            return true;
        }

        unsafe {
            self.f_dev
                .dev
                .get_fence_status(self.f_sync.ss_fence)
                .unwrap_or(true)
        }
    }

    /// Block until the submission has completed
    pub fn wait(&self) {
        if self.f_sync.retired(self.f_generation) {
            return;
        }

        unsafe {
            self.f_dev
                .dev
                .wait_for_fences(&[self.f_sync.ss_fence], true, std::u64::MAX)
                .expect("Could not wait for command slot fence");
        }
    }
}

/// One entry in the ring
pub(crate) struct CmdSlot {
    /// Allocated lazily from the ring's pool
    cs_cbuf: vk::CommandBuffer,
    /// Has this slot been submitted and not yet reclaimed
    cs_live: bool,
    cs_sync: Arc<SlotSync>,
    /// Resources to be destroyed once cs_sync's fence signals
    pub(crate) cs_destroy: DestroyList,
    pub(crate) cs_const_bump: BumpAlloc,
    pub(crate) cs_storage_bump: BumpAlloc,
    /// Fallback descriptor pool for devices without push descriptors
    cs_desc_pool: vk::DescriptorPool,
}

/// A per thread ring of command slots
pub(crate) struct CmdRing {
    cr_pool: vk::CommandPool,
    cr_slots: Vec<CmdSlot>,
    /// Index of the slot currently recording, if any
    cr_active: Option<usize>,
    /// Reentrancy count for cmd_acquire
    cr_refcount: u32,
    /// Next slot to hand out, round robin so the wait in acquire
    /// always lands on the oldest submission
    cr_next: usize,
    /// The most recently submitted slot
    cr_last: Option<usize>,
}

impl CmdRing {
    fn new(dev: &Device) -> Result<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(dev.graphics_queue.q_family);

        let pool = unsafe {
            dev.dev
                .create_command_pool(&pool_create_info, None)
                .or(Err(SleetError::DEVICE_ERROR))?
        };

        let mut slots = Vec::with_capacity(RING_SIZE);
        for _ in 0..RING_SIZE {
            let fence = unsafe {
                dev.dev
                    .create_fence(
                        &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
                        None,
                    )
                    .or(Err(SleetError::DEVICE_ERROR))?
            };

            slots.push(CmdSlot {
                cs_cbuf: vk::CommandBuffer::null(),
                cs_live: false,
                cs_sync: Arc::new(SlotSync {
                    ss_fence: fence,
                    ss_generation: AtomicU64::new(0),
                }),
                cs_destroy: DestroyList::new(),
                cs_const_bump: BumpAlloc::new_const(),
                cs_storage_bump: BumpAlloc::new_storage(),
                cs_desc_pool: vk::DescriptorPool::null(),
            });
        }

        Ok(Self {
            cr_pool: pool,
            cr_slots: slots,
            cr_active: None,
            cr_refcount: 0,
            cr_next: 0,
            cr_last: None,
        })
    }

    /// Begin recording on this thread, entering the active slot
    ///
    /// Reentrant: nested acquires return the same command buffer and
    /// only bump the refcount. On the outermost acquire the next ring
    /// slot is claimed, waiting for its fence and draining its
    /// destroy list if it is still in flight.
    fn acquire(&mut self, dev: &Device) -> Result<vk::CommandBuffer> {
        if let Some(idx) = self.cr_active {
            self.cr_refcount += 1;
            return Ok(self.cr_slots[idx].cs_cbuf);
        }

        let idx = self.cr_next;
        self.reclaim_slot(dev, idx);

        let pool = self.cr_pool;
        let cbuf = {
            let slot = &mut self.cr_slots[idx];
            unsafe {
                if slot.cs_cbuf == vk::CommandBuffer::null() {
                    let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
                        .command_buffer_count(1)
                        .command_pool(pool)
                        .level(vk::CommandBufferLevel::PRIMARY);
                    slot.cs_cbuf = dev
                        .dev
                        .allocate_command_buffers(&cbuf_allocate_info)
                        .or(Err(SleetError::DEVICE_ERROR))?[0];
                } else {
                    dev.dev
                        .reset_command_buffer(
                            slot.cs_cbuf,
                            vk::CommandBufferResetFlags::RELEASE_RESOURCES,
                        )
                        .or(Err(SleetError::DEVICE_ERROR))?;
                }

                let record_info = vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                dev.dev
                    .begin_command_buffer(slot.cs_cbuf, &record_info)
                    .or(Err(SleetError::DEVICE_ERROR))?;
            }
            slot.cs_cbuf
        };

        self.cr_active = Some(idx);
        self.cr_refcount = 1;
        Ok(cbuf)
    }

    /// Wait for a slot's previous submission and recycle its state
    fn reclaim_slot(&mut self, dev: &Device, idx: usize) {
        let slot = &mut self.cr_slots[idx];

        if slot.cs_live {
            unsafe {
                dev.dev
                    .wait_for_fences(&[slot.cs_sync.ss_fence], true, std::u64::MAX)
                    .expect("Could not wait for command slot fence");
            }
            slot.cs_live = false;
            // The generation bump is what marks the destroy list as
            // having run for any outstanding Futures
            slot.cs_sync.ss_generation.fetch_add(1, Ordering::AcqRel);
            slot.cs_destroy.execute(&dev.dev, &dev.d_bind_pool);
        }

        slot.cs_const_bump.reset(dev);
        slot.cs_storage_bump.reset(dev);

        unsafe {
            dev.dev
                .reset_fences(&[slot.cs_sync.ss_fence])
                .expect("Could not reset command slot fence");
            if slot.cs_desc_pool != vk::DescriptorPool::null() {
                dev.dev
                    .reset_descriptor_pool(
                        slot.cs_desc_pool,
                        vk::DescriptorPoolResetFlags::empty(),
                    )
                    .unwrap();
            }
        }
    }

    /// End recording and submit on the outermost release
    fn release(
        &mut self,
        dev: &Device,
        wait_semas: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semas: &[vk::Semaphore],
    ) -> Result<Option<Future>> {
        let idx = match self.cr_active {
            Some(i) => i,
            None => return Err(SleetError::RECORDING_NOT_IN_PROGRESS),
        };

        self.cr_refcount -= 1;
        if self.cr_refcount > 0 {
            return Ok(None);
        }

        let sync = {
            let slot = &mut self.cr_slots[idx];
            unsafe {
                dev.dev
                    .end_command_buffer(slot.cs_cbuf)
                    .or(Err(SleetError::DEVICE_ERROR))?;

                let cbufs = [slot.cs_cbuf];
                let submit_info = [vk::SubmitInfo::builder()
                    .wait_semaphores(wait_semas)
                    .wait_dst_stage_mask(wait_stages)
                    .command_buffers(&cbufs)
                    .signal_semaphores(signal_semas)
                    .build()];

                // Serialize submission against other threads targeting
                // the same queue
                let queue = &dev.graphics_queue;
                let _guard = queue.q_lock.lock().unwrap();
                dev.dev
                    .queue_submit(queue.q_queue, &submit_info, slot.cs_sync.ss_fence)
                    .or(Err(SleetError::DEVICE_ERROR))?;
            }

            slot.cs_live = true;
            slot.cs_sync.clone()
        };

        self.cr_last = Some(idx);
        self.cr_active = None;
        self.cr_next = (idx + 1) % RING_SIZE;

        Ok(Some(Future {
            f_dev: dev.self_arc(),
            f_generation: sync.ss_generation.load(Ordering::Acquire),
            f_sync: sync,
        }))
    }

    /// A future for the active or most recently submitted slot
    fn future_get(&self, dev: &Device) -> Result<Future> {
        let idx = match self.cr_active.or(self.cr_last) {
            Some(i) => i,
            None => return Err(SleetError::RECORDING_NOT_IN_PROGRESS),
        };
        let slot = &self.cr_slots[idx];

        Ok(Future {
            f_dev: dev.self_arc(),
            f_sync: slot.cs_sync.clone(),
            f_generation: slot.cs_sync.ss_generation.load(Ordering::Acquire),
        })
    }

    /// Get the fallback descriptor pool for the active slot,
    /// creating it on first use.
    fn desc_pool(&mut self, dev: &Device) -> Result<vk::DescriptorPool> {
        let idx = match self.cr_active {
            Some(i) => i,
            None => return Err(SleetError::RECORDING_NOT_IN_PROGRESS),
        };
        let slot = &mut self.cr_slots[idx];

        if slot.cs_desc_pool == vk::DescriptorPool::null() {
            let sizes = [
                vk::DescriptorPoolSize::builder()
                    .ty(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(DESC_POOL_SETS)
                    .build(),
                vk::DescriptorPoolSize::builder()
                    .ty(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(DESC_POOL_SETS)
                    .build(),
                vk::DescriptorPoolSize::builder()
                    .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(DESC_POOL_SETS)
                    .build(),
                vk::DescriptorPoolSize::builder()
                    .ty(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(DESC_POOL_SETS)
                    .build(),
            ];
            let info = vk::DescriptorPoolCreateInfo::builder()
                .pool_sizes(&sizes)
                .max_sets(DESC_POOL_SETS);
            slot.cs_desc_pool = unsafe {
                dev.dev
                    .create_descriptor_pool(&info, None)
                    .or(Err(SleetError::DEVICE_ERROR))?
            };
        }

        Ok(slot.cs_desc_pool)
    }

    fn destroy(&mut self, dev: &ash::Device, pool: &BindPool) {
        unsafe {
            for slot in self.cr_slots.iter_mut() {
                if slot.cs_live {
                    dev.wait_for_fences(&[slot.cs_sync.ss_fence], true, std::u64::MAX)
                        .expect("Could not wait for command slot fence");
                    slot.cs_live = false;
                }
                // Invalidate any outstanding futures before the fence
                // goes away
                slot.cs_sync.ss_generation.fetch_add(1, Ordering::AcqRel);
                slot.cs_destroy.execute(dev, pool);
                slot.cs_const_bump.destroy(dev);
                slot.cs_storage_bump.destroy(dev);
                dev.destroy_fence(slot.cs_sync.ss_fence, None);
                if slot.cs_desc_pool != vk::DescriptorPool::null() {
                    dev.destroy_descriptor_pool(slot.cs_desc_pool, None);
                }
            }
            dev.destroy_command_pool(self.cr_pool, None);
        }
    }
}

/// The bounded table of recording threads
///
/// thread_init reserves an entry and caches its index in a thread
/// local, all later per-thread operations go straight to that entry.
pub(crate) struct ThreadTable {
    tt_entries: Vec<Mutex<Option<CmdRing>>>,
}

impl ThreadTable {
    pub(crate) fn new() -> Self {
        let mut entries = Vec::with_capacity(MAX_THREADS);
        for _ in 0..MAX_THREADS {
            entries.push(Mutex::new(None));
        }
        Self {
            tt_entries: entries,
        }
    }

    pub(crate) fn destroy(&self, dev: &ash::Device, pool: &BindPool) {
        for entry in self.tt_entries.iter() {
            if let Some(ring) = entry.lock().unwrap().as_mut() {
                ring.destroy(dev, pool);
            }
        }
    }
}

// The per thread entry points all live on Device so that callers can
// reach them through the one context handle they already have.
impl Device {
    /// Reserve a command ring for the calling thread
    pub fn thread_init(&self) -> Result<()> {
        if lookup_thread_slot(self.d_id).is_some() {
            return Ok(());
        }

        for (i, entry) in self.d_threads.tt_entries.iter().enumerate() {
            let mut slot = entry.lock().unwrap();
            if slot.is_none() {
                *slot = Some(CmdRing::new(self)?);
                THREAD_SLOTS.with(|slots| slots.borrow_mut().push((self.d_id, i)));
                return Ok(());
            }
        }

        log::error!("All {} recording thread slots are in use", MAX_THREADS);
        Err(SleetError::OUT_OF_MEMORY)
    }

    /// Release the calling thread's command ring
    ///
    /// Waits for all of the ring's submissions and runs their
    /// destroy lists.
    pub fn thread_shutdown(&self) {
        let idx = THREAD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            match slots.iter().position(|(id, _)| *id == self.d_id) {
                Some(pos) => Some(slots.remove(pos).1),
                None => None,
            }
        });
        let idx = match idx {
            Some(i) => i,
            None => return,
        };

        let mut slot = self.d_threads.tt_entries[idx].lock().unwrap();
        if let Some(ring) = slot.as_mut() {
            ring.destroy(&self.dev, &self.d_bind_pool);
        }
        *slot = None;
    }

    /// Run `f` with the calling thread's command ring
    pub(crate) fn with_ring<R>(&self, f: impl FnOnce(&mut CmdRing) -> Result<R>) -> Result<R> {
        let idx = match lookup_thread_slot(self.d_id) {
            Some(i) => i,
            None => {
                log::error!("thread_init was not called on this thread");
                return Err(SleetError::RECORDING_NOT_IN_PROGRESS);
            }
        };

        let mut entry = self.d_threads.tt_entries[idx].lock().unwrap();
        match entry.as_mut() {
            Some(ring) => f(ring),
            None => Err(SleetError::RECORDING_NOT_IN_PROGRESS),
        }
    }

    /// Begin (or reenter) command recording on this thread
    pub(crate) fn cmd_acquire(&self) -> Result<vk::CommandBuffer> {
        self.with_ring(|ring| ring.acquire(self))
    }

    /// End one level of recording, submitting on the outermost release
    pub(crate) fn cmd_release(&self) -> Result<Option<Future>> {
        self.with_ring(|ring| ring.release(self, &[], &[], &[]))
    }

    /// Outermost release with semaphores attached, used by the
    /// swapchain path.
    pub(crate) fn cmd_end_submit(
        &self,
        wait_semas: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semas: &[vk::Semaphore],
    ) -> Result<Future> {
        self.with_ring(|ring| {
            match ring.release(self, wait_semas, wait_stages, signal_semas)? {
                Some(f) => Ok(f),
                // end_submit must be the outermost release
                None => Err(SleetError::RECORDING_NOT_IN_PROGRESS),
            }
        })
    }

    /// A future observing this thread's current or last submission
    pub(crate) fn future_get(&self) -> Result<Future> {
        self.with_ring(|ring| ring.future_get(self))
    }

    /// Is a command buffer currently recording on this thread?
    pub(crate) fn is_recording(&self) -> bool {
        self.with_ring(|ring| Ok(ring.cr_active.is_some()))
            .unwrap_or(false)
    }

    /// Destroy `item` now, or once the active slot's fence signals
    ///
    /// If this thread is recording the item is attached to the
    /// active slot's destroy list. Otherwise it is destroyed
    /// immediately.
    pub(crate) fn destroy_or_defer(&self, item: DestroyItem) {
        let mut item = Some(item);

        // try_lock instead of lock: a destroy list being drained can
        // drop the last handle to a resource, which lands back here
        // on the same thread with the ring lock already held. The
        // drain context means the fence has signaled, so destroying
        // in place is safe.
        if let Some(idx) = lookup_thread_slot(self.d_id) {
            if let Ok(mut entry) = self.d_threads.tt_entries[idx].try_lock() {
                if let Some(ring) = entry.as_mut() {
                    if let Some(active) = ring.cr_active {
                        ring.cr_slots[active].cs_destroy.add(item.take().unwrap());
                        return;
                    }
                }
            }
        }

        // Not recording, destroy in place
        if let Some(item) = item.take() {
            let list = DestroyList::new();
            list.add(item);
            list.execute(&self.dev, &self.d_bind_pool);
        }
    }

    /// Attach `item` to the active slot's destroy list
    ///
    /// Unlike destroy_or_defer this fails if nothing is recording.
    pub(crate) fn defer_destroy(&self, item: DestroyItem) -> Result<()> {
        self.with_ring(|ring| {
            if let Some(idx) = ring.cr_active {
                ring.cr_slots[idx].cs_destroy.add(item);
                return Ok(());
            }
            Err(SleetError::RECORDING_NOT_IN_PROGRESS)
        })
    }

    /// Allocate constant data for this frame, returning the
    /// (buffer, offset) pair it was written at.
    pub(crate) fn bump_alloc_const(&self, data: &[u8]) -> Result<(vk::Buffer, u64)> {
        self.with_ring(|ring| {
            let idx = ring.cr_active.ok_or(SleetError::RECORDING_NOT_IN_PROGRESS)?;
            ring.cr_slots[idx].cs_const_bump.alloc_write(self, data)
        })
    }

    /// Allocate storage data for this frame
    pub(crate) fn bump_alloc_storage(&self, data: &[u8]) -> Result<(vk::Buffer, u64)> {
        self.with_ring(|ring| {
            let idx = ring.cr_active.ok_or(SleetError::RECORDING_NOT_IN_PROGRESS)?;
            ring.cr_slots[idx].cs_storage_bump.alloc_write(self, data)
        })
    }

    /// The fallback descriptor pool of the active slot
    pub(crate) fn slot_desc_pool(&self) -> Result<vk::DescriptorPool> {
        self.with_ring(|ring| ring.desc_pool(self))
    }

    /// Wait for every ring slot on every thread and run its destroy
    /// list. Only valid when nothing is recording, this is the
    /// shutdown path.
    pub(crate) fn drain_all_destroy_lists(&self) {
        for entry in self.d_threads.tt_entries.iter() {
            if let Some(ring) = entry.lock().unwrap().as_mut() {
                for idx in 0..RING_SIZE {
                    ring.reclaim_slot(self, idx);
                }
            }
        }
    }
}
