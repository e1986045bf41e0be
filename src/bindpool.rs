// The process-wide bind pool
//
// One contiguous slab of binding slots. Materials rent a range of
// consecutive slots at creation, seeded from shader reflection, and
// return it through the deferred destroy path so in-flight
// descriptor writes never read freed entries. The free list is
// first-fit with coalescing.
//
// Austin Shafer - 2024

use crate::buffer::Buffer;
use crate::shader::BindInfo;
use crate::texture::Texture;
use utils::log;

use std::sync::{Mutex, MutexGuard};

/// Initial slab capacity, in slots
const BIND_POOL_INITIAL: u32 = 64;

/// What a slot currently points at
///
/// Slots start out empty. The handles here are the library's
/// refcounted handles, so a bound resource's CPU bookkeeping stays
/// alive as long as a material references it even after an explicit
/// destroy retired the GPU objects.
#[derive(Clone)]
pub(crate) enum BindResource {
    None,
    Buffer(Buffer),
    Texture(Texture),
}

/// One rented binding slot
pub(crate) struct BindSlot {
    /// The reflection descriptor this slot was seeded from
    pub(crate) bs_bind: Option<BindInfo>,
    pub(crate) bs_res: BindResource,
}

pub(crate) struct BindPoolInternal {
    pub(crate) bp_slots: Vec<BindSlot>,
    /// (start, count) of unrented runs, kept sorted by start
    bp_free: Vec<(u32, u32)>,
}

pub(crate) struct BindPool {
    bp_internal: Mutex<BindPoolInternal>,
}

impl BindPool {
    pub(crate) fn new() -> Self {
        Self {
            bp_internal: Mutex::new(BindPoolInternal {
                bp_slots: Vec::new(),
                bp_free: Vec::new(),
            }),
        }
    }

    /// Rent `count` consecutive slots, returning the start index
    ///
    /// First fit over the free list. The slab doubles when no run is
    /// large enough.
    pub(crate) fn alloc(&self, count: u32) -> u32 {
        let mut internal = self.bp_internal.lock().unwrap();
        internal.alloc(count)
    }

    /// Return a rented range
    ///
    /// Adjacent free runs are merged so the slab does not fragment
    /// into single-slot confetti.
    pub(crate) fn free(&self, start: u32, count: u32) {
        let mut internal = self.bp_internal.lock().unwrap();
        internal.free(start, count);
    }

    /// Hold the pool lock across a sequence of slot reads
    pub(crate) fn lock(&self) -> MutexGuard<BindPoolInternal> {
        self.bp_internal.lock().unwrap()
    }

    pub(crate) fn set_slot(&self, idx: u32, bind: Option<BindInfo>, res: BindResource) {
        let mut internal = self.bp_internal.lock().unwrap();
        let slot = &mut internal.bp_slots[idx as usize];
        if let Some(b) = bind {
            slot.bs_bind = Some(b);
        }
        slot.bs_res = res;
    }

    pub(crate) fn set_resource(&self, idx: u32, res: BindResource) {
        let mut internal = self.bp_internal.lock().unwrap();
        internal.bp_slots[idx as usize].bs_res = res;
    }

    #[cfg(test)]
    pub(crate) fn free_ranges(&self) -> Vec<(u32, u32)> {
        self.bp_internal.lock().unwrap().bp_free.clone()
    }
}

impl BindPoolInternal {
    fn alloc(&mut self, count: u32) -> u32 {
        if count == 0 {
            log::error!("Allocating an empty bind range");
            return 0;
        }

        // First fit
        for i in 0..self.bp_free.len() {
            let (start, run) = self.bp_free[i];
            if run >= count {
                if run == count {
                    self.bp_free.remove(i);
                } else {
                    self.bp_free[i] = (start + count, run - count);
                }
                for s in start..start + count {
                    self.bp_slots[s as usize].bs_bind = None;
                    self.bp_slots[s as usize].bs_res = BindResource::None;
                }
                return start;
            }
        }

        // Nothing fits, grow the slab
        let old_len = self.bp_slots.len() as u32;
        let grow = (old_len.max(BIND_POOL_INITIAL)).max(count);
        for _ in 0..grow {
            self.bp_slots.push(BindSlot {
                bs_bind: None,
                bs_res: BindResource::None,
            });
        }
        self.free(old_len, grow);

        self.alloc(count)
    }

    fn free(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }

        // Drop the resource references eagerly, only the range
        // bookkeeping survives
        for s in start..start + count {
            self.bp_slots[s as usize].bs_bind = None;
            self.bp_slots[s as usize].bs_res = BindResource::None;
        }

        let pos = self
            .bp_free
            .iter()
            .position(|&(s, _)| s > start)
            .unwrap_or(self.bp_free.len());
        self.bp_free.insert(pos, (start, count));

        // Coalesce with the neighbors
        if pos + 1 < self.bp_free.len() {
            let (s, c) = self.bp_free[pos];
            let (next_s, next_c) = self.bp_free[pos + 1];
            if s + c == next_s {
                self.bp_free[pos] = (s, c + next_c);
                self.bp_free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_s, prev_c) = self.bp_free[pos - 1];
            let (s, c) = self.bp_free[pos];
            if prev_s + prev_c == s {
                self.bp_free[pos - 1] = (prev_s, prev_c + c);
                self.bp_free.remove(pos);
            }
        }
    }

    pub(crate) fn slot(&self, idx: u32) -> &BindSlot {
        &self.bp_slots[idx as usize]
    }
}
