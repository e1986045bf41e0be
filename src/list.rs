// Render lists
//
// A frame-scoped queue of draw requests. Each item inlines the
// handles and sizes it needs so the source mesh and material can be
// destroyed right after add. Items are sorted by (queue, mesh,
// material, draw params) and consecutive compatible runs collapse
// into single instanced draws.
//
// Austin Shafer - 2024

use ash::vk;

use crate::buffer::Buffer;
use crate::material::Material;
use crate::mesh::Mesh;
use crate::shader::ShaderMeta;
use crate::{Result, SleetError};
use utils::log;

use std::sync::Arc;

/// One inlined draw request
pub(crate) struct RenderItem {
    /// Precomputed fast-compare key, ties broken on the full fields
    ri_sort_key: u128,

    // source handles
    pub(crate) ri_vbuf: vk::Buffer,
    pub(crate) ri_ibuf: vk::Buffer,
    pub(crate) ri_index_type: vk::IndexType,
    pub(crate) ri_vfmt_idx: u32,
    pub(crate) ri_mat_idx: u32,
    pub(crate) ri_bind_start: u32,
    pub(crate) ri_meta: Arc<ShaderMeta>,

    // sort identities
    pub(crate) ri_queue: u32,
    pub(crate) ri_mesh_id: usize,
    pub(crate) ri_mat_id: usize,

    // draw params
    pub(crate) ri_first_index: u32,
    pub(crate) ri_index_count: u32,
    pub(crate) ri_vertex_offset: i32,
    pub(crate) ri_vert_count: u32,
    pub(crate) ri_inst_stride: u32,
    pub(crate) ri_inst_count: u32,

    // offsets into the list blobs
    pub(crate) ri_inst_offset: usize,
    pub(crate) ri_mat_offset: usize,
    pub(crate) ri_mat_size: usize,
}

impl RenderItem {
    /// Pack the hot comparison fields, queue first and untruncated.
    /// Mesh and material identities lose their upper bits here, the
    /// comparator falls back to the full fields on key ties.
    fn compute_sort_key(&self) -> u128 {
        ((self.ri_queue as u128) << 96)
            | (((self.ri_mesh_id as u128) & 0xffff_ffff_ffff) << 48)
            | (((self.ri_mat_id as u128) & 0xffff_ffff) << 16)
            | ((self.ri_first_index as u128) & 0xffff)
    }

    pub(crate) fn inst_size(&self) -> usize {
        (self.ri_inst_stride as usize) * (self.ri_inst_count as usize)
    }

    /// Can `other` fold into the same instanced draw as self?
    pub(crate) fn batches_with(&self, other: &RenderItem) -> bool {
        self.ri_mesh_id == other.ri_mesh_id
            && self.ri_mat_id == other.ri_mat_id
            && self.ri_inst_stride == other.ri_inst_stride
            && self.ri_first_index == other.ri_first_index
            && self.ri_index_count == other.ri_index_count
            && self.ri_vertex_offset == other.ri_vertex_offset
            && self.ri_mat_offset == other.ri_mat_offset
    }
}

/// A reusable list of draw requests
pub struct RenderList {
    pub(crate) l_items: Vec<RenderItem>,
    /// Per-instance payloads, packed in item order after sort
    pub(crate) l_inst_data: Vec<u8>,
    /// Scratch blob the sorted payload is rebuilt into, swapped
    /// with l_inst_data so neither side reallocates every frame
    l_inst_scratch: Vec<u8>,
    /// Material $Global snapshots taken at add time
    pub(crate) l_mat_data: Vec<u8>,
    /// GPU buffers for the per-draw system and instance data, owned
    /// by the list and grown in place
    pub(crate) l_sysbuf: Option<Buffer>,
    pub(crate) l_instbuf: Option<Buffer>,
    pub(crate) l_needs_sort: bool,
}

impl RenderList {
    pub fn new() -> Self {
        Self {
            l_items: Vec::new(),
            l_inst_data: Vec::new(),
            l_inst_scratch: Vec::new(),
            l_mat_data: Vec::new(),
            l_sysbuf: None,
            l_instbuf: None,
            l_needs_sort: false,
        }
    }

    /// Queue a non-indexed draw of `mesh` with `material`
    pub fn add(
        &mut self,
        mesh: &Mesh,
        material: &Material,
        instance_data: Option<&[u8]>,
        stride: u32,
        count: u32,
    ) -> Result<()> {
        let vert_count = mesh.vert_count();
        self.add_common(mesh, material, instance_data, stride, count, 0, 0, 0, vert_count)
    }

    /// Queue an indexed draw of a range of `mesh`
    pub fn add_indexed(
        &mut self,
        mesh: &Mesh,
        material: &Material,
        instance_data: Option<&[u8]>,
        stride: u32,
        count: u32,
        first_index: u32,
        index_count: u32,
        vertex_offset: i32,
    ) -> Result<()> {
        self.add_common(
            mesh,
            material,
            instance_data,
            stride,
            count,
            first_index,
            index_count,
            vertex_offset,
            0,
        )
    }

    fn add_common(
        &mut self,
        mesh: &Mesh,
        material: &Material,
        instance_data: Option<&[u8]>,
        stride: u32,
        count: u32,
        first_index: u32,
        index_count: u32,
        vertex_offset: i32,
        vert_count: u32,
    ) -> Result<()> {
        if count == 0 {
            log::error!("A render item needs at least one instance");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if let Some(data) = instance_data {
            if data.len() != (stride as usize) * (count as usize) {
                log::error!("Instance data does not match stride * count");
                return Err(SleetError::INVALID_PARAMETER);
            }
        }

        let (vbuf, ibuf, index_type, vfmt_idx, mesh_index_count) = {
            let m = mesh.m_internal.read().unwrap();
            (
                m.m_vbuf.vk_current(),
                m.m_ibuf.as_ref().map(|b| b.vk_current()),
                m.m_index_type,
                m.m_vfmt_idx,
                m.m_index_count,
            )
        };
        let (mat_idx, bind_start, queue, meta) = {
            let mt = material.mt_internal.read().unwrap();
            (
                mt.mt_pipe_idx,
                mt.mt_bind_start,
                mt.mt_queue_offset,
                mt.mt_shader.meta_arc(),
            )
        };

        // Copy the instance payload into the list's blob
        let inst_offset = self.l_inst_data.len();
        if let Some(data) = instance_data {
            self.l_inst_data.extend_from_slice(data);
        }

        // Snapshot the material parameters. Consecutive items of the
        // same material with unchanged parameters share one snapshot
        // so they can later batch.
        let params = material.params_snapshot();
        let mat_id = material.id();
        let (mat_offset, mat_size) = match self.l_items.last() {
            Some(last)
                if last.ri_mat_id == mat_id
                    && last.ri_mat_size == params.len()
                    && self.l_mat_data[last.ri_mat_offset..last.ri_mat_offset + last.ri_mat_size]
                        == params[..] =>
            {
                (last.ri_mat_offset, last.ri_mat_size)
            }
            _ => {
                let offset = self.l_mat_data.len();
                self.l_mat_data.extend_from_slice(&params);
                (offset, params.len())
            }
        };

        // Indexed adds with no explicit range draw the whole mesh
        let index_count = match (ibuf.is_some(), index_count) {
            (true, 0) => mesh_index_count,
            (_, n) => n,
        };

        let mut item = RenderItem {
            ri_sort_key: 0,
            ri_vbuf: vbuf,
            ri_ibuf: ibuf.unwrap_or(vk::Buffer::null()),
            ri_index_type: index_type,
            ri_vfmt_idx: vfmt_idx,
            ri_mat_idx: mat_idx,
            ri_bind_start: bind_start,
            ri_meta: meta,
            ri_queue: queue,
            ri_mesh_id: mesh.id(),
            ri_mat_id: mat_id,
            ri_first_index: first_index,
            ri_index_count: index_count,
            ri_vertex_offset: vertex_offset,
            ri_vert_count: vert_count,
            ri_inst_stride: stride,
            ri_inst_count: count,
            ri_inst_offset: inst_offset,
            ri_mat_offset: mat_offset,
            ri_mat_size: mat_size,
        };
        item.ri_sort_key = item.compute_sort_key();

        self.l_items.push(item);
        self.l_needs_sort = true;
        Ok(())
    }

    /// Reset the list for a new frame
    ///
    /// Item and blob storage stays allocated, only the counts drop.
    pub fn clear(&mut self) {
        self.l_items.clear();
        self.l_inst_data.clear();
        self.l_mat_data.clear();
        self.l_needs_sort = false;
    }

    pub fn len(&self) -> usize {
        self.l_items.len()
    }

    /// Order the items and repack the instance blob
    ///
    /// Primary key is the material queue offset, then mesh, then
    /// material, then draw params. The per-instance payloads are
    /// rebuilt into item order, with runs of source-adjacent items
    /// copied in single chunks. Resorting an unchanged list is a
    /// byte-for-byte no-op.
    pub fn sort(&mut self) {
        if !self.l_needs_sort {
            return;
        }

        // A stable sort keeps equal items in insertion order, which
        // keeps their instance payloads in insertion order too. The
        // full queue offset leads so the packed key can never
        // misorder it, then the untruncated identities and params.
        self.l_items.sort_by(|a, b| {
            a.ri_queue
                .cmp(&b.ri_queue)
                .then(a.ri_sort_key.cmp(&b.ri_sort_key))
                .then(a.ri_mesh_id.cmp(&b.ri_mesh_id))
                .then(a.ri_mat_id.cmp(&b.ri_mat_id))
                .then(a.ri_first_index.cmp(&b.ri_first_index))
                .then(a.ri_index_count.cmp(&b.ri_index_count))
                .then(a.ri_vertex_offset.cmp(&b.ri_vertex_offset))
        });

        // Rebuild the instance blob in the new item order. A run of
        // items whose payloads were already adjacent in the source
        // blob is copied with one extend.
        let mut sorted = std::mem::take(&mut self.l_inst_scratch);
        sorted.clear();
        sorted.reserve(self.l_inst_data.len());

        let mut i = 0;
        while i < self.l_items.len() {
            let run_src = self.l_items[i].ri_inst_offset;
            let mut run_len = self.l_items[i].inst_size();
            let run_dst = sorted.len();
            self.l_items[i].ri_inst_offset = run_dst;

            let mut j = i + 1;
            while j < self.l_items.len() && self.l_items[j].ri_inst_offset == run_src + run_len {
                self.l_items[j].ri_inst_offset = run_dst + run_len;
                run_len += self.l_items[j].inst_size();
                j += 1;
            }

            sorted.extend_from_slice(&self.l_inst_data[run_src..run_src + run_len]);
            i = j;
        }

        std::mem::swap(&mut self.l_inst_data, &mut sorted);
        self.l_inst_scratch = sorted;
        self.l_needs_sort = false;
    }

    /// Test-only item construction that skips the device-backed
    /// mesh/material handles
    #[cfg(test)]
    pub(crate) fn add_raw(
        &mut self,
        mesh_id: usize,
        mat_id: usize,
        queue: u32,
        stride: u32,
        count: u32,
        data: &[u8],
    ) {
        let inst_offset = self.l_inst_data.len();
        self.l_inst_data.extend_from_slice(data);

        let mut item = RenderItem {
            ri_sort_key: 0,
            ri_vbuf: vk::Buffer::null(),
            ri_ibuf: vk::Buffer::null(),
            ri_index_type: vk::IndexType::UINT32,
            ri_vfmt_idx: 0,
            ri_mat_idx: 0,
            ri_bind_start: 0,
            ri_meta: ShaderMeta::empty(),
            ri_queue: queue,
            ri_mesh_id: mesh_id,
            ri_mat_id: mat_id,
            ri_first_index: 0,
            ri_index_count: 0,
            ri_vertex_offset: 0,
            ri_vert_count: 3,
            ri_inst_stride: stride,
            ri_inst_count: count,
            ri_inst_offset: inst_offset,
            ri_mat_offset: 0,
            ri_mat_size: 0,
        };
        item.ri_sort_key = item.compute_sort_key();
        self.l_items.push(item);
        self.l_needs_sort = true;
    }

    /// Test-only view of the batches draw would issue
    #[cfg(test)]
    pub(crate) fn batch_counts(&self) -> Vec<u32> {
        let mut ret = Vec::new();
        let mut i = 0;
        while i < self.l_items.len() {
            let mut total = self.l_items[i].ri_inst_count;
            let mut j = i + 1;
            while j < self.l_items.len() && self.l_items[i].batches_with(&self.l_items[j]) {
                total += self.l_items[j].ri_inst_count;
                j += 1;
            }
            ret.push(total);
            i = j;
        }
        ret
    }

    #[cfg(test)]
    pub(crate) fn instance_blob(&self) -> &[u8] {
        &self.l_inst_data
    }

    #[cfg(test)]
    pub(crate) fn item_order(&self) -> Vec<(usize, usize, usize)> {
        self.l_items
            .iter()
            .map(|i| (i.ri_mesh_id, i.ri_mat_id, i.ri_inst_offset))
            .collect()
    }
}
