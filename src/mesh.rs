// Meshes and vertex formats
//
// A vertex format is a value type interned with the pipeline cache.
// A mesh is the pairing of vertex/index buffers with one of those
// formats, it either owns its buffers or is a view over externally
// managed ones.
//
// Austin Shafer - 2024

use ash::vk;

use crate::buffer::{BufType, BufUse, Buffer};
use crate::deletion_queue::DestroyItem;
use crate::device::Device;
use crate::pipeline::PipelineCache;
use crate::{Result, SleetError};
use utils::log;

use std::sync::{Arc, RwLock};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VertSemantic {
    Position,
    Normal,
    Tangent,
    Color,
    TexCoord,
    BoneWeights,
    BoneIndices,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VertCompFormat {
    F32,
    U8,
    U8Norm,
    U16,
    U32,
}

/// One vertex attribute: what it means, how it is stored, and how
/// many scalars it has
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VertComponent {
    pub semantic: VertSemantic,
    pub format: VertCompFormat,
    pub count: u32,
}

impl VertComponent {
    fn size(&self) -> u32 {
        let scalar = match self.format {
            VertCompFormat::F32 | VertCompFormat::U32 => 4,
            VertCompFormat::U16 => 2,
            VertCompFormat::U8 | VertCompFormat::U8Norm => 1,
        };
        scalar * self.count
    }

    fn vk_format(&self) -> Result<vk::Format> {
        let fmt = match (self.format, self.count) {
            (VertCompFormat::F32, 1) => vk::Format::R32_SFLOAT,
            (VertCompFormat::F32, 2) => vk::Format::R32G32_SFLOAT,
            (VertCompFormat::F32, 3) => vk::Format::R32G32B32_SFLOAT,
            (VertCompFormat::F32, 4) => vk::Format::R32G32B32A32_SFLOAT,
            (VertCompFormat::U8, 4) => vk::Format::R8G8B8A8_UINT,
            (VertCompFormat::U8Norm, 4) => vk::Format::R8G8B8A8_UNORM,
            (VertCompFormat::U16, 1) => vk::Format::R16_UINT,
            (VertCompFormat::U16, 2) => vk::Format::R16G16_UINT,
            (VertCompFormat::U16, 4) => vk::Format::R16G16B16A16_UINT,
            (VertCompFormat::U32, 1) => vk::Format::R32_UINT,
            (VertCompFormat::U32, 2) => vk::Format::R32G32_UINT,
            (VertCompFormat::U32, 4) => vk::Format::R32G32B32A32_UINT,
            _ => {
                log::error!(
                    "Unsupported vertex component: {:?} x{}",
                    self.format,
                    self.count
                );
                return Err(SleetError::UNSUPPORTED);
            }
        };
        Ok(fmt)
    }
}

/// A packed sequence of vertex components
///
/// Two formats with the same component list compare equal and
/// intern to the same pipeline cache index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexFormat {
    vf_components: Vec<VertComponent>,
}

impl VertexFormat {
    pub fn new(components: &[VertComponent]) -> Self {
        Self {
            vf_components: components.to_vec(),
        }
    }

    /// An empty format for vertex-id driven fullscreen passes
    pub fn empty() -> Self {
        Self {
            vf_components: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vf_components.is_empty()
    }

    /// The packed per-vertex stride
    pub fn stride(&self) -> u32 {
        self.vf_components.iter().map(|c| c.size()).sum()
    }

    pub(crate) fn vk_attributes(&self) -> Result<Vec<vk::VertexInputAttributeDescription>> {
        let mut attribs = Vec::with_capacity(self.vf_components.len());
        let mut offset = 0;

        for (i, comp) in self.vf_components.iter().enumerate() {
            attribs.push(
                vk::VertexInputAttributeDescription::builder()
                    .location(i as u32)
                    .binding(0)
                    .format(comp.vk_format()?)
                    .offset(offset)
                    .build(),
            );
            offset += comp.size();
        }

        Ok(attribs)
    }
}

pub(crate) struct MeshInternal {
    m_cache: Arc<PipelineCache>,
    pub(crate) m_vbuf: Buffer,
    pub(crate) m_ibuf: Option<Buffer>,
    pub(crate) m_index_type: vk::IndexType,
    pub(crate) m_vert_count: u32,
    pub(crate) m_index_count: u32,
    pub(crate) m_vfmt_idx: u32,
    /// Meshes built around external buffers do not destroy them
    m_owns_buffers: bool,
    m_destroyed: bool,
}

/// A drawable mesh handle
#[derive(Clone)]
pub struct Mesh {
    pub(crate) m_internal: Arc<RwLock<MeshInternal>>,
}

impl Mesh {
    pub(crate) fn new(
        dev: Arc<Device>,
        cache: Arc<PipelineCache>,
        fmt: &VertexFormat,
        vert_data: &[u8],
        vert_count: u32,
        index_data: Option<&[u8]>,
        index_count: u32,
    ) -> Result<Mesh> {
        let stride = fmt.stride() as usize;
        if vert_count == 0 || stride == 0 {
            log::error!("A mesh needs at least one vertex and a non-empty format");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if vert_data.len() != stride * vert_count as usize {
            log::error!("Vertex data does not match count * stride");
            return Err(SleetError::INVALID_PARAMETER);
        }

        let vbuf = Buffer::new(
            dev.clone(),
            Some(vert_data),
            vert_count as usize,
            stride,
            BufType::Vertex,
            BufUse::STATIC,
        )?;

        let (ibuf, index_type) = match index_data {
            Some(data) => {
                if index_count == 0 || data.len() % index_count as usize != 0 {
                    log::error!("Index data does not match the index count");
                    return Err(SleetError::INVALID_PARAMETER);
                }
                let index_stride = data.len() / index_count as usize;
                let index_type = match index_stride {
                    2 => vk::IndexType::UINT16,
                    4 => vk::IndexType::UINT32,
                    _ => {
                        log::error!("Indices must be 16 or 32 bit");
                        return Err(SleetError::INVALID_PARAMETER);
                    }
                };
                let ibuf = Buffer::new(
                    dev.clone(),
                    Some(data),
                    index_count as usize,
                    index_stride,
                    BufType::Index,
                    BufUse::STATIC,
                )?;
                (Some(ibuf), index_type)
            }
            None => (None, vk::IndexType::UINT32),
        };

        let vfmt_idx = cache.register_vertfmt(fmt)?;

        Ok(Mesh {
            m_internal: Arc::new(RwLock::new(MeshInternal {
                m_cache: cache,
                m_vbuf: vbuf,
                m_ibuf: ibuf,
                m_index_type: index_type,
                m_vert_count: vert_count,
                m_index_count: index_count,
                m_vfmt_idx: vfmt_idx,
                m_owns_buffers: true,
                m_destroyed: false,
            })),
        })
    }

    /// Build a mesh as a view on caller-owned buffers
    pub(crate) fn new_external(
        cache: Arc<PipelineCache>,
        fmt: &VertexFormat,
        vert_buf: &Buffer,
        vert_count: u32,
        index_buf: Option<&Buffer>,
        index_count: u32,
    ) -> Result<Mesh> {
        if vert_buf.buf_type() != BufType::Vertex {
            log::error!("External vertex buffer is not a vertex buffer");
            return Err(SleetError::INVALID_PARAMETER);
        }
        if let Some(ibuf) = index_buf {
            if ibuf.buf_type() != BufType::Index {
                log::error!("External index buffer is not an index buffer");
                return Err(SleetError::INVALID_PARAMETER);
            }
        }

        let vfmt_idx = cache.register_vertfmt(fmt)?;

        Ok(Mesh {
            m_internal: Arc::new(RwLock::new(MeshInternal {
                m_cache: cache,
                m_vbuf: vert_buf.clone(),
                m_ibuf: index_buf.cloned(),
                m_index_type: vk::IndexType::UINT32,
                m_vert_count: vert_count,
                m_index_count: index_count,
                m_vfmt_idx: vfmt_idx,
                m_owns_buffers: false,
                m_destroyed: false,
            })),
        })
    }

    /// A stable identity used as the secondary render list sort key
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.m_internal) as usize
    }

    pub fn vert_count(&self) -> u32 {
        self.m_internal.read().unwrap().m_vert_count
    }

    pub fn index_count(&self) -> u32 {
        self.m_internal.read().unwrap().m_index_count
    }

    /// Destroy the mesh
    ///
    /// Owned buffers are retired through the deferred destroy path,
    /// so render items recorded from this mesh stay valid for the
    /// frame in flight.
    pub fn destroy(&self) {
        self.m_internal.write().unwrap().destroy();
    }
}

impl MeshInternal {
    fn destroy(&mut self) {
        if self.m_destroyed {
            return;
        }
        self.m_destroyed = true;

        if self.m_owns_buffers {
            self.m_vbuf.destroy();
            if let Some(ibuf) = self.m_ibuf.as_ref() {
                ibuf.destroy();
            }
        }
        // The format index may still be named by render items
        // recorded this frame, its unregister rides the destroy list
        self.m_cache.dev().destroy_or_defer(DestroyItem::VertFmtUnregister(
            self.m_cache.clone(),
            self.m_vfmt_idx,
        ));
    }
}

impl Drop for MeshInternal {
    fn drop(&mut self) {
        self.destroy();
    }
}
