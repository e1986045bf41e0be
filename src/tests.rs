/// Sleet tests
///
/// These cover the device-independent machinery: the bind pool's
/// range allocator, render list sorting and batching, the command
/// slot generation rules, the bump allocator's sizing math, the
/// layout source tables, and the interning keys. Anything that needs
/// a live VkDevice lives in the sleet-test member crate.
///
/// Austin Shafer - 2024
use crate as sl;

use crate::bindpool::BindPool;
use crate::buffer::{bump_offset, bump_regrow_size};
use crate::cmdring::SlotSync;
use crate::layout::src_scope;
use crate::pipeline::MaterialKey;
use crate::texture::full_mip_chain;

use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};

// ----------------------------------------------------------------------
// bind pool
// ----------------------------------------------------------------------

#[test]
fn bind_pool_first_fit() {
    let pool = BindPool::new();

    let a = pool.alloc(4);
    let b = pool.alloc(4);
    assert_ne!(a, b);

    // Freeing a opens the lowest hole, the next fit lands in it
    pool.free(a, 4);
    let c = pool.alloc(2);
    assert_eq!(c, a);

    // The remainder of the hole is still free
    let d = pool.alloc(2);
    assert_eq!(d, a + 2);
}

#[test]
fn bind_pool_coalesces_neighbors() {
    let pool = BindPool::new();

    let a = pool.alloc(4);
    let b = pool.alloc(4);
    let c = pool.alloc(4);
    // keep the slab from handing the tail back
    let _guard = pool.alloc(4);

    // Free the outer runs, then the middle one. All three have to
    // merge into a single range.
    pool.free(a, 4);
    pool.free(c, 4);
    pool.free(b, 4);

    let merged = pool
        .free_ranges()
        .iter()
        .find(|&&(start, _)| start == a)
        .copied()
        .expect("merged range missing");
    assert!(merged.1 >= 12);

    // And a fit of the full merged size reuses it
    let big = pool.alloc(12);
    assert_eq!(big, a);
}

#[test]
fn bind_pool_grows() {
    let pool = BindPool::new();

    // Far more than the initial slab, allocation must still succeed
    let mut starts = Vec::new();
    for _ in 0..64 {
        starts.push(pool.alloc(8));
    }
    starts.sort();
    starts.dedup();
    assert_eq!(starts.len(), 64);
}

// ----------------------------------------------------------------------
// render list
// ----------------------------------------------------------------------

#[test]
fn list_sort_orders_by_queue_then_mesh_then_material() {
    let mut list = sl::RenderList::new();

    list.add_raw(2, 1, 1, 0, 1, &[]);
    list.add_raw(1, 2, 0, 0, 1, &[]);
    list.add_raw(1, 1, 0, 0, 1, &[]);
    list.sort();

    let order = list.item_order();
    // queue 0 items first, ordered by mesh then material
    assert_eq!(order[0].0, 1);
    assert_eq!(order[0].1, 1);
    assert_eq!(order[1].0, 1);
    assert_eq!(order[1].1, 2);
    assert_eq!(order[2].0, 2);
}

#[test]
fn list_sort_is_idempotent() {
    let mut list = sl::RenderList::new();

    list.add_raw(3, 1, 0, 4, 1, &[1, 1, 1, 1]);
    list.add_raw(1, 1, 0, 4, 2, &[2, 2, 2, 2, 3, 3, 3, 3]);
    list.add_raw(2, 2, 1, 4, 1, &[4, 4, 4, 4]);

    list.sort();
    let order = list.item_order();
    let blob = list.instance_blob().to_vec();

    // Resorting with no adds must not move a byte
    list.l_needs_sort = true;
    list.sort();
    assert_eq!(order, list.item_order());
    assert_eq!(blob, list.instance_blob());
}

#[test]
fn list_sort_repacks_instance_data() {
    let mut list = sl::RenderList::new();

    // Insertion order interleaves two meshes, the payloads must
    // follow their items into sorted order
    list.add_raw(2, 1, 0, 1, 1, &[b'c']);
    list.add_raw(1, 1, 0, 1, 1, &[b'a']);
    list.add_raw(2, 1, 0, 1, 1, &[b'd']);
    list.add_raw(1, 1, 0, 1, 1, &[b'b']);

    list.sort();
    assert_eq!(list.instance_blob(), b"abcd");
}

#[test]
fn list_batches_consecutive_compatible_items() {
    let mut list = sl::RenderList::new();

    // Three draws of the same mesh + material with stride 64 and
    // instance counts 1, 2, 3
    let a: Vec<u8> = vec![0xa0; 64];
    let bc: Vec<u8> = (0..128).map(|i| (i / 64 + 0xb0) as u8).collect();
    let def: Vec<u8> = (0..192).map(|i| (i / 64 + 0xd0) as u8).collect();

    list.add_raw(1, 1, 0, 64, 1, &a);
    list.add_raw(1, 1, 0, 64, 2, &bc);
    list.add_raw(1, 1, 0, 64, 3, &def);

    list.sort();

    // One draw of six instances, payloads in insertion order
    assert_eq!(list.batch_counts(), vec![6]);
    let mut expected = a.clone();
    expected.extend_from_slice(&bc);
    expected.extend_from_slice(&def);
    assert_eq!(list.instance_blob(), expected.as_slice());
}

#[test]
fn list_does_not_batch_across_materials() {
    let mut list = sl::RenderList::new();

    list.add_raw(1, 1, 0, 16, 1, &[1; 16]);
    list.add_raw(1, 2, 0, 16, 1, &[2; 16]);
    list.add_raw(1, 1, 0, 16, 1, &[3; 16]);

    list.sort();

    // Sorting groups the material-1 items back together, so we get
    // one batch of two and one of one
    assert_eq!(list.batch_counts(), vec![2, 1]);
}

#[test]
fn list_clear_keeps_storage() {
    let mut list = sl::RenderList::new();

    list.add_raw(1, 1, 0, 8, 1, &[0; 8]);
    list.sort();
    list.clear();

    assert_eq!(list.len(), 0);
    assert_eq!(list.instance_blob().len(), 0);
}

// ----------------------------------------------------------------------
// command slot generations
// ----------------------------------------------------------------------

#[test]
fn slot_generation_retires_futures() {
    // A future snapshots the generation at submission time. Bumping
    // the generation (what reclaim does after draining the destroy
    // list) retires every outstanding snapshot without touching the
    // fence.
    let sync = SlotSync {
        ss_fence: vk::Fence::null(),
        ss_generation: AtomicU64::new(3),
    };

    let snapshot = sync.ss_generation.load(Ordering::Acquire);
    assert!(!sync.retired(snapshot));

    // Slot reuse
    sync.ss_generation.fetch_add(1, Ordering::AcqRel);
    assert!(sync.retired(snapshot));

    // A fresh snapshot agrees again
    let snapshot = sync.ss_generation.load(Ordering::Acquire);
    assert!(!sync.retired(snapshot));
}

#[test]
fn slot_generation_is_monotonic() {
    let sync = SlotSync {
        ss_fence: vk::Fence::null(),
        ss_generation: AtomicU64::new(0),
    };

    // Every older snapshot stays retired forever
    let old = sync.ss_generation.load(Ordering::Acquire);
    for _ in 0..8 {
        sync.ss_generation.fetch_add(1, Ordering::AcqRel);
        assert!(sync.retired(old));
    }
}

// ----------------------------------------------------------------------
// bump allocator sizing
// ----------------------------------------------------------------------

#[test]
fn bump_offsets_are_aligned() {
    assert_eq!(bump_offset(0, 256), 0);
    assert_eq!(bump_offset(1, 256), 256);
    assert_eq!(bump_offset(256, 256), 256);
    assert_eq!(bump_offset(257, 64), 320);

    // Consecutive allocations never overlap
    let a = bump_offset(0, 256);
    let b = bump_offset(a + 100, 256);
    assert!(b >= a + 100);
    assert_eq!(b % 256, 0);
}

#[test]
fn bump_regrow_covers_high_water_mark() {
    // After a frame whose high-water mark was H the next main
    // buffer must hold at least H, and never shrinks below the
    // 4 KiB floor
    assert_eq!(bump_regrow_size(0), 4096);
    assert_eq!(bump_regrow_size(100), 4096);
    assert!(bump_regrow_size(4096) >= 4096 + 1024);
    for h in [1u64, 4095, 4096, 65536, 1 << 20] {
        assert!(bump_regrow_size(h) >= h);
    }

    // hwm * 1.25 growth
    assert_eq!(bump_regrow_size(1 << 20), (1 << 20) + (1 << 18));
}

// ----------------------------------------------------------------------
// layout tracker tables
// ----------------------------------------------------------------------

#[test]
fn layout_source_scopes() {
    let (stage, access) = src_scope(vk::ImageLayout::UNDEFINED);
    assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    assert_eq!(access, vk::AccessFlags::empty());

    let (stage, access) = src_scope(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
    assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);

    let (stage, access) = src_scope(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    assert_eq!(access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

    let (_, access) = src_scope(vk::ImageLayout::GENERAL);
    assert!(access.contains(vk::AccessFlags::SHADER_WRITE));
}

#[test]
fn mip_chain_lengths() {
    // A 256x256 texture carries log2(256) + 1 = 9 levels
    assert_eq!(full_mip_chain((256, 256, 1)), 9);
    assert_eq!(full_mip_chain((1, 1, 1)), 1);
    assert_eq!(full_mip_chain((640, 480, 1)), 10);
}

// ----------------------------------------------------------------------
// register slots
// ----------------------------------------------------------------------

#[test]
fn register_kind_shifts() {
    assert_eq!(sl::RegisterKind::Constant.shift(), 0);
    assert_eq!(sl::RegisterKind::Texture.shift(), 100);
    assert_eq!(sl::RegisterKind::ReadBuffer.shift(), 100);
    assert_eq!(sl::RegisterKind::ReadWrite.shift(), 200);
    assert_eq!(sl::RegisterKind::ReadWriteTex.shift(), 200);
}

#[test]
fn register_kind_descriptor_types() {
    assert_eq!(
        sl::RegisterKind::Constant.descriptor_type(),
        vk::DescriptorType::UNIFORM_BUFFER
    );
    assert_eq!(
        sl::RegisterKind::Texture.descriptor_type(),
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
    );
    assert_eq!(
        sl::RegisterKind::ReadBuffer.descriptor_type(),
        vk::DescriptorType::STORAGE_BUFFER
    );
    assert_eq!(
        sl::RegisterKind::ReadWrite.descriptor_type(),
        vk::DescriptorType::STORAGE_BUFFER
    );
    assert_eq!(
        sl::RegisterKind::ReadWriteTex.descriptor_type(),
        vk::DescriptorType::STORAGE_IMAGE
    );
}

#[test]
fn param_type_sizes() {
    assert_eq!(sl::ParamType::Uint8.size(), 1);
    assert_eq!(sl::ParamType::Float.size(), 4);
    assert_eq!(sl::ParamType::Float4.size(), 16);
    assert_eq!(sl::ParamType::Matrix.size(), 64);
}

// ----------------------------------------------------------------------
// vertex formats
// ----------------------------------------------------------------------

/// The layout the format below describes
#[repr(C)]
struct VertData {
    position: cgmath::Vector3<f32>,
    uv: cgmath::Vector2<f32>,
    color: [u8; 4],
}

#[test]
fn vertex_format_matches_struct_layout() {
    let fmt = sl::VertexFormat::new(&[
        sl::VertComponent {
            semantic: sl::VertSemantic::Position,
            format: sl::VertCompFormat::F32,
            count: 3,
        },
        sl::VertComponent {
            semantic: sl::VertSemantic::TexCoord,
            format: sl::VertCompFormat::F32,
            count: 2,
        },
        sl::VertComponent {
            semantic: sl::VertSemantic::Color,
            format: sl::VertCompFormat::U8Norm,
            count: 4,
        },
    ]);

    assert_eq!(fmt.stride() as usize, std::mem::size_of::<VertData>());

    let attribs = fmt.vk_attributes().unwrap();
    assert_eq!(attribs.len(), 3);
    assert_eq!(attribs[0].offset as usize, memoffset::offset_of!(VertData, position));
    assert_eq!(attribs[1].offset as usize, memoffset::offset_of!(VertData, uv));
    assert_eq!(attribs[2].offset as usize, memoffset::offset_of!(VertData, color));
    assert_eq!(attribs[0].format, vk::Format::R32G32B32_SFLOAT);
    assert_eq!(attribs[1].format, vk::Format::R32G32_SFLOAT);
    assert_eq!(attribs[2].format, vk::Format::R8G8B8A8_UNORM);
}

#[test]
fn vertex_formats_intern_by_value() {
    let a = sl::VertexFormat::new(&[sl::VertComponent {
        semantic: sl::VertSemantic::Position,
        format: sl::VertCompFormat::F32,
        count: 3,
    }]);
    let b = sl::VertexFormat::new(&[sl::VertComponent {
        semantic: sl::VertSemantic::Position,
        format: sl::VertCompFormat::F32,
        count: 3,
    }]);
    let c = sl::VertexFormat::new(&[sl::VertComponent {
        semantic: sl::VertSemantic::Position,
        format: sl::VertCompFormat::F32,
        count: 2,
    }]);

    assert_eq!(a, b);
    assert_ne!(a, c);
}

// ----------------------------------------------------------------------
// material keys
// ----------------------------------------------------------------------

fn test_key(shader: usize, cull: sl::CullMode) -> MaterialKey {
    MaterialKey {
        mk_shader: shader,
        mk_cull: cull,
        mk_write_mask: sl::WriteMask::COLOR | sl::WriteMask::DEPTH,
        mk_depth_test: true,
        mk_depth_compare: sl::CompareOp::LessOrEqual,
        mk_blend: sl::BlendState::default(),
        mk_alpha_to_coverage: false,
        mk_stencil_front: None,
        mk_stencil_back: None,
    }
}

#[test]
fn material_keys_compare_fieldwise() {
    assert!(test_key(1, sl::CullMode::Back) == test_key(1, sl::CullMode::Back));
    assert!(test_key(1, sl::CullMode::Back) != test_key(1, sl::CullMode::Front));
    assert!(test_key(1, sl::CullMode::Back) != test_key(2, sl::CullMode::Back));

    let mut blended = test_key(1, sl::CullMode::Back);
    blended.mk_blend = sl::BlendState::alpha();
    assert!(blended != test_key(1, sl::CullMode::Back));
}

#[test]
fn texture_format_attributes() {
    assert!(sl::Format::Depth32Float.has_depth());
    assert!(!sl::Format::Depth32Float.has_stencil());
    assert!(sl::Format::Depth24Stencil8.has_stencil());
    assert!(!sl::Format::Rgba8Srgb.has_depth());
}

#[test]
fn global_slot_range_is_validated() {
    // The table rejects out-of-range slots without touching state
    let mut globals = crate::material::GlobalTable::new();
    assert_eq!(
        globals.set_buffer(sl::MAX_GLOBALS as u32, None),
        Err(sl::SleetError::INVALID_PARAMETER)
    );
    assert!(globals.set_buffer(0, None).is_ok());
}
