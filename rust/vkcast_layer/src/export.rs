//! Export-image engine.
//!
//! Creates the LINEAR, DMA-BUF-exportable copy target once per swapchain
//! generation and records the per-present blit into it. The copy runs on the
//! presenting queue behind a small ring of command buffers fenced against
//! reuse, so capture never stalls a present unless the ring wraps onto work
//! the GPU has not finished.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use tracing::{info, warn};

use crate::device::{DeviceState, FrameRing, FrameSlot, QueueState};
use crate::funcs::DeviceFuncs;
use crate::socket;
use crate::swapchain::{ExportImage, SwapState};
use vkcast_wire::TextureInfo;

/// Create the export image for `swap`, export its memory as a DMA-BUF and
/// hand the descriptor to the broker. Returns false with no state left
/// behind on any failure.
pub(crate) unsafe fn shtex_init(
    state: &DeviceState,
    funcs: &DeviceFuncs,
    swap: &Arc<SwapState>,
) -> bool {
    let device = state.device;
    let extent = swap.extent;

    let mut external = vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let image_info = vk::ImageCreateInfo::default()
        .push_next(&mut external)
        .image_type(vk::ImageType::TYPE_2D)
        .format(swap.format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::LINEAR)
        .usage(vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::GENERAL);

    let mut image = vk::Image::null();
    let res = (funcs.create_image)(device, &image_info, state.ac_ptr(), &mut image);
    if res != vk::Result::SUCCESS {
        warn!("CreateImage failed: {res:?}");
        return false;
    }

    // The single linear plane the consumer will map.
    let subresource = vk::ImageSubresource::default().aspect_mask(vk::ImageAspectFlags::COLOR);
    let mut layout = vk::SubresourceLayout::default();
    (funcs.get_image_subresource_layout)(device, image, &subresource, &mut layout);

    let mut dedicated = vk::MemoryDedicatedRequirements::default();
    let mut reqs2 = vk::MemoryRequirements2::default().push_next(&mut dedicated);
    let req_info = vk::ImageMemoryRequirementsInfo2::default().image(image);
    (funcs.get_image_memory_requirements2)(device, &req_info, &mut reqs2);
    let reqs = reqs2.memory_requirements;

    let Some(ifuncs) = state.instance_funcs() else {
        (funcs.destroy_image)(device, image, state.ac_ptr());
        return false;
    };
    let mut mem_props = vk::PhysicalDeviceMemoryProperties::default();
    (ifuncs.get_physical_device_memory_properties)(state.phys, &mut mem_props);

    let mut type_idx = None;
    for i in 0..mem_props.memory_type_count {
        if reqs.memory_type_bits & (1 << i) == 0 {
            continue;
        }
        if mem_props.memory_types[i as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        {
            type_idx = Some(i);
            break;
        }
    }
    let Some(type_idx) = type_idx else {
        warn!("no device-local memory type for the export image");
        (funcs.destroy_image)(device, image, state.ac_ptr());
        return false;
    };

    let mut export_info = vk::ExportMemoryAllocateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
    let mut alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(reqs.size)
        .memory_type_index(type_idx)
        .push_next(&mut export_info);
    if dedicated.requires_dedicated_allocation == vk::TRUE
        || dedicated.prefers_dedicated_allocation == vk::TRUE
    {
        alloc = alloc.push_next(&mut dedicated_info);
    }
    let mut memory = vk::DeviceMemory::null();
    let res = (funcs.allocate_memory)(device, &alloc, ptr::null(), &mut memory);
    if res != vk::Result::SUCCESS {
        warn!("AllocateMemory failed: {res:?}");
        (funcs.destroy_image)(device, image, state.ac_ptr());
        return false;
    }

    let bind = vk::BindImageMemoryInfo::default().image(image).memory(memory);
    let res = (funcs.bind_image_memory2)(device, 1, &bind);
    if res != vk::Result::SUCCESS {
        warn!("BindImageMemory2 failed: {res:?}");
        (funcs.destroy_image)(device, image, state.ac_ptr());
        (funcs.free_memory)(device, memory, ptr::null());
        return false;
    }

    let fd_info = vk::MemoryGetFdInfoKHR::default()
        .memory(memory)
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let mut raw_fd: RawFd = -1;
    let res = (funcs.get_memory_fd_khr)(device, &fd_info, &mut raw_fd);
    if res != vk::Result::SUCCESS || raw_fd < 0 {
        warn!("GetMemoryFdKHR failed: {res:?}");
        (funcs.destroy_image)(device, image, state.ac_ptr());
        (funcs.free_memory)(device, memory, ptr::null());
        return false;
    }
    let export = ExportImage {
        image,
        memory,
        layout,
        fd: OwnedFd::from_raw_fd(raw_fd),
    };

    let texture_info = TextureInfo::single_plane(
        extent.width,
        extent.height,
        export.layout.row_pitch as u32,
        export.layout.offset as u32,
    );
    if !socket::send_texture(&texture_info, export.fd.as_raw_fd()) {
        (funcs.destroy_image)(device, export.image, state.ac_ptr());
        (funcs.free_memory)(device, export.memory, ptr::null());
        return false;
    }

    *swap.export.lock().unwrap() = Some(export);
    *state.cur_swap.lock().unwrap() = Some(swap.clone());

    info!(
        "vulkan capture started ({}x{}, stride {})",
        extent.width, extent.height, layout.row_pitch
    );
    true
}

/// Release every export image on the device and leave the capturing state.
pub(crate) unsafe fn shtex_free(state: &DeviceState, funcs: &DeviceFuncs) {
    state.swaps.walk(|swap| {
        if let Some(export) = swap.export.lock().unwrap().take() {
            unsafe {
                (funcs.destroy_image)(state.device, export.image, state.ac_ptr());
                (funcs.free_memory)(state.device, export.memory, ptr::null());
            }
            // Dropping `export.fd` closes the producer's descriptor; the
            // broker keeps its own copy until client cleanup.
        }
    });
    *state.cur_swap.lock().unwrap() = None;
    socket::stop();
    info!("vulkan capture stopped");
}

pub(crate) unsafe fn create_frame_slots(
    device: vk::Device,
    funcs: &DeviceFuncs,
    ac: *const vk::AllocationCallbacks<'static>,
    fam_idx: u32,
    count: usize,
    ring: &mut FrameRing,
) -> bool {
    ring.index = 0;
    for _ in 0..count {
        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(fam_idx);
        let mut cmd_pool = vk::CommandPool::null();
        let res = (funcs.create_command_pool)(device, &pool_info, ac, &mut cmd_pool);
        if res != vk::Result::SUCCESS {
            warn!("CreateCommandPool failed: {res:?}");
            destroy_frame_slots(device, funcs, ac, ring);
            return false;
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(cmd_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let mut cmd_buffer = vk::CommandBuffer::null();
        let res = (funcs.allocate_command_buffers)(device, &alloc_info, &mut cmd_buffer);
        if res != vk::Result::SUCCESS {
            warn!("AllocateCommandBuffers failed: {res:?}");
            (funcs.destroy_command_pool)(device, cmd_pool, ac);
            destroy_frame_slots(device, funcs, ac, ring);
            return false;
        }
        // A layer owns the dispatch word of objects it allocates; point the
        // command buffer at the device's table so downstream layers can key
        // off it.
        *(cmd_buffer.as_raw() as usize as *mut usize) = *(device.as_raw() as usize as *const usize);

        let fence_info = vk::FenceCreateInfo::default();
        let mut fence = vk::Fence::null();
        let res = (funcs.create_fence)(device, &fence_info, ac, &mut fence);
        if res != vk::Result::SUCCESS {
            warn!("CreateFence failed: {res:?}");
            (funcs.destroy_command_pool)(device, cmd_pool, ac);
            destroy_frame_slots(device, funcs, ac, ring);
            return false;
        }

        ring.slots.push(FrameSlot {
            cmd_pool,
            cmd_buffer,
            fence,
            busy: false,
        });
    }
    true
}

pub(crate) unsafe fn destroy_frame_slots(
    device: vk::Device,
    funcs: &DeviceFuncs,
    ac: *const vk::AllocationCallbacks<'static>,
    ring: &mut FrameRing,
) {
    for slot in ring.slots.drain(..) {
        if slot.busy {
            (funcs.wait_for_fences)(device, 1, &slot.fence, vk::TRUE, u64::MAX);
        }
        (funcs.destroy_fence)(device, slot.fence, ac);
        (funcs.destroy_command_pool)(device, slot.cmd_pool, ac);
    }
    ring.index = 0;
}

/// Record and submit the copy of the presented backbuffer into the export
/// image.
pub(crate) unsafe fn shtex_capture(
    state: &DeviceState,
    funcs: &DeviceFuncs,
    swap: &Arc<SwapState>,
    image_index: u32,
    queue_state: &QueueState,
    queue: vk::Queue,
) {
    let export_image = match swap.export.lock().unwrap().as_ref() {
        Some(export) => export.image,
        None => return,
    };
    let Some(backbuffer) = swap.images.get(image_index as usize).copied() else {
        return;
    };
    let device = state.device;
    let fam_idx = queue_state.fam_idx;

    let mut ring = queue_state.ring.lock().unwrap();

    // The ring tracks the swapchain image count so a submit never has to
    // wait unless it wraps onto an unfinished slot.
    let image_count = swap.images.len();
    if ring.slots.len() < image_count {
        destroy_frame_slots(device, funcs, state.ac_ptr(), &mut ring);
        if !create_frame_slots(device, funcs, state.ac_ptr(), fam_idx, image_count, &mut ring) {
            return;
        }
    }

    let index = ring.index;
    ring.index = (index + 1) % ring.slots.len();
    let slot = &mut ring.slots[index];
    if slot.busy {
        (funcs.wait_for_fences)(device, 1, &slot.fence, vk::TRUE, u64::MAX);
        (funcs.reset_fences)(device, 1, &slot.fence);
        slot.busy = false;
    }
    let cmd_buffer = slot.cmd_buffer;
    let cmd_pool = slot.cmd_pool;
    let fence = slot.fence;

    (funcs.reset_command_pool)(device, cmd_pool, vk::CommandPoolResetFlags::empty());

    let begin = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    (funcs.begin_command_buffer)(cmd_buffer, &begin);

    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1);

    // Backbuffer to transfer-source; export image to transfer-dest, taking
    // ownership from the external consumer. The reverse pair below hands it
    // back, which is what keeps the DMA-BUF contents defined on the import
    // side without a cross-process fence.
    let to_transfer = [
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(backbuffer)
            .subresource_range(range),
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
            .dst_queue_family_index(fam_idx)
            .image(export_image)
            .subresource_range(range),
    ];
    (funcs.cmd_pipeline_barrier)(
        cmd_buffer,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        0,
        ptr::null(),
        0,
        ptr::null(),
        to_transfer.len() as u32,
        to_transfer.as_ptr(),
    );

    let subresource = vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1);
    let region = vk::ImageCopy::default()
        .src_subresource(subresource)
        .dst_subresource(subresource)
        .extent(vk::Extent3D {
            width: swap.extent.width,
            height: swap.extent.height,
            depth: 1,
        });
    (funcs.cmd_copy_image)(
        cmd_buffer,
        backbuffer,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        export_image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        1,
        &region,
    );

    let to_present = [
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(backbuffer)
            .subresource_range(range),
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(fam_idx)
            .dst_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
            .image(export_image)
            .subresource_range(range),
    ];
    (funcs.cmd_pipeline_barrier)(
        cmd_buffer,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::DependencyFlags::empty(),
        0,
        ptr::null(),
        0,
        ptr::null(),
        to_present.len() as u32,
        to_present.as_ptr(),
    );

    (funcs.end_command_buffer)(cmd_buffer);

    let cmd_buffers = [cmd_buffer];
    let submit = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
    let res = (funcs.queue_submit)(queue, 1, &submit, fence);
    if res == vk::Result::SUCCESS {
        slot.busy = true;
    } else {
        warn!("QueueSubmit failed: {res:?}");
    }
}
