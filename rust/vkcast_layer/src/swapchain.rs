//! Swapchain interception and the per-present capture driver.

use std::os::fd::OwnedFd;
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex};

use ash::vk;
use ash::vk::Handle;
use tracing::error;

use crate::device::{DeviceState, QueueState};
use crate::export;
use crate::funcs::DeviceFuncs;
use crate::registry;
use crate::socket;
use crate::DEVICES;

pub struct ExportImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub layout: vk::SubresourceLayout,
    pub fd: OwnedFd,
}

pub struct SwapState {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub images: Vec<vk::Image>,
    pub export: Mutex<Option<ExportImage>>,
}

impl SwapState {
    pub fn valid_rect(&self) -> bool {
        self.extent.width != 0 && self.extent.height != 0
    }
}

pub(crate) unsafe extern "system" fn create_swapchain_khr(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let Some(state) = DEVICES.get(registry::dispatch_key(device.as_raw())) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(funcs) = &state.funcs else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if !state.is_valid() || p_create_info.is_null() {
        return (funcs.create_swapchain_khr)(device, p_create_info, p_allocator, p_swapchain);
    }

    // The backbuffer must be blittable into the export image.
    let mut info = *p_create_info;
    info.image_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    let res = (funcs.create_swapchain_khr)(device, &info, p_allocator, p_swapchain);
    if res != vk::Result::SUCCESS {
        // Retry with the original imageUsage flags.
        return (funcs.create_swapchain_khr)(device, p_create_info, p_allocator, p_swapchain);
    }

    let swapchain = *p_swapchain;
    let mut count = 0u32;
    let images_res =
        (funcs.get_swapchain_images_khr)(device, swapchain, &mut count, ptr::null_mut());
    if images_res == vk::Result::SUCCESS && count > 0 {
        let mut images = vec![vk::Image::null(); count as usize];
        let images_res =
            (funcs.get_swapchain_images_khr)(device, swapchain, &mut count, images.as_mut_ptr());
        if images_res == vk::Result::SUCCESS {
            state.swaps.insert(
                swapchain.as_raw(),
                Arc::new(SwapState {
                    extent: (*p_create_info).image_extent,
                    format: (*p_create_info).image_format,
                    images,
                    export: Mutex::new(None),
                }),
            );
        }
    }

    res
}

pub(crate) unsafe extern "system" fn destroy_swapchain_khr(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    let Some(state) = DEVICES.get(registry::dispatch_key(device.as_raw())) else {
        return;
    };
    let Some(funcs) = &state.funcs else {
        return;
    };

    if swapchain != vk::SwapchainKHR::null() && state.is_valid() {
        if let Some(swap) = state.swaps.get(swapchain.as_raw()) {
            let is_current = state
                .cur_swap
                .lock()
                .unwrap()
                .as_ref()
                .map_or(false, |cur| Arc::ptr_eq(cur, &swap));
            if is_current {
                export::shtex_free(&state, funcs);
            }
            state.swaps.remove(swapchain.as_raw());
        }
    }

    (funcs.destroy_swapchain_khr)(device, swapchain, p_allocator)
}

pub(crate) unsafe extern "system" fn queue_present_khr(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let Some(state) = DEVICES.get(registry::dispatch_key(queue.as_raw())) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(funcs) = &state.funcs else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    if state.is_valid() && !p_present_info.is_null() {
        if let Some(queue_state) = state.queues.get(queue.as_raw()) {
            if queue_state.supports_transfer {
                capture_present(&state, funcs, &queue_state, queue, &*p_present_info);
            }
        }
    }

    (funcs.queue_present_khr)(queue, p_present_info)
}

/// One capture step per present: poll the broker connection, move the export
/// state machine, and record the blit for the first presented swapchain.
unsafe fn capture_present(
    state: &DeviceState,
    funcs: &DeviceFuncs,
    queue_state: &QueueState,
    queue: vk::Queue,
    info: &vk::PresentInfoKHR,
) {
    if info.swapchain_count == 0 || info.p_swapchains.is_null() || info.p_image_indices.is_null() {
        return;
    }
    let swapchains = slice::from_raw_parts(info.p_swapchains, info.swapchain_count as usize);
    let indices = slice::from_raw_parts(info.p_image_indices, info.swapchain_count as usize);
    let Some(swap) = state.swaps.get(swapchains[0].as_raw()) else {
        return;
    };

    socket::update();

    if socket::should_stop() {
        export::shtex_free(state, funcs);
    }

    if socket::should_init() && swap.valid_rect() && !export::shtex_init(state, funcs, &swap) {
        export::shtex_free(state, funcs);
        state.invalidate();
        error!("export image setup failed");
    }

    if socket::ready() {
        let cur = state.cur_swap.lock().unwrap().clone();
        match cur {
            Some(cur) if Arc::ptr_eq(&cur, &swap) => {
                export::shtex_capture(state, funcs, &swap, indices[0], queue_state, queue);
            }
            // The application switched swapchains mid-stream.
            _ => export::shtex_free(state, funcs),
        }
    }
}
