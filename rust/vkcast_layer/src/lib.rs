//! Vulkan capture layer.
//!
//! Loaded into a graphics application by the Vulkan loader, this layer
//! shadows instance and device creation, tracks swapchains and queues, and
//! on every present blits the backbuffer into a DMA-BUF-exportable image
//! whose descriptor is handed to the capture broker over a UNIX socket.

mod device;
mod export;
mod funcs;
mod instance;
mod link;
mod registry;
mod socket;
mod swapchain;

use std::ffi::{c_char, CStr};

use ash::vk;
use ash::vk::Handle;
use once_cell::sync::Lazy;
use tracing::info;

use device::DeviceState;
use instance::InstanceState;
use link::{
    NegotiateLayerInterface, CURRENT_LOADER_LAYER_INTERFACE_VERSION,
    LAYER_NEGOTIATE_INTERFACE_STRUCT,
};
use registry::ObjectMap;

pub(crate) static INSTANCES: Lazy<ObjectMap<InstanceState>> = Lazy::new(ObjectMap::new);
pub(crate) static DEVICES: Lazy<ObjectMap<DeviceState>> = Lazy::new(ObjectMap::new);

static GLOBAL_INIT: Lazy<()> = Lazy::new(|| {
    // The host application may have installed its own subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();
    info!("capture layer initialized");
});

macro_rules! fp {
    ($f:expr, $ty:ty) => {{
        let f: $ty = $f;
        Some(std::mem::transmute::<$ty, unsafe extern "system" fn()>(f))
    }};
}

/// Loader negotiation entry point, named by the layer manifest.
///
/// # Safety
/// Called by the Vulkan loader with a valid negotiation struct.
#[no_mangle]
pub unsafe extern "system" fn vkcast_NegotiateLoaderLayerInterfaceVersion(
    p_interface: *mut NegotiateLayerInterface,
) -> vk::Result {
    Lazy::force(&GLOBAL_INIT);
    Lazy::force(&INSTANCES);
    Lazy::force(&DEVICES);

    if p_interface.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let interface = &mut *p_interface;

    if interface.loader_layer_interface_version >= 2 {
        interface.s_type = LAYER_NEGOTIATE_INTERFACE_STRUCT;
        interface.p_next = std::ptr::null_mut();
        interface.pfn_get_instance_proc_addr = Some(vkcast_GetInstanceProcAddr);
        interface.pfn_get_device_proc_addr = Some(vkcast_GetDeviceProcAddr);
        interface.pfn_get_physical_device_proc_addr = None;
    }

    if interface.loader_layer_interface_version > CURRENT_LOADER_LAYER_INTERFACE_VERSION {
        interface.loader_layer_interface_version = CURRENT_LOADER_LAYER_INTERFACE_VERSION;
    }

    vk::Result::SUCCESS
}

/// # Safety
/// Called by the loader or application with a NUL-terminated name and a
/// handle this layer has seen (or null for global commands).
#[no_mangle]
pub unsafe extern "system" fn vkcast_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    match CStr::from_ptr(p_name).to_bytes() {
        b"vkGetInstanceProcAddr" => {
            return fp!(vkcast_GetInstanceProcAddr, vk::PFN_vkGetInstanceProcAddr)
        }
        b"vkCreateInstance" => return fp!(instance::create_instance, vk::PFN_vkCreateInstance),
        b"vkDestroyInstance" => return fp!(instance::destroy_instance, vk::PFN_vkDestroyInstance),
        b"vkGetDeviceProcAddr" => {
            return fp!(vkcast_GetDeviceProcAddr, vk::PFN_vkGetDeviceProcAddr)
        }
        b"vkCreateDevice" => return fp!(device::create_device, vk::PFN_vkCreateDevice),
        b"vkDestroyDevice" => return fp!(device::destroy_device, vk::PFN_vkDestroyDevice),
        _ => {}
    }

    if instance == vk::Instance::null() {
        return None;
    }
    let Some(state) = INSTANCES.get(registry::dispatch_key(instance.as_raw())) else {
        return None;
    };
    (state.next_gipa)(instance, p_name)
}

/// # Safety
/// Called by the loader or application with a NUL-terminated name and a
/// device created through this layer.
#[no_mangle]
pub unsafe extern "system" fn vkcast_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name).to_bytes();
    match name {
        b"vkGetDeviceProcAddr" => {
            return fp!(vkcast_GetDeviceProcAddr, vk::PFN_vkGetDeviceProcAddr)
        }
        b"vkDestroyDevice" => return fp!(device::destroy_device, vk::PFN_vkDestroyDevice),
        _ => {}
    }

    if device == vk::Device::null() {
        return None;
    }
    let Some(state) = DEVICES.get(registry::dispatch_key(device.as_raw())) else {
        return None;
    };

    // The swapchain hooks are only offered when the next layer implements
    // the swapchain entry points.
    if state.funcs.is_some() {
        match name {
            b"vkCreateSwapchainKHR" => {
                return fp!(
                    swapchain::create_swapchain_khr,
                    vk::PFN_vkCreateSwapchainKHR
                )
            }
            b"vkDestroySwapchainKHR" => {
                return fp!(
                    swapchain::destroy_swapchain_khr,
                    vk::PFN_vkDestroySwapchainKHR
                )
            }
            b"vkQueuePresentKHR" => {
                return fp!(swapchain::queue_present_khr, vk::PFN_vkQueuePresentKHR)
            }
            _ => {}
        }
    }

    (state.next_gdpa)(device, p_name)
}
