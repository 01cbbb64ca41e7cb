//! Loader layer-negotiation structs.
//!
//! `ash` generates the core API but not `vk_layer.h`, so the negotiation
//! interface and the pNext link nodes the loader threads through
//! `vkCreateInstance`/`vkCreateDevice` are declared here. Layouts must match
//! the loader's C declarations exactly.

use std::ffi::{c_char, c_void};
use std::ptr;

use ash::vk;

/// Highest loader interface version this layer speaks.
pub const CURRENT_LOADER_LAYER_INTERFACE_VERSION: u32 = 2;

/// VkNegotiateLayerStructType::LAYER_NEGOTIATE_INTERFACE_STRUCT
pub const LAYER_NEGOTIATE_INTERFACE_STRUCT: i32 = 1;

/// VkLayerFunction::VK_LAYER_LINK_INFO
pub const VK_LAYER_LINK_INFO: i32 = 0;

pub type PfnGetPhysicalDeviceProcAddr =
    unsafe extern "system" fn(vk::Instance, *const c_char) -> vk::PFN_vkVoidFunction;

/// VkNegotiateLayerInterface
#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: i32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

/// VkLayerInstanceLink
#[repr(C)]
pub struct InstanceLink {
    pub p_next: *mut InstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_physical_device_proc_addr: *const c_void,
}

/// VkLayerInstanceCreateInfo. Only the `pLayerInfo` arm of the union is
/// touched; the callback arms are pointer-sized too.
#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: LayerInstanceUnion,
}

#[repr(C)]
pub union LayerInstanceUnion {
    pub p_layer_info: *mut InstanceLink,
    pub pfn_callback: *const c_void,
}

/// VkLayerDeviceLink
#[repr(C)]
pub struct DeviceLink {
    pub p_next: *mut DeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

/// VkLayerDeviceCreateInfo
#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: LayerDeviceUnion,
}

#[repr(C)]
pub union LayerDeviceUnion {
    pub p_layer_info: *mut DeviceLink,
    pub pfn_callback: *const c_void,
}

/// Step through the create-info pNext chain until the loader's link-info
/// node. Returns null if the chain does not carry one.
pub unsafe fn find_instance_link_info(p_next: *const c_void) -> *mut LayerInstanceCreateInfo {
    let mut cur = p_next as *mut LayerInstanceCreateInfo;
    while !cur.is_null() {
        if (*cur).s_type == vk::StructureType::LOADER_INSTANCE_CREATE_INFO
            && (*cur).function == VK_LAYER_LINK_INFO
        {
            return cur;
        }
        cur = (*cur).p_next as *mut LayerInstanceCreateInfo;
    }
    ptr::null_mut()
}

pub unsafe fn find_device_link_info(p_next: *const c_void) -> *mut LayerDeviceCreateInfo {
    let mut cur = p_next as *mut LayerDeviceCreateInfo;
    while !cur.is_null() {
        if (*cur).s_type == vk::StructureType::LOADER_DEVICE_CREATE_INFO
            && (*cur).function == VK_LAYER_LINK_INFO
        {
            return cur;
        }
        cur = (*cur).p_next as *mut LayerDeviceCreateInfo;
    }
    ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "system" fn fake_gipa(
        _instance: vk::Instance,
        _name: *const c_char,
    ) -> vk::PFN_vkVoidFunction {
        None
    }

    #[test]
    fn finds_link_info_behind_foreign_nodes() {
        let mut link = InstanceLink {
            p_next: ptr::null_mut(),
            pfn_next_get_instance_proc_addr: fake_gipa,
            pfn_next_get_physical_device_proc_addr: ptr::null(),
        };
        let mut link_node = LayerInstanceCreateInfo {
            s_type: vk::StructureType::LOADER_INSTANCE_CREATE_INFO,
            p_next: ptr::null(),
            function: VK_LAYER_LINK_INFO,
            u: LayerInstanceUnion {
                p_layer_info: &mut link,
            },
        };
        // A loader callback node of the same sType but a different function
        // must be skipped.
        let callback_node = LayerInstanceCreateInfo {
            s_type: vk::StructureType::LOADER_INSTANCE_CREATE_INFO,
            p_next: &mut link_node as *mut _ as *const c_void,
            function: 1,
            u: LayerInstanceUnion {
                pfn_callback: ptr::null(),
            },
        };

        let found = unsafe { find_instance_link_info(&callback_node as *const _ as *const c_void) };
        assert_eq!(found, &mut link_node as *mut _);
        assert_eq!(
            unsafe { (*found).u.p_layer_info },
            &mut link as *mut InstanceLink
        );
    }

    #[test]
    fn missing_link_info_returns_null() {
        assert!(unsafe { find_instance_link_info(ptr::null()) }.is_null());
        assert!(unsafe { find_device_link_info(ptr::null()) }.is_null());
    }
}
