//! Next-layer dispatch tables.
//!
//! Resolved once at instance/device creation through the next layer's
//! `GetInstanceProcAddr`/`GetDeviceProcAddr`. A table only exists in its
//! complete form; any missing entry point makes the whole load fail and the
//! owning instance/device fall back to pass-through.

use std::ffi::c_char;

use ash::vk;

macro_rules! define_funcs {
    ($table:ident, $handle:ty, $($field:ident: $pfn:ty = $name:literal),+ $(,)?) => {
        pub struct $table {
            $(pub $field: $pfn,)+
        }

        impl $table {
            /// Returns `None` if the next layer is missing any entry point.
            pub unsafe fn load(
                gpa: unsafe extern "system" fn($handle, *const c_char) -> vk::PFN_vkVoidFunction,
                handle: $handle,
            ) -> Option<Self> {
                $(
                    let $field: Option<$pfn> = {
                        let pfn = gpa(handle, concat!("vk", $name, "\0").as_ptr().cast());
                        if pfn.is_none() {
                            tracing::warn!("could not get address for vk{}", $name);
                        }
                        std::mem::transmute(pfn)
                    };
                )+
                Some(Self {
                    $($field: $field?,)+
                })
            }
        }
    };
}

define_funcs!(
    InstanceFuncs, vk::Instance,
    destroy_instance: vk::PFN_vkDestroyInstance = "DestroyInstance",
    get_physical_device_queue_family_properties: vk::PFN_vkGetPhysicalDeviceQueueFamilyProperties
        = "GetPhysicalDeviceQueueFamilyProperties",
    get_physical_device_memory_properties: vk::PFN_vkGetPhysicalDeviceMemoryProperties
        = "GetPhysicalDeviceMemoryProperties",
);

define_funcs!(
    DeviceFuncs, vk::Device,
    create_swapchain_khr: vk::PFN_vkCreateSwapchainKHR = "CreateSwapchainKHR",
    destroy_swapchain_khr: vk::PFN_vkDestroySwapchainKHR = "DestroySwapchainKHR",
    queue_present_khr: vk::PFN_vkQueuePresentKHR = "QueuePresentKHR",
    get_swapchain_images_khr: vk::PFN_vkGetSwapchainImagesKHR = "GetSwapchainImagesKHR",
    allocate_memory: vk::PFN_vkAllocateMemory = "AllocateMemory",
    free_memory: vk::PFN_vkFreeMemory = "FreeMemory",
    bind_image_memory2: vk::PFN_vkBindImageMemory2 = "BindImageMemory2",
    create_image: vk::PFN_vkCreateImage = "CreateImage",
    destroy_image: vk::PFN_vkDestroyImage = "DestroyImage",
    get_image_memory_requirements2: vk::PFN_vkGetImageMemoryRequirements2
        = "GetImageMemoryRequirements2",
    get_image_subresource_layout: vk::PFN_vkGetImageSubresourceLayout
        = "GetImageSubresourceLayout",
    get_memory_fd_khr: vk::PFN_vkGetMemoryFdKHR = "GetMemoryFdKHR",
    get_device_queue: vk::PFN_vkGetDeviceQueue = "GetDeviceQueue",
    queue_submit: vk::PFN_vkQueueSubmit = "QueueSubmit",
    create_command_pool: vk::PFN_vkCreateCommandPool = "CreateCommandPool",
    destroy_command_pool: vk::PFN_vkDestroyCommandPool = "DestroyCommandPool",
    reset_command_pool: vk::PFN_vkResetCommandPool = "ResetCommandPool",
    allocate_command_buffers: vk::PFN_vkAllocateCommandBuffers = "AllocateCommandBuffers",
    begin_command_buffer: vk::PFN_vkBeginCommandBuffer = "BeginCommandBuffer",
    end_command_buffer: vk::PFN_vkEndCommandBuffer = "EndCommandBuffer",
    cmd_copy_image: vk::PFN_vkCmdCopyImage = "CmdCopyImage",
    cmd_pipeline_barrier: vk::PFN_vkCmdPipelineBarrier = "CmdPipelineBarrier",
    create_fence: vk::PFN_vkCreateFence = "CreateFence",
    destroy_fence: vk::PFN_vkDestroyFence = "DestroyFence",
    wait_for_fences: vk::PFN_vkWaitForFences = "WaitForFences",
    reset_fences: vk::PFN_vkResetFences = "ResetFences",
);
