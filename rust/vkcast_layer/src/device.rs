//! Device-chain interception and per-device capture state.

use std::ffi::CStr;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use ash::vk::Handle;
use tracing::{info, warn};

use crate::export;
use crate::funcs::{DeviceFuncs, InstanceFuncs};
use crate::instance::InstanceState;
use crate::link;
use crate::registry::{self, ObjectMap};
use crate::swapchain::SwapState;
use crate::{DEVICES, INSTANCES};

pub struct FrameSlot {
    pub cmd_pool: vk::CommandPool,
    pub cmd_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub busy: bool,
}

#[derive(Default)]
pub struct FrameRing {
    pub slots: Vec<FrameSlot>,
    pub index: usize,
}

pub struct QueueState {
    pub fam_idx: u32,
    pub supports_transfer: bool,
    pub ring: Mutex<FrameRing>,
}

/// The application's allocator callbacks, captured at device creation. The
/// callbacks and their user pointer stay valid for the device's lifetime per
/// the Vulkan allocation contract.
pub struct AllocCallbacks(Option<vk::AllocationCallbacks<'static>>);

unsafe impl Send for AllocCallbacks {}
unsafe impl Sync for AllocCallbacks {}

impl AllocCallbacks {
    pub fn as_ptr(&self) -> *const vk::AllocationCallbacks<'static> {
        match &self.0 {
            Some(ac) => ac,
            None => ptr::null(),
        }
    }
}

pub struct DeviceState {
    pub device: vk::Device,
    pub phys: vk::PhysicalDevice,
    valid: AtomicBool,
    pub next_gdpa: vk::PFN_vkGetDeviceProcAddr,
    destroy_device_fn: Option<vk::PFN_vkDestroyDevice>,
    pub funcs: Option<DeviceFuncs>,
    pub instance: Arc<InstanceState>,
    pub queues: ObjectMap<QueueState>,
    pub swaps: ObjectMap<SwapState>,
    pub cur_swap: Mutex<Option<Arc<SwapState>>>,
    pub ac: AllocCallbacks,
}

impl DeviceState {
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Relaxed);
    }

    pub fn ac_ptr(&self) -> *const vk::AllocationCallbacks<'static> {
        self.ac.as_ptr()
    }

    pub fn instance_funcs(&self) -> Option<&InstanceFuncs> {
        self.instance.funcs.as_ref()
    }
}

pub(crate) unsafe extern "system" fn create_device(
    phys: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    if p_create_info.is_null() || p_device.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let Some(inst) = INSTANCES.get(registry::dispatch_key(phys.as_raw())) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let ldci = link::find_device_link_info((*p_create_info).p_next);
    if ldci.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let layer_info = (*ldci).u.p_layer_info;
    if layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let gipa = (*layer_info).pfn_next_get_instance_proc_addr;
    let gdpa = (*layer_info).pfn_next_get_device_proc_addr;
    (*ldci).u.p_layer_info = (*layer_info).p_next;

    // The DMA-BUF export requires VK_KHR_external_memory_fd; enable it on
    // the application's behalf when absent.
    let mut info = *p_create_info;
    let wanted = ash::khr::external_memory_fd::NAME;
    let existing: &[*const std::ffi::c_char] = if info.enabled_extension_count > 0 {
        slice::from_raw_parts(
            info.pp_enabled_extension_names,
            info.enabled_extension_count as usize,
        )
    } else {
        &[]
    };
    let mut ext_names = existing.to_vec();
    let already_enabled = existing
        .iter()
        .any(|&p| !p.is_null() && CStr::from_ptr(p) == wanted);
    if !already_enabled {
        info!("enabling {:?} for capture", wanted);
        ext_names.push(wanted.as_ptr());
        info.enabled_extension_count = ext_names.len() as u32;
        info.pp_enabled_extension_names = ext_names.as_ptr();
    }

    let create: vk::PFN_vkCreateDevice = match mem::transmute::<
        vk::PFN_vkVoidFunction,
        Option<vk::PFN_vkCreateDevice>,
    >(gipa(inst.instance, c"vkCreateDevice".as_ptr())) {
        Some(f) => f,
        None => return vk::Result::ERROR_INITIALIZATION_FAILED,
    };

    let res = create(phys, &info, p_allocator, p_device);
    if res != vk::Result::SUCCESS {
        return res;
    }
    let device = *p_device;

    let destroy_device_fn: Option<vk::PFN_vkDestroyDevice> =
        mem::transmute(gdpa(device, c"vkDestroyDevice".as_ptr()));
    let funcs = DeviceFuncs::load(gdpa, device);
    let valid = funcs.is_some() && inst.valid();
    if !valid {
        warn!("device is missing required entry points, capture disabled");
    }

    let queues = ObjectMap::new();
    if let (Some(dfuncs), Some(ifuncs)) = (funcs.as_ref(), inst.funcs.as_ref()) {
        let mut family_count = 0u32;
        (ifuncs.get_physical_device_queue_family_properties)(
            phys,
            &mut family_count,
            ptr::null_mut(),
        );
        let mut families = vec![vk::QueueFamilyProperties::default(); family_count as usize];
        (ifuncs.get_physical_device_queue_family_properties)(
            phys,
            &mut family_count,
            families.as_mut_ptr(),
        );

        let queue_infos = slice::from_raw_parts(
            info.p_queue_create_infos,
            info.queue_create_info_count as usize,
        );
        for queue_info in queue_infos {
            let fam_idx = queue_info.queue_family_index;
            let supports_transfer = families.get(fam_idx as usize).map_or(false, |f| {
                f.queue_flags.intersects(
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                )
            });
            for queue_index in 0..queue_info.queue_count {
                let mut queue = vk::Queue::null();
                (dfuncs.get_device_queue)(device, fam_idx, queue_index, &mut queue);
                queues.insert(
                    queue.as_raw(),
                    Arc::new(QueueState {
                        fam_idx,
                        supports_transfer,
                        ring: Mutex::new(FrameRing::default()),
                    }),
                );
            }
        }
    }

    let ac = AllocCallbacks(if p_allocator.is_null() {
        None
    } else {
        Some(mem::transmute::<
            vk::AllocationCallbacks<'_>,
            vk::AllocationCallbacks<'static>,
        >(*p_allocator))
    });

    DEVICES.insert(
        registry::dispatch_key(device.as_raw()),
        Arc::new(DeviceState {
            device,
            phys,
            valid: AtomicBool::new(valid),
            next_gdpa: gdpa,
            destroy_device_fn,
            funcs,
            instance: inst,
            queues,
            swaps: ObjectMap::new(),
            cur_swap: Mutex::new(None),
            ac,
        }),
    );

    res
}

pub(crate) unsafe extern "system" fn destroy_device(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if device == vk::Device::null() {
        return;
    }
    let Some(state) = DEVICES.remove(registry::dispatch_key(device.as_raw())) else {
        return;
    };

    if let Some(funcs) = &state.funcs {
        if state.cur_swap.lock().unwrap().is_some() {
            export::shtex_free(&state, funcs);
        }
        state.queues.walk(|queue| {
            let mut ring = queue.ring.lock().unwrap();
            unsafe {
                export::destroy_frame_slots(state.device, funcs, state.ac_ptr(), &mut ring);
            }
        });
    }
    state.queues.drain();
    state.swaps.drain();

    let destroy = state.destroy_device_fn.or_else(|| unsafe {
        mem::transmute::<vk::PFN_vkVoidFunction, Option<vk::PFN_vkDestroyDevice>>((state
            .next_gdpa)(
            device,
            c"vkDestroyDevice".as_ptr(),
        ))
    });
    if let Some(destroy) = destroy {
        destroy(device, p_allocator);
    }
}
