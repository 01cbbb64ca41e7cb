//! Instance-chain interception.

use std::mem;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use tracing::warn;

use crate::funcs::InstanceFuncs;
use crate::link;
use crate::registry;
use crate::INSTANCES;

pub struct InstanceState {
    pub instance: vk::Instance,
    pub next_gipa: vk::PFN_vkGetInstanceProcAddr,
    pub funcs: Option<InstanceFuncs>,
    valid: bool,
}

impl InstanceState {
    pub fn valid(&self) -> bool {
        self.valid && self.funcs.is_some()
    }
}

pub(crate) unsafe extern "system" fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    if p_create_info.is_null() || p_instance.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    let lici = link::find_instance_link_info((*p_create_info).p_next);
    if lici.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let layer_info = (*lici).u.p_layer_info;
    if layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let gipa = (*layer_info).pfn_next_get_instance_proc_addr;
    // Advance the chain for the next layer down.
    (*lici).u.p_layer_info = (*layer_info).p_next;

    // The memory-fd export path needs 1.2; raise a lower requested version.
    let mut info = *p_create_info;
    let app_info = if info.p_application_info.is_null() {
        vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_2)
    } else {
        let mut app_info = *info.p_application_info;
        if app_info.api_version < vk::API_VERSION_1_2 {
            app_info.api_version = vk::API_VERSION_1_2;
        }
        app_info
    };
    info.p_application_info = &app_info;

    let create: vk::PFN_vkCreateInstance = match mem::transmute::<
        vk::PFN_vkVoidFunction,
        Option<vk::PFN_vkCreateInstance>,
    >(gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr())) {
        Some(f) => f,
        None => return vk::Result::ERROR_INITIALIZATION_FAILED,
    };

    let mut res = create(&info, p_allocator, p_instance);
    let mut valid = res == vk::Result::SUCCESS;
    if !valid {
        // Retry with the caller's untouched arguments.
        res = create(p_create_info, p_allocator, p_instance);
        if res != vk::Result::SUCCESS {
            return res;
        }
    }

    let instance = *p_instance;
    let funcs = InstanceFuncs::load(gipa, instance);
    if funcs.is_none() {
        warn!("instance is missing required entry points, capture disabled");
        valid = false;
    }

    INSTANCES.insert(
        registry::dispatch_key(instance.as_raw()),
        Arc::new(InstanceState {
            instance,
            next_gipa: gipa,
            funcs,
            valid,
        }),
    );

    res
}

pub(crate) unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if instance == vk::Instance::null() {
        return;
    }
    let Some(state) = INSTANCES.remove(registry::dispatch_key(instance.as_raw())) else {
        return;
    };
    let destroy = state.funcs.as_ref().map(|f| f.destroy_instance).or_else(|| unsafe {
        mem::transmute::<vk::PFN_vkVoidFunction, Option<vk::PFN_vkDestroyInstance>>((state
            .next_gipa)(
            instance,
            c"vkDestroyInstance".as_ptr(),
        ))
    });
    if let Some(destroy) = destroy {
        destroy(instance, p_allocator);
    }
}
