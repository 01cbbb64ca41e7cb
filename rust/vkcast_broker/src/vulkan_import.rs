//! DMA-BUF to Vulkan texture import.

use std::ffi::CStr;
use std::os::fd::RawFd;

use anyhow::Context;
use ash::{ext, khr, vk};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::info;
use vkcast_wire::{TextureInfo, DRM_FORMAT_MOD_INVALID};

use crate::source::DmabufImporter;

const DEVICE_EXTENSIONS: [&CStr; 3] = [
    khr::external_memory_fd::NAME,
    ext::external_memory_dma_buf::NAME,
    ext::image_drm_format_modifier::NAME,
];

/// Owns a private Vulkan instance/device used only to wrap received DMA-BUFs
/// as sampleable images.
pub struct VulkanImporter {
    _entry: ash::Entry,
    instance: ash::Instance,
    phys: vk::PhysicalDevice,
    device: ash::Device,
    khr_mem_fd: khr::external_memory_fd::Device,
    memory_props: vk::PhysicalDeviceMemoryProperties,
}

pub struct ImportedTexture {
    device: ash::Device,
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    pub width: u32,
    pub height: u32,
}

impl Drop for ImportedTexture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

impl VulkanImporter {
    pub fn new() -> anyhow::Result<Self> {
        let entry = unsafe { ash::Entry::load() }.context("load vulkan")?;

        let app = vk::ApplicationInfo::default()
            .application_name(c"vkcast-broker")
            .api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&app);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .context("create vk instance")?;

        let result = (|| {
            let phys = pick_physical_device(&instance)?;
            let (device, queue_family_index) = create_device(&instance, phys)?;
            info!("dmabuf importer using queue family {queue_family_index}");
            let khr_mem_fd = khr::external_memory_fd::Device::new(&instance, &device);
            let memory_props =
                unsafe { instance.get_physical_device_memory_properties(phys) };
            Ok::<_, anyhow::Error>((phys, device, khr_mem_fd, memory_props))
        })();

        match result {
            Ok((phys, device, khr_mem_fd, memory_props)) => Ok(Self {
                _entry: entry,
                instance,
                phys,
                device,
                khr_mem_fd,
                memory_props,
            }),
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    fn vk_format_for(format: u32) -> anyhow::Result<vk::Format> {
        // Zero means "whatever the producer's swapchain used"; every
        // mainstream compositor path lands on BGRA there.
        if format == 0 {
            return Ok(vk::Format::B8G8R8A8_UNORM);
        }
        match DrmFourcc::try_from(format) {
            Ok(DrmFourcc::Argb8888) | Ok(DrmFourcc::Xrgb8888) => Ok(vk::Format::B8G8R8A8_UNORM),
            Ok(DrmFourcc::Abgr8888) | Ok(DrmFourcc::Xbgr8888) => Ok(vk::Format::R8G8B8A8_UNORM),
            other => anyhow::bail!("unsupported dmabuf format {other:?}"),
        }
    }

    fn memory_type_for(&self, allowed_type_bits: u32) -> anyhow::Result<u32> {
        let props = &self.memory_props;
        let mut fallback = None;
        for i in 0..props.memory_type_count {
            if allowed_type_bits & (1 << i) == 0 {
                continue;
            }
            let flags = props.memory_types[i as usize].property_flags;
            if flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                return Ok(i);
            }
            fallback.get_or_insert(i);
        }
        fallback.ok_or_else(|| {
            anyhow::anyhow!("no usable memory type in allowed bits {allowed_type_bits:#x}")
        })
    }
}

impl DmabufImporter for VulkanImporter {
    type Texture = ImportedTexture;

    fn import(&mut self, info: &TextureInfo, fds: &[RawFd]) -> anyhow::Result<ImportedTexture> {
        if info.nfd != 1 || fds.len() != 1 {
            anyhow::bail!(
                "only single-plane dmabufs are supported (got {} planes)",
                info.nfd
            );
        }
        let format = Self::vk_format_for(info.format)?;
        // An absent modifier means the producer exported a plain linear
        // image.
        let modifier = if info.modifier == DRM_FORMAT_MOD_INVALID {
            u64::from(DrmModifier::Linear)
        } else {
            info.modifier
        };

        let fd = unsafe { libc::dup(fds[0]) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("dup dmabuf fd");
        }

        let stride = u64::from(info.strides[0]);
        let plane_layout = vk::SubresourceLayout {
            offset: u64::from(info.offsets[0]),
            size: stride.saturating_mul(u64::from(info.height)),
            row_pitch: stride,
            array_pitch: 0,
            depth_pitch: 0,
        };

        let mut explicit = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .drm_format_modifier(modifier)
            .plane_layouts(std::slice::from_ref(&plane_layout));
        let mut external = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let image_info = vk::ImageCreateInfo::default()
            .push_next(&mut external)
            .push_next(&mut explicit)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = match unsafe { self.device.create_image(&image_info, None) } {
            Ok(image) => image,
            Err(err) => {
                let _ = unsafe { libc::close(fd) };
                return Err(err).context("create imported image");
            }
        };

        let mut dedicated_req = vk::MemoryDedicatedRequirements::default();
        let mut mem_req2 = vk::MemoryRequirements2::default().push_next(&mut dedicated_req);
        let req_info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        unsafe {
            self.device
                .get_image_memory_requirements2(&req_info, &mut mem_req2)
        };
        let mem_req = mem_req2.memory_requirements;

        let mut fd_props = vk::MemoryFdPropertiesKHR::default();
        if let Err(err) = unsafe {
            self.khr_mem_fd.get_memory_fd_properties(
                vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                fd,
                &mut fd_props,
            )
        } {
            unsafe { self.device.destroy_image(image, None) };
            let _ = unsafe { libc::close(fd) };
            return Err(err).context("vkGetMemoryFdPropertiesKHR");
        }

        let allowed_type_bits = mem_req.memory_type_bits & fd_props.memory_type_bits;
        if allowed_type_bits == 0 {
            unsafe { self.device.destroy_image(image, None) };
            let _ = unsafe { libc::close(fd) };
            anyhow::bail!(
                "no compatible memory types for imported fd (image bits {:#x}, fd bits {:#x})",
                mem_req.memory_type_bits,
                fd_props.memory_type_bits
            );
        }
        let memory_type_index = match self.memory_type_for(allowed_type_bits) {
            Ok(idx) => idx,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                let _ = unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(fd);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let mut alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_req.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info);
        if dedicated_req.requires_dedicated_allocation == vk::TRUE
            || dedicated_req.prefers_dedicated_allocation == vk::TRUE
        {
            alloc = alloc.push_next(&mut dedicated_info);
        }

        let memory = match unsafe { self.device.allocate_memory(&alloc, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                // Vulkan only takes ownership of the fd on success.
                let _ = unsafe { libc::close(fd) };
                return Err(err).with_context(|| {
                    format!(
                        "allocate imported memory ({}x{} stride {} modifier {:#x})",
                        info.width, info.height, stride, modifier
                    )
                });
            }
        };

        if let Err(err) = unsafe { self.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
            }
            return Err(err).context("bind imported image memory");
        }

        Ok(ImportedTexture {
            device: self.device.clone(),
            image,
            memory,
            width: info.width,
            height: info.height,
        })
    }
}

impl Drop for VulkanImporter {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn pick_physical_device(instance: &ash::Instance) -> anyhow::Result<vk::PhysicalDevice> {
    let devices =
        unsafe { instance.enumerate_physical_devices() }.context("enumerate physical devices")?;
    for phys in devices {
        let exts = unsafe { instance.enumerate_device_extension_properties(phys) }
            .context("enumerate device extensions")?;
        let has_all = DEVICE_EXTENSIONS.iter().all(|wanted| {
            exts.iter().any(|e| {
                e.extension_name_as_c_str()
                    .map_or(false, |name| name == *wanted)
            })
        });
        if has_all {
            return Ok(phys);
        }
    }
    anyhow::bail!("no Vulkan device supports dmabuf import");
}

fn create_device(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
) -> anyhow::Result<(ash::Device, u32)> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(phys) };
    let queue_family_index = families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| {
            families
                .iter()
                .position(|f| f.queue_flags.contains(vk::QueueFlags::TRANSFER))
        })
        .context("no suitable queue family")? as u32;

    let ext_ptrs: Vec<*const std::ffi::c_char> =
        DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();
    let queue_info = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&[1.0])];
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_info)
        .enabled_extension_names(&ext_ptrs);

    let device = unsafe { instance.create_device(phys, &device_info, None) }
        .context("create vk device")?;
    Ok((device, queue_family_index))
}
