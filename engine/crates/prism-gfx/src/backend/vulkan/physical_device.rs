use std::ffi::CStr;

use ash::vk;
use itertools::Itertools;

use crate::error::{GfxError, GfxResult};

/// 表示一张物理显卡
pub struct GfxPhysicalDevice {
    pub(crate) vk_handle: vk::PhysicalDevice,

    /// 当前 gpu 的基础属性
    pub(crate) basic_props: vk::PhysicalDeviceProperties,

    /// 当前 gpu 的加速结构属性
    pub(crate) acc_struct_props: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static>,

    /// 全能的 queue family：graphics, compute, transfer
    pub(crate) queue_family_index: u32,
}

impl GfxPhysicalDevice {
    /// 优先选择独立显卡，否则选择第一个满足条件的显卡
    ///
    /// surface: 如果存在，queue family 还必须支持 present
    pub fn select(
        instance: &ash::Instance,
        surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
        required_exts: &[&CStr],
    ) -> GfxResult<Self> {
        let pdevices = unsafe { instance.enumerate_physical_devices()? };
        pdevices
            .iter()
            .filter_map(|pdevice| Self::new(*pdevice, instance, surface, required_exts))
            // 优先使用独立显卡
            .find_or_first(GfxPhysicalDevice::is_descrete_gpu)
            .ok_or(GfxError::NoPhysicalDevice)
    }

    /// 不满足条件时返回 None
    fn new(
        pdevice: vk::PhysicalDevice,
        instance: &ash::Instance,
        surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
        required_exts: &[&CStr],
    ) -> Option<Self> {
        unsafe {
            let mut acc_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut acc_props);
            instance.get_physical_device_properties2(pdevice, &mut props2);
            let basic_props = props2.properties;
            acc_props.p_next = std::ptr::null_mut();

            let device_name = basic_props.device_name_as_c_str().unwrap_or(c"unknown");
            log::info!("found gpu: {:?}", device_name);

            // 检查必须的 device extensions
            let device_exts = instance.enumerate_device_extension_properties(pdevice).ok()?;
            let missing = required_exts
                .iter()
                .filter(|ext| {
                    !device_exts.iter().any(|props| props.extension_name_as_c_str().is_ok_and(|name| name == **ext))
                })
                .collect_vec();
            if !missing.is_empty() {
                log::info!("gpu {:?} skipped, missing extensions: {:?}", device_name, missing);
                return None;
            }

            let queue_family_props = instance.get_physical_device_queue_family_properties(pdevice);
            let queue_family_index = queue_family_props.iter().enumerate().find_map(|(idx, props)| {
                let all_purpose = props.queue_flags.contains(
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                );
                let present = surface.is_none_or(|(loader, surface)| {
                    loader.get_physical_device_surface_support(pdevice, idx as u32, surface).unwrap_or(false)
                });
                (all_purpose && present).then_some(idx as u32)
            })?;

            Some(Self {
                vk_handle: pdevice,
                basic_props,
                acc_struct_props: acc_props,
                queue_family_index,
            })
        }
    }

    /// 当前 gpu 是否是独立显卡
    #[inline]
    pub fn is_descrete_gpu(&self) -> bool {
        self.basic_props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    #[inline]
    pub fn device_name(&self) -> String {
        self.basic_props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
