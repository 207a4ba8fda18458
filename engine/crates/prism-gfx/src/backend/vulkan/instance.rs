use std::ffi::{CStr, CString, c_char};

use ash::vk;
use itertools::Itertools;

use crate::{
    backend::vulkan::debug_messenger::GfxDebugMsger,
    error::{GfxError, GfxResult},
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct GfxInstance {
    pub(crate) ash_instance: ash::Instance,
}

impl GfxInstance {
    /// 设置所需的 layers 和 extensions，创建 vk instance
    ///
    /// extra_instance_exts: 例如创建 surface 所需的 extension
    pub fn new(entry: &ash::Entry, app_name: &str, extra_instance_exts: &[*const c_char]) -> GfxResult<Self> {
        let app_name = CString::new(app_name).unwrap_or_default();
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"prism")
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let enabled_extensions = Self::get_extensions(entry, extra_instance_exts)?;
        let enabled_layers = Self::get_layers(entry)?;
        log::info!(
            "instance extensions: {}\ninstance layers: {}",
            enabled_extensions.iter().map(|e| format!("\n\t{:?}", unsafe { CStr::from_ptr(*e) })).join(""),
            enabled_layers.iter().map(|l| format!("\n\t{:?}", unsafe { CStr::from_ptr(*l) })).join("")
        );

        // 为 instance info 添加 debug messenger
        let mut debug_utils_messenger_ci = GfxDebugMsger::debug_utils_messenger_ci();
        let instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_extensions)
            .enabled_layer_names(&enabled_layers)
            .push_next(&mut debug_utils_messenger_ci);

        let ash_instance = unsafe { entry.create_instance(&instance_ci, None)? };
        Ok(Self { ash_instance })
    }

    pub fn destroy(self) {
        log::info!("destroying instance");
        unsafe {
            self.ash_instance.destroy_instance(None);
        }
    }
}
// 构造过程
impl GfxInstance {
    fn get_extensions(entry: &ash::Entry, extra_instance_exts: &[*const c_char]) -> GfxResult<Vec<*const c_char>> {
        let all_ext_props = unsafe { entry.enumerate_instance_extension_properties(None)? };

        // 这个 extension 提供 debug messenger、debug name 以及 command buffer label
        let required = std::iter::once(vk::EXT_DEBUG_UTILS_NAME)
            .chain(extra_instance_exts.iter().map(|e| unsafe { CStr::from_ptr(*e) }))
            .unique()
            .collect_vec();

        for ext in &required {
            let supported = all_ext_props
                .iter()
                .any(|props| props.extension_name_as_c_str().is_ok_and(|name| name == *ext));
            if !supported {
                return Err(GfxError::Unsupported {
                    kind: "instance extension",
                    name: ext.to_string_lossy().into_owned(),
                });
            }
        }

        Ok(required.iter().map(|e| e.as_ptr()).collect_vec())
    }

    /// debug 构建下尽量开启 validation layer，找不到时只给出警告
    fn get_layers(entry: &ash::Entry) -> GfxResult<Vec<*const c_char>> {
        if !cfg!(debug_assertions) {
            return Ok(vec![]);
        }

        let all_layer_props = unsafe { entry.enumerate_instance_layer_properties()? };
        let supported = all_layer_props
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
        if supported {
            Ok(vec![VALIDATION_LAYER.as_ptr()])
        } else {
            log::warn!("validation layer {:?} is not available", VALIDATION_LAYER);
            Ok(vec![])
        }
    }
}
