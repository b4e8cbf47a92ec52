// Diagnostics - where validation-layer output goes
//
// The debug-utils messenger hands every message to a `DiagnosticsSink`. The
// default sink forwards to the `log` facade under `vulkan::<category>`.

use ash::vk;
use std::ffi::CStr;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn from_vk(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Self::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            Self::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Self::Info
        } else {
            Self::Verbose
        }
    }

    pub fn level(self) -> log::Level {
        match self {
            Self::Verbose => log::Level::Trace,
            Self::Info => log::Level::Debug,
            Self::Warning => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Validation,
    Performance,
    General,
}

impl Category {
    /// Validation wins over performance, performance over general.
    pub fn from_vk(flags: vk::DebugUtilsMessageTypeFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
            Self::Validation
        } else if flags.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
            Self::Performance
        } else {
            Self::General
        }
    }

    pub fn target(self) -> &'static str {
        match self {
            Self::Validation => "vulkan::validation",
            Self::Performance => "vulkan::performance",
            Self::General => "vulkan::general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validation => "validation",
            Self::Performance => "performance",
            Self::General => "general",
        })
    }
}

pub trait DiagnosticsSink: Send + Sync {
    fn emit(&self, severity: Severity, category: Category, message: &str);
}

/// Forwards diagnostics to the `log` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn emit(&self, severity: Severity, category: Category, message: &str) {
        log::log!(target: category.target(), severity.level(), "[Vulkan] {}", message);
    }
}

/// Severities the messenger subscribes to.
pub fn subscribed_severities() -> vk::DebugUtilsMessageSeverityFlagsEXT {
    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
}

pub fn subscribed_categories() -> vk::DebugUtilsMessageTypeFlagsEXT {
    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
}

/// Debug-utils callback. `p_user_data` must point at a live
/// `Box<dyn DiagnosticsSink>` owned by the instance that created the messenger.
pub unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }

    let data = &*p_callback_data;
    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };

    let sink = &*(p_user_data as *const Box<dyn DiagnosticsSink>);
    sink.emit(
        Severity::from_vk(message_severity),
        Category::from_vk(message_type),
        &message,
    );

    vk::FALSE
}
