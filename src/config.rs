// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// The loaded `Config` is an immutable value handed to constructors; nothing in
// the engine reads process-wide settings. Missing files or sections fall back
// to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub frame: FrameConfig,
    pub queues: QueueConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Engine".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// What to do when a device exposes none of the preferred surface formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceFormatPolicy {
    /// Reject the device.
    #[default]
    Strict,
    /// Take the first format the surface reports, with a warning.
    FirstAvailable,
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub surface_format: SurfaceFormatPolicy,
    pub clear_color: [f32; 4],
    /// Case-insensitive substring of a device name that gets a large score bonus.
    pub preferred_device: Option<String>,
    /// Directory searched for compiled `<name>.spv` shaders.
    pub shader_dir: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            surface_format: SurfaceFormatPolicy::Strict,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            preferred_device: None,
            shader_dir: "shaders".to_string(),
        }
    }
}

/// Frame loop timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub fence_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: 5_000,
            acquire_timeout_ms: 1_000,
            poll_interval_ms: 100,
        }
    }
}

impl FrameConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Never zero, so a fence wait always makes progress.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// How the queue classifier treats two families with the same capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateFamilyPolicy {
    /// Fail startup with `DuplicateClass`.
    Reject,
    /// Keep all of them and pick the most specific, then lowest index.
    #[default]
    MostSpecific,
}

/// Queue reservations made before logical-device creation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    pub duplicate_families: DuplicateFamilyPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            graphics: 1,
            compute: 0,
            transfer: 0,
            duplicate_families: DuplicateFamilyPolicy::MostSpecific,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Fail startup instead of continuing without validation.
    pub require_validation: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            require_validation: false,
            log_to_file: false,
            log_file: "frame_engine.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Preferred present mode as Vulkan enum. FIFO is the universal fallback
    /// the selector uses when this one is unavailable.
    pub fn preferred_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }
}
