// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default; a missing file means defaults, a broken one
// logs a warning and falls back to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode; FIFO is used when the surface lacks it.
    pub present_mode: String,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Compiled SPIR-V locations
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/vert.spv"),
            fragment: PathBuf::from("shaders/frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Only honoured in debug builds
    pub validation_layers: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
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

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get preferred present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            other => {
                log::warn!("Unknown present mode '{}', defaulting to FIFO", other);
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', using info", self.debug.log_level);
            log::LevelFilter::Info
        })
    }

    /// Validation is a debug-build convenience only.
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert!(config.window.resizable);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/vert.spv"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            title = "Quad"
            width = 1920

            [graphics]
            present_mode = "FIFO"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "Quad");
        assert_eq!(config.window.width, 1920);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::parse("[graphics]\npresent_mode = \"turbo\"").unwrap();

        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        let config = Config::parse("[debug]\nlog_level = \"DEBUG\"").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);

        let config = Config::parse("[debug]\nlog_level = \"loud\"").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
        assert!(Config::parse("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("no/such/config.toml").unwrap();
        assert_eq!(config.window.title, "Vulkan");
    }
}
