// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
pub use scanout_config::{AllocatorKind, OutputConfig, ScanoutConfig};
use smithay::backend::allocator::Fourcc;
use tracing::{debug, info, warn};

use crate::{
    backend::kms::DeviceSettings,
    utils::env::{bool_var, parsed_var, path_var},
};

/// Settings in effect, the config file with command line and environment
/// overrides applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: ScanoutConfig,
    /// Card to use as primary gpu instead of the seat's boot gpu.
    pub device: Option<PathBuf>,
    pub allocator: AllocatorKind,
    pub format: Fourcc,
    pub idle_timeout: Duration,
}

/// Values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub device: Option<PathBuf>,
    pub allocator: Option<AllocatorKind>,
    pub disable_gbm: bool,
}

impl Overrides {
    pub fn from_env() -> Overrides {
        Overrides {
            device: path_var("SCANOUT_DRM_DEVICE"),
            allocator: parsed_var("SCANOUT_ALLOCATOR"),
            disable_gbm: bool_var("SCANOUT_DISABLE_GBM").unwrap_or(false),
        }
    }
}

impl Config {
    /// Loads the config file. `device` comes from the command line and wins
    /// over everything else.
    pub fn load(device: Option<PathBuf>) -> Config {
        let xdg = xdg::BaseDirectories::with_prefix("scanout").ok();
        let file = Self::load_file(xdg.as_ref());

        let mut overrides = Overrides::from_env();
        if device.is_some() {
            overrides.device = device;
        }
        Config::new(file, overrides)
    }

    fn load_file(xdg: Option<&xdg::BaseDirectories>) -> ScanoutConfig {
        let mut locations = Vec::with_capacity(3);
        if let Some(base) = xdg {
            locations.push(base.get_config_file("scanout.ron"));
        }
        if cfg!(debug_assertions) {
            if let Ok(mut cwd) = std::env::current_dir() {
                cwd.push("scanout.ron");
                locations.push(cwd);
            }
        }
        locations.push(PathBuf::from("/etc/scanout/scanout.ron"));

        for path in locations {
            debug!("Trying config location: {}", path.display());
            if path.exists() {
                info!("Using config at {}", path.display());
                match read_config(&path) {
                    Ok(config) => return config,
                    Err(err) => {
                        warn!(?err, "Failed to read config, using defaults.");
                        break;
                    }
                }
            }
        }

        ScanoutConfig::default()
    }

    pub fn new(file: ScanoutConfig, overrides: Overrides) -> Config {
        let format = parse_fourcc(&file.format).unwrap_or_else(|| {
            warn!(format = %file.format, "Unknown pixel format, using XR24");
            Fourcc::Xrgb8888
        });

        let mut allocator = overrides.allocator.unwrap_or(file.allocator);
        if overrides.disable_gbm {
            allocator = AllocatorKind::Dumb;
        }

        Config {
            device: overrides.device.or_else(|| file.device.clone()),
            allocator,
            format,
            idle_timeout: Duration::from_millis(file.idle_timeout_ms),
            file,
        }
    }

    pub fn output(&self, name: &str) -> OutputConfig {
        self.file.output(name)
    }

    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            allocator: self.allocator,
            format: self.format,
            idle_timeout: self.idle_timeout,
        }
    }
}

fn read_config(path: &Path) -> Result<ScanoutConfig> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let config = ron::de::from_reader(file)
        .with_context(|| format!("Malformed config file {}", path.display()))?;
    Ok(config)
}

/// Parses a four character code like `XR24` or `AR24`.
pub fn parse_fourcc(code: &str) -> Option<Fourcc> {
    let bytes: [u8; 4] = code.as_bytes().try_into().ok()?;
    Fourcc::try_from(u32::from_le_bytes(bytes)).ok()
}
