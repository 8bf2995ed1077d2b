// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, str::FromStr};

pub mod output;

pub use output::{EdidProduct, OutputConfig};

/// Buffer allocation strategy used for scanout buffers.
#[derive(Debug, Default, Deserialize, Serialize, Copy, Clone, PartialEq, Eq)]
pub enum AllocatorKind {
    /// GBM when a context can be created for the device, dumb buffers otherwise.
    #[default]
    Auto,
    Gbm,
    Dumb,
}

impl FromStr for AllocatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(AllocatorKind::Auto),
            "gbm" => Ok(AllocatorKind::Gbm),
            "dumb" => Ok(AllocatorKind::Dumb),
            other => Err(format!("unknown allocator `{}`", other)),
        }
    }
}

fn default_format() -> String {
    String::from("XR24")
}

fn default_idle_timeout() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScanoutConfig {
    #[serde(default)]
    pub allocator: AllocatorKind,
    /// Overrides the primary gpu picked from the seat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<PathBuf>,
    /// Fourcc code of the swapchain format.
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub outputs: HashMap<String, OutputConfig>,
}

impl Default for ScanoutConfig {
    fn default() -> ScanoutConfig {
        ScanoutConfig {
            allocator: AllocatorKind::default(),
            device: None,
            format: default_format(),
            idle_timeout_ms: default_idle_timeout(),
            outputs: HashMap::new(),
        }
    }
}

impl ScanoutConfig {
    pub fn output(&self, name: &str) -> OutputConfig {
        self.outputs.get(name).cloned().unwrap_or_default()
    }
}
