// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Vendor block of a monitor's EDID, enough to tell two panels of the same
/// model apart.
#[derive(Debug, Deserialize, Serialize, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdidProduct {
    pub manufacturer: [char; 3],
    pub product: u16,
    pub serial: Option<u32>,
    pub manufacture_week: i32,
    pub manufacture_year: i32,
    pub model_year: Option<i32>,
}

#[cfg(feature = "libdisplay-info")]
impl From<libdisplay_info::edid::VendorProduct> for EdidProduct {
    fn from(vp: libdisplay_info::edid::VendorProduct) -> Self {
        Self {
            manufacturer: vp.manufacturer,
            product: vp.product,
            serial: vp.serial,
            manufacture_week: vp.manufacture_week,
            manufacture_year: vp.manufacture_year,
            model_year: vp.model_year,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Per-connector settings, keyed by connector name (`DP-1`, `eDP-1`, ...).
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Requested ((width, height), refresh in Hz). The connector's preferred
    /// mode is used when unset or when nothing matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<((u16, u16), Option<u32>)>,
}

impl Default for OutputConfig {
    fn default() -> OutputConfig {
        OutputConfig {
            enabled: true,
            mode: None,
        }
    }
}
