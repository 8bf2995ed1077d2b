// SPDX-License-Identifier: GPL-3.0-only

use std::{ffi::CStr, fmt};

use bytemuck::{Pod, Zeroable};
use smithay::reexports::drm::control::{self, ModeFlags, ModeTypeFlags};

/// A display timing.
///
/// Laid out exactly like the kernel's `drm_mode_modeinfo`, so the bytes of a
/// `Mode` can be uploaded as a `MODE_ID` blob as they are.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Mode {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: [u8; 32],
}

impl Mode {
    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    pub fn name(&self) -> &str {
        CStr::from_bytes_until_nul(&self.name)
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("")
    }

    pub fn flags(&self) -> ModeFlags {
        ModeFlags::from_bits_truncate(self.flags)
    }

    pub fn mode_type(&self) -> ModeTypeFlags {
        ModeTypeFlags::from_bits_truncate(self.mode_type)
    }

    pub fn is_preferred(&self) -> bool {
        self.mode_type().contains(ModeTypeFlags::PREFERRED)
    }

    /// Vertical refresh rate in mHz.
    pub fn refresh(&self) -> u32 {
        let htotal = self.htotal as u64;
        let vtotal = self.vtotal as u64;
        if htotal == 0 || vtotal == 0 {
            return 0;
        }

        let mut refresh = (self.clock as u64 * 1_000_000 / htotal + vtotal / 2) / vtotal;

        if self.flags().contains(ModeFlags::INTERLACE) {
            refresh *= 2;
        }
        if self.flags().contains(ModeFlags::DBLSCAN) {
            refresh /= 2;
        }
        if self.vscan > 1 {
            refresh /= self.vscan as u64;
        }

        refresh as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// The mode flagged as preferred, or the first one if none is.
pub fn preferred_mode(modes: &[Mode]) -> Option<Mode> {
    modes
        .iter()
        .find(|mode| mode.is_preferred())
        .or_else(|| modes.first())
        .copied()
}

/// Picks the mode matching `size` and, if given, `refresh` (rounded Hz).
/// Among several matches the highest refresh rate wins.
pub fn find_mode(modes: &[Mode], size: (u16, u16), refresh: Option<u32>) -> Option<Mode> {
    modes
        .iter()
        .filter(|mode| mode.size() == size)
        .filter(|mode| refresh.map_or(true, |refresh| (mode.refresh() + 500) / 1000 == refresh))
        .max_by_key(|mode| mode.refresh())
        .copied()
}

impl From<control::Mode> for Mode {
    fn from(mode: control::Mode) -> Mode {
        let (hdisplay, vdisplay) = mode.size();
        let (hsync_start, hsync_end, htotal) = mode.hsync();
        let (vsync_start, vsync_end, vtotal) = mode.vsync();

        let mut name = [0u8; 32];
        let bytes = mode.name().to_bytes();
        let len = bytes.len().min(name.len() - 1);
        name[..len].copy_from_slice(&bytes[..len]);

        Mode {
            clock: mode.clock(),
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            hskew: mode.hskew(),
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: mode.vscan(),
            vrefresh: mode.vrefresh(),
            flags: mode.flags().bits(),
            mode_type: mode.mode_type().bits(),
            name,
        }
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mode")
            .field("name", &self.name())
            .field("size", &self.size())
            .field("refresh", &self.refresh())
            .field("clock", &self.clock)
            .field("flags", &self.flags())
            .field("type", &self.mode_type())
            .finish()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{:.3}",
            self.hdisplay,
            self.vdisplay,
            self.refresh() as f64 / 1000.0
        )
    }
}

#[cfg(test)]
pub(crate) fn test_mode(width: u16, height: u16, refresh: u32) -> Mode {
    let htotal = width + 160;
    let vtotal = height + 45;
    let clock = (htotal as u64 * vtotal as u64 * refresh as u64 / 1000) as u32;
    let mut name = [0u8; 32];
    let label = format!("{}x{}", width, height);
    name[..label.len()].copy_from_slice(label.as_bytes());

    Mode {
        clock,
        hdisplay: width,
        hsync_start: width + 48,
        hsync_end: width + 80,
        htotal,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 3,
        vsync_end: height + 8,
        vtotal,
        vscan: 0,
        vrefresh: refresh,
        flags: 0,
        mode_type: ModeTypeFlags::DRIVER.bits(),
        name,
    }
}
