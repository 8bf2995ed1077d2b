// SPDX-License-Identifier: GPL-3.0-only

//! The boundary between the output model and the kernel's mode-setting api.
//!
//! Everything above this module works on plain ids and info records, so the
//! whole object graph can be driven by [`DrmCard`](super::card::DrmCard) in
//! production and by an in-memory device in tests.

use std::{fmt, io, rc::Rc, time::Duration};

use bitflags::bitflags;
use smithay::backend::{
    allocator::{Fourcc, Modifier},
    drm::DrmDeviceFd,
};

use super::{mode::Mode, object::KernelObject};

macro_rules! kernel_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for u32 {
            fn from(id: $name) -> u32 {
                id.0
            }
        }
    )*};
}

kernel_id!(
    ConnectorId,
    /// Kernel id of a display pipeline (CRTC).
    CrtcId,
    EncoderId,
    PlaneId,
    PropertyId,
    FramebufferId,
    BlobId,
);

pub type KernelHandle = Rc<dyn KernelDevice>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    DumbBuffer,
    /// Bit 1 is import, bit 2 is export.
    Prime,
    AddFb2Modifiers,
}

pub const PRIME_IMPORT: u64 = 1;
pub const PRIME_EXPORT: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCapability {
    UniversalPlanes,
    Atomic,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 1 << 0;
        const NONBLOCK = 1 << 1;
        const ALLOW_MODESET = 1 << 2;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub connectors: Vec<ConnectorId>,
    pub crtcs: Vec<CrtcId>,
    pub encoders: Vec<EncoderId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    /// Short interface name, `DP`, `HDMI-A`, `eDP`, ...
    pub interface: String,
    pub interface_id: u32,
    pub connected: bool,
    /// Physical size in millimetres.
    pub size: Option<(u32, u32)>,
    pub modes: Vec<Mode>,
    pub encoders: Vec<EncoderId>,
    pub current_encoder: Option<EncoderId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: EncoderId,
    pub crtc: Option<CrtcId>,
    /// Bitmask over the pipe index of the crtcs this encoder can drive.
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrtcInfo {
    pub id: CrtcId,
    pub mode: Option<Mode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: PlaneId,
    pub crtc: Option<CrtcId>,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

/// Descriptor of a single object property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: PropertyId,
    pub name: String,
    /// Names and raw values of an enum property, empty for everything else.
    pub enum_values: Vec<(String, u64)>,
}

/// Everything needed to register a (possibly multi-planar) framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    /// Set when the buffer was allocated against an explicit modifier list,
    /// which registers it with the modifiers flag.
    pub modifier: Option<Modifier>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    entries: Vec<(KernelObject, PropertyId, u64)>,
}

impl AtomicRequest {
    pub fn new() -> AtomicRequest {
        AtomicRequest::default()
    }

    pub fn add_property(&mut self, object: KernelObject, property: PropertyId, value: u64) {
        self.entries.push((object, property, value));
    }

    pub fn entries(&self) -> &[(KernelObject, PropertyId, u64)] {
        &self.entries
    }

    pub fn value(&self, object: KernelObject, property: PropertyId) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|(obj, prop, _)| *obj == object && *prop == property)
            .map(|(_, _, value)| *value)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Completion of a page-flipping commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlip {
    pub crtc: CrtcId,
    pub sequence: u32,
    pub time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbInfo {
    pub handle: u32,
    pub pitch: u32,
}

pub trait KernelDevice: fmt::Debug {
    fn capability(&self, cap: Capability) -> io::Result<u64>;
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()>;

    fn resources(&self) -> io::Result<Resources>;
    fn plane_ids(&self) -> io::Result<Vec<PlaneId>>;
    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo>;
    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo>;
    fn crtc(&self, id: CrtcId) -> io::Result<CrtcInfo>;
    fn plane(&self, id: PlaneId) -> io::Result<PlaneInfo>;

    fn properties(&self, object: KernelObject) -> io::Result<Vec<(PropertyInfo, u64)>>;
    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>>;
    fn create_mode_blob(&self, mode: &Mode) -> io::Result<BlobId>;
    fn destroy_blob(&self, blob: BlobId) -> io::Result<()>;

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<FramebufferId>;
    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()>;

    fn atomic_commit(&self, flags: CommitFlags, request: &AtomicRequest) -> io::Result<()>;
    /// Blocks until the device has events to read, `false` on timeout.
    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool>;
    fn receive_events(&self) -> io::Result<Vec<PageFlip>>;

    fn create_dumb(&self, width: u32, height: u32, format: Fourcc, bpp: u32)
        -> io::Result<DumbInfo>;
    fn map_dumb(&self, handle: u32, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()>;
    fn destroy_dumb(&self, handle: u32) -> io::Result<()>;

    /// The underlying device node, if this is backed by one.
    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        None
    }
}
