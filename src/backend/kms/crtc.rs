// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use bitflags::bitflags;

use super::{
    kernel::{CrtcId, KernelDevice, PlaneId, PropertyId},
    mode::Mode,
    object::{KernelObject, ObjectKind},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CrtcCapabilities: u32 {
        const GAMMA_LUT = 1 << 0;
        const DEGAMMA_LUT = 1 << 1;
        const CTM = 1 << 2;
        const ROTATION = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrtcProperties {
    pub active: Option<PropertyId>,
    pub mode_id: Option<PropertyId>,
    pub gamma_lut: Option<PropertyId>,
    pub degamma_lut: Option<PropertyId>,
    pub ctm: Option<PropertyId>,
    pub rotation: Option<PropertyId>,
}

/// A display pipeline. Created once per device, crtcs are not hot-pluggable.
#[derive(Debug)]
pub struct Crtc {
    object: KernelObject,
    id: CrtcId,
    pipe: usize,
    mode: Option<Mode>,
    primary_plane: Option<PlaneId>,
    cursor_plane: Option<PlaneId>,
    capabilities: CrtcCapabilities,
    properties: CrtcProperties,
}

impl Crtc {
    pub fn new(kernel: &dyn KernelDevice, id: CrtcId, pipe: usize) -> io::Result<Crtc> {
        let object = KernelObject::new(id, ObjectKind::Crtc);
        let info = kernel.crtc(id)?;
        let props = object.properties(kernel)?;

        let properties = CrtcProperties {
            active: props.id("ACTIVE"),
            mode_id: props.id("MODE_ID"),
            gamma_lut: props.id("GAMMA_LUT"),
            degamma_lut: props.id("DEGAMMA_LUT"),
            ctm: props.id("CTM"),
            rotation: props.id("rotation"),
        };

        let mut capabilities = CrtcCapabilities::empty();
        capabilities.set(CrtcCapabilities::GAMMA_LUT, properties.gamma_lut.is_some());
        capabilities.set(
            CrtcCapabilities::DEGAMMA_LUT,
            properties.degamma_lut.is_some(),
        );
        capabilities.set(CrtcCapabilities::CTM, properties.ctm.is_some());
        capabilities.set(CrtcCapabilities::ROTATION, properties.rotation.is_some());

        Ok(Crtc {
            object,
            id,
            pipe,
            mode: info.mode,
            primary_plane: None,
            cursor_plane: None,
            capabilities,
            properties,
        })
    }

    pub fn object(&self) -> KernelObject {
        self.object
    }

    pub fn id(&self) -> CrtcId {
        self.id
    }

    /// Index of this crtc in the kernel's resource list.
    pub fn pipe(&self) -> usize {
        self.pipe
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn primary_plane(&self) -> Option<PlaneId> {
        self.primary_plane
    }

    pub fn cursor_plane(&self) -> Option<PlaneId> {
        self.cursor_plane
    }

    pub(super) fn set_primary_plane(&mut self, plane: Option<PlaneId>) {
        self.primary_plane = plane;
    }

    pub(super) fn set_cursor_plane(&mut self, plane: Option<PlaneId>) {
        self.cursor_plane = plane;
    }

    pub fn capabilities(&self) -> CrtcCapabilities {
        self.capabilities
    }

    pub fn properties(&self) -> CrtcProperties {
        self.properties
    }
}
