// SPDX-License-Identifier: GPL-3.0-only

use std::{cell::RefCell, collections::HashMap, io, num::NonZeroU32, time::Duration};

use rustix::event::{poll, PollFd, PollFlags};
use smithay::{
    backend::{
        allocator::{Fourcc, Modifier},
        drm::DrmDeviceFd,
    },
    reexports::drm::{
        buffer::{self, Buffer as _, PlanarBuffer},
        control::{
            self, atomic::AtomicModeReq, connector, dumbbuffer::DumbBuffer, property,
            AtomicCommitFlags, Device as ControlDevice, Event, FbCmd2Flags, ResourceHandle,
        },
        ClientCapability as DrmClientCapability, Device as _, DriverCapability,
    },
};
use tracing::trace;

use super::{
    drm_helpers,
    kernel::*,
    mode::Mode,
    object::{KernelObject, ObjectKind},
};

/// A mode-setting device node.
#[derive(Debug)]
pub struct DrmCard {
    fd: DrmDeviceFd,
    /// Crtcs never come and go, possible-crtc masks are resolved against
    /// this list.
    resources: control::ResourceHandles,
    dumb: RefCell<HashMap<u32, DumbBuffer>>,
}

impl DrmCard {
    pub fn new(fd: DrmDeviceFd) -> io::Result<DrmCard> {
        let resources = fd.resource_handles()?;
        Ok(DrmCard {
            fd,
            resources,
            dumb: RefCell::new(HashMap::new()),
        })
    }

    fn possible_crtcs(&self, filter: control::CrtcListFilter) -> u32 {
        crtc_mask(self.resources.crtcs(), self.resources.filter_crtcs(filter))
    }

    fn object_properties<H: ResourceHandle>(
        &self,
        handle: H,
    ) -> io::Result<Vec<(PropertyInfo, u64)>> {
        let props = self.fd.get_properties(handle)?;
        let (ids, values) = props.as_props_and_values();

        let mut result = Vec::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values.iter()) {
            let info = self.fd.get_property(*id)?;
            let enum_values = match info.value_type() {
                property::ValueType::Enum(values) => values
                    .values()
                    .1
                    .iter()
                    .map(|value| {
                        (
                            value.name().to_string_lossy().into_owned(),
                            value.value(),
                        )
                    })
                    .collect(),
                _ => Vec::new(),
            };
            result.push((
                PropertyInfo {
                    id: PropertyId(u32::from(*id)),
                    name: info.name().to_string_lossy().into_owned(),
                    enum_values,
                },
                *value,
            ));
        }
        Ok(result)
    }
}

fn handle<H: ResourceHandle>(id: impl Into<u32>) -> io::Result<H> {
    let id = id.into();
    control::from_u32(id).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid object id {}", id),
        )
    })
}

/// Bitmask over the pipe index of `possible` within `crtcs`.
fn crtc_mask(
    crtcs: &[control::crtc::Handle],
    possible: impl IntoIterator<Item = control::crtc::Handle>,
) -> u32 {
    possible
        .into_iter()
        .filter_map(|crtc| crtcs.iter().position(|c| *c == crtc))
        .filter(|pipe| *pipe < 32)
        .fold(0, |mask, pipe| mask | (1 << pipe))
}

struct PlanarDesc<'a>(&'a FramebufferDesc);

impl PlanarBuffer for PlanarDesc<'_> {
    fn size(&self) -> (u32, u32) {
        (self.0.width, self.0.height)
    }

    fn format(&self) -> Fourcc {
        self.0.format
    }

    fn modifier(&self) -> Option<Modifier> {
        self.0.modifier
    }

    fn pitches(&self) -> [u32; 4] {
        self.0.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.0
            .handles
            .map(|handle| NonZeroU32::new(handle).map(buffer::Handle::from))
    }

    fn offsets(&self) -> [u32; 4] {
        self.0.offsets
    }
}

impl KernelDevice for DrmCard {
    fn capability(&self, cap: Capability) -> io::Result<u64> {
        let cap = match cap {
            Capability::DumbBuffer => DriverCapability::DumbBuffer,
            Capability::Prime => DriverCapability::Prime,
            Capability::AddFb2Modifiers => DriverCapability::AddFB2Modifiers,
        };
        self.fd.get_driver_capability(cap)
    }

    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        let cap = match cap {
            ClientCapability::UniversalPlanes => DrmClientCapability::UniversalPlanes,
            ClientCapability::Atomic => DrmClientCapability::Atomic,
        };
        self.fd.set_client_capability(cap, enable)
    }

    fn resources(&self) -> io::Result<Resources> {
        let resources = self.fd.resource_handles()?;
        Ok(Resources {
            connectors: resources
                .connectors()
                .iter()
                .map(|c| ConnectorId(u32::from(*c)))
                .collect(),
            crtcs: resources
                .crtcs()
                .iter()
                .map(|c| CrtcId(u32::from(*c)))
                .collect(),
            encoders: resources
                .encoders()
                .iter()
                .map(|e| EncoderId(u32::from(*e)))
                .collect(),
        })
    }

    fn plane_ids(&self) -> io::Result<Vec<PlaneId>> {
        Ok(self
            .fd
            .plane_handles()?
            .iter()
            .map(|p| PlaneId(u32::from(*p)))
            .collect())
    }

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo> {
        let info = self.fd.get_connector(handle(id)?, false)?;
        Ok(ConnectorInfo {
            id,
            interface: drm_helpers::interface_short_name(info.interface()).into_owned(),
            interface_id: info.interface_id(),
            connected: info.state() == connector::State::Connected,
            size: info.size(),
            modes: info.modes().iter().copied().map(Mode::from).collect(),
            encoders: info
                .encoders()
                .iter()
                .map(|e| EncoderId(u32::from(*e)))
                .collect(),
            current_encoder: info.current_encoder().map(|e| EncoderId(u32::from(e))),
        })
    }

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo> {
        let info = self.fd.get_encoder(handle(id)?)?;
        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(|c| CrtcId(u32::from(c))),
            possible_crtcs: self.possible_crtcs(info.possible_crtcs()),
        })
    }

    fn crtc(&self, id: CrtcId) -> io::Result<CrtcInfo> {
        let info = self.fd.get_crtc(handle(id)?)?;
        Ok(CrtcInfo {
            id,
            mode: info.mode().map(Mode::from),
        })
    }

    fn plane(&self, id: PlaneId) -> io::Result<PlaneInfo> {
        let info = self.fd.get_plane(handle(id)?)?;
        Ok(PlaneInfo {
            id,
            crtc: info.crtc().map(|c| CrtcId(u32::from(c))),
            possible_crtcs: self.possible_crtcs(info.possible_crtcs()),
            formats: info.formats().to_vec(),
        })
    }

    fn properties(&self, object: KernelObject) -> io::Result<Vec<(PropertyInfo, u64)>> {
        match object.kind() {
            ObjectKind::Connector => {
                self.object_properties(handle::<connector::Handle>(object.id())?)
            }
            ObjectKind::Crtc => {
                self.object_properties(handle::<control::crtc::Handle>(object.id())?)
            }
            ObjectKind::Encoder => {
                self.object_properties(handle::<control::encoder::Handle>(object.id())?)
            }
            ObjectKind::Plane => {
                self.object_properties(handle::<control::plane::Handle>(object.id())?)
            }
        }
    }

    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.fd.get_property_blob(blob)
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<BlobId> {
        match self.fd.create_property_blob(mode)? {
            property::Value::Blob(id) => Ok(BlobId(id as u32)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected blob value {:?}", other),
            )),
        }
    }

    fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
        self.fd.destroy_property_blob(u32::from(blob) as u64)
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<FramebufferId> {
        let flags = if desc.modifier.is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let fb = self.fd.add_planar_framebuffer(&PlanarDesc(desc), flags)?;
        Ok(FramebufferId(u32::from(fb)))
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
        self.fd.destroy_framebuffer(handle(fb)?)
    }

    fn atomic_commit(&self, flags: CommitFlags, request: &AtomicRequest) -> io::Result<()> {
        let mut req = AtomicModeReq::new();
        for (object, prop, value) in request.entries() {
            let prop = handle::<property::Handle>(*prop)?;
            let value = property::Value::UnsignedRange(*value);
            match object.kind() {
                ObjectKind::Connector => {
                    req.add_property(handle::<connector::Handle>(object.id())?, prop, value)
                }
                ObjectKind::Crtc => {
                    req.add_property(handle::<control::crtc::Handle>(object.id())?, prop, value)
                }
                ObjectKind::Encoder => {
                    req.add_property(handle::<control::encoder::Handle>(object.id())?, prop, value)
                }
                ObjectKind::Plane => {
                    req.add_property(handle::<control::plane::Handle>(object.id())?, prop, value)
                }
            }
        }

        let mut drm_flags = AtomicCommitFlags::empty();
        drm_flags.set(
            AtomicCommitFlags::PAGE_FLIP_EVENT,
            flags.contains(CommitFlags::PAGE_FLIP_EVENT),
        );
        drm_flags.set(
            AtomicCommitFlags::NONBLOCK,
            flags.contains(CommitFlags::NONBLOCK),
        );
        drm_flags.set(
            AtomicCommitFlags::ALLOW_MODESET,
            flags.contains(CommitFlags::ALLOW_MODESET),
        );
        self.fd.atomic_commit(drm_flags, req)
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout = timeout
            .map(|timeout| timeout.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        let ready = poll(&mut fds, timeout).map_err(io::Error::from)?;
        Ok(ready > 0)
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlip>> {
        let mut flips = Vec::new();
        for event in self.fd.receive_events()? {
            match event {
                Event::PageFlip(event) => flips.push(PageFlip {
                    crtc: CrtcId(u32::from(event.crtc)),
                    sequence: event.frame,
                    time: event.duration,
                }),
                _ => trace!("Ignoring drm event"),
            }
        }
        Ok(flips)
    }

    fn create_dumb(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        bpp: u32,
    ) -> io::Result<DumbInfo> {
        let buffer = self.fd.create_dumb_buffer((width, height), format, bpp)?;
        let info = DumbInfo {
            handle: u32::from(buffer.handle()),
            pitch: buffer.pitch(),
        };
        self.dumb.borrow_mut().insert(info.handle, buffer);
        Ok(info)
    }

    fn map_dumb(&self, handle: u32, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()> {
        let mut buffers = self.dumb.borrow_mut();
        let buffer = buffers.get_mut(&handle).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no dumb buffer {}", handle),
            )
        })?;
        let mut mapping = self.fd.map_dumb_buffer(buffer)?;
        f(&mut mapping[..]);
        Ok(())
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        let buffer = self.dumb.borrow_mut().remove(&handle).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no dumb buffer {}", handle),
            )
        })?;
        self.fd.destroy_dumb_buffer(buffer)
    }

    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        Some(self.fd.clone())
    }
}
