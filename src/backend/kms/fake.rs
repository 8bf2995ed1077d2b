// SPDX-License-Identifier: GPL-3.0-only

//! In-memory mode-setting device used by the unit tests.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    io,
    rc::Rc,
    time::Duration,
};

use smithay::backend::allocator::Fourcc;

use super::{
    kernel::*,
    mode::Mode,
    object::{KernelObject, ObjectKind},
};

#[derive(Debug, Default)]
pub struct FakeState {
    pub caps: HashMap<Capability, u64>,
    pub atomic: bool,
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: Vec<CrtcInfo>,
    pub planes: Vec<PlaneInfo>,
    pub properties: HashMap<KernelObject, Vec<(PropertyInfo, u64)>>,
    pub blobs: HashMap<u64, Vec<u8>>,
    pub destroyed_blobs: Vec<BlobId>,
    pub framebuffers: HashMap<FramebufferId, FramebufferDesc>,
    pub removed_framebuffers: Vec<FramebufferId>,
    pub commits: Vec<(CommitFlags, AtomicRequest)>,
    pub fail_commits: bool,
    pub events: VecDeque<PageFlip>,
    pub dumb: HashMap<u32, Vec<u8>>,
    /// Number of dumb buffers that can still be created, unlimited if `None`.
    pub dumb_budget: Option<usize>,
    pub sequence: u32,
    next_id: u32,
}

#[derive(Debug)]
pub struct FakeKernel {
    pub state: RefCell<FakeState>,
}

const NO_ENUM: &[(&str, u64)] = &[];
const DPMS: &[(&str, u64)] = &[("On", 0), ("Off", 3)];
const PLANE_TYPES: &[(&str, u64)] = &[("Overlay", 0), ("Primary", 1), ("Cursor", 2)];

impl FakeKernel {
    pub fn new() -> Rc<FakeKernel> {
        let mut state = FakeState {
            atomic: true,
            next_id: 100,
            ..Default::default()
        };
        state.caps.insert(Capability::DumbBuffer, 1);
        state.caps.insert(Capability::Prime, PRIME_IMPORT | PRIME_EXPORT);
        state.caps.insert(Capability::AddFb2Modifiers, 0);
        Rc::new(FakeKernel {
            state: RefCell::new(state),
        })
    }

    fn next_id(&self) -> u32 {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        state.next_id
    }

    fn add_properties(&self, object: KernelObject, props: &[(&str, u64, &[(&str, u64)])]) {
        let props = props
            .iter()
            .map(|(name, value, enums)| {
                (
                    PropertyInfo {
                        id: PropertyId(self.next_id()),
                        name: name.to_string(),
                        enum_values: enums
                            .iter()
                            .map(|(name, value)| (name.to_string(), *value))
                            .collect(),
                    },
                    *value,
                )
            })
            .collect::<Vec<_>>();
        self.state
            .borrow_mut()
            .properties
            .entry(object)
            .or_default()
            .extend(props);
    }

    pub fn set_capability(&self, cap: Capability, value: u64) {
        self.state.borrow_mut().caps.insert(cap, value);
    }

    pub fn add_crtc(&self) -> CrtcId {
        let id = CrtcId(self.next_id());
        self.state
            .borrow_mut()
            .crtcs
            .push(CrtcInfo { id, mode: None });
        self.add_properties(
            KernelObject::new(id, ObjectKind::Crtc),
            &[("ACTIVE", 0, NO_ENUM), ("MODE_ID", 0, NO_ENUM), ("GAMMA_LUT", 0, NO_ENUM)],
        );
        id
    }

    /// Adds a plane of the given `type` name that can be used on the crtcs
    /// in the `possible` pipe mask.
    pub fn add_plane(&self, kind: &str, possible: u32, crtc: Option<CrtcId>) -> PlaneId {
        let id = PlaneId(self.next_id());
        self.state.borrow_mut().planes.push(PlaneInfo {
            id,
            crtc,
            possible_crtcs: possible,
            formats: vec![Fourcc::Xrgb8888 as u32, Fourcc::Argb8888 as u32],
        });
        let kind = PLANE_TYPES
            .iter()
            .find(|(name, _)| *name == kind)
            .map(|(_, value)| *value)
            .unwrap_or(0);
        self.add_properties(
            KernelObject::new(id, ObjectKind::Plane),
            &[
                ("type", kind, PLANE_TYPES),
                ("FB_ID", 0, NO_ENUM),
                ("CRTC_ID", crtc.map(u32::from).unwrap_or(0) as u64, NO_ENUM),
                ("SRC_X", 0, NO_ENUM),
                ("SRC_Y", 0, NO_ENUM),
                ("SRC_W", 0, NO_ENUM),
                ("SRC_H", 0, NO_ENUM),
                ("CRTC_X", 0, NO_ENUM),
                ("CRTC_Y", 0, NO_ENUM),
                ("CRTC_W", 0, NO_ENUM),
                ("CRTC_H", 0, NO_ENUM),
            ],
        );
        id
    }

    /// Adds a blob property to an object, returning the blob id.
    pub fn add_blob_property(&self, object: KernelObject, name: &str, data: Vec<u8>) -> u64 {
        let blob = self.next_id() as u64;
        self.state.borrow_mut().blobs.insert(blob, data);
        self.add_properties(object, &[(name, blob, NO_ENUM)]);
        blob
    }

    /// A crtc with its own primary plane, the common universal-planes layout.
    pub fn add_pipe(&self) -> (CrtcId, PlaneId) {
        let pipe = self.state.borrow().crtcs.len();
        let crtc = self.add_crtc();
        let plane = self.add_plane("Primary", 1 << pipe, None);
        (crtc, plane)
    }

    /// Adds a connected connector with one encoder able to drive the
    /// crtcs in the `possible` pipe mask.
    pub fn add_connector(&self, interface: &str, modes: Vec<Mode>, possible: u32) -> ConnectorId {
        let id = ConnectorId(self.next_id());
        let encoder = EncoderId(self.next_id());
        let interface_id = {
            let state = self.state.borrow();
            state
                .connectors
                .iter()
                .filter(|conn| conn.interface == interface)
                .count() as u32
                + 1
        };
        {
            let mut state = self.state.borrow_mut();
            state.encoders.push(EncoderInfo {
                id: encoder,
                crtc: None,
                possible_crtcs: possible,
            });
            state.connectors.push(ConnectorInfo {
                id,
                interface: interface.to_string(),
                interface_id,
                connected: true,
                size: Some((600, 340)),
                modes,
                encoders: vec![encoder],
                current_encoder: None,
            });
        }
        self.add_properties(
            KernelObject::new(id, ObjectKind::Connector),
            &[("CRTC_ID", 0, NO_ENUM), ("DPMS", 0, DPMS)],
        );
        id
    }

    /// Makes the kernel report `crtc` as currently driving `connector`.
    pub fn set_current_crtc(&self, connector: ConnectorId, crtc: CrtcId) {
        let mut state = self.state.borrow_mut();
        let Some(conn) = state.connectors.iter().find(|c| c.id == connector) else {
            return;
        };
        let encoder = conn.encoders[0];
        if let Some(conn) = state.connectors.iter_mut().find(|c| c.id == connector) {
            conn.current_encoder = Some(encoder);
        }
        if let Some(enc) = state.encoders.iter_mut().find(|e| e.id == encoder) {
            enc.crtc = Some(crtc);
        }
    }

    pub fn set_connected(&self, connector: ConnectorId, connected: bool) {
        if let Some(conn) = self
            .state
            .borrow_mut()
            .connectors
            .iter_mut()
            .find(|c| c.id == connector)
        {
            conn.connected = connected;
        }
    }

    pub fn unplug(&self, connector: ConnectorId) {
        self.state
            .borrow_mut()
            .connectors
            .retain(|c| c.id != connector);
    }

    pub fn queue_flip(&self, crtc: CrtcId, sequence: u32, time: Duration) {
        self.state.borrow_mut().events.push_back(PageFlip {
            crtc,
            sequence,
            time,
        });
    }

    pub fn commits(&self) -> Vec<(CommitFlags, AtomicRequest)> {
        self.state.borrow().commits.clone()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn removed_framebuffers(&self) -> Vec<FramebufferId> {
        self.state.borrow().removed_framebuffers.clone()
    }

    pub fn property_id(&self, object: KernelObject, name: &str) -> PropertyId {
        self.state.borrow().properties[&object]
            .iter()
            .find(|(info, _)| info.name == name)
            .map(|(info, _)| info.id)
            .unwrap()
    }
}

fn not_found(what: &str, id: impl Into<u32>) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no {} with id {}", what, id.into()),
    )
}

impl KernelDevice for FakeKernel {
    fn capability(&self, cap: Capability) -> io::Result<u64> {
        Ok(self.state.borrow().caps.get(&cap).copied().unwrap_or(0))
    }

    fn set_client_capability(&self, cap: ClientCapability, _enable: bool) -> io::Result<()> {
        match cap {
            ClientCapability::Atomic if !self.state.borrow().atomic => {
                Err(io::Error::from_raw_os_error(einval()))
            }
            _ => Ok(()),
        }
    }

    fn resources(&self) -> io::Result<Resources> {
        let state = self.state.borrow();
        Ok(Resources {
            connectors: state.connectors.iter().map(|c| c.id).collect(),
            crtcs: state.crtcs.iter().map(|c| c.id).collect(),
            encoders: state.encoders.iter().map(|e| e.id).collect(),
        })
    }

    fn plane_ids(&self) -> io::Result<Vec<PlaneId>> {
        Ok(self.state.borrow().planes.iter().map(|p| p.id).collect())
    }

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo> {
        let state = self.state.borrow();
        let info = state
            .connectors
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("connector", id))?;
        let mut info = info.clone();
        if !info.connected {
            info.modes.clear();
        }
        Ok(info)
    }

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo> {
        self.state
            .borrow()
            .encoders
            .iter()
            .find(|e| e.id == id)
            .copied()
            .ok_or_else(|| not_found("encoder", id))
    }

    fn crtc(&self, id: CrtcId) -> io::Result<CrtcInfo> {
        self.state
            .borrow()
            .crtcs
            .iter()
            .find(|c| c.id == id)
            .copied()
            .ok_or_else(|| not_found("crtc", id))
    }

    fn plane(&self, id: PlaneId) -> io::Result<PlaneInfo> {
        self.state
            .borrow()
            .planes
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| not_found("plane", id))
    }

    fn properties(&self, object: KernelObject) -> io::Result<Vec<(PropertyInfo, u64)>> {
        Ok(self
            .state
            .borrow()
            .properties
            .get(&object)
            .cloned()
            .unwrap_or_default())
    }

    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.state
            .borrow()
            .blobs
            .get(&blob)
            .cloned()
            .ok_or_else(|| not_found("blob", blob as u32))
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<BlobId> {
        let id = self.next_id();
        self.state
            .borrow_mut()
            .blobs
            .insert(id as u64, mode.as_bytes().to_vec());
        Ok(BlobId(id))
    }

    fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .blobs
            .remove(&(blob.0 as u64))
            .ok_or_else(|| not_found("blob", blob))?;
        state.destroyed_blobs.push(blob);
        Ok(())
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<FramebufferId> {
        if desc.modifier.is_some() && self.capability(Capability::AddFb2Modifiers)? == 0 {
            return Err(io::Error::from_raw_os_error(einval()));
        }
        let id = FramebufferId(self.next_id());
        self.state.borrow_mut().framebuffers.insert(id, *desc);
        Ok(id)
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .framebuffers
            .remove(&fb)
            .ok_or_else(|| not_found("framebuffer", fb))?;
        state.removed_framebuffers.push(fb);
        Ok(())
    }

    fn atomic_commit(&self, flags: CommitFlags, request: &AtomicRequest) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_commits {
            return Err(io::Error::from_raw_os_error(einval()));
        }
        state.commits.push((flags, request.clone()));
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            let mut crtcs = request
                .entries()
                .iter()
                .filter(|(obj, _, _)| obj.kind() == ObjectKind::Crtc)
                .map(|(obj, _, _)| CrtcId(obj.id()))
                .collect::<Vec<_>>();
            crtcs.dedup();
            for crtc in crtcs {
                state.sequence += 1;
                let sequence = state.sequence;
                state.events.push_back(PageFlip {
                    crtc,
                    sequence,
                    time: Duration::from_millis(16 * sequence as u64),
                });
            }
        }
        Ok(())
    }

    fn wait_readable(&self, _timeout: Option<Duration>) -> io::Result<bool> {
        Ok(!self.state.borrow().events.is_empty())
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlip>> {
        Ok(self.state.borrow_mut().events.drain(..).collect())
    }

    fn create_dumb(
        &self,
        width: u32,
        height: u32,
        _format: Fourcc,
        bpp: u32,
    ) -> io::Result<DumbInfo> {
        if self.capability(Capability::DumbBuffer)? == 0 {
            return Err(io::Error::from_raw_os_error(einval()));
        }
        {
            let mut state = self.state.borrow_mut();
            if let Some(budget) = state.dumb_budget.as_mut() {
                if *budget == 0 {
                    return Err(io::Error::new(io::ErrorKind::OutOfMemory, "out of memory"));
                }
                *budget -= 1;
            }
        }
        let handle = self.next_id();
        let pitch = width * bpp / 8;
        self.state
            .borrow_mut()
            .dumb
            .insert(handle, vec![0; (pitch * height) as usize]);
        Ok(DumbInfo { handle, pitch })
    }

    fn map_dumb(&self, handle: u32, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let data = state
            .dumb
            .get_mut(&handle)
            .ok_or_else(|| not_found("dumb buffer", handle))?;
        f(data);
        Ok(())
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        self.state
            .borrow_mut()
            .dumb
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| not_found("dumb buffer", handle))
    }
}

fn einval() -> i32 {
    rustix::io::Errno::INVAL.raw_os_error()
}
