// SPDX-License-Identifier: GPL-3.0-only

use std::{io, time::Duration};

use thiserror::Error;
use tracing::{debug, trace};

use super::{
    blob::PropertyBlob,
    connector::{Connector, ConnectorProperties},
    crtc::{Crtc, CrtcProperties},
    drm_helpers::Identity,
    kernel::{AtomicRequest, CommitFlags, ConnectorId, CrtcId, KernelHandle, PlaneId, PropertyId},
    mode::Mode,
    object::{KernelObject, ObjectKind},
    plane::{Plane, PlaneProperties},
    swapchain::Swapchain,
};

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("A frame is still pending on this output")]
    Pending,
    #[error("Output is not routed to a crtc")]
    NotRouted,
    #[error("Output has no swapchain")]
    NoSwapchain,
    #[error("Image {0} is not checked out from the swapchain")]
    InvalidImage(usize),
    #[error("Required property {0} is missing")]
    MissingProperty(&'static str),
    #[error("Failed to create mode blob")]
    ModeBlob(#[source] io::Error),
    #[error("Atomic commit was rejected")]
    Commit(#[source] io::Error),
}

/// The crtc and primary plane an output scans out through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcBinding {
    pub crtc: CrtcId,
    pub crtc_props: CrtcProperties,
    pub plane: PlaneId,
    pub plane_props: PlaneProperties,
}

impl CrtcBinding {
    pub fn new(crtc: &Crtc, plane: &Plane) -> CrtcBinding {
        CrtcBinding {
            crtc: crtc.id(),
            crtc_props: crtc.properties(),
            plane: plane.id(),
            plane_props: plane.properties(),
        }
    }

    fn crtc_object(&self) -> KernelObject {
        KernelObject::new(self.crtc, ObjectKind::Crtc)
    }

    fn plane_object(&self) -> KernelObject {
        KernelObject::new(self.plane, ObjectKind::Plane)
    }
}

fn prop(id: Option<PropertyId>, name: &'static str) -> Result<PropertyId, PresentError> {
    id.ok_or(PresentError::MissingProperty(name))
}

/// A display fed by one connector.
#[derive(Debug)]
pub struct Output {
    kernel: KernelHandle,
    connector: ConnectorId,
    name: String,
    identity: Option<Identity>,
    connector_props: ConnectorProperties,
    modes: Vec<Mode>,

    binding: Option<CrtcBinding>,
    swapchain: Option<Swapchain>,
    mode: Mode,
    enabled: bool,
    needs_modeset: bool,
    pending: Option<usize>,
    unsubmitted: Option<usize>,
    sequence: u32,
    timestamp: Duration,
    mode_blob: Option<PropertyBlob>,
}

impl Output {
    pub fn new(kernel: &KernelHandle, connector: &Connector, mode: Mode) -> Output {
        Output {
            kernel: kernel.clone(),
            connector: connector.id(),
            name: connector.name().to_string(),
            identity: connector.identity().cloned(),
            connector_props: connector.properties(),
            modes: connector.modes().to_vec(),
            binding: None,
            swapchain: None,
            mode,
            enabled: false,
            needs_modeset: true,
            pending: None,
            unsubmitted: None,
            sequence: 0,
            timestamp: Duration::ZERO,
            mode_blob: None,
        }
    }

    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn crtc(&self) -> Option<CrtcId> {
        self.binding.map(|binding| binding.crtc)
    }

    pub fn binding(&self) -> Option<CrtcBinding> {
        self.binding
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Modes the connector reported on the last scan.
    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Applies output settings. Changing the mode requires a modeset and a
    /// swapchain of the new size, so the output is re-routed on the next
    /// [`Device::reroute`](super::device::Device::reroute).
    pub fn configure(&mut self, enabled: bool, mode: Option<Mode>) {
        self.enabled = enabled;
        if let Some(mode) = mode.filter(|mode| *mode != self.mode) {
            debug!(output = %self.name, %mode, "Changing mode");
            self.mode = mode;
            self.needs_modeset = true;
        }
    }

    /// Re-reads what a persisting connector reports, falling back to its
    /// preferred mode if the current one went away.
    pub(super) fn update(&mut self, connector: &Connector) {
        self.identity = connector.identity().cloned();
        self.connector_props = connector.properties();
        self.modes = connector.modes().to_vec();
        if !connector.modes().contains(&self.mode) {
            if let Some(mode) = connector.preferred_mode() {
                debug!(output = %self.name, %mode, "Current mode vanished, using preferred mode");
                self.mode = mode;
                self.needs_modeset = true;
            }
        }
    }

    pub fn needs_modeset(&self) -> bool {
        self.needs_modeset
    }

    pub fn set_needs_modeset(&mut self) {
        self.needs_modeset = true;
    }

    /// The swapchain image currently waiting for its page-flip.
    pub fn pending(&self) -> Option<usize> {
        self.pending
    }

    /// Sequence number of the last completed flip.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn swapchain_mut(&mut self) -> Option<&mut Swapchain> {
        self.swapchain.as_mut()
    }

    /// The image for the next frame. An image whose commit was rejected
    /// stays checked out and is handed out again until it is submitted,
    /// otherwise the next free swapchain image is checked out.
    pub fn acquire(&mut self) -> Option<usize> {
        if let Some(slot) = self.unsubmitted {
            return Some(slot);
        }
        let slot = self.swapchain.as_mut()?.acquire()?;
        self.unsubmitted = Some(slot);
        Some(slot)
    }

    /// The checked out image that has not reached the kernel yet.
    pub fn unsubmitted(&self) -> Option<usize> {
        self.unsubmitted
    }

    pub(super) fn bind(&mut self, binding: CrtcBinding, swapchain: Option<Swapchain>) {
        self.binding = Some(binding);
        self.swapchain = swapchain;
        self.pending = None;
        self.unsubmitted = None;
        self.needs_modeset = true;
    }

    pub(super) fn unbind(&mut self) {
        self.binding = None;
        self.swapchain = None;
        self.pending = None;
        self.unsubmitted = None;
        self.mode_blob = None;
        self.needs_modeset = true;
    }

    /// Submits the swapchain image `slot` for scan-out.
    ///
    /// The commit is non-blocking and asks for a page-flip event, which has
    /// to be fed back through [`Output::complete`] before the next frame. A
    /// rejected commit leaves the output untouched, the same image can be
    /// submitted again.
    pub fn present(&mut self, slot: usize) -> Result<(), PresentError> {
        profiling::scope!("Output::present");

        if self.pending.is_some() {
            return Err(PresentError::Pending);
        }
        let binding = self.binding.ok_or(PresentError::NotRouted)?;
        let swapchain = self.swapchain.as_ref().ok_or(PresentError::NoSwapchain)?;
        let (fb, width, height) = swapchain
            .image(slot)
            .filter(|image| image.is_busy())
            .map(|image| {
                let buffer = image.buffer();
                (buffer.id(), buffer.width(), buffer.height())
            })
            .ok_or(PresentError::InvalidImage(slot))?;

        if self.needs_modeset || self.mode_blob.is_none() {
            let blob =
                PropertyBlob::from_mode(&self.kernel, &self.mode).map_err(PresentError::ModeBlob)?;
            self.mode_blob = Some(blob);
        }
        let mode_blob = self
            .mode_blob
            .as_ref()
            .map(|blob| u32::from(blob.id()) as u64)
            .unwrap_or(0);

        let connector = KernelObject::new(self.connector, ObjectKind::Connector);
        let crtc = binding.crtc_object();
        let plane = binding.plane_object();
        let crtc_id = u32::from(binding.crtc) as u64;
        let (width, height) = (width as u64, height as u64);

        let mut req = AtomicRequest::new();
        req.add_property(
            connector,
            prop(self.connector_props.crtc_id, "CRTC_ID")?,
            crtc_id,
        );
        req.add_property(crtc, prop(binding.crtc_props.mode_id, "MODE_ID")?, mode_blob);
        req.add_property(crtc, prop(binding.crtc_props.active, "ACTIVE")?, 1);

        let props = &binding.plane_props;
        req.add_property(plane, prop(props.src_x, "SRC_X")?, 0);
        req.add_property(plane, prop(props.src_y, "SRC_Y")?, 0);
        // 16.16 fixed point
        req.add_property(plane, prop(props.src_w, "SRC_W")?, width << 16);
        req.add_property(plane, prop(props.src_h, "SRC_H")?, height << 16);
        req.add_property(plane, prop(props.crtc_x, "CRTC_X")?, 0);
        req.add_property(plane, prop(props.crtc_y, "CRTC_Y")?, 0);
        req.add_property(plane, prop(props.crtc_w, "CRTC_W")?, width);
        req.add_property(plane, prop(props.crtc_h, "CRTC_H")?, height);
        req.add_property(plane, prop(props.crtc_id, "CRTC_ID")?, crtc_id);
        req.add_property(plane, prop(props.fb_id, "FB_ID")?, u32::from(fb) as u64);

        let mut flags = CommitFlags::PAGE_FLIP_EVENT | CommitFlags::NONBLOCK;
        if self.needs_modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        self.kernel
            .atomic_commit(flags, &req)
            .map_err(PresentError::Commit)?;

        trace!(
            output = %self.name,
            slot,
            fb = %fb,
            modeset = self.needs_modeset,
            "Submitted frame"
        );
        self.pending = Some(slot);
        if self.unsubmitted == Some(slot) {
            self.unsubmitted = None;
        }
        self.needs_modeset = false;
        Ok(())
    }

    /// Records a page-flip, returning the pending image to the swapchain.
    pub fn complete(&mut self, sequence: u32, timestamp: Duration) {
        if let Some(slot) = self.pending.take() {
            if let Some(swapchain) = self.swapchain.as_mut() {
                swapchain.release(slot);
            }
        }
        self.sequence = sequence;
        self.timestamp = timestamp;
    }

    /// Turns the crtc off and releases it. The commit is blocking, callers
    /// have to make sure no flip is pending on the device.
    pub(super) fn disable(&mut self) -> Result<(), PresentError> {
        let Some(binding) = self.binding else {
            return Ok(());
        };
        let result = self.commit_off(&binding);
        self.unbind();
        result
    }

    fn commit_off(&self, binding: &CrtcBinding) -> Result<(), PresentError> {
        let connector = KernelObject::new(self.connector, ObjectKind::Connector);
        let crtc = binding.crtc_object();
        let plane = binding.plane_object();

        let mut req = AtomicRequest::new();
        req.add_property(connector, prop(self.connector_props.crtc_id, "CRTC_ID")?, 0);
        req.add_property(crtc, prop(binding.crtc_props.active, "ACTIVE")?, 0);
        req.add_property(crtc, prop(binding.crtc_props.mode_id, "MODE_ID")?, 0);
        req.add_property(plane, prop(binding.plane_props.fb_id, "FB_ID")?, 0);
        req.add_property(plane, prop(binding.plane_props.crtc_id, "CRTC_ID")?, 0);

        self.kernel
            .atomic_commit(CommitFlags::ALLOW_MODESET, &req)
            .map_err(PresentError::Commit)
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use smithay::backend::allocator::Fourcc;

    use super::*;
    use crate::backend::kms::{
        allocator::Allocator, fake::FakeKernel, kernel::KernelDevice, mode::test_mode,
    };

    struct Setup {
        fake: Rc<FakeKernel>,
        kernel: KernelHandle,
        output: Output,
        binding: CrtcBinding,
    }

    fn setup() -> Setup {
        let fake = FakeKernel::new();
        let kernel: KernelHandle = fake.clone();
        let (crtc, plane) = fake.add_pipe();
        let conn = fake.add_connector("DP", vec![test_mode(640, 480, 60)], 0b1);

        let crtc = Crtc::new(&*kernel, crtc, 0).unwrap();
        let plane = Plane::new(&*kernel, plane).unwrap();
        let connector = Connector::new(&*kernel, conn).unwrap();
        let binding = CrtcBinding::new(&crtc, &plane);

        let allocator = Allocator::dumb(&kernel, true, false);
        let swapchain = Swapchain::new(&allocator, 640, 480, Fourcc::Xrgb8888, &[]).unwrap();

        let mut output = Output::new(&kernel, &connector, connector.preferred_mode().unwrap());
        output.set_enabled(true);
        output.bind(binding, Some(swapchain));

        Setup {
            fake,
            kernel,
            output,
            binding,
        }
    }

    #[test]
    fn first_present_is_a_modeset() {
        let Setup {
            fake,
            mut output,
            binding,
            ..
        } = setup();
        let slot = output.acquire().unwrap();
        let fb = output.swapchain().unwrap().image(slot).unwrap().buffer().id();

        output.present(slot).unwrap();
        assert_eq!(output.pending(), Some(slot));
        assert!(!output.needs_modeset());

        let commits = fake.commits();
        assert_eq!(commits.len(), 1);
        let (flags, req) = &commits[0];
        assert_eq!(
            *flags,
            CommitFlags::PAGE_FLIP_EVENT | CommitFlags::NONBLOCK | CommitFlags::ALLOW_MODESET
        );

        let connector = KernelObject::new(output.connector(), ObjectKind::Connector);
        let crtc = KernelObject::new(binding.crtc, ObjectKind::Crtc);
        let plane = KernelObject::new(binding.plane, ObjectKind::Plane);
        let crtc_id = u32::from(binding.crtc) as u64;

        assert_eq!(
            req.value(connector, fake.property_id(connector, "CRTC_ID")),
            Some(crtc_id)
        );
        assert_eq!(req.value(crtc, fake.property_id(crtc, "ACTIVE")), Some(1));
        let blob = req.value(crtc, fake.property_id(crtc, "MODE_ID")).unwrap();
        assert_eq!(
            fake.property_blob(blob).unwrap(),
            output.mode().as_bytes().to_vec()
        );
        assert_eq!(
            req.value(plane, fake.property_id(plane, "SRC_W")),
            Some(640 << 16)
        );
        assert_eq!(
            req.value(plane, fake.property_id(plane, "SRC_H")),
            Some(480 << 16)
        );
        assert_eq!(req.value(plane, fake.property_id(plane, "CRTC_W")), Some(640));
        assert_eq!(req.value(plane, fake.property_id(plane, "CRTC_H")), Some(480));
        assert_eq!(
            req.value(plane, fake.property_id(plane, "CRTC_ID")),
            Some(crtc_id)
        );
        assert_eq!(
            req.value(plane, fake.property_id(plane, "FB_ID")),
            Some(u32::from(fb) as u64)
        );
    }

    #[test]
    fn one_pending_frame_at_a_time() {
        let Setup {
            fake, mut output, ..
        } = setup();
        let first = output.acquire().unwrap();
        output.present(first).unwrap();

        let second = output.acquire().unwrap();
        assert!(matches!(output.present(second), Err(PresentError::Pending)));
        assert_eq!(fake.commits().len(), 1);
        assert_eq!(output.pending(), Some(first));

        output.complete(7, Duration::from_millis(100));
        assert_eq!(output.pending(), None);
        assert_eq!(output.sequence(), 7);
        assert_eq!(output.timestamp(), Duration::from_millis(100));
        assert!(!output.swapchain().unwrap().image(first).unwrap().is_busy());
        assert!(output.swapchain().unwrap().image(second).unwrap().is_busy());

        output.present(second).unwrap();
        let commits = fake.commits();
        assert_eq!(commits.len(), 2);
        // the mode is already set and the blob is reused
        assert!(!commits[1].0.contains(CommitFlags::ALLOW_MODESET));
        assert!(fake.state.borrow().destroyed_blobs.is_empty());
    }

    #[test]
    fn rejected_commit_keeps_state() {
        let Setup {
            fake, mut output, ..
        } = setup();
        let slot = output.acquire().unwrap();

        fake.state.borrow_mut().fail_commits = true;
        assert!(matches!(output.present(slot), Err(PresentError::Commit(_))));
        assert_eq!(output.pending(), None);
        assert!(output.needs_modeset());
        assert!(output.swapchain().unwrap().image(slot).unwrap().is_busy());

        fake.state.borrow_mut().fail_commits = false;
        output.present(slot).unwrap();
        assert_eq!(output.pending(), Some(slot));
        assert!(fake.commits()[0].0.contains(CommitFlags::ALLOW_MODESET));
    }

    #[test]
    fn rejected_image_is_acquired_again() {
        let Setup {
            fake, mut output, ..
        } = setup();
        let slot = output.acquire().unwrap();
        assert_eq!(output.unsubmitted(), Some(slot));
        // still not submitted, same image
        assert_eq!(output.acquire(), Some(slot));

        fake.state.borrow_mut().fail_commits = true;
        assert!(output.present(slot).is_err());
        assert_eq!(output.acquire(), Some(slot));
        assert_eq!(output.swapchain().unwrap().busy_count(), 1);

        fake.state.borrow_mut().fail_commits = false;
        output.present(slot).unwrap();
        assert_eq!(output.unsubmitted(), None);
        let next = output.acquire().unwrap();
        assert_ne!(next, slot);
        assert_eq!(output.swapchain().unwrap().busy_count(), 2);
    }

    #[test]
    fn present_preconditions() {
        let Setup {
            kernel,
            mut output,
            binding,
            ..
        } = setup();

        // not checked out
        assert!(matches!(
            output.present(0),
            Err(PresentError::InvalidImage(0))
        ));
        assert!(matches!(
            output.present(5),
            Err(PresentError::InvalidImage(5))
        ));

        output.bind(binding, None);
        assert!(matches!(output.present(0), Err(PresentError::NoSwapchain)));

        output.unbind();
        assert!(matches!(output.present(0), Err(PresentError::NotRouted)));

        let allocator = Allocator::dumb(&kernel, true, false);
        let swapchain = Swapchain::new(&allocator, 640, 480, Fourcc::Xrgb8888, &[]).unwrap();
        let mut broken = binding;
        broken.plane_props.fb_id = None;
        output.bind(broken, Some(swapchain));
        let slot = output.acquire().unwrap();
        assert!(matches!(
            output.present(slot),
            Err(PresentError::MissingProperty("FB_ID"))
        ));
        assert_eq!(output.pending(), None);
    }

    #[test]
    fn mode_change_forces_modeset() {
        let Setup {
            fake, mut output, ..
        } = setup();
        let slot = output.acquire().unwrap();
        output.present(slot).unwrap();
        output.complete(1, Duration::from_millis(16));

        let old_blob = fake.commits()[0].1.entries()[1].2;

        output.configure(true, Some(output.mode()));
        assert!(!output.needs_modeset());

        output.configure(true, Some(test_mode(640, 480, 75)));
        assert!(output.needs_modeset());

        let slot = output.acquire().unwrap();
        output.present(slot).unwrap();
        assert!(fake.commits()[1].0.contains(CommitFlags::ALLOW_MODESET));
        assert_eq!(
            fake.state.borrow().destroyed_blobs,
            vec![crate::backend::kms::kernel::BlobId(old_blob as u32)]
        );
    }

    #[test]
    fn disable_turns_crtc_off() {
        let Setup {
            fake,
            mut output,
            binding,
            ..
        } = setup();
        let slot = output.acquire().unwrap();
        output.present(slot).unwrap();
        output.complete(1, Duration::from_millis(16));

        output.disable().unwrap();
        assert_eq!(output.crtc(), None);
        assert!(output.swapchain().is_none());
        assert_eq!(fake.framebuffer_count(), 0);

        let commits = fake.commits();
        let (flags, req) = commits.last().unwrap();
        assert_eq!(*flags, CommitFlags::ALLOW_MODESET);
        let connector = KernelObject::new(output.connector(), ObjectKind::Connector);
        let crtc = KernelObject::new(binding.crtc, ObjectKind::Crtc);
        let plane = KernelObject::new(binding.plane, ObjectKind::Plane);
        assert_eq!(
            req.value(connector, fake.property_id(connector, "CRTC_ID")),
            Some(0)
        );
        assert_eq!(req.value(crtc, fake.property_id(crtc, "ACTIVE")), Some(0));
        assert_eq!(req.value(crtc, fake.property_id(crtc, "MODE_ID")), Some(0));
        assert_eq!(req.value(plane, fake.property_id(plane, "FB_ID")), Some(0));

        // nothing left to turn off
        output.disable().unwrap();
        assert_eq!(fake.commits().len(), commits.len());
    }
}
