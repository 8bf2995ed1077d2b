// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashSet,
    fmt, io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use bitflags::bitflags;
use indexmap::IndexMap;
use scanout_config::AllocatorKind;
use smithay::backend::allocator::Fourcc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::{
    allocator::{AllocError, Allocator},
    connector::Connector,
    crtc::Crtc,
    kernel::{
        Capability, ClientCapability, ConnectorId, CrtcId, KernelHandle, PlaneId, PRIME_EXPORT,
        PRIME_IMPORT,
    },
    output::{CrtcBinding, Output},
    plane::{Plane, PlaneType},
    swapchain::Swapchain,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCapabilities: u32 {
        const DUMB_BUFFER = 1 << 0;
        const PRIME_IMPORT = 1 << 1;
        const PRIME_EXPORT = 1 << 2;
        const FB_MODIFIERS = 1 << 3;
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device does not support atomic mode-setting")]
    AtomicUnsupported(#[source] io::Error),
    #[error("Device does not support universal planes")]
    UniversalPlanesUnsupported(#[source] io::Error),
    #[error("No usable allocator")]
    Allocator(#[source] AllocError),
    #[error("Timed out waiting for pending page-flips")]
    IdleTimeout,
    #[error("Kernel request failed")]
    Kernel(#[from] io::Error),
}

/// Whether the device may currently be driven.
pub trait SessionState {
    fn is_active(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub allocator: AllocatorKind,
    pub format: Fourcc,
    pub idle_timeout: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            allocator: AllocatorKind::Auto,
            format: Fourcc::Xrgb8888,
            idle_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChanges {
    pub added: Vec<ConnectorId>,
    pub removed: Vec<ConnectorId>,
}

pub struct Device {
    path: PathBuf,
    kernel: KernelHandle,
    session: Box<dyn SessionState>,
    settings: DeviceSettings,
    capabilities: DeviceCapabilities,
    allocator: Allocator,

    /// Indexed by pipe.
    crtcs: Vec<Crtc>,
    planes: Vec<Plane>,
    connectors: IndexMap<ConnectorId, Connector>,
    outputs: IndexMap<ConnectorId, Output>,

    freeze: usize,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("kernel", &self.kernel)
            .field("settings", &self.settings)
            .field("capabilities", &self.capabilities)
            .field("allocator", &self.allocator)
            .field("crtcs", &self.crtcs)
            .field("planes", &self.planes)
            .field("connectors", &self.connectors)
            .field("outputs", &self.outputs)
            .field("freeze", &self.freeze)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Takes over a mode-setting device and reads its fixed pipeline layout.
    ///
    /// Connectors are not scanned yet, call [`Device::scan_connectors`] once
    /// the caller is ready to initialize outputs.
    pub fn new(
        path: impl Into<PathBuf>,
        kernel: KernelHandle,
        session: Box<dyn SessionState>,
        settings: DeviceSettings,
    ) -> Result<Device, DeviceError> {
        let path = path.into();
        let capabilities = query_capabilities(&kernel);
        debug!(path = %path.display(), ?capabilities, "Device capabilities");

        kernel
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(DeviceError::UniversalPlanesUnsupported)?;
        kernel
            .set_client_capability(ClientCapability::Atomic, true)
            .map_err(DeviceError::AtomicUnsupported)?;

        let allocator = select_allocator(&kernel, settings.allocator, capabilities)?;
        info!(path = %path.display(), ?allocator, "Using allocator");

        let mut device = Device {
            path,
            kernel,
            session,
            settings,
            capabilities,
            allocator,
            crtcs: Vec::new(),
            planes: Vec::new(),
            connectors: IndexMap::new(),
            outputs: IndexMap::new(),
            freeze: 0,
        };
        device.scan_crtcs()?;
        device.scan_planes()?;
        Ok(device)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kernel(&self) -> &KernelHandle {
        &self.kernel
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Connector> {
        self.connectors.values()
    }

    pub fn connector(&self, id: ConnectorId) -> Option<&Connector> {
        self.connectors.get(&id)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values()
    }

    pub fn outputs_mut(&mut self) -> impl Iterator<Item = &mut Output> {
        self.outputs.values_mut()
    }

    pub fn output(&self, id: ConnectorId) -> Option<&Output> {
        self.outputs.get(&id)
    }

    pub fn output_mut(&mut self, id: ConnectorId) -> Option<&mut Output> {
        self.outputs.get_mut(&id)
    }

    pub fn is_session_active(&self) -> bool {
        self.session.is_active()
    }

    fn scan_crtcs(&mut self) -> Result<(), DeviceError> {
        let resources = self.kernel.resources()?;
        self.crtcs = resources
            .crtcs
            .iter()
            .enumerate()
            .map(|(pipe, id)| Crtc::new(&*self.kernel, *id, pipe))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(())
    }

    /// Reads all planes and hands every crtc its primary and cursor plane.
    fn scan_planes(&mut self) -> Result<(), DeviceError> {
        self.planes = self
            .kernel
            .plane_ids()?
            .into_iter()
            .map(|id| Plane::new(&*self.kernel, id))
            .collect::<io::Result<Vec<_>>>()?;

        let mut claimed = HashSet::new();
        for crtc in self.crtcs.iter_mut() {
            let primary = special_plane(&self.planes, crtc, PlaneType::Primary, &claimed);
            let cursor = special_plane(&self.planes, crtc, PlaneType::Cursor, &claimed);
            claimed.extend(primary);
            claimed.extend(cursor);

            if primary.is_none() {
                warn!(crtc = %crtc.id(), "No primary plane for crtc, it will not be used");
            }
            trace!(crtc = %crtc.id(), ?primary, ?cursor, "Assigned planes");
            crtc.set_primary_plane(primary);
            crtc.set_cursor_plane(cursor);
        }
        Ok(())
    }

    /// Re-reads the connector list and updates the outputs to match.
    ///
    /// Newly connected outputs are handed to `init` before they are routed.
    pub fn scan_connectors(
        &mut self,
        init: &mut dyn FnMut(&mut Output),
    ) -> Result<OutputChanges, DeviceError> {
        let resources = self.kernel.resources()?;

        let mut connectors = IndexMap::new();
        for id in resources.connectors {
            let connector = match self.connectors.shift_remove(&id) {
                Some(mut connector) => match connector.refresh(&*self.kernel) {
                    Ok(()) => connector,
                    Err(err) => {
                        warn!(?err, connector = %connector.name(), "Failed to refresh connector");
                        continue;
                    }
                },
                None => match Connector::new(&*self.kernel, id) {
                    Ok(connector) => connector,
                    Err(err) => {
                        warn!(?err, connector = %id, "Failed to read connector");
                        continue;
                    }
                },
            };
            if connector.is_online() {
                connectors.insert(id, connector);
            }
        }

        let changes = OutputChanges {
            added: connectors
                .keys()
                .filter(|id| !self.outputs.contains_key(*id))
                .copied()
                .collect(),
            removed: self
                .outputs
                .keys()
                .filter(|id| !connectors.contains_key(*id))
                .copied()
                .collect(),
        };

        if !changes.removed.is_empty() {
            self.settle();
            for id in &changes.removed {
                if let Some(mut output) = self.outputs.shift_remove(id) {
                    info!(output = %output.name(), "Output disconnected");
                    if let Err(err) = output.disable() {
                        debug!(?err, output = %output.name(), "Failed to turn off removed output");
                    }
                }
            }
        }

        for (id, output) in self.outputs.iter_mut() {
            if let Some(connector) = connectors.get(id) {
                output.update(connector);
            }
        }

        for id in &changes.added {
            let Some(connector) = connectors.get(id) else {
                continue;
            };
            let Some(mode) = connector.preferred_mode() else {
                continue;
            };
            let mut output = Output::new(&self.kernel, connector, mode);
            init(&mut output);
            info!(
                output = %output.name(),
                %mode,
                size_mm = ?connector.physical_size(),
                enabled = output.is_enabled(),
                "Output connected"
            );
            self.outputs.insert(*id, output);
        }

        self.connectors = connectors;
        self.reroute();

        Ok(changes)
    }

    /// Finds a crtc for every enabled output and rebinds the outputs whose
    /// crtc changed. Returns `false` if no such assignment exists, in which
    /// case all bindings stay as they were.
    pub fn reroute(&mut self) -> bool {
        self.release_disabled();

        let connectors = self
            .outputs
            .values()
            .filter(|output| output.is_enabled())
            .map(|output| output.connector())
            .filter(|id| self.connectors.contains_key(id))
            .collect::<Vec<_>>();

        let format = self.settings.format;
        let primaries = self
            .crtcs
            .iter()
            .filter_map(|crtc| {
                let plane = crtc.primary_plane()?;
                let plane = self.planes.iter().find(|p| p.id() == plane)?;
                Some((crtc.pipe(), plane.supports_format(format)))
            })
            .collect::<Vec<_>>();
        let mut pipes = primaries
            .iter()
            .filter(|(_, supported)| *supported)
            .map(|(pipe, _)| *pipe)
            .collect::<Vec<_>>();
        if pipes.len() < primaries.len() {
            warn!(
                %format,
                skipped = primaries.len() - pipes.len(),
                "Primary planes cannot scan out the configured format, skipping their crtcs"
            );
        }

        // keep connectors on the crtc they already use, where possible
        for (i, id) in connectors.iter().enumerate() {
            let connector = &self.connectors[id];
            let current = connector
                .crtc()
                .and_then(|crtc| self.crtc_pipe(crtc))
                .filter(|pipe| connector.can_use(*pipe));
            if let Some(j) = current.and_then(|pipe| pipes.iter().position(|p| *p == pipe)) {
                if i < pipes.len() && i != j {
                    pipes.swap(i, j);
                }
            }
        }

        let candidates = connectors
            .iter()
            .map(|id| self.connectors[id].possible_crtcs())
            .collect::<Vec<_>>();
        let Some(assignment) = find_configuration(&candidates, &pipes) else {
            warn!(
                outputs = connectors.len(),
                crtcs = pipes.len(),
                "No crtc assignment for all enabled outputs, keeping current routing"
            );
            return false;
        };

        let changed = connectors
            .iter()
            .zip(assignment)
            .filter(|(id, pipe)| {
                let crtc = self.crtcs[*pipe].id();
                self.outputs.get(*id).is_some_and(|output| {
                    output.crtc() != Some(crtc) || !swapchain_fits(output)
                })
            })
            .map(|(id, pipe)| (*id, pipe))
            .collect::<Vec<_>>();
        if changed.is_empty() {
            return true;
        }

        self.settle();
        for (id, pipe) in changed {
            self.route(id, pipe);
        }
        true
    }

    fn route(&mut self, id: ConnectorId, pipe: usize) {
        let crtc = &self.crtcs[pipe];
        let crtc_id = crtc.id();
        let Some(plane) = crtc
            .primary_plane()
            .and_then(|plane| self.planes.iter().find(|p| p.id() == plane))
        else {
            return;
        };
        let binding = CrtcBinding::new(crtc, plane);

        if let Some(previous) = self
            .outputs
            .values_mut()
            .find(|output| output.connector() != id && output.crtc() == Some(crtc_id))
        {
            debug!(output = %previous.name(), crtc = %crtc_id, "Releasing crtc");
            previous.unbind();
            if let Some(connector) = self.connectors.get_mut(&previous.connector()) {
                connector.set_crtc(None);
            }
        }

        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        let (width, height) = output.mode().size();
        let swapchain = match Swapchain::new(
            &self.allocator,
            width as u32,
            height as u32,
            self.settings.format,
            &[],
        ) {
            Ok(swapchain) => Some(swapchain),
            Err(err) => {
                warn!(?err, output = %output.name(), "Failed to allocate swapchain");
                None
            }
        };
        info!(output = %output.name(), crtc = %crtc_id, "Routing output");
        output.bind(binding, swapchain);
        if let Some(connector) = self.connectors.get_mut(&id) {
            connector.set_crtc(Some(crtc_id));
        }
    }

    /// Turns off outputs that were disabled but still hold a crtc.
    fn release_disabled(&mut self) {
        let disabled = self
            .outputs
            .values()
            .filter(|output| !output.is_enabled() && output.crtc().is_some())
            .map(|output| output.connector())
            .collect::<Vec<_>>();
        if disabled.is_empty() {
            return;
        }

        self.settle();
        for id in disabled {
            if let Some(output) = self.outputs.get_mut(&id) {
                info!(output = %output.name(), "Disabling output");
                if let Err(err) = output.disable() {
                    warn!(?err, output = %output.name(), "Failed to turn off output");
                }
            }
            if let Some(connector) = self.connectors.get_mut(&id) {
                connector.set_crtc(None);
            }
        }
    }

    /// Disables an output and releases its crtc.
    pub fn disable_output(&mut self, id: ConnectorId) -> bool {
        let Some(output) = self.outputs.get_mut(&id) else {
            return false;
        };
        output.set_enabled(false);
        self.reroute();
        true
    }

    fn crtc_pipe(&self, id: CrtcId) -> Option<usize> {
        self.crtcs
            .iter()
            .find(|crtc| crtc.id() == id)
            .map(|crtc| crtc.pipe())
    }

    /// Reads pending page-flip events and completes the matching outputs.
    ///
    /// `on_frame` is called for every completed output, unless the device
    /// is frozen or the session is not active. Returns the number of events
    /// read.
    pub fn dispatch_events(
        &mut self,
        on_frame: &mut dyn FnMut(&mut Output),
    ) -> Result<usize, DeviceError> {
        profiling::scope!("Device::dispatch_events");

        let events = self.kernel.receive_events()?;
        let count = events.len();
        for event in events {
            let Some(output) = self
                .outputs
                .values_mut()
                .find(|output| output.crtc() == Some(event.crtc))
            else {
                trace!(crtc = %event.crtc, "Page-flip for unknown crtc");
                continue;
            };

            output.complete(event.sequence, event.time);
            if self.freeze > 0 {
                continue;
            }
            if !self.session.is_active() {
                continue;
            }
            on_frame(output);
        }
        Ok(count)
    }

    pub fn freeze(&mut self) {
        self.freeze += 1;
    }

    pub fn thaw(&mut self) {
        self.freeze = self.freeze.saturating_sub(1);
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze > 0
    }

    /// No output is waiting for a page-flip.
    pub fn is_idle(&self) -> bool {
        self.outputs.values().all(|output| output.pending().is_none())
    }

    /// Blocks until every pending page-flip has completed.
    ///
    /// The device stays frozen meanwhile, completions are recorded but not
    /// forwarded.
    pub fn wait_idle(&mut self) -> Result<(), DeviceError> {
        self.freeze();
        let result = self.drain_pending();
        self.thaw();
        result
    }

    fn drain_pending(&mut self) -> Result<(), DeviceError> {
        let deadline = Instant::now() + self.settings.idle_timeout;
        while !self.is_idle() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.kernel.wait_readable(Some(remaining))? {
                return Err(DeviceError::IdleTimeout);
            }
            self.dispatch_events(&mut |_| {})?;
        }
        Ok(())
    }

    fn settle(&mut self) {
        if self.is_idle() {
            return;
        }
        if let Err(err) = self.wait_idle() {
            warn!(?err, path = %self.path.display(), "Device did not go idle");
        }
    }
}

fn query_capabilities(kernel: &KernelHandle) -> DeviceCapabilities {
    let cap = |which: Capability| {
        kernel.capability(which).unwrap_or_else(|err| {
            debug!(?err, capability = ?which, "Failed to query capability");
            0
        })
    };

    let mut capabilities = DeviceCapabilities::empty();
    capabilities.set(
        DeviceCapabilities::DUMB_BUFFER,
        cap(Capability::DumbBuffer) != 0,
    );
    let prime = cap(Capability::Prime);
    capabilities.set(DeviceCapabilities::PRIME_IMPORT, prime & PRIME_IMPORT != 0);
    capabilities.set(DeviceCapabilities::PRIME_EXPORT, prime & PRIME_EXPORT != 0);
    capabilities.set(
        DeviceCapabilities::FB_MODIFIERS,
        cap(Capability::AddFb2Modifiers) != 0,
    );
    capabilities
}

fn select_allocator(
    kernel: &KernelHandle,
    kind: AllocatorKind,
    capabilities: DeviceCapabilities,
) -> Result<Allocator, DeviceError> {
    let modifiers = capabilities.contains(DeviceCapabilities::FB_MODIFIERS);
    let dumb = || {
        Allocator::dumb(
            kernel,
            capabilities.contains(DeviceCapabilities::DUMB_BUFFER),
            modifiers,
        )
    };

    match kind {
        AllocatorKind::Gbm => Allocator::gbm(kernel, modifiers).map_err(DeviceError::Allocator),
        AllocatorKind::Dumb => Ok(dumb()),
        AllocatorKind::Auto => match Allocator::gbm(kernel, modifiers) {
            Ok(allocator) => Ok(allocator),
            Err(err) => {
                debug!(?err, "Falling back to dumb buffers");
                Ok(dumb())
            }
        },
    }
}

/// Picks the plane of `kind` for `crtc`: the one already bound to it, else
/// the first unbound one that can be used with it.
fn special_plane(
    planes: &[Plane],
    crtc: &Crtc,
    kind: PlaneType,
    claimed: &HashSet<PlaneId>,
) -> Option<PlaneId> {
    let mut candidates = planes
        .iter()
        .filter(|plane| plane.kind() == kind && !claimed.contains(&plane.id()));

    candidates
        .clone()
        .find(|plane| plane.crtc() == Some(crtc.id()))
        .or_else(|| candidates.find(|plane| plane.crtc().is_none() && plane.can_use(crtc.pipe())))
        .map(|plane| plane.id())
}

fn swapchain_fits(output: &Output) -> bool {
    let (width, height) = output.mode().size();
    output
        .swapchain()
        .is_some_and(|swapchain| swapchain.size() == (width as u32, height as u32))
}

/// Assigns each connector, given as a bitmask over the pipes it can use, a
/// distinct pipe from `pipes`, trying pipes in the given order. Returns the
/// pipe per connector, or `None` if no complete assignment exists.
pub fn find_configuration(candidates: &[u32], pipes: &[usize]) -> Option<Vec<usize>> {
    fn search(
        candidates: &[u32],
        pipes: &[usize],
        taken: &mut u32,
        chosen: &mut Vec<usize>,
    ) -> bool {
        let Some(mask) = candidates.get(chosen.len()) else {
            return true;
        };
        for &pipe in pipes {
            if pipe >= 32 {
                continue;
            }
            let bit = 1u32 << pipe;
            if *taken & bit != 0 || mask & bit == 0 {
                continue;
            }

            *taken |= bit;
            chosen.push(pipe);
            if search(candidates, pipes, taken, chosen) {
                return true;
            }
            chosen.pop();
            *taken &= !bit;
        }
        false
    }

    let mut taken = 0;
    let mut chosen = Vec::with_capacity(candidates.len());
    search(candidates, pipes, &mut taken, &mut chosen).then_some(chosen)
}
