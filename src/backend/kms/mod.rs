// SPDX-License-Identifier: GPL-3.0-only

use crate::{config::Config, state::State};

use anyhow::{Context, Result};
use calloop::{
    generic::Generic, Dispatcher, EventLoop, Interest, LoopHandle, Mode as IoMode, PostAction,
    RegistrationToken,
};
use indexmap::IndexMap;
use smithay::{
    backend::{
        drm::{DrmDeviceFd, DrmNode, NodeType},
        session::{libseat::LibSeatSession, Event as SessionEvent, Session},
        udev::{primary_gpu, UdevBackend, UdevEvent},
    },
    reexports::rustix::fs::{Dev, OFlags},
    utils::DeviceFd,
};
use tracing::{debug, error, info, warn};

use std::{
    path::{Path, PathBuf},
    rc::Rc,
};

mod allocator;
mod blob;
mod buffer;
mod card;
mod connector;
mod crtc;
mod device;
mod drm_helpers;
#[cfg(test)]
mod fake;
mod kernel;
mod mode;
mod object;
mod output;
mod plane;
mod render;
mod swapchain;

pub use device::DeviceSettings;

use card::DrmCard;
use device::{Device, DeviceCapabilities, SessionState};
use kernel::KernelHandle;
use mode::find_mode;
use output::Output;
use render::render_frame;

impl SessionState for LibSeatSession {
    fn is_active(&self) -> bool {
        Session::is_active(self)
    }
}

pub struct KmsState {
    pub devices: IndexMap<DrmNode, KmsDevice>,
    pub primary_node: Option<DrmNode>,
    pub session: LibSeatSession,
    udev_dispatcher: Dispatcher<'static, UdevBackend, State>,
}

pub struct KmsDevice {
    pub device: Device,
    token: RegistrationToken,
}

/// Acquires the seat and starts watching it for gpus. Devices already
/// present are picked up by [`State::add_present_devices`].
pub fn init_backend(event_loop: &mut EventLoop<'static, State>) -> Result<KmsState> {
    // establish session
    let (session, notifier) = LibSeatSession::new().context("Failed to acquire session")?;

    // watch for gpu events
    let udev_dispatcher = init_udev(session.seat(), &event_loop.handle())
        .context("Failed to initialize udev connection")?;

    // handle session events
    event_loop
        .handle()
        .insert_source(notifier, move |event, &mut (), state| match event {
            SessionEvent::ActivateSession => state.resume_session(),
            SessionEvent::PauseSession => state.pause_session(),
        })
        .map_err(|err| err.error)
        .context("Failed to initialize session event source")?;

    Ok(KmsState {
        devices: IndexMap::new(),
        primary_node: None,
        session,
        udev_dispatcher,
    })
}

fn init_udev(
    seat: String,
    evlh: &LoopHandle<'static, State>,
) -> Result<Dispatcher<'static, UdevBackend, State>> {
    let udev_backend = UdevBackend::new(&seat)?;

    let dispatcher = Dispatcher::new(udev_backend, move |event, _, state: &mut State| {
        let result = match event {
            UdevEvent::Added {
                device_id,
                ref path,
            } => state
                .device_added(device_id, path)
                .with_context(|| format!("Failed to add drm device: {}", device_id)),
            UdevEvent::Changed { device_id } => state
                .device_changed(device_id)
                .with_context(|| format!("Failed to update drm device: {}", device_id)),
            UdevEvent::Removed { device_id } => state
                .device_removed(device_id)
                .with_context(|| format!("Failed to remove drm device: {}", device_id)),
        };
        match result {
            Ok(()) => debug!("Successfully handled udev event."),
            Err(err) => error!(?err, "Error while handling udev event."),
        }
    });

    evlh.register_dispatcher(dispatcher.clone())
        .context("Failed to register udev event source")?;

    Ok(dispatcher)
}

/// The gpu outputs are driven from first, secondary gpus have to be able to
/// share buffers with it.
fn determine_primary_gpu(config: &Config, seat: &str, nodes: &[DrmNode]) -> Option<DrmNode> {
    let configured = config.device.as_ref().and_then(|path| {
        DrmNode::from_path(path)
            .inspect_err(|err| {
                warn!(?err, path = %path.display(), "Configured device is not a drm node")
            })
            .ok()
    });
    let boot = primary_gpu(seat)
        .ok()
        .flatten()
        .and_then(|path| DrmNode::from_path(path).ok());

    configured
        .into_iter()
        .chain(boot)
        .filter_map(|node| node.node_with_type(NodeType::Primary).and_then(Result::ok))
        .find(|node| nodes.contains(node))
        .or_else(|| nodes.first().copied())
}

fn init_output(config: &Config, output: &mut Output) {
    let settings = config.output(output.name());
    let mode = settings.mode.and_then(|(size, refresh)| {
        let mode = find_mode(output.modes(), size, refresh);
        if mode.is_none() {
            warn!(
                output = %output.name(),
                ?size,
                ?refresh,
                "Configured mode not available, using preferred mode"
            );
        }
        mode
    });
    output.configure(settings.enabled, mode);
}

fn render_outputs(device: &mut Device) {
    if !device.is_session_active() || device.is_frozen() {
        return;
    }
    for output in device.outputs_mut() {
        render_frame(output);
    }
}

impl State {
    /// Opens the gpus that exist already, the primary one first.
    pub fn add_present_devices(&mut self) {
        let mut devices = self
            .backend
            .udev_dispatcher
            .as_source_ref()
            .device_list()
            .map(|(dev, path)| (dev, path.to_path_buf()))
            .collect::<Vec<(Dev, PathBuf)>>();

        let nodes = devices
            .iter()
            .filter_map(|(dev, _)| DrmNode::from_dev_id(*dev).ok())
            .filter(|node| node.ty() == NodeType::Primary)
            .collect::<Vec<_>>();
        let primary = determine_primary_gpu(&self.config, &self.backend.session.seat(), &nodes);
        if let Some(node) = primary {
            info!("Using {} as primary gpu.", node);
        }
        self.backend.primary_node = primary;

        devices.sort_by_key(|(dev, _)| primary.is_none_or(|node| node.dev_id() != *dev));
        for (dev, path) in devices {
            if let Err(err) = self.device_added(dev, &path) {
                warn!(?err, "Failed to add device {}.", path.display());
            }
        }
    }

    pub fn device_added(&mut self, dev: Dev, path: &Path) -> Result<()> {
        if !self.backend.session.is_active() {
            return Ok(());
        }

        let node = DrmNode::from_dev_id(dev)?;
        if node.ty() != NodeType::Primary {
            debug!(%node, "Ignoring non-primary drm node");
            return Ok(());
        }
        if self.backend.devices.contains_key(&node) {
            return self.device_changed(dev);
        }

        let fd = DrmDeviceFd::new(DeviceFd::from(
            self.backend
                .session
                .open(
                    path,
                    OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
                )
                .with_context(|| {
                    format!(
                        "Failed to obtain file descriptor for drm device: {}",
                        path.display()
                    )
                })?,
        ));
        let card = DrmCard::new(fd.clone())
            .with_context(|| format!("Failed to read drm resources: {}", path.display()))?;
        let kernel: KernelHandle = Rc::new(card);
        let mut device = Device::new(
            path,
            kernel,
            Box::new(self.backend.session.clone()),
            self.config.device_settings(),
        )
        .with_context(|| format!("Failed to initialize drm device: {}", path.display()))?;

        let primary = *self.backend.primary_node.get_or_insert(node);
        if primary != node {
            let exports = self.backend.devices.get(&primary).is_some_and(|primary| {
                primary
                    .device
                    .capabilities()
                    .contains(DeviceCapabilities::PRIME_EXPORT)
            });
            let imports = device
                .capabilities()
                .contains(DeviceCapabilities::PRIME_IMPORT);
            if !exports || !imports {
                info!(
                    %node,
                    %primary,
                    exports,
                    imports,
                    "Skipping gpu that cannot share buffers with the primary gpu"
                );
                return Ok(());
            }
        }

        let config = &self.config;
        let changes = device.scan_connectors(&mut |output| init_output(config, output))?;
        info!(
            %node,
            outputs = changes.added.len(),
            "Added drm device {}.",
            path.display()
        );

        let token = self
            .event_loop_handle
            .insert_source(
                Generic::new(fd, Interest::READ, IoMode::Level),
                move |_, _, state: &mut State| {
                    if let Some(kms) = state.backend.devices.get_mut(&node) {
                        if let Err(err) = kms.device.dispatch_events(&mut render_frame) {
                            warn!(?err, "Failed to read events of device {}.", node);
                        }
                    }
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| err.error)
            .with_context(|| format!("Failed to add drm device to event loop: {}", node))?;

        render_outputs(&mut device);
        self.backend
            .devices
            .insert(node, KmsDevice { device, token });
        Ok(())
    }

    pub fn device_changed(&mut self, dev: Dev) -> Result<()> {
        if !self.backend.session.is_active() {
            return Ok(());
        }

        let node = DrmNode::from_dev_id(dev)?;
        let Some(kms) = self.backend.devices.get_mut(&node) else {
            return Ok(());
        };

        let config = &self.config;
        let changes = kms
            .device
            .scan_connectors(&mut |output| init_output(config, output))?;
        if !changes.added.is_empty() || !changes.removed.is_empty() {
            info!(%node, ?changes, "Outputs changed");
        }
        render_outputs(&mut kms.device);
        Ok(())
    }

    pub fn device_removed(&mut self, dev: Dev) -> Result<()> {
        let node = DrmNode::from_dev_id(dev)?;
        let Some(mut kms) = self.backend.devices.shift_remove(&node) else {
            return Ok(());
        };

        if let Err(err) = kms.device.wait_idle() {
            warn!(?err, %node, "Removing device with frames in flight");
        }
        self.event_loop_handle.remove(kms.token);
        if self.backend.primary_node == Some(node) {
            self.backend.primary_node = None;
        }
        info!(%node, "Removed drm device");
        Ok(())
    }

    pub(crate) fn pause_session(&mut self) {
        info!("Session paused");
    }

    pub(crate) fn resume_session(&mut self) {
        info!("Session resumed");

        for kms in self.backend.devices.values_mut() {
            for output in kms.device.outputs_mut() {
                output.set_needs_modeset();
            }
        }

        // pick up everything that changed while we were away, after the
        // rest of the pending events were processed
        self.event_loop_handle.insert_idle(|state| {
            let devices = state
                .backend
                .udev_dispatcher
                .as_source_ref()
                .device_list()
                .map(|(dev, path)| (dev, path.to_path_buf()))
                .collect::<Vec<_>>();
            for (dev, path) in devices {
                if let Err(err) = state.device_added(dev, &path) {
                    error!(?err, "Failed to update drm device {}.", path.display());
                }
            }
        });
        self.loop_signal.wakeup();
    }
}
