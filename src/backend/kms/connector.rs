// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use tracing::{trace, warn};

use super::{
    drm_helpers::{self, Identity},
    kernel::{ConnectorId, ConnectorInfo, CrtcId, KernelDevice, PropertyId},
    mode::{self, Mode},
    object::{KernelObject, ObjectKind},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorProperties {
    pub crtc_id: Option<PropertyId>,
    pub dpms: Option<PropertyId>,
}

/// A physical output jack.
#[derive(Debug)]
pub struct Connector {
    object: KernelObject,
    id: ConnectorId,
    name: String,
    online: bool,
    modes: Vec<Mode>,
    identity: Option<Identity>,
    physical_size: Option<(u32, u32)>,
    crtc: Option<CrtcId>,
    possible_crtcs: u32,
    properties: ConnectorProperties,
}

impl Connector {
    /// Reads a connector from the kernel, including the crtc currently
    /// driving it.
    pub fn new(kernel: &dyn KernelDevice, id: ConnectorId) -> io::Result<Connector> {
        let mut connector = Connector {
            object: KernelObject::new(id, ObjectKind::Connector),
            id,
            name: String::new(),
            online: false,
            modes: Vec::new(),
            identity: None,
            physical_size: None,
            crtc: None,
            possible_crtcs: 0,
            properties: ConnectorProperties::default(),
        };
        let info = kernel.connector(id)?;
        let current_encoder = info.current_encoder;
        connector.update(kernel, info)?;

        if connector.online {
            connector.crtc = match current_encoder {
                Some(encoder) => kernel.encoder(encoder)?.crtc,
                None => None,
            };
        }

        Ok(connector)
    }

    /// Re-reads the connection state. The crtc association is left alone, it
    /// is owned by the device's routing.
    pub fn refresh(&mut self, kernel: &dyn KernelDevice) -> io::Result<()> {
        let info = kernel.connector(self.id)?;
        self.update(kernel, info)
    }

    fn update(&mut self, kernel: &dyn KernelDevice, info: ConnectorInfo) -> io::Result<()> {
        self.name = drm_helpers::connector_name(&info.interface, info.interface_id);
        self.online = info.connected && !info.modes.is_empty();

        if !self.online {
            self.modes.clear();
            self.identity = None;
            self.physical_size = None;
            self.possible_crtcs = 0;
            self.crtc = None;
            return Ok(());
        }

        self.modes = info.modes;
        self.physical_size = info.size;

        let mut possible_crtcs = 0;
        for encoder in &info.encoders {
            match kernel.encoder(*encoder) {
                Ok(encoder) => possible_crtcs |= encoder.possible_crtcs,
                Err(err) => warn!(?err, connector = %self.name, "Failed to query encoder"),
            }
        }
        self.possible_crtcs = possible_crtcs;

        let props = self.object.properties(kernel)?;
        self.properties = ConnectorProperties {
            crtc_id: props.id("CRTC_ID"),
            dpms: props.id("DPMS"),
        };
        self.identity = match props.value("EDID") {
            Some(blob) if blob != 0 => match kernel.property_blob(blob) {
                Ok(data) => drm_helpers::edid_identity(&data),
                Err(err) => {
                    trace!(?err, connector = %self.name, "Failed to read EDID blob");
                    None
                }
            },
            _ => None,
        };

        Ok(())
    }

    pub fn object(&self) -> KernelObject {
        self.object
    }

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn preferred_mode(&self) -> Option<Mode> {
        mode::preferred_mode(&self.modes)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn physical_size(&self) -> Option<(u32, u32)> {
        self.physical_size
    }

    pub fn crtc(&self) -> Option<CrtcId> {
        self.crtc
    }

    pub(super) fn set_crtc(&mut self, crtc: Option<CrtcId>) {
        self.crtc = crtc;
    }

    /// Bitmask over the pipe index of the crtcs that can drive this connector.
    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    pub fn can_use(&self, pipe: usize) -> bool {
        pipe < 32 && self.possible_crtcs & (1 << pipe) != 0
    }

    pub fn properties(&self) -> ConnectorProperties {
        self.properties
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::kms::{
        fake::FakeKernel,
        kernel::{EncoderId, EncoderInfo},
        mode::test_mode,
    };

    #[test]
    fn online_connector() {
        let kernel = FakeKernel::new();
        let (crtc, _) = kernel.add_pipe();
        kernel.add_pipe();
        let id = kernel.add_connector("DP", vec![test_mode(1920, 1080, 60)], 0b11);
        kernel.set_current_crtc(id, crtc);

        let connector = Connector::new(&*kernel, id).unwrap();
        assert!(connector.is_online());
        assert_eq!(connector.name(), "DP-1");
        assert_eq!(connector.crtc(), Some(crtc));
        assert_eq!(connector.possible_crtcs(), 0b11);
        assert!(connector.can_use(1));
        assert!(!connector.can_use(2));
        assert!(connector.properties().crtc_id.is_some());
        assert!(connector.properties().dpms.is_some());
        assert_eq!(connector.identity(), None);
    }

    #[test]
    fn possible_crtcs_are_merged_over_encoders() {
        let kernel = FakeKernel::new();
        let id = kernel.add_connector("HDMI-A", vec![test_mode(1280, 720, 60)], 0b001);
        {
            let mut state = kernel.state.borrow_mut();
            let extra = EncoderId(9999);
            state.encoders.push(EncoderInfo {
                id: extra,
                crtc: None,
                possible_crtcs: 0b100,
            });
            let conn = state.connectors.iter_mut().find(|c| c.id == id).unwrap();
            conn.encoders.push(extra);
        }

        let connector = Connector::new(&*kernel, id).unwrap();
        assert_eq!(connector.possible_crtcs(), 0b101);
    }

    #[test]
    fn offline_connector_has_no_state() {
        let kernel = FakeKernel::new();
        let (crtc, _) = kernel.add_pipe();
        let id = kernel.add_connector("DP", vec![test_mode(1920, 1080, 60)], 0b1);
        kernel.set_current_crtc(id, crtc);
        kernel.set_connected(id, false);

        let connector = Connector::new(&*kernel, id).unwrap();
        assert!(!connector.is_online());
        assert!(connector.modes().is_empty());
        assert_eq!(connector.crtc(), None);
        assert_eq!(connector.preferred_mode(), None);
    }

    #[test]
    fn refresh_keeps_routing() {
        let kernel = FakeKernel::new();
        let (crtc, _) = kernel.add_pipe();
        let id = kernel.add_connector("DP", vec![test_mode(1920, 1080, 60)], 0b1);

        let mut connector = Connector::new(&*kernel, id).unwrap();
        assert_eq!(connector.crtc(), None);
        connector.set_crtc(Some(crtc));

        kernel.state.borrow_mut().connectors[0].modes = vec![test_mode(2560, 1440, 60)];
        connector.refresh(&*kernel).unwrap();
        assert_eq!(connector.crtc(), Some(crtc));
        assert_eq!(connector.modes()[0].size(), (2560, 1440));
    }
}
