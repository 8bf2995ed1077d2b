// SPDX-License-Identifier: GPL-3.0-only

use std::borrow::Cow;

use libdisplay_info::info::Info;
use scanout_config::EdidProduct;
use smithay::reexports::drm::control::connector;
use tracing::debug;

pub fn interface_short_name(interface: connector::Interface) -> Cow<'static, str> {
    match interface {
        connector::Interface::DVII => Cow::Borrowed("DVI-I"),
        connector::Interface::DVID => Cow::Borrowed("DVI-D"),
        connector::Interface::DVIA => Cow::Borrowed("DVI-A"),
        connector::Interface::SVideo => Cow::Borrowed("S-VIDEO"),
        connector::Interface::DisplayPort => Cow::Borrowed("DP"),
        connector::Interface::HDMIA => Cow::Borrowed("HDMI-A"),
        connector::Interface::HDMIB => Cow::Borrowed("HDMI-B"),
        connector::Interface::EmbeddedDisplayPort => Cow::Borrowed("eDP"),
        connector::Interface::VGA => Cow::Borrowed("VGA"),
        connector::Interface::LVDS => Cow::Borrowed("LVDS"),
        connector::Interface::DSI => Cow::Borrowed("DSI"),
        connector::Interface::Virtual => Cow::Borrowed("Virtual"),
        other => Cow::Owned(format!("{:?}", other)),
    }
}

pub fn connector_name(interface: &str, interface_id: u32) -> String {
    format!("{}-{}", interface, interface_id)
}

/// What the monitor says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub make: String,
    pub model: String,
    pub serial: Option<String>,
    pub product: Option<EdidProduct>,
}

pub fn edid_identity(blob: &[u8]) -> Option<Identity> {
    let info = match Info::parse_edid(blob) {
        Ok(info) => info,
        Err(err) => {
            debug!(?err, "Unable to parse edid");
            return None;
        }
    };

    Some(Identity {
        make: info.make().unwrap_or_else(|| String::from("Unknown")),
        model: info.model().unwrap_or_else(|| String::from("Unknown")),
        serial: info.serial(),
        product: info.edid().map(|edid| edid.vendor_product().into()),
    })
}
