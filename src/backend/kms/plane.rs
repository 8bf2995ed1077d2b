// SPDX-License-Identifier: GPL-3.0-only

use std::{io, mem::size_of};

use bytemuck::{Pod, Zeroable};
use indexmap::IndexMap;
use smallvec::SmallVec;
use smithay::backend::allocator::{Fourcc, Modifier};
use tracing::{trace, warn};

use super::{
    kernel::{CrtcId, KernelDevice, PlaneId, PropertyId},
    object::{KernelObject, ObjectKind, PropertySet},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Overlay,
    Primary,
    Cursor,
}

impl PlaneType {
    fn from_props(props: &PropertySet) -> PlaneType {
        match props.enum_value("type") {
            Some("Primary") => PlaneType::Primary,
            Some("Cursor") => PlaneType::Cursor,
            Some("Overlay") => PlaneType::Overlay,
            // fall back to the uapi values
            _ => match props.value("type") {
                Some(1) => PlaneType::Primary,
                Some(2) => PlaneType::Cursor,
                _ => PlaneType::Overlay,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneProperties {
    pub src_x: Option<PropertyId>,
    pub src_y: Option<PropertyId>,
    pub src_w: Option<PropertyId>,
    pub src_h: Option<PropertyId>,
    pub crtc_x: Option<PropertyId>,
    pub crtc_y: Option<PropertyId>,
    pub crtc_w: Option<PropertyId>,
    pub crtc_h: Option<PropertyId>,
    pub fb_id: Option<PropertyId>,
    pub crtc_id: Option<PropertyId>,
    pub rotation: Option<PropertyId>,
}

pub type Modifiers = SmallVec<[Modifier; 4]>;

/// A scanout plane.
#[derive(Debug)]
pub struct Plane {
    object: KernelObject,
    id: PlaneId,
    kind: PlaneType,
    crtc: Option<CrtcId>,
    possible_crtcs: u32,
    formats: IndexMap<Fourcc, Modifiers>,
    properties: PlaneProperties,
}

impl Plane {
    pub fn new(kernel: &dyn KernelDevice, id: PlaneId) -> io::Result<Plane> {
        let object = KernelObject::new(id, ObjectKind::Plane);
        let info = kernel.plane(id)?;
        let props = object.properties(kernel)?;

        let properties = PlaneProperties {
            src_x: props.id("SRC_X"),
            src_y: props.id("SRC_Y"),
            src_w: props.id("SRC_W"),
            src_h: props.id("SRC_H"),
            crtc_x: props.id("CRTC_X"),
            crtc_y: props.id("CRTC_Y"),
            crtc_w: props.id("CRTC_W"),
            crtc_h: props.id("CRTC_H"),
            fb_id: props.id("FB_ID"),
            crtc_id: props.id("CRTC_ID"),
            rotation: props.id("rotation"),
        };

        let in_formats = match props.value("IN_FORMATS") {
            Some(blob) if blob != 0 => match kernel.property_blob(blob) {
                Ok(data) => {
                    let formats = parse_in_formats(&data);
                    if formats.is_none() {
                        warn!(plane = %id, "Malformed IN_FORMATS blob");
                    }
                    formats
                }
                Err(err) => {
                    warn!(?err, plane = %id, "Failed to read IN_FORMATS blob");
                    None
                }
            },
            _ => None,
        };
        let formats = in_formats.unwrap_or_else(|| {
            info.formats
                .iter()
                .filter_map(|code| match Fourcc::try_from(*code) {
                    Ok(format) => Some((format, Modifiers::new())),
                    Err(_) => {
                        trace!(plane = %id, code, "Skipping unknown format");
                        None
                    }
                })
                .collect()
        });

        Ok(Plane {
            object,
            id,
            kind: PlaneType::from_props(&props),
            crtc: info.crtc,
            possible_crtcs: info.possible_crtcs,
            formats,
            properties,
        })
    }

    pub fn object(&self) -> KernelObject {
        self.object
    }

    pub fn id(&self) -> PlaneId {
        self.id
    }

    pub fn kind(&self) -> PlaneType {
        self.kind
    }

    /// The crtc this plane is currently bound to.
    pub fn crtc(&self) -> Option<CrtcId> {
        self.crtc
    }

    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    pub fn can_use(&self, pipe: usize) -> bool {
        pipe < 32 && self.possible_crtcs & (1 << pipe) != 0
    }

    pub fn formats(&self) -> impl Iterator<Item = Fourcc> + '_ {
        self.formats.keys().copied()
    }

    pub fn supports_format(&self, format: Fourcc) -> bool {
        self.formats.contains_key(&format)
    }

    /// Layout modifiers advertised for `format`, empty if the plane did not
    /// advertise any.
    pub fn modifiers(&self, format: Fourcc) -> &[Modifier] {
        self.formats
            .get(&format)
            .map(|modifiers| modifiers.as_slice())
            .unwrap_or(&[])
    }

    pub fn properties(&self) -> PlaneProperties {
        self.properties
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FormatModifierBlob {
    version: u32,
    flags: u32,
    count_formats: u32,
    formats_offset: u32,
    count_modifiers: u32,
    modifiers_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FormatModifier {
    /// Bitmask of the formats, relative to `offset`, this modifier applies to.
    formats: u64,
    offset: u32,
    pad: u32,
    modifier: u64,
}

fn read<T: Pod>(data: &[u8], offset: usize) -> Option<T> {
    let bytes = data.get(offset..offset.checked_add(size_of::<T>())?)?;
    bytemuck::try_pod_read_unaligned(bytes).ok()
}

/// Parses the `IN_FORMATS` blob into format -> modifiers, keeping the order
/// in which the kernel lists the formats.
fn parse_in_formats(data: &[u8]) -> Option<IndexMap<Fourcc, Modifiers>> {
    let header: FormatModifierBlob = read(data, 0)?;

    let codes = (0..header.count_formats as usize)
        .map(|i| read::<u32>(data, header.formats_offset as usize + i * size_of::<u32>()))
        .collect::<Option<Vec<_>>>()?;

    let mut formats = IndexMap::<u32, Modifiers>::new();
    for code in &codes {
        formats.entry(*code).or_default();
    }

    for i in 0..header.count_modifiers as usize {
        let entry: FormatModifier = read(
            data,
            header.modifiers_offset as usize + i * size_of::<FormatModifier>(),
        )?;
        for bit in 0..64 {
            if entry.formats & (1 << bit) == 0 {
                continue;
            }
            let Some(code) = codes.get(entry.offset as usize + bit) else {
                break;
            };
            let modifiers = formats.entry(*code).or_default();
            let modifier = Modifier::from(entry.modifier);
            if !modifiers.contains(&modifier) {
                modifiers.push(modifier);
            }
        }
    }

    Some(
        formats
            .into_iter()
            .filter_map(|(code, modifiers)| {
                Fourcc::try_from(code)
                    .ok()
                    .map(|format| (format, modifiers))
            })
            .collect(),
    )
}

#[cfg(test)]
pub(crate) fn in_formats_blob(formats: &[Fourcc], modifiers: &[(u64, u32, Modifier)]) -> Vec<u8> {
    let header = FormatModifierBlob {
        version: 1,
        flags: 0,
        count_formats: formats.len() as u32,
        formats_offset: size_of::<FormatModifierBlob>() as u32,
        count_modifiers: modifiers.len() as u32,
        modifiers_offset: (size_of::<FormatModifierBlob>() + formats.len() * 4) as u32,
    };
    let mut data = bytemuck::bytes_of(&header).to_vec();
    for format in formats {
        data.extend_from_slice(&(*format as u32).to_ne_bytes());
    }
    for (mask, offset, modifier) in modifiers {
        let entry = FormatModifier {
            formats: *mask,
            offset: *offset,
            pad: 0,
            modifier: (*modifier).into(),
        };
        data.extend_from_slice(bytemuck::bytes_of(&entry));
    }
    data
}
