// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io};

use super::kernel::{KernelDevice, PropertyId, PropertyInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Connector,
    Crtc,
    Encoder,
    Plane,
}

/// Identity of a mode-setting object: its kernel id and class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelObject {
    id: u32,
    kind: ObjectKind,
}

impl KernelObject {
    pub fn new(id: impl Into<u32>, kind: ObjectKind) -> KernelObject {
        KernelObject {
            id: id.into(),
            kind,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Reads the object's current property set from the kernel.
    pub fn properties(&self, kernel: &dyn KernelDevice) -> io::Result<PropertySet> {
        kernel.properties(*self).map(PropertySet)
    }
}

impl fmt::Display for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.id)
    }
}

/// A snapshot of (descriptor, value) pairs of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet(Vec<(PropertyInfo, u64)>);

impl PropertySet {
    pub fn iter(&self) -> impl Iterator<Item = (&PropertyInfo, u64)> {
        self.0.iter().map(|(info, value)| (info, *value))
    }

    pub fn find(&self, name: &str) -> Option<(&PropertyInfo, u64)> {
        self.iter().find(|(info, _)| info.name == name)
    }

    pub fn id(&self, name: &str) -> Option<PropertyId> {
        self.find(name).map(|(info, _)| info.id)
    }

    pub fn value(&self, name: &str) -> Option<u64> {
        self.find(name).map(|(_, value)| value)
    }

    /// Name of the current value of an enum property.
    pub fn enum_value(&self, name: &str) -> Option<&str> {
        let (info, value) = self.find(name)?;
        info.enum_values
            .iter()
            .find(|(_, raw)| *raw == value)
            .map(|(name, _)| name.as_str())
    }
}

impl FromIterator<(PropertyInfo, u64)> for PropertySet {
    fn from_iter<T: IntoIterator<Item = (PropertyInfo, u64)>>(iter: T) -> Self {
        PropertySet(iter.into_iter().collect())
    }
}
