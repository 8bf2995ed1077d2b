// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io};

use scanout_config::AllocatorKind;
use smithay::{
    backend::{
        allocator::{
            gbm::{GbmBufferFlags, GbmDevice},
            Fourcc, Modifier,
        },
        drm::DrmDeviceFd,
    },
    reexports::{drm::buffer::PlanarBuffer, gbm::BufferObject},
};
use thiserror::Error;
use tracing::warn;

use super::{
    buffer::Buffer,
    kernel::{FramebufferDesc, KernelHandle},
};

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("The device does not support dumb buffers")]
    DumbUnsupported,
    #[error("No GBM device could be created for this device")]
    GbmUnavailable,
    #[error("The device cannot scan out buffers with explicit modifiers")]
    ModifiersUnsupported,
    #[error("Dumb buffers are linear only, got {0:?}")]
    UnsupportedModifier(Vec<Modifier>),
    #[error("Dumb buffers cannot hold {0}")]
    UnsupportedFormat(Fourcc),
    #[error("Failed to create dumb buffer")]
    Dumb(#[source] io::Error),
    #[error("Failed to create GBM buffer object")]
    Gbm(#[source] io::Error),
    #[error("Failed to register framebuffer")]
    Framebuffer(#[source] io::Error),
    #[error("Image is not cpu-mappable")]
    NotMappable,
}

/// Backing memory of an [`Image`].
enum Backing {
    Dumb(DumbMemory),
    Gbm(BufferObject<()>),
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Dumb(dumb) => f.debug_tuple("Dumb").field(dumb).finish(),
            Backing::Gbm(_) => f.debug_tuple("Gbm").finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
struct DumbMemory {
    kernel: KernelHandle,
    handle: u32,
}

impl Drop for DumbMemory {
    fn drop(&mut self) {
        if let Err(err) = self.kernel.destroy_dumb(self.handle) {
            warn!(?err, handle = self.handle, "Failed to destroy dumb buffer");
        }
    }
}

/// An allocated scanout buffer and its framebuffer registration.
#[derive(Debug)]
pub struct Image {
    // dropped first, the framebuffer goes away before its memory
    buffer: Buffer,
    backing: Backing,
    busy: bool,
}

impl Image {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub(super) fn set_busy(&mut self) {
        self.busy = true;
    }

    /// Returns the image to its pool. Releasing an idle image does nothing.
    pub fn release(&mut self) {
        self.busy = false;
    }

    /// Gives write access to the pixels of cpu-mapped images.
    pub fn map_pixels(&mut self, f: &mut dyn FnMut(&mut [u8])) -> Result<(), AllocError> {
        match &self.backing {
            Backing::Dumb(dumb) => dumb
                .kernel
                .map_dumb(dumb.handle, f)
                .map_err(AllocError::Dumb),
            Backing::Gbm(_) => Err(AllocError::NotMappable),
        }
    }

    pub fn is_mappable(&self) -> bool {
        matches!(self.backing, Backing::Dumb(_))
    }
}

/// Allocation strategy, chosen once per device.
pub enum Allocator {
    Dumb {
        kernel: KernelHandle,
        supported: bool,
        modifiers: bool,
    },
    Gbm {
        kernel: KernelHandle,
        gbm: GbmDevice<DrmDeviceFd>,
        modifiers: bool,
    },
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("kind", &self.kind())
            .field("valid", &self.is_valid())
            .field("modifiers", &self.supports_modifiers())
            .finish()
    }
}

impl Allocator {
    /// Cpu-mapped dumb buffers. The allocator is invalid and refuses every
    /// request if the device lacks dumb buffer support.
    pub fn dumb(kernel: &KernelHandle, supported: bool, modifiers: bool) -> Allocator {
        Allocator::Dumb {
            kernel: kernel.clone(),
            supported,
            modifiers,
        }
    }

    pub fn gbm(kernel: &KernelHandle, modifiers: bool) -> Result<Allocator, AllocError> {
        let fd = kernel.drm_fd().ok_or(AllocError::GbmUnavailable)?;
        let gbm = GbmDevice::new(fd).map_err(|err| {
            warn!(?err, "Failed to create GBM device");
            AllocError::GbmUnavailable
        })?;
        Ok(Allocator::Gbm {
            kernel: kernel.clone(),
            gbm,
            modifiers,
        })
    }

    pub fn kind(&self) -> AllocatorKind {
        match self {
            Allocator::Dumb { .. } => AllocatorKind::Dumb,
            Allocator::Gbm { .. } => AllocatorKind::Gbm,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Allocator::Dumb { supported, .. } => *supported,
            Allocator::Gbm { .. } => true,
        }
    }

    pub fn supports_modifiers(&self) -> bool {
        match self {
            Allocator::Dumb { modifiers, .. } | Allocator::Gbm { modifiers, .. } => *modifiers,
        }
    }

    /// Allocates a scanout image. A non-empty `modifiers` list constrains the
    /// layout and registers the framebuffer with explicit modifiers.
    pub fn allocate(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Image, AllocError> {
        if !modifiers.is_empty() && !self.supports_modifiers() {
            return Err(AllocError::ModifiersUnsupported);
        }

        match self {
            Allocator::Dumb {
                kernel, supported, ..
            } => {
                if !supported {
                    return Err(AllocError::DumbUnsupported);
                }
                if !modifiers.is_empty() && !modifiers.contains(&Modifier::Linear) {
                    return Err(AllocError::UnsupportedModifier(modifiers.to_vec()));
                }

                let bpp = dumb_bpp(format).ok_or(AllocError::UnsupportedFormat(format))?;

                let info = kernel
                    .create_dumb(width, height, format, bpp)
                    .map_err(AllocError::Dumb)?;
                let memory = DumbMemory {
                    kernel: kernel.clone(),
                    handle: info.handle,
                };

                let desc = FramebufferDesc {
                    width,
                    height,
                    format,
                    handles: [info.handle, 0, 0, 0],
                    pitches: [info.pitch, 0, 0, 0],
                    offsets: [0; 4],
                    modifier: (!modifiers.is_empty()).then_some(Modifier::Linear),
                };
                let buffer = Buffer::register(kernel, &desc).map_err(AllocError::Framebuffer)?;

                Ok(Image {
                    buffer,
                    backing: Backing::Dumb(memory),
                    busy: false,
                })
            }
            Allocator::Gbm { kernel, gbm, .. } => {
                let usage = GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT;
                let bo = if modifiers.is_empty() {
                    gbm.create_buffer_object::<()>(width, height, format, usage)
                } else {
                    gbm.create_buffer_object_with_modifiers2::<()>(
                        width,
                        height,
                        format,
                        modifiers.iter().copied(),
                        usage,
                    )
                }
                .map_err(AllocError::Gbm)?;

                let desc = gbm_framebuffer_desc(&bo, !modifiers.is_empty());
                let buffer = Buffer::register(kernel, &desc).map_err(AllocError::Framebuffer)?;

                Ok(Image {
                    buffer,
                    backing: Backing::Gbm(bo),
                    busy: false,
                })
            }
        }
    }
}

fn gbm_framebuffer_desc(bo: &BufferObject<()>, with_modifiers: bool) -> FramebufferDesc {
    let (width, height) = PlanarBuffer::size(bo);
    let handles = PlanarBuffer::handles(bo).map(|handle| handle.map(u32::from).unwrap_or(0));
    let modifier = PlanarBuffer::modifier(bo).filter(|modifier| *modifier != Modifier::Invalid);

    FramebufferDesc {
        width,
        height,
        format: PlanarBuffer::format(bo),
        handles,
        pitches: PlanarBuffer::pitches(bo),
        offsets: PlanarBuffer::offsets(bo),
        modifier: if with_modifiers { modifier } else { None },
    }
}

/// Bits per pixel of the single-plane formats a dumb buffer can hold.
fn dumb_bpp(format: Fourcc) -> Option<u32> {
    match format {
        Fourcc::Xrgb8888
        | Fourcc::Argb8888
        | Fourcc::Xbgr8888
        | Fourcc::Abgr8888
        | Fourcc::Rgbx8888
        | Fourcc::Rgba8888
        | Fourcc::Bgrx8888
        | Fourcc::Bgra8888
        | Fourcc::Xrgb2101010
        | Fourcc::Argb2101010
        | Fourcc::Xbgr2101010
        | Fourcc::Abgr2101010 => Some(32),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::kms::{fake::FakeKernel, kernel::KernelDevice};

    #[test]
    fn dumb_allocation() {
        let fake = FakeKernel::new();
        let kernel: KernelHandle = fake.clone();
        let allocator = Allocator::dumb(&kernel, true, false);
        assert!(allocator.is_valid());

        let mut image = allocator
            .allocate(320, 200, Fourcc::Xrgb8888, &[])
            .unwrap();
        assert!(!image.is_busy());
        assert_eq!(image.buffer().width(), 320);
        assert_eq!(image.buffer().height(), 200);
        assert_eq!(image.buffer().format(), Fourcc::Xrgb8888);
        assert!(image.is_mappable());

        image
            .map_pixels(&mut |pixels| {
                assert_eq!(pixels.len(), 320 * 200 * 4);
                pixels.fill(0xff);
            })
            .unwrap();

        let fb = image.buffer().id();
        let desc = fake.state.borrow().framebuffers[&fb];
        assert_eq!(desc.pitches[0], 320 * 4);
        assert_eq!(desc.modifier, None);

        drop(image);
        assert_eq!(fake.framebuffer_count(), 0);
        assert!(fake.state.borrow().dumb.is_empty());
    }

    #[test]
    fn dumb_rejects_other_layouts() {
        let fake = FakeKernel::new();
        let kernel: KernelHandle = fake.clone();
        let allocator = Allocator::dumb(&kernel, true, false);

        for format in [Fourcc::Rgb565, Fourcc::Nv12] {
            assert!(matches!(
                allocator.allocate(64, 64, format, &[]),
                Err(AllocError::UnsupportedFormat(f)) if f == format
            ));
        }
        assert!(fake.state.borrow().dumb.is_empty());
        assert_eq!(fake.framebuffer_count(), 0);

        let image = allocator.allocate(64, 64, Fourcc::Abgr2101010, &[]).unwrap();
        let desc = fake.state.borrow().framebuffers[&image.buffer().id()];
        assert_eq!(desc.pitches[0], 64 * 4);
    }

    #[test]
    fn modifiers_without_support_fail() {
        let fake = FakeKernel::new();
        let kernel: KernelHandle = fake.clone();
        let allocator = Allocator::dumb(&kernel, true, false);

        assert!(matches!(
            allocator.allocate(64, 64, Fourcc::Xrgb8888, &[Modifier::Linear]),
            Err(AllocError::ModifiersUnsupported)
        ));
        assert!(fake.state.borrow().dumb.is_empty());
    }

    #[test]
    fn linear_modifier_with_support() {
        let fake = FakeKernel::new();
        fake.set_capability(
            crate::backend::kms::kernel::Capability::AddFb2Modifiers,
            1,
        );
        let kernel: KernelHandle = fake.clone();
        let allocator = Allocator::dumb(&kernel, true, true);

        let image = allocator
            .allocate(64, 64, Fourcc::Xrgb8888, &[Modifier::Linear])
            .unwrap();
        let desc = fake.state.borrow().framebuffers[&image.buffer().id()];
        assert_eq!(desc.modifier, Some(Modifier::Linear));

        let x_tiled = Modifier::from(0x0100000000000001u64);
        assert!(matches!(
            allocator.allocate(64, 64, Fourcc::Xrgb8888, &[x_tiled]),
            Err(AllocError::UnsupportedModifier(_))
        ));
    }

    #[test]
    fn unsupported_dumb_allocator_always_fails() {
        let fake = FakeKernel::new();
        let kernel: KernelHandle = fake.clone();
        let allocator = Allocator::dumb(&kernel, false, false);

        assert!(!allocator.is_valid());
        assert!(matches!(
            allocator.allocate(64, 64, Fourcc::Xrgb8888, &[]),
            Err(AllocError::DumbUnsupported)
        ));
    }

    #[test]
    fn failed_registration_frees_memory() {
        let fake = FakeKernel::new();
        let kernel: KernelHandle = fake.clone();
        // claims modifier support the kernel does not have
        let allocator = Allocator::dumb(&kernel, true, true);

        assert!(matches!(
            allocator.allocate(64, 64, Fourcc::Xrgb8888, &[Modifier::Linear]),
            Err(AllocError::Framebuffer(_))
        ));
        assert!(fake.state.borrow().dumb.is_empty());
        assert_eq!(fake.framebuffer_count(), 0);
    }

    #[test]
    fn gbm_needs_a_device_node() {
        let fake = FakeKernel::new();
        assert!(fake.drm_fd().is_none());
        let kernel: KernelHandle = fake;
        assert!(matches!(
            Allocator::gbm(&kernel, false),
            Err(AllocError::GbmUnavailable)
        ));
    }
}
