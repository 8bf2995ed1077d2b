// SPDX-License-Identifier: GPL-3.0-only

use smithay::backend::allocator::{Fourcc, Modifier};

use super::allocator::{AllocError, Allocator, Image};

pub const SWAPCHAIN_DEPTH: usize = 3;

/// Fixed pool of scanout images rotated across frames.
///
/// All images are allocated up front, a swapchain either holds
/// [`SWAPCHAIN_DEPTH`] images or does not exist.
#[derive(Debug)]
pub struct Swapchain {
    images: Vec<Image>,
    width: u32,
    height: u32,
    format: Fourcc,
}

impl Swapchain {
    pub fn new(
        allocator: &Allocator,
        width: u32,
        height: u32,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Swapchain, AllocError> {
        let images = (0..SWAPCHAIN_DEPTH)
            .map(|_| allocator.allocate(width, height, format, modifiers))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Swapchain {
            images,
            width,
            height,
            format,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Checks out the first idle image. `None` means every image is in
    /// flight and the caller has to wait for a completion.
    pub fn acquire(&mut self) -> Option<usize> {
        let (slot, image) = self
            .images
            .iter_mut()
            .enumerate()
            .find(|(_, image)| !image.is_busy())?;
        image.set_busy();
        Some(slot)
    }

    pub fn release(&mut self, slot: usize) {
        if let Some(image) = self.images.get_mut(slot) {
            image.release();
        }
    }

    pub fn image(&self, slot: usize) -> Option<&Image> {
        self.images.get(slot)
    }

    pub fn image_mut(&mut self, slot: usize) -> Option<&mut Image> {
        self.images.get_mut(slot)
    }

    pub fn busy_count(&self) -> usize {
        self.images.iter().filter(|image| image.is_busy()).count()
    }
}
