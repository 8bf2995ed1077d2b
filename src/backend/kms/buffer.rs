// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use smithay::backend::allocator::Fourcc;
use tracing::warn;

use super::kernel::{FramebufferDesc, FramebufferId, KernelHandle};

/// A framebuffer registered with the kernel.
///
/// The registration lives exactly as long as the `Buffer`, dropping it
/// removes the framebuffer again.
#[derive(Debug)]
pub struct Buffer {
    kernel: KernelHandle,
    id: FramebufferId,
    format: Fourcc,
    width: u32,
    height: u32,
}

impl Buffer {
    pub fn register(kernel: &KernelHandle, desc: &FramebufferDesc) -> io::Result<Buffer> {
        let id = kernel.add_framebuffer(desc)?;
        Ok(Buffer {
            kernel: kernel.clone(),
            id,
            format: desc.format,
            width: desc.width,
            height: desc.height,
        })
    }

    pub fn id(&self) -> FramebufferId {
        self.id
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(err) = self.kernel.remove_framebuffer(self.id) {
            warn!(?err, fb = %self.id, "Failed to remove framebuffer");
        }
    }
}
