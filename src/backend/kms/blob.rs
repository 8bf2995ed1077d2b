// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use tracing::warn;

use super::{
    kernel::{BlobId, KernelHandle},
    mode::Mode,
};

/// A property blob registered with the kernel, destroyed on drop.
#[derive(Debug)]
pub struct PropertyBlob {
    kernel: KernelHandle,
    id: BlobId,
}

impl PropertyBlob {
    pub fn from_mode(kernel: &KernelHandle, mode: &Mode) -> io::Result<PropertyBlob> {
        let id = kernel.create_mode_blob(mode)?;
        Ok(PropertyBlob {
            kernel: kernel.clone(),
            id,
        })
    }

    pub fn id(&self) -> BlobId {
        self.id
    }
}

impl Drop for PropertyBlob {
    fn drop(&mut self) {
        if let Err(err) = self.kernel.destroy_blob(self.id) {
            warn!(?err, blob = %self.id, "Failed to destroy property blob");
        }
    }
}
