// SPDX-License-Identifier: GPL-3.0-only

use tracing::{trace, warn};

use super::output::Output;

/// Frames per full trip around the colour wheel, about ten seconds at 60Hz.
const CYCLE: u32 = 600;

/// Renders and submits the next frame of `output`.
///
/// Cpu-mappable images are filled with a slowly cycling colour, other images
/// are scanned out with whatever they contain. Nothing happens while a frame
/// is in flight or every image is busy. A rejected frame keeps its image,
/// the next call redraws and submits that same image.
pub fn render_frame(output: &mut Output) {
    profiling::scope!("render_frame");

    if output.pending().is_some() || !output.is_enabled() {
        return;
    }
    let Some(slot) = output.acquire() else {
        trace!(
            output = %output.name(),
            busy = ?output.swapchain().map(|swapchain| swapchain.busy_count()),
            "No free image, skipping frame"
        );
        return;
    };

    let color = cycle_color(output.sequence());
    if let Some(image) = output
        .swapchain_mut()
        .and_then(|swapchain| swapchain.image_mut(slot))
        .filter(|image| image.is_mappable())
    {
        if let Err(err) = image.map_pixels(&mut |pixels| fill(pixels, color)) {
            warn!(?err, "Failed to map image");
        }
    }

    if let Err(err) = output.present(slot) {
        warn!(?err, output = %output.name(), slot, "Failed to present frame");
    }
}

/// XRGB8888 pixels are stored little endian, blue first.
fn fill(pixels: &mut [u8], [r, g, b]: [u8; 3]) {
    for pixel in pixels.chunks_exact_mut(4) {
        pixel.copy_from_slice(&[b, g, r, 0xff]);
    }
}

fn cycle_color(sequence: u32) -> [u8; 3] {
    let step = sequence % CYCLE;
    let third = CYCLE / 3;
    let phase = step % third;
    let rise = (phase * 255 / third) as u8;
    let fall = 255 - rise;
    match step / third {
        0 => [fall, rise, 0],
        1 => [0, fall, rise],
        _ => [rise, 0, fall],
    }
}
