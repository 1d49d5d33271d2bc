// gpu/grid.rs — device-resident 2D u32 grid and CPU↔GPU transfer.
//
// Labeling kernels need atomic read-write access to every pixel, which
// texture bindings do not provide — so device images here are flat u32
// storage buffers, row-major, stride == width. `GpuGrid` is both the
// input mask (0 = background, nonzero = foreground) and the label grid
// the pass writes.
//
// UPLOAD CONVERSION:
// The host container may hold any `Pixel` element type and a stride wider
// than the row. Upload compacts the stride padding away and collapses
// each element to a 0/1 indicator word. The collapse happens on the host
// because the device buffer is u32: a float mask value like 0.5 would
// truncate to 0 in a raw cast and silently drop foreground pixels.

use wgpu::util::DeviceExt;

use crate::gpu::device::{GpuDevice, GpuError};
use crate::image::{Image, Pixel};

/// A `width × height` u32 grid resident on the GPU as a storage buffer.
///
/// Created via [`GpuGrid::upload`] (mask input) or [`GpuGrid::zeroed`]
/// (caller-allocated output). Dropping it releases the device memory.
pub struct GpuGrid {
    /// Flat row-major storage buffer, `width * height` u32 words.
    pub buffer: wgpu::Buffer,
    pub width: u32,
    pub height: u32,
}

impl GpuGrid {
    /// Number of elements (`width * height`).
    pub fn len(&self) -> u32 {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a zero-filled grid (wgpu zero-initializes new buffers).
    pub fn zeroed(gpu: &GpuDevice, width: u32, height: u32) -> Self {
        let bytes = u64::from(width) * u64::from(height) * 4;
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuGrid"),
            // Zero-sized grids keep a minimal allocation so the type
            // stays bindable; the labeling pass never dispatches on them.
            size: bytes.max(4),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        GpuGrid { buffer, width, height }
    }

    /// Upload a host image as a 0/1 foreground mask.
    pub fn upload<T: Pixel>(gpu: &GpuDevice, src: &Image<T>) -> Self {
        let width = src.width() as u32;
        let height = src.height() as u32;
        let words = mask_words(src);
        if words.is_empty() {
            return Self::zeroed(gpu, width, height);
        }

        let buffer = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("GpuGrid::upload"),
            contents: bytemuck::cast_slice(&words),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });

        GpuGrid { buffer, width, height }
    }

    /// Read the grid back to host memory.
    ///
    /// Expensive and synchronous — stalls until the GPU timeline reaches
    /// the copy. Returns `width * height` words, row-major.
    pub fn readback(&self, gpu: &GpuDevice) -> Result<Vec<u32>, GpuError> {
        let n = self.len() as usize;
        if n == 0 {
            return Ok(Vec::new());
        }
        let bytes = (n * 4) as u64;

        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuGrid::readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuGrid::readback"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| GpuError::Execution("readback channel closed".into()))?
            .map_err(GpuError::MapFailed)?;

        let mapped = slice.get_mapped_range();
        let out: Vec<u32> = bytemuck::cast_slice(&mapped).to_vec();
        drop(mapped);
        staging.unmap();
        Ok(out)
    }

    /// Read the grid back into a host [`Image<u32>`].
    pub fn readback_image(&self, gpu: &GpuDevice) -> Result<Image<u32>, GpuError> {
        let data = self.readback(gpu)?;
        Ok(Image::from_vec(self.width as usize, self.height as usize, data))
    }
}

/// Read a single u32 from a device buffer at the given element offset.
///
/// Transfers 4 bytes instead of the whole buffer — this is the hot
/// readback on the equivalence loop (continue flag) and on compaction
/// (max label, component count).
pub(crate) fn read_scalar_u32(
    gpu: &GpuDevice,
    buffer: &wgpu::Buffer,
    element_offset: u32,
) -> Result<u32, GpuError> {
    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("scalar readback"),
        size: 4,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("scalar readback"),
        });
    encoder.copy_buffer_to_buffer(buffer, u64::from(element_offset) * 4, &staging, 0, 4);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| GpuError::Execution("scalar readback channel closed".into()))?
        .map_err(GpuError::MapFailed)?;

    let mapped = slice.get_mapped_range();
    let value = u32::from_ne_bytes([mapped[0], mapped[1], mapped[2], mapped[3]]);
    drop(mapped);
    staging.unmap();
    Ok(value)
}

/// Compact a host image into 0/1 indicator words, stripping stride padding.
fn mask_words<T: Pixel>(src: &Image<T>) -> Vec<u32> {
    let mut words = Vec::with_capacity(src.width() * src.height());
    for y in 0..src.height() {
        words.extend(src.row(y).iter().map(|&v| u32::from(v.is_foreground())));
    }
    words
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
