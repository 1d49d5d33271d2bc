// gpu/mod.rs — device context and the labeling pass.
//
// Layering:
//
//   device      wgpu adapter/device/queue, workgroup config, dispatch math
//   grid        device-resident u32 grids, CPU↔GPU transfer
//   labeling    the four-stage connected-component pass (public surface)
//   compaction  sparse-label → dense-id table builder (internal, used by
//               labeling's stage 3)
//
// Everything device-side is storage buffers — labeling needs atomic
// per-pixel writes, which rules out textures.

pub mod device;
pub mod grid;
pub mod labeling;

pub(crate) mod compaction;
