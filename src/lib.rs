// Comet: connected-component extraction on the GPU.
//
// Dense labeling of 2D binary masks with wgpu compute: every foreground
// pixel gets a component id from 1..=K, background stays 0, and the whole
// pass — provisional labeling, label-equivalence propagation, sort-based
// compaction, final relabeling — runs on device memory with only scalar
// readbacks in between.
//
// Reference: Hawick, Leist, Playne — "Parallel Graph Component Labelling
// with GPUs and CUDA" (Parallel Computing, 2010), the label-equivalence
// propagation family this pass belongs to.

pub mod gpu;
pub mod image;

// Re-export the working set.
pub use gpu::device::{GpuDevice, GpuError, WorkgroupSize};
pub use gpu::grid::GpuGrid;
pub use gpu::labeling::{ConnectedComponents, Connectivity, LabelError};
pub use image::{Image, Pixel};
