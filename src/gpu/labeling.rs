// gpu/labeling.rs — GPU connected-component labeling pass.
//
// Four stages, strictly ordered, all on the device:
//
//   1. initial_label   every foreground pixel gets a unique provisional
//                      label (its linear index + 1; 0 stays background).
//   2. update_equiv    minimum-label propagation to a fixed point. The
//                      host re-dispatches the kernel until an iteration
//                      reports no change through a 4-byte flag readback —
//                      a read-after-write dependency that cannot be
//                      pipelined away without losing the convergence
//                      guarantee.
//   3. compaction      sort + boundary search + exclusive scan build the
//                      sparse-label → dense-id table (gpu::compaction).
//   4. final_relabel   every pixel is rewritten through the table, in
//                      place on the output grid.
//
// The output grid doubles as the working buffer for stages 1–2, so the
// pass allocates no third full-size grid. Input and output must be
// distinct buffers: a grid bound as both the read-only mask and the
// read-write label array in one bind group fails wgpu validation.
//
// WORST CASE: one propagation step moves a label one neighbor per
// iteration, so a thin snake-shaped component needs O(path length)
// iterations of O(W*H) work each. That is a throughput property, not a
// correctness hazard — set `max_iterations` to trade exactness for a
// bound (the pass then compacts whatever partition the loop reached).

use wgpu::util::DeviceExt;

use crate::gpu::compaction::CompactionPass;
use crate::gpu::device::{GpuDevice, GpuError, WorkgroupSize};
use crate::gpu::grid::{read_scalar_u32, GpuGrid};

use std::fmt;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which neighbors count as adjacent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Edge neighbors only (von Neumann neighborhood).
    Four,
    /// Edge and diagonal neighbors (Moore neighborhood).
    Eight,
}

impl Connectivity {
    /// Value of the `DIAGONALS` shader constant.
    fn diagonals(self) -> u32 {
        match self {
            Connectivity::Four => 0,
            Connectivity::Eight => 1,
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Four => write!(f, "4-connected"),
            Connectivity::Eight => write!(f, "8-connected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Uniform params (must match WGSL struct GridParams exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GridParams {
    width: u32,
    height: u32,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from a labeling call.
#[derive(Debug)]
pub enum LabelError {
    /// Input and output grids have different dimensions. Nothing was
    /// dispatched; the output grid is untouched.
    ShapeMismatch {
        input: (u32, u32),
        output: (u32, u32),
    },
    /// The device failed while executing the pass (validation fault,
    /// out-of-memory on a scratch buffer, lost readback). The output
    /// grid may hold an intermediate state; the call is not retried.
    Gpu(GpuError),
}

impl fmt::Display for LabelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelError::ShapeMismatch { input, output } => write!(
                f,
                "input grid {}×{} does not match output grid {}×{}",
                input.0, input.1, output.0, output.1
            ),
            LabelError::Gpu(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LabelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LabelError::Gpu(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuError> for LabelError {
    fn from(e: GpuError) -> Self {
        LabelError::Gpu(e)
    }
}

// ---------------------------------------------------------------------------
// ConnectedComponents
// ---------------------------------------------------------------------------

/// Compiled connected-component labeling pass.
///
/// Connectivity and workgroup size are baked into the shaders at
/// construction; create once and call [`label`](Self::label) per image.
///
/// ```no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use comet_ccl::{ConnectedComponents, Connectivity, GpuDevice, GpuGrid, Image};
///
/// let gpu = GpuDevice::new()?;
/// let pass = ConnectedComponents::new(&gpu, Connectivity::Eight);
///
/// let mask: Image<u8> = Image::from_vec(3, 1, vec![1, 0, 1]);
/// let input = GpuGrid::upload(&gpu, &mask);
/// let output = GpuGrid::zeroed(&gpu, 3, 1);
///
/// let components = pass.label(&gpu, &input, &output)?;
/// assert_eq!(components, 2);
/// assert_eq!(output.readback(&gpu)?, vec![1, 0, 2]);
/// # Ok(())
/// # }
/// ```
pub struct ConnectedComponents {
    p_initial: wgpu::ComputePipeline,
    p_update: wgpu::ComputePipeline,
    p_relabel: wgpu::ComputePipeline,
    bgl_initial: wgpu::BindGroupLayout,
    bgl_update: wgpu::BindGroupLayout,
    bgl_relabel: wgpu::BindGroupLayout,
    compaction: CompactionPass,
    workgroup: WorkgroupSize,
    pub connectivity: Connectivity,
    /// Optional cap on equivalence iterations. `None` (the default) runs
    /// to the fixed point. With a cap, a pass that hits it still
    /// compacts and relabels the partition reached so far — labels stay
    /// dense and background stays 0, but distant pixels of a sprawling
    /// component may end up in separate components.
    pub max_iterations: Option<u32>,
}

impl ConnectedComponents {
    pub fn new(gpu: &GpuDevice, connectivity: Connectivity) -> Self {
        let shader_src = shader_source(gpu.workgroup_size, connectivity);
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("labeling.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        // Bind group layouts mirror @group(0) in labeling.wgsl; each
        // entry point uses its own subset of the bindings.
        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let uniform = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bgl_initial = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("initial_label BGL"),
            entries: &[
                storage(0, true),  // mask
                storage(1, false), // labels
                uniform(2),        // params
            ],
        });
        let bgl_update = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("update_equiv BGL"),
            entries: &[
                storage(0, true),  // mask
                storage(1, false), // labels
                uniform(2),        // params
                storage(3, false), // changed flag
            ],
        });
        let bgl_relabel = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("final_relabel BGL"),
            entries: &[
                storage(1, false), // labels
                uniform(2),        // params
                storage(4, true),  // compaction table
            ],
        });

        let make = |label: &str, entry: &str, bgl: &wgpu::BindGroupLayout| {
            let layout = gpu
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[bgl],
                    push_constant_ranges: &[],
                });
            gpu.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    module: &shader,
                    entry_point: entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
        };

        let p_initial = make("initial_label", "initial_label", &bgl_initial);
        let p_update = make("update_equiv", "update_equiv", &bgl_update);
        let p_relabel = make("final_relabel", "final_relabel", &bgl_relabel);

        ConnectedComponents {
            p_initial,
            p_update,
            p_relabel,
            bgl_initial,
            bgl_update,
            bgl_relabel,
            compaction: CompactionPass::new(gpu),
            workgroup: gpu.workgroup_size,
            connectivity,
            max_iterations: None,
        }
    }

    /// Label the connected components of `input` into `output`.
    ///
    /// `input` is read as a mask (nonzero = foreground) and left
    /// untouched. `output` must be a distinct, caller-allocated grid of
    /// the same dimensions; it is overwritten entirely — foreground
    /// pixels get their component id from `1..=K` in ascending order of
    /// each component's first row-major pixel, background pixels get 0.
    ///
    /// Returns K, the number of components. A zero-sized grid is a
    /// no-op returning 0. The result is deterministic: identical mask
    /// and connectivity produce a bit-identical labeling.
    pub fn label(
        &self,
        gpu: &GpuDevice,
        input: &GpuGrid,
        output: &GpuGrid,
    ) -> Result<u32, LabelError> {
        if (input.width, input.height) != (output.width, output.height) {
            return Err(LabelError::ShapeMismatch {
                input: (input.width, input.height),
                output: (output.width, output.height),
            });
        }
        if input.is_empty() {
            return Ok(0);
        }

        // Device faults surface asynchronously; scopes collect anything
        // raised by the stages below (scratch allocation failure,
        // validation fault) so the call fails loudly instead of
        // returning a half-written grid as success.
        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let result = self.run_stages(gpu, input, output);

        gpu.device.poll(wgpu::Maintain::Wait);
        let oom = pollster::block_on(gpu.device.pop_error_scope());
        let validation = pollster::block_on(gpu.device.pop_error_scope());
        if let Some(e) = oom.or(validation) {
            return Err(GpuError::Execution(e.to_string()).into());
        }
        result
    }

    fn run_stages(
        &self,
        gpu: &GpuDevice,
        input: &GpuGrid,
        output: &GpuGrid,
    ) -> Result<u32, LabelError> {
        let params = GridParams { width: input.width, height: input.height };
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("labeling params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        // Fresh convergence flag per call — no state survives between
        // labeling requests.
        let changed = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("changed flag"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let bg_initial = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("initial_label BG"),
            layout: &self.bgl_initial,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: input.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: output.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
            ],
        });
        let bg_update = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("update_equiv BG"),
            layout: &self.bgl_update,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: input.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: output.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: changed.as_entire_binding() },
            ],
        });

        let (dx, dy) = self.grid_dispatch(input.width, input.height);

        // ── Stage 1: initial labeling ────────────────────────────────────────
        self.dispatch_grid(gpu, &self.p_initial, &bg_initial, dx, dy, "initial_label");

        // ── Stage 2: equivalence resolution to a fixed point ─────────────────
        let mut iterations = 0u32;
        loop {
            gpu.queue.write_buffer(&changed, 0, bytemuck::bytes_of(&0u32));
            self.dispatch_grid(gpu, &self.p_update, &bg_update, dx, dy, "update_equiv");
            iterations += 1;

            // Blocking scalar readback — the decision to relaunch depends
            // on this iteration's outcome.
            let flag = read_scalar_u32(gpu, &changed, 0)?;
            if flag == 0 {
                break;
            }
            if let Some(cap) = self.max_iterations {
                if iterations >= cap {
                    log::warn!(
                        "equivalence loop stopped at iteration cap {cap}; \
                         labeling is approximate"
                    );
                    break;
                }
            }
        }
        log::trace!("equivalence resolved in {iterations} iterations");

        // ── Stage 3: label compaction ────────────────────────────────────────
        let (table, k) = self.compaction.build_table(gpu, output)?;

        // ── Stage 4: final relabeling, in place ──────────────────────────────
        let bg_relabel = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("final_relabel BG"),
            layout: &self.bgl_relabel,
            entries: &[
                wgpu::BindGroupEntry { binding: 1, resource: output.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: table.as_entire_binding() },
            ],
        });
        self.dispatch_grid(gpu, &self.p_relabel, &bg_relabel, dx, dy, "final_relabel");

        Ok(k)
    }

    /// Workgroup counts covering the image with the baked workgroup size.
    fn grid_dispatch(&self, width: u32, height: u32) -> (u32, u32) {
        let dx = width.div_ceil(self.workgroup.x);
        let dy = height.div_ceil(self.workgroup.y);
        (dx, dy)
    }

    fn dispatch_grid(
        &self,
        gpu: &GpuDevice,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        dx: u32,
        dy: u32,
        label: &str,
    ) {
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(dx, dy, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }
}

/// Bake workgroup size and connectivity into the shader source.
fn shader_source(workgroup: WorkgroupSize, connectivity: Connectivity) -> String {
    include_str!("../shaders/labeling.wgsl")
        .replace("{{WG_X}}", &workgroup.x.to_string())
        .replace("{{WG_Y}}", &workgroup.y.to_string())
        .replace("{{DIAGONALS}}", &connectivity.diagonals().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
