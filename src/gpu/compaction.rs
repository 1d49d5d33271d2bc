// gpu/compaction.rs — sparse-label → dense-id compaction pass.
//
// After the equivalence loop converges, the label grid holds one
// canonical label per component: the minimum linear index (+1) of the
// component's pixels. Those survivors are sparse — this pass renumbers
// them 1..=K without ever pulling the grid back to the host:
//
//   1. copy the grid into a scratch buffer, zero-padded to a power of two
//   2. sort the scratch in place (bitonic network, one dispatch per pass)
//   3. read back the last element → max label → bin count
//   4. upper-bound counts per candidate label value
//   5. adjacent difference clamped to 0/1 → occurrence flags
//   6. hierarchical exclusive scan of the flags → the compaction table
//
// The table entry at `max_label` (the rank of the largest surviving
// label) doubles as K, read back as a second 4-byte scalar.
//
// The sort is a bitonic network rather than radix: keys are bare u32s
// sorted once per labeling call, and the data-independent (k, j)
// schedule needs no histograms, no scatter, and no double buffering. Its
// compare-and-swap rule is mirrored by a CPU simulation in the tests.
//
// SCRATCH LIFETIME: every buffer created here dies with this call; the
// only output is the table handed to final_relabel.

use wgpu::util::DeviceExt;

use crate::gpu::device::{GpuDevice, GpuError, LINEAR_WG};
use crate::gpu::grid::{read_scalar_u32, GpuGrid};

// ---------------------------------------------------------------------------
// Uniform params (must match the WGSL structs exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct SortParams {
    n: u32,
    k: u32,
    j: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct BinParams {
    num_bins: u32,
    n: u32,
    _pad0: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ScanParams {
    len: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

// ---------------------------------------------------------------------------
// CompactionPass
// ---------------------------------------------------------------------------

/// Compiled compaction pipelines. Created once per [`super::labeling::ConnectedComponents`]
/// and reused across labeling calls.
pub(crate) struct CompactionPass {
    p_bitonic: wgpu::ComputePipeline,
    p_counts: wgpu::ComputePipeline,
    p_flags: wgpu::ComputePipeline,
    p_scan_block: wgpu::ComputePipeline,
    p_scan_propagate: wgpu::ComputePipeline,
    p_shift: wgpu::ComputePipeline,
}

impl CompactionPass {
    pub fn new(gpu: &GpuDevice) -> Self {
        let shader_template = include_str!("../shaders/compaction.wgsl");
        let shader_src = shader_template.replace("{{LINEAR_WG}}", &LINEAR_WG.to_string());

        let module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("compaction.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        // Auto layouts: each entry point binds a different subset of the
        // module's bindings, and the inferred layout covers exactly the
        // statically used ones.
        let make = |label: &str, entry: &str| -> wgpu::ComputePipeline {
            gpu.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: None,
                    module: &module,
                    entry_point: entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
        };

        CompactionPass {
            p_bitonic: make("bitonic_step", "bitonic_step"),
            p_counts: make("upper_bound_counts", "upper_bound_counts"),
            p_flags: make("boundary_flags", "boundary_flags"),
            p_scan_block: make("scan_block", "scan_block"),
            p_scan_propagate: make("scan_propagate", "scan_propagate"),
            p_shift: make("inclusive_to_exclusive", "inclusive_to_exclusive"),
        }
    }

    /// Build the provisional → dense mapping for a converged label grid.
    ///
    /// Returns the table buffer (`max_label + 1` words, entry 0 = 0) and
    /// K, the number of distinct surviving foreground labels.
    pub fn build_table(
        &self,
        gpu: &GpuDevice,
        labels: &GpuGrid,
    ) -> Result<(wgpu::Buffer, u32), GpuError> {
        let n = labels.len();
        let padded = n.next_power_of_two();

        // --- 1. scratch copy, zero-padded -----------------------------------
        // New buffers are zero-filled, so only the live prefix is copied;
        // the padding zeros sort into the background run at the front.
        let scratch = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("compaction scratch"),
            size: u64::from(padded) * 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compaction sort"),
            });
        encoder.copy_buffer_to_buffer(&labels.buffer, 0, &scratch, 0, u64::from(n) * 4);

        // --- 2. bitonic sort, all passes in one submission ------------------
        // Compute passes within an encoder are ordered, so the whole
        // O(log² n) schedule rides a single queue submission.
        let (sort_gx, sort_gy) = gpu.linear_dispatch(padded)?;
        let bgl_bitonic = self.p_bitonic.get_bind_group_layout(0);
        for (k, j) in bitonic_passes(padded) {
            let params = SortParams { n: padded, k, j, _pad: 0 };
            let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("bitonic params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("bitonic BG"),
                layout: &bgl_bitonic,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: scratch.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: params_buf.as_entire_binding() },
                ],
            });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("bitonic_step"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.p_bitonic);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(sort_gx, sort_gy, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        // --- 3. bin count from the sorted maximum ---------------------------
        let max_label = read_scalar_u32(gpu, &scratch, padded - 1)?;
        let num_bins = max_label + 1;

        // --- 4/5. upper-bound counts and occurrence flags -------------------
        let counts = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("compaction counts"),
            size: u64::from(num_bins) * 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let flags = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("compaction flags"),
            size: u64::from(num_bins) * 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let bin_params = BinParams { num_bins, n: padded, _pad0: 0, _pad1: 0 };
        let bin_params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("bin params"),
            contents: bytemuck::bytes_of(&bin_params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bg_counts = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("counts BG"),
            layout: &self.p_counts.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry { binding: 2, resource: scratch.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: counts.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: bin_params_buf.as_entire_binding() },
            ],
        });
        let bg_flags = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("flags BG"),
            layout: &self.p_flags.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry { binding: 3, resource: counts.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: bin_params_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: flags.as_entire_binding() },
            ],
        });

        let (bins_gx, bins_gy) = gpu.linear_dispatch(num_bins)?;
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compaction bins"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("upper_bound_counts"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.p_counts);
            pass.set_bind_group(0, &bg_counts, &[]);
            pass.dispatch_workgroups(bins_gx, bins_gy, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("boundary_flags"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.p_flags);
            pass.set_bind_group(0, &bg_flags, &[]);
            pass.dispatch_workgroups(bins_gx, bins_gy, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        // --- 6. exclusive scan → table --------------------------------------
        let inclusive = self.inclusive_scan(gpu, &flags, num_bins)?;

        let table = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("compaction table"),
            size: u64::from(num_bins) * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let scan_params = ScanParams { len: num_bins, _pad0: 0, _pad1: 0, _pad2: 0 };
        let scan_params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("shift params"),
            contents: bytemuck::bytes_of(&scan_params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bg_shift = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shift BG"),
            layout: &self.p_shift.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry { binding: 6, resource: inclusive.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 9, resource: scan_params_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 11, resource: table.as_entire_binding() },
            ],
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compaction shift"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("inclusive_to_exclusive"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.p_shift);
            pass.set_bind_group(0, &bg_shift, &[]);
            pass.dispatch_workgroups(bins_gx, bins_gy, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        // K = rank of the largest surviving label. The forced background
        // flag at bin 0 holds rank 0, so foreground ranks count from 1.
        let k = read_scalar_u32(gpu, &table, max_label)?;
        log::debug!("compaction: max_label={max_label}, components={k}");

        Ok((table, k))
    }

    /// Hierarchical inclusive prefix sum over `input[0..len]`.
    ///
    /// Per-block shared-memory scans, then a recursive scan of the block
    /// totals, then a propagation pass. Recursion depth is
    /// log_256(len) — three levels cover 16M bins.
    fn inclusive_scan(
        &self,
        gpu: &GpuDevice,
        input: &wgpu::Buffer,
        len: u32,
    ) -> Result<wgpu::Buffer, GpuError> {
        let num_blocks = len.div_ceil(LINEAR_WG).max(1);

        let output = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scan output"),
            size: u64::from(len.max(1)) * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let block_sums = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scan block sums"),
            size: u64::from(num_blocks) * 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let scan_params = ScanParams { len, _pad0: 0, _pad1: 0, _pad2: 0 };
        let scan_params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scan params"),
            contents: bytemuck::bytes_of(&scan_params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bg_block = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scan block BG"),
            layout: &self.p_scan_block.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry { binding: 6, resource: input.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 7, resource: output.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 8, resource: block_sums.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 9, resource: scan_params_buf.as_entire_binding() },
            ],
        });

        let (gx, gy) = gpu.linear_dispatch(len)?;
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("scan block"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("scan_block"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.p_scan_block);
            pass.set_bind_group(0, &bg_block, &[]);
            pass.dispatch_workgroups(gx, gy, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        if num_blocks > 1 {
            let block_offsets = self.inclusive_scan(gpu, &block_sums, num_blocks)?;

            let bg_prop = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("scan propagate BG"),
                layout: &self.p_scan_propagate.get_bind_group_layout(0),
                entries: &[
                    wgpu::BindGroupEntry { binding: 7, resource: output.as_entire_binding() },
                    wgpu::BindGroupEntry {
                        binding: 9,
                        resource: scan_params_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 10,
                        resource: block_offsets.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("scan propagate"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("scan_propagate"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.p_scan_propagate);
                pass.set_bind_group(0, &bg_prop, &[]);
                pass.dispatch_workgroups(gx, gy, 1);
            }
            gpu.queue.submit(std::iter::once(encoder.finish()));
        }

        Ok(output)
    }
}

/// The (k, j) schedule of a bitonic sorting network over `n` elements
/// (`n` a power of two). Empty for n < 2.
pub(crate) fn bitonic_passes(n: u32) -> Vec<(u32, u32)> {
    let mut passes = Vec::new();
    let mut k = 2u32;
    while k <= n {
        let mut j = k / 2;
        while j > 0 {
            passes.push((k, j));
            j /= 2;
        }
        k *= 2;
    }
    passes
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Bitonic schedule, validated by simulating the network -------------
    //
    // Applies exactly the compare-and-swap rule of the bitonic_step kernel
    // to a host vector. If the schedule or the rule were wrong, arbitrary
    // inputs would come out unsorted.

    fn simulate_network(data: &mut [u32]) {
        let n = data.len() as u32;
        assert!(n.is_power_of_two() || n < 2);
        for (k, j) in bitonic_passes(n) {
            for i in 0..n {
                let partner = i ^ j;
                if partner <= i {
                    continue;
                }
                let ascending = (i & k) == 0;
                let (a, b) = (data[i as usize], data[partner as usize]);
                if (ascending && a > b) || (!ascending && a < b) {
                    data[i as usize] = b;
                    data[partner as usize] = a;
                }
            }
        }
    }

    #[test]
    fn bitonic_passes_counts() {
        assert!(bitonic_passes(1).is_empty());
        assert_eq!(bitonic_passes(2), vec![(2, 1)]);
        // n = 8: k=2 (1 pass), k=4 (2), k=8 (3) → 6 passes.
        assert_eq!(bitonic_passes(8).len(), 6);
        // log2(n) * (log2(n) + 1) / 2 in general.
        assert_eq!(bitonic_passes(1024).len(), 55);
    }

    #[test]
    fn network_sorts_reversed_input() {
        let mut data: Vec<u32> = (0..64u32).rev().collect();
        simulate_network(&mut data);
        let expected: Vec<u32> = (0..64u32).collect();
        assert_eq!(data, expected);
    }

    #[test]
    fn network_sorts_lcg_noise() {
        // Deterministic pseudo-random input, several sizes.
        for &n in &[2usize, 16, 128, 1024] {
            let mut rng = 0x2545F491u32;
            let mut data: Vec<u32> = (0..n)
                .map(|_| {
                    rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
                    rng % 97
                })
                .collect();
            let mut expected = data.clone();
            expected.sort_unstable();
            simulate_network(&mut data);
            assert_eq!(data, expected, "network failed for n={n}");
        }
    }

    #[test]
    fn network_keeps_padding_zeros_in_front() {
        // Sparse labels + zero padding, as the real scratch buffer sees.
        let mut data = vec![0u32, 0, 17, 0, 5, 0, 0, 17];
        simulate_network(&mut data);
        assert_eq!(data, vec![0, 0, 0, 0, 0, 5, 17, 17]);
    }

    // ---- Table construction, mirrored on the host ---------------------------
    //
    // Mirrors the kernel sequence (sort → upper bound → clamped difference
    // with forced bin 0 → exclusive scan) in plain Rust to pin down the
    // arithmetic the GPU integration tests then compare against.

    fn reference_table(labels: &[u32]) -> (Vec<u32>, u32) {
        let mut sorted = labels.to_vec();
        sorted.sort_unstable();
        let max_label = sorted.last().copied().unwrap_or(0);
        let num_bins = max_label as usize + 1;

        let counts: Vec<u32> = (0..num_bins)
            .map(|i| sorted.partition_point(|&v| v <= i as u32) as u32)
            .collect();

        let flags: Vec<u32> = (0..num_bins)
            .map(|i| {
                if i == 0 {
                    1
                } else {
                    (counts[i] - counts[i - 1]).min(1)
                }
            })
            .collect();

        let mut table = vec![0u32; num_bins];
        let mut running = 0u32;
        for i in 0..num_bins {
            table[i] = running;
            running += flags[i];
        }
        let k = table[max_label as usize];
        (table, k)
    }

    #[test]
    fn table_background_only() {
        let (table, k) = reference_table(&[0, 0, 0, 0]);
        assert_eq!(table, vec![0]);
        assert_eq!(k, 0);
    }

    #[test]
    fn table_dense_ids_skip_gaps() {
        // Canonical labels 3 and 9 → dense ids 1 and 2.
        let (table, k) = reference_table(&[0, 3, 3, 0, 9, 9, 9, 0]);
        assert_eq!(k, 2);
        assert_eq!(table[0], 0);
        assert_eq!(table[3], 1);
        assert_eq!(table[9], 2);
    }

    #[test]
    fn table_without_background_still_starts_at_one() {
        // All-foreground grid: no zeros anywhere, forced bin 0 keeps the
        // single component at id 1, not 0.
        let (table, k) = reference_table(&[1, 1, 1, 1]);
        assert_eq!(k, 1);
        assert_eq!(table[1], 1);
    }

    #[test]
    fn table_ids_follow_label_order() {
        // Dense ids are assigned in ascending canonical-label order,
        // which is first-occurrence order in a row-major scan.
        let (table, k) = reference_table(&[0, 2, 5, 11, 2, 5, 0, 0]);
        assert_eq!(k, 3);
        assert_eq!(table[2], 1);
        assert_eq!(table[5], 2);
        assert_eq!(table[11], 3);
    }

    #[test]
    fn table_padding_zeros_do_not_shift_ids() {
        let bare = reference_table(&[0, 4, 4, 7]);
        let padded = reference_table(&[0, 4, 4, 7, 0, 0, 0, 0]);
        assert_eq!(bare, padded);
    }

    // ---- Scan block math ----------------------------------------------------

    #[test]
    fn scan_recursion_depth_is_bounded() {
        // 16.7M bins → 65536 blocks → 256 → 1: three levels.
        let mut len = 1u32 << 24;
        let mut depth = 0;
        while len > 1 {
            len = len.div_ceil(LINEAR_WG);
            depth += 1;
        }
        assert_eq!(depth, 3);
    }
}
