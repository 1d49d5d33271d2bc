// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate adapters and select the first hardware one, falling back
//     to whatever exists (software rasterizers work, just slowly — the
//     equivalence loop is many dispatch+readback round trips).
//   - Expose `WorkgroupSize` — the 2D workgroup configuration used by the
//     per-pixel labeling kernels, validated against the device limits.
//   - Provide dispatch helpers: ceiling-division 2D dispatch over an image
//     grid, and tiled 1-D dispatch for the flat compaction buffers (a
//     single dispatch dimension caps out at 65535 workgroups; past that
//     the workgroups fold into a 2D grid and kernels linearize through
//     the num_workgroups builtin).
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` applies power-preference heuristics
// that can select a software Vulkan device (llvmpipe) on headless Linux.
// We enumerate explicitly and prefer real hardware by device type.

use std::fmt;

/// A workgroup size configuration for 2D compute dispatches.
///
/// Both dimensions are baked into the WGSL source at pipeline creation
/// (the shaders carry `{{WG_X}}`/`{{WG_Y}}` placeholders). The product
/// must not exceed the device's `max_compute_invocations_per_workgroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }
}

impl Default for WorkgroupSize {
    /// 16×8 = 128 invocations: four 32-wide warps / two 64-wide waves,
    /// with the 16-wide x dimension matching row-major cache lines.
    fn default() -> Self {
        WorkgroupSize { x: 16, y: 8 }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Workgroup size for the 1-D compaction kernels (sort, search, scan).
/// `wgpu::Limits::default()` guarantees at least 256 invocations, and the
/// shared-memory scan tile is sized to match.
pub const LINEAR_WG: u32 = 256;

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The core GPU context: adapter, device, queue, and dispatch limits.
///
/// Create once via [`GpuDevice::new`] and reuse for the lifetime of the
/// application — device initialization is expensive, and every labeling
/// pass created from it shares the compiled pipelines.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is declared
/// last so the `wgpu::Instance` outlives `device` and `queue`; some
/// drivers crash if the instance dies while device objects still hold
/// back-references into it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    max_invocations: u32,
    max_workgroups_per_dim: u32,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` drop.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` on the best available adapter.
    ///
    /// # Errors
    /// Returns `Err` if no adapter is found or the device request fails.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            // Validation layer in debug builds for shader error feedback.
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::PRIMARY)
            .into_iter()
            .collect();

        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let info = a.get_info();
            log::debug!(
                "adapter: {} ({:?}, {:?})",
                info.name,
                info.backend,
                info.device_type
            );
        }

        // Tier 1: real hardware. Tier 2: take whatever exists (llvmpipe
        // and friends produce correct results; only throughput suffers).
        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                )
            })
            .or_else(|| {
                instance
                    .enumerate_adapters(wgpu::Backends::PRIMARY)
                    .into_iter()
                    .next()
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        log::debug!("selected adapter: {adapter_info}");

        let limits = wgpu::Limits::default();
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("comet-ccl"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        Ok(GpuDevice {
            device,
            queue,
            adapter_info,
            workgroup_size: WorkgroupSize::default(),
            max_invocations: limits.max_compute_invocations_per_workgroup,
            max_workgroups_per_dim: limits.max_compute_workgroups_per_dimension,
            _instance: instance,
        })
    }

    /// Override the default 2D workgroup size.
    ///
    /// Returns `Err` if x * y exceeds the device's invocation limit.
    /// Takes effect for labeling passes constructed afterwards — the
    /// dimensions are baked into the shaders at pipeline creation.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let total = x * y;
        if total == 0 || total > self.max_invocations {
            return Err(GpuError::WorkgroupTooLarge { total, max: self.max_invocations });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    /// Workgroup counts covering a `img_w × img_h` grid with the active
    /// workgroup size. Ceiling division: every pixel is covered even when
    /// the dimensions are not workgroup multiples, so shaders must guard
    /// `gid.x >= width || gid.y >= height`.
    pub fn dispatch_size(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        let dx = (img_w + self.workgroup_size.x - 1) / self.workgroup_size.x;
        let dy = (img_h + self.workgroup_size.y - 1) / self.workgroup_size.y;
        (dx, dy)
    }

    /// Workgroup grid for a 1-D dispatch over `items` elements with
    /// [`LINEAR_WG`]-sized workgroups, folded into 2D when the count
    /// exceeds the per-dimension limit. Kernels recover the linear index
    /// through `@builtin(num_workgroups)`.
    pub fn linear_dispatch(&self, items: u32) -> Result<(u32, u32), GpuError> {
        tile_linear(items, LINEAR_WG, self.max_workgroups_per_dim)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, workgroup: {} }}",
            self.adapter_info, self.workgroup_size
        )
    }
}

/// Fold a 1-D workgroup count into a (x, y) grid bounded by
/// `max_per_dim` in each dimension.
fn tile_linear(items: u32, wg: u32, max_per_dim: u32) -> Result<(u32, u32), GpuError> {
    let groups = items.div_ceil(wg).max(1);
    if groups <= max_per_dim {
        return Ok((groups, 1));
    }
    let gy = groups.div_ceil(max_per_dim);
    if gy > max_per_dim {
        return Err(GpuError::DispatchTooLarge { groups, max: max_per_dim });
    }
    Ok((max_per_dim, gy))
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialization, dispatch, and readback.
#[derive(Debug)]
pub enum GpuError {
    /// No compute adapter found. On headless Linux: check that a Vulkan
    /// ICD is installed (`vulkaninfo` should list at least one device).
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits).
    DeviceRequest(wgpu::RequestDeviceError),
    /// Requested workgroup size exceeds the device's invocation limit.
    WorkgroupTooLarge { total: u32, max: u32 },
    /// A flat buffer needs more workgroups than a 2D dispatch grid holds.
    DispatchTooLarge { groups: u32, max: u32 },
    /// A readback buffer failed to map.
    MapFailed(wgpu::BufferAsyncError),
    /// The device reported an error while executing submitted work
    /// (validation failure or out-of-memory during a labeling pass).
    Execution(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoSuitableAdapter => {
                write!(f, "no compute adapter found (is a GPU driver or Vulkan ICD installed?)")
            }
            GpuError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
            GpuError::WorkgroupTooLarge { total, max } => {
                write!(f, "workgroup size {total} exceeds device limit of {max} invocations")
            }
            GpuError::DispatchTooLarge { groups, max } => {
                write!(f, "dispatch of {groups} workgroups exceeds {max}×{max} grid")
            }
            GpuError::MapFailed(e) => write!(f, "readback map failed: {e}"),
            GpuError::Execution(msg) => write!(f, "device execution error: {msg}"),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceRequest(e) => Some(e),
            GpuError::MapFailed(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================
// Tests
// ============================================================
