// image.rs — Runtime-sized host image container, generic over element type.
//
// This is the staging container on the CPU side of the crate: binary masks
// live in an `Image<T>` before upload, and label grids come back into an
// `Image<u32>` after readback. The device never sees this type — kernels
// operate on flat u32 storage buffers (see gpu::grid).
//
// Memory layout is row-major with an explicit element stride:
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9] 10 11 12 13 [14]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|  |--- row 2 ---|
//
//   [4], [9], [14] are padding elements (stride - width = 1 per row).
//   Upload compacts these away; the device layout is always stride == width.

use std::fmt;

// ---------------------------------------------------------------------------
// Pixel trait
// ---------------------------------------------------------------------------

/// Trait for types that can serve as elements of an [`Image`].
///
/// The labeling entry point only cares about one property of the input
/// element type: whether a value is zero (background) or nonzero
/// (foreground). [`Pixel::is_foreground`] is that indicator; the f32
/// converters exist for staging and for tests that build synthetic masks.
pub trait Pixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Convert this value to f32 (raw cast, not normalized).
    fn to_f32(self) -> f32;

    /// Construct an element from an f32 value, clamping to the valid range.
    fn from_f32(v: f32) -> Self;

    /// Nonzero test — any nonzero value counts as foreground.
    #[inline]
    fn is_foreground(self) -> bool {
        self.to_f32() != 0.0
    }
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 255.0).round() as u8
    }
}

impl Pixel for u16 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 65535.0).round() as u16
    }
}

impl Pixel for u32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, u32::MAX as f32) as u32
    }

    #[inline]
    fn is_foreground(self) -> bool {
        // Exact: no f32 round-trip for label-sized integers.
        self != 0
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D grid with runtime dimensions, generic over element type `T`.
pub struct Image<T: Pixel> {
    /// Element data in row-major order. Length = height * stride.
    data: Vec<T>,
    /// Width in elements.
    width: usize,
    /// Height in rows.
    height: usize,
    /// Row stride in *elements* (not bytes). stride >= width.
    /// Elements of row y start at index y * stride.
    stride: usize,
}

// Deep copy of heap data — implemented manually to make that explicit.
impl<T: Pixel> Clone for Image<T> {
    fn clone(&self) -> Self {
        Image {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            stride: self.stride,
        }
    }
}

impl<T: Pixel> Image<T> {
    // --- Constructors ---

    /// Create a zero-initialized image. Stride equals width (no padding).
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Create a zero-initialized image with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(stride >= width, "stride {stride} < width {width}");
        Image {
            data: vec![T::default(); height * stride],
            width,
            height,
            stride,
        }
    }

    /// Wrap an existing row-major vector. Stride equals width.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "from_vec: data length {} != {width} * {height}",
            data.len()
        );
        Image { data, width, height, stride: width }
    }

    /// Wrap an existing vector with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width` or `data.len() != height * stride`.
    pub fn from_vec_with_stride(
        width: usize,
        height: usize,
        stride: usize,
        data: Vec<T>,
    ) -> Self {
        assert!(stride >= width, "stride {stride} < width {width}");
        assert_eq!(
            data.len(),
            height * stride,
            "from_vec_with_stride: data length {} != {height} * {stride}",
            data.len()
        );
        Image { data, width, height, stride }
    }

    // --- Accessors ---

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Element at (x, y).
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        debug_assert!(x < self.width && y < self.height, "get({x}, {y}) out of bounds");
        self.data[y * self.stride + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        debug_assert!(x < self.width && y < self.height, "set({x}, {y}) out of bounds");
        self.data[y * self.stride + x] = value;
    }

    /// The full backing slice, including any stride padding.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Active elements of row `y` (width elements, padding excluded).
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Iterate over (x, y, value) for every active element, row-major.
    pub fn iter_pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height)
            .flat_map(move |y| (0..self.width).map(move |x| (x, y, self.get(x, y))))
    }
}

impl<T: Pixel> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image {{ {}x{}, stride {} }}",
            self.width, self.height, self.stride
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
