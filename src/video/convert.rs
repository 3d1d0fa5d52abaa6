//! Pixel format conversion
//!
//! YUYV 4:2:2 (from V4L2 capture) → YUV420P (for H.264 encoding).
//!
//! Luma is copied through sample for sample. Each output chroma sample is the
//! truncating mean of the same horizontal YUYV pair in the current source row
//! and in the row below it. Only two vertical taps are used, never a 2x2 box.
//!
//! Height is processed in row pairs: with an odd height the last source row
//! contributes luma only and the last destination chroma row is left as is.

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Plane of a YUV420P frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Y,
    U,
    V,
}

impl Plane {
    pub fn index(self) -> usize {
        match self {
            Plane::Y => 0,
            Plane::U => 1,
            Plane::V => 2,
        }
    }
}

/// Destination of a conversion: three independently strided planes
pub trait PlanarTarget {
    /// Mutable plane data and its row stride in bytes
    fn plane_mut(&mut self, plane: Plane) -> (&mut [u8], usize);
}

/// Owned YUV420P frame whose planes may be padded beyond the logical width
#[derive(Debug, Clone)]
pub struct Yuv420pBuffer {
    planes: [Vec<u8>; 3],
    strides: [usize; 3],
    resolution: Resolution,
}

impl Yuv420pBuffer {
    /// Tightly packed planes
    pub fn new(resolution: Resolution) -> Self {
        Self::with_alignment(resolution, 1)
    }

    /// Row strides rounded up to a multiple of `align` bytes
    pub fn with_alignment(resolution: Resolution, align: usize) -> Self {
        let align = align.max(1);
        let chroma = resolution.chroma();
        let y_stride = (resolution.width as usize).next_multiple_of(align);
        let c_stride = (chroma.width as usize).next_multiple_of(align);
        let y_len = y_stride * resolution.height as usize;
        let c_len = c_stride * chroma.height as usize;

        Self {
            planes: [vec![0u8; y_len], vec![0u8; c_len], vec![0u8; c_len]],
            strides: [y_stride, c_stride, c_stride],
            resolution,
        }
    }

    pub fn plane(&self, plane: Plane) -> &[u8] {
        &self.planes[plane.index()]
    }

    pub fn stride(&self, plane: Plane) -> usize {
        self.strides[plane.index()]
    }

    /// Sample at (x, y) in plane coordinates
    pub fn sample(&self, plane: Plane, x: usize, y: usize) -> u8 {
        self.planes[plane.index()][y * self.stride(plane) + x]
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Fill every plane with a constant value
    pub fn fill(&mut self, y: u8, u: u8, v: u8) {
        self.planes[0].fill(y);
        self.planes[1].fill(u);
        self.planes[2].fill(v);
    }
}

impl PlanarTarget for Yuv420pBuffer {
    fn plane_mut(&mut self, plane: Plane) -> (&mut [u8], usize) {
        let index = plane.index();
        (&mut self.planes[index], self.strides[index])
    }
}

/// YUYV → YUV420P converter for one negotiated capture format
#[derive(Debug, Clone, Copy)]
pub struct PixelConverter {
    resolution: Resolution,
    /// Bytes per source row (at least `width * 2`)
    src_stride: usize,
}

impl PixelConverter {
    /// Converter for tightly packed YUYV rows
    pub fn yuyv_to_yuv420p(resolution: Resolution) -> Self {
        Self {
            resolution,
            src_stride: PixelFormat::Yuyv.frame_size(Resolution::new(resolution.width, 1)),
        }
    }

    /// Use the driver-reported bytes per line; zero keeps the packed stride
    pub fn with_src_stride(mut self, stride: usize) -> Self {
        if stride > 0 {
            self.src_stride = stride;
        }
        self
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Minimum number of source bytes one frame occupies
    pub fn input_len(&self) -> usize {
        let height = self.resolution.height as usize;
        if height == 0 {
            return 0;
        }
        self.src_stride * (height - 1) + self.resolution.width as usize * 2
    }

    /// Convert one frame into `dst`
    pub fn convert(&self, input: &[u8], dst: &mut dyn PlanarTarget) -> Result<()> {
        yuyv_to_yuv420p(input, self.src_stride, self.resolution, dst)
    }
}

/// Convert a YUYV frame into the planes of `dst`
pub fn yuyv_to_yuv420p(
    src: &[u8],
    src_stride: usize,
    resolution: Resolution,
    dst: &mut dyn PlanarTarget,
) -> Result<()> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let row_bytes = width * 2;

    if width % 2 != 0 {
        return Err(AppError::FrameConvertFailed(format!(
            "YUYV width must be even, got {}",
            width
        )));
    }
    if src_stride < row_bytes {
        return Err(AppError::FrameConvertFailed(format!(
            "Source stride {} shorter than row ({} bytes)",
            src_stride, row_bytes
        )));
    }
    if height == 0 {
        return Ok(());
    }
    let needed = src_stride * (height - 1) + row_bytes;
    if src.len() < needed {
        return Err(AppError::FrameConvertFailed(format!(
            "Input buffer too small: {} < {}",
            src.len(),
            needed
        )));
    }

    let src_row = |row: usize| &src[row * src_stride..row * src_stride + row_bytes];

    // Luma: every even byte of the source row
    {
        let (y_plane, y_stride) = dst.plane_mut(Plane::Y);
        check_plane("Y", y_plane.len(), y_stride, width, height)?;
        for row in 0..height {
            let out = &mut y_plane[row * y_stride..row * y_stride + width];
            for (sample, pair) in out.iter_mut().zip(src_row(row).chunks_exact(2)) {
                *sample = pair[0];
            }
        }
    }

    // Chroma: U at byte 1, V at byte 3 of each 4-byte group
    let chroma_width = width / 2;
    let row_pairs = height / 2;
    for (plane, offset) in [(Plane::U, 1usize), (Plane::V, 3usize)] {
        let (c_plane, c_stride) = dst.plane_mut(plane);
        check_plane(
            if plane == Plane::U { "U" } else { "V" },
            c_plane.len(),
            c_stride,
            chroma_width,
            row_pairs,
        )?;
        for pair in 0..row_pairs {
            let top = src_row(pair * 2);
            let bottom = src_row(pair * 2 + 1);
            let out = &mut c_plane[pair * c_stride..pair * c_stride + chroma_width];
            for ((sample, t), b) in out
                .iter_mut()
                .zip(top.chunks_exact(4))
                .zip(bottom.chunks_exact(4))
            {
                *sample = ((t[offset] as u16 + b[offset] as u16) / 2) as u8;
            }
        }
    }

    Ok(())
}

fn check_plane(name: &str, len: usize, stride: usize, width: usize, rows: usize) -> Result<()> {
    if rows == 0 || width == 0 {
        return Ok(());
    }
    if stride < width || len < stride * (rows - 1) + width {
        return Err(AppError::FrameConvertFailed(format!(
            "{} plane too small for {}x{} (stride {}, {} bytes)",
            name, width, rows, stride, len
        )));
    }
    Ok(())
}

/// Calculate YUYV buffer size for a given resolution
pub fn yuyv_buffer_size(resolution: Resolution) -> usize {
    PixelFormat::Yuyv.frame_size(resolution)
}

/// Write a solid-colour YUYV frame into `dst`
pub fn fill_yuyv(dst: &mut [u8], y: u8, u: u8, v: u8) {
    for group in dst.chunks_exact_mut(4) {
        group.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// YUYV frame where every sample encodes its own position
    fn positional_yuyv(width: usize, height: usize, stride: usize) -> Vec<u8> {
        let mut data = vec![0xEEu8; stride * height];
        for row in 0..height {
            for pair in 0..width / 2 {
                let base = row * stride + pair * 4;
                data[base] = (row * 7 + pair * 2) as u8;
                data[base + 1] = (row * 13 + pair * 3) as u8;
                data[base + 2] = (row * 7 + pair * 2 + 1) as u8;
                data[base + 3] = (200 - row * 5 - pair) as u8;
            }
        }
        data
    }

    #[test]
    fn test_yuv420p_buffer_creation() {
        let buffer = Yuv420pBuffer::new(Resolution::HD720);
        assert_eq!(buffer.plane(Plane::Y).len(), 1280 * 720);
        assert_eq!(buffer.plane(Plane::U).len(), 1280 * 720 / 4);
        assert_eq!(buffer.plane(Plane::V).len(), 1280 * 720 / 4);
    }

    #[test]
    fn test_aligned_strides() {
        let buffer = Yuv420pBuffer::with_alignment(Resolution::new(100, 10), 32);
        assert_eq!(buffer.stride(Plane::Y), 128);
        assert_eq!(buffer.stride(Plane::U), 64);
        assert_eq!(buffer.plane(Plane::V).len(), 64 * 5);
    }

    #[test]
    fn test_luma_passes_through() {
        let (w, h) = (8, 4);
        let src = positional_yuyv(w, h, w * 2);
        let mut dst = Yuv420pBuffer::with_alignment(Resolution::new(w as u32, h as u32), 16);
        yuyv_to_yuv420p(&src, w * 2, Resolution::new(w as u32, h as u32), &mut dst).unwrap();

        for row in 0..h {
            for x in 0..w {
                assert_eq!(dst.sample(Plane::Y, x, row), src[row * w * 2 + x * 2]);
            }
        }
    }

    #[test]
    fn test_chroma_is_truncating_mean_of_vertical_pair() {
        let (w, h) = (8, 6);
        let src = positional_yuyv(w, h, w * 2);
        let mut dst = Yuv420pBuffer::new(Resolution::new(w as u32, h as u32));
        yuyv_to_yuv420p(&src, w * 2, Resolution::new(w as u32, h as u32), &mut dst).unwrap();

        for pair_row in 0..h / 2 {
            for cx in 0..w / 2 {
                let top = (pair_row * 2) * w * 2 + cx * 4;
                let bottom = (pair_row * 2 + 1) * w * 2 + cx * 4;
                let u = (src[top + 1] as u16 + src[bottom + 1] as u16) / 2;
                let v = (src[top + 3] as u16 + src[bottom + 3] as u16) / 2;
                assert_eq!(dst.sample(Plane::U, cx, pair_row) as u16, u);
                assert_eq!(dst.sample(Plane::V, cx, pair_row) as u16, v);
            }
        }
    }

    #[test]
    fn test_mean_truncates() {
        let res = Resolution::new(2, 2);
        // U: 10 and 13 -> 11, V: 255 and 254 -> 254
        let src = [50u8, 10, 51, 255, 52, 13, 53, 254];
        let mut dst = Yuv420pBuffer::new(res);
        yuyv_to_yuv420p(&src, 4, res, &mut dst).unwrap();
        assert_eq!(dst.plane(Plane::Y), &[50u8, 51, 52, 53]);
        assert_eq!(dst.plane(Plane::U), &[11u8]);
        assert_eq!(dst.plane(Plane::V), &[254u8]);
    }

    #[test]
    fn test_source_stride_padding_is_ignored() {
        let (w, h, stride) = (4, 2, 12);
        let src = positional_yuyv(w, h, stride);
        let converter =
            PixelConverter::yuyv_to_yuv420p(Resolution::new(w as u32, h as u32)).with_src_stride(stride);
        assert_eq!(converter.input_len(), stride + w * 2);

        let mut dst = Yuv420pBuffer::new(converter.resolution());
        converter.convert(&src, &mut dst).unwrap();
        assert_eq!(dst.sample(Plane::Y, 3, 1), src[stride + 6]);
        assert!(!dst.plane(Plane::Y).contains(&0xEE));
    }

    #[test]
    fn test_odd_height_leaves_last_chroma_row() {
        let res = Resolution::new(4, 3);
        let src = positional_yuyv(4, 3, 8);
        let mut dst = Yuv420pBuffer::new(res);
        dst.fill(0, 0x42, 0x42);
        yuyv_to_yuv420p(&src, 8, res, &mut dst).unwrap();

        // Last source row still feeds luma
        assert_eq!(dst.sample(Plane::Y, 0, 2), src[16]);
        // Second chroma row (from the unpaired source row) untouched
        assert_eq!(dst.sample(Plane::U, 0, 1), 0x42);
        assert_eq!(dst.sample(Plane::V, 1, 1), 0x42);
        assert_ne!(dst.sample(Plane::U, 0, 0), 0x42);
    }

    #[test]
    fn test_solid_colour_round() {
        let res = Resolution::VGA;
        let mut src = vec![0u8; yuyv_buffer_size(res)];
        fill_yuyv(&mut src, 81, 90, 240);
        let mut dst = Yuv420pBuffer::with_alignment(res, 32);
        PixelConverter::yuyv_to_yuv420p(res).convert(&src, &mut dst).unwrap();

        assert!(dst.plane(Plane::Y).iter().all(|&s| s == 81));
        assert!(dst.plane(Plane::U).iter().all(|&s| s == 90));
        assert!(dst.plane(Plane::V).iter().all(|&s| s == 240));
    }

    #[test]
    fn test_short_input_rejected() {
        let res = Resolution::new(4, 4);
        let src = vec![0u8; 31];
        let mut dst = Yuv420pBuffer::new(res);
        let err = yuyv_to_yuv420p(&src, 8, res, &mut dst).unwrap_err();
        assert!(matches!(err, AppError::FrameConvertFailed(_)));
    }

    #[test]
    fn test_small_destination_rejected() {
        let src = vec![0u8; 32];
        let mut dst = Yuv420pBuffer::new(Resolution::new(2, 2));
        let err = yuyv_to_yuv420p(&src, 8, Resolution::new(4, 4), &mut dst).unwrap_err();
        assert!(matches!(err, AppError::FrameConvertFailed(_)));
    }
}
