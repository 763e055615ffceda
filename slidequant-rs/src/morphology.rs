//! Grey-level morphology with a disk structuring element.
//!
//! The disk is decomposed into one horizontal segment per row offset, and
//! each segment is a 1-D running min/max computed with the van Herk /
//! Gil-Werman block scheme, so the per-pixel cost does not grow with the
//! segment length. Pixels outside the image never contribute; for a
//! symmetric footprint this equals mirror padding.

use ndarray::Array2;
use std::borrow::Cow;

/// Disk footprint `{(dy, dx) : dy^2 + dx^2 <= r^2}`.
#[derive(Debug, Clone)]
pub struct Disk {
    radius: usize,
    /// Half-width of the segment at row offset `dy`, indexed by `dy + radius`.
    half_widths: Vec<usize>,
}

impl Disk {
    pub fn new(radius: usize) -> Self {
        let r2 = radius * radius;
        let mut half_widths = Vec::with_capacity(2 * radius + 1);
        let mut hw = 0;
        for dy in 0..=radius {
            let dy2 = (radius - dy) * (radius - dy);
            while (hw + 1) * (hw + 1) + dy2 <= r2 {
                hw += 1;
            }
            half_widths.push(hw);
        }
        // Mirror the upper half onto the lower half.
        for i in (0..radius).rev() {
            half_widths.push(half_widths[i]);
        }
        Disk {
            radius,
            half_widths,
        }
    }

    pub fn half_widths(&self) -> &[usize] {
        &self.half_widths
    }
}

/// Pixel types the filters run on. `LOWEST`/`HIGHEST` are the identities
/// of max and min.
pub trait Sample: Copy + PartialOrd {
    const LOWEST: Self;
    const HIGHEST: Self;

    /// `self - other`, floored at zero.
    fn diff(self, other: Self) -> Self;
}

impl Sample for u16 {
    const LOWEST: Self = u16::MIN;
    const HIGHEST: Self = u16::MAX;

    fn diff(self, other: Self) -> Self {
        self.saturating_sub(other)
    }
}

impl Sample for u32 {
    const LOWEST: Self = u32::MIN;
    const HIGHEST: Self = u32::MAX;

    fn diff(self, other: Self) -> Self {
        self.saturating_sub(other)
    }
}

impl Sample for f32 {
    const LOWEST: Self = f32::NEG_INFINITY;
    const HIGHEST: Self = f32::INFINITY;

    fn diff(self, other: Self) -> Self {
        (self - other).max(0.0)
    }
}

struct LineScratch<T> {
    padded: Vec<T>,
    forward: Vec<T>,
    backward: Vec<T>,
}

impl<T> LineScratch<T> {
    fn new() -> Self {
        LineScratch {
            padded: Vec::new(),
            forward: Vec::new(),
            backward: Vec::new(),
        }
    }
}

/// `out[i] = op(src[i - hw ..= i + hw])`, out-of-range samples replaced by `identity`.
fn line_filter<T: Sample>(
    src: &[T],
    hw: usize,
    op: fn(T, T) -> T,
    identity: T,
    scratch: &mut LineScratch<T>,
    out: &mut [T],
) {
    let n = src.len();
    if hw == 0 {
        out.copy_from_slice(src);
        return;
    }
    let k = 2 * hw + 1;
    let LineScratch {
        padded,
        forward,
        backward,
    } = scratch;

    padded.clear();
    padded.resize(hw, identity);
    padded.extend_from_slice(src);
    padded.resize(n + 2 * hw, identity);
    let m = padded.len();
    forward.resize(m, identity);
    backward.resize(m, identity);

    for start in (0..m).step_by(k) {
        let end = (start + k).min(m);
        forward[start] = padded[start];
        for j in start + 1..end {
            forward[j] = op(forward[j - 1], padded[j]);
        }
        backward[end - 1] = padded[end - 1];
        for j in (start..end - 1).rev() {
            backward[j] = op(backward[j + 1], padded[j]);
        }
    }
    for (i, o) in out.iter_mut().enumerate() {
        *o = op(backward[i], forward[i + k - 1]);
    }
}

fn apply<T: Sample>(image: &Array2<T>, disk: &Disk, op: fn(T, T) -> T, identity: T) -> Array2<T> {
    let (rows, cols) = image.dim();
    let data: Cow<[T]> = match image.as_slice() {
        Some(s) => Cow::Borrowed(s),
        None => Cow::Owned(image.iter().copied().collect()),
    };

    let mut out = Array2::from_elem((rows, cols), identity);
    let mut line = vec![identity; cols];
    let mut scratch = LineScratch::new();
    let r = disk.radius as isize;

    for (y, mut acc) in out.outer_iter_mut().enumerate() {
        for (i, &hw) in disk.half_widths.iter().enumerate() {
            let sy = y as isize + i as isize - r;
            if sy < 0 || sy >= rows as isize {
                continue;
            }
            let sy = sy as usize;
            line_filter(&data[sy * cols..(sy + 1) * cols], hw, op, identity, &mut scratch, &mut line);
            for (a, &v) in acc.iter_mut().zip(&line) {
                *a = op(*a, v);
            }
        }
    }
    out
}

fn min_op<T: Sample>(a: T, b: T) -> T {
    if b < a {
        b
    } else {
        a
    }
}

fn max_op<T: Sample>(a: T, b: T) -> T {
    if b > a {
        b
    } else {
        a
    }
}

pub fn erode<T: Sample>(image: &Array2<T>, disk: &Disk) -> Array2<T> {
    apply(image, disk, min_op, T::HIGHEST)
}

pub fn dilate<T: Sample>(image: &Array2<T>, disk: &Disk) -> Array2<T> {
    apply(image, disk, max_op, T::LOWEST)
}

pub fn opening<T: Sample>(image: &Array2<T>, disk: &Disk) -> Array2<T> {
    dilate(&erode(image, disk), disk)
}

/// Image minus its opening: keeps bright structures smaller than the disk.
pub fn white_tophat<T: Sample>(image: &Array2<T>, radius: usize) -> Array2<T> {
    let disk = Disk::new(radius);
    let opened = opening(image, &disk);
    let mut out = image.clone();
    out.zip_mut_with(&opened, |v, &o| *v = v.diff(o));
    out
}
