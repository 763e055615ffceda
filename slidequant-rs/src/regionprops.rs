//! Per-label statistics of an integer mask: area, centroid, eccentricity,
//! and mean intensity over a matching image plane.

use ndarray::{Array2, Zip};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::tiffio::Plane;

#[derive(Debug, Clone, PartialEq)]
pub struct RegionProps {
    pub label: u32,
    /// Pixel count.
    pub area: u64,
    /// (row, col)
    pub centroid: (f64, f64),
    pub eccentricity: f64,
}

/// Raw moments relative to the first pixel seen, which keeps the squared
/// sums small on large slides.
#[derive(Default)]
struct Moments {
    origin: (f64, f64),
    n: u64,
    sr: f64,
    sc: f64,
    srr: f64,
    scc: f64,
    src: f64,
}

impl Moments {
    fn push(&mut self, r: f64, c: f64) {
        if self.n == 0 {
            self.origin = (r, c);
        }
        let (dr, dc) = (r - self.origin.0, c - self.origin.1);
        self.n += 1;
        self.sr += dr;
        self.sc += dc;
        self.srr += dr * dr;
        self.scc += dc * dc;
        self.src += dr * dc;
    }

    fn finish(&self, label: u32) -> RegionProps {
        let n = self.n as f64;
        let (mr, mc) = (self.sr / n, self.sc / n);
        // Central second moments normalized by area (inertia tensor entries).
        let a = self.srr / n - mr * mr;
        let c = self.scc / n - mc * mc;
        let b = self.src / n - mr * mc;
        let half_trace = (a + c) / 2.0;
        let disc = (((a - c) / 2.0).powi(2) + b * b).sqrt();
        let l1 = half_trace + disc;
        let l2 = (half_trace - disc).max(0.0);
        let eccentricity = if l1 <= 0.0 { 0.0 } else { (1.0 - l2 / l1).sqrt() };
        RegionProps {
            label,
            area: self.n,
            centroid: (self.origin.0 + mr, self.origin.1 + mc),
            eccentricity,
        }
    }
}

/// Slot lookup with a one-entry cache; masks are mostly runs of one label.
struct SlotCache<'a> {
    slots: &'a HashMap<u32, usize>,
    last: Option<(u32, usize)>,
}

impl SlotCache<'_> {
    fn get(&mut self, label: u32) -> Option<usize> {
        match self.last {
            Some((l, s)) if l == label => Some(s),
            _ => {
                let s = *self.slots.get(&label)?;
                self.last = Some((label, s));
                Some(s)
            }
        }
    }
}

/// Regions of a label mask, ordered by ascending label. Label 0 is background.
#[derive(Debug, Clone)]
pub struct Regions {
    props: Vec<RegionProps>,
    slots: HashMap<u32, usize>,
    dim: (usize, usize),
}

impl Regions {
    pub fn from_labels(labels: &Array2<u32>) -> Self {
        let mut slots: HashMap<u32, usize> = HashMap::new();
        let mut moments: Vec<(u32, Moments)> = Vec::new();
        let mut last: Option<(u32, usize)> = None;

        for ((r, c), &label) in labels.indexed_iter() {
            if label == 0 {
                continue;
            }
            let slot = match last {
                Some((l, s)) if l == label => s,
                _ => {
                    let s = *slots.entry(label).or_insert_with(|| {
                        moments.push((label, Moments::default()));
                        moments.len() - 1
                    });
                    last = Some((label, s));
                    s
                }
            };
            moments[slot].1.push(r as f64, c as f64);
        }

        moments.sort_unstable_by_key(|(label, _)| *label);
        let props: Vec<RegionProps> = moments.iter().map(|(label, m)| m.finish(*label)).collect();
        let slots = props
            .iter()
            .enumerate()
            .map(|(i, p)| (p.label, i))
            .collect();
        Regions {
            props,
            slots,
            dim: labels.dim(),
        }
    }

    pub fn props(&self) -> &[RegionProps] {
        &self.props
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Mean of `intensity` over each region, in region order.
    /// `labels` must be the mask these regions were built from.
    pub fn mean_intensity(&self, labels: &Array2<u32>, intensity: &Plane) -> Result<Vec<f64>> {
        if labels.dim() != self.dim {
            return Err(Error::ShapeMismatch {
                mask: self.dim,
                image: labels.dim(),
            });
        }
        if intensity.dim() != self.dim {
            return Err(Error::ShapeMismatch {
                mask: self.dim,
                image: intensity.dim(),
            });
        }
        let sums = match intensity {
            Plane::U8(a) => self.sums(labels, a),
            Plane::U16(a) => self.sums(labels, a),
            Plane::U32(a) => self.sums(labels, a),
            Plane::F32(a) => self.sums(labels, a),
        };
        Ok(sums
            .into_iter()
            .zip(&self.props)
            .map(|(s, p)| s / p.area as f64)
            .collect())
    }

    fn sums<T: Copy + Into<f64>>(&self, labels: &Array2<u32>, image: &Array2<T>) -> Vec<f64> {
        let mut sums = vec![0.0f64; self.props.len()];
        let mut cache = SlotCache {
            slots: &self.slots,
            last: None,
        };
        Zip::from(labels).and(image).for_each(|&label, &v| {
            if label == 0 {
                return;
            }
            if let Some(slot) = cache.get(label) {
                sums[slot] += v.into();
            }
        });
        sums
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn area_centroid_and_order() {
        let mask = array![
            [0u32, 7, 7, 0],
            [2, 7, 7, 0],
            [2, 0, 0, 0],
        ];
        let regions = Regions::from_labels(&mask);
        let labels: Vec<u32> = regions.props().iter().map(|p| p.label).collect();
        assert_eq!(labels, vec![2, 7]);

        let p2 = &regions.props()[0];
        assert_eq!(p2.area, 2);
        assert_eq!(p2.centroid, (1.5, 0.0));

        let p7 = &regions.props()[1];
        assert_eq!(p7.area, 4);
        assert_eq!(p7.centroid, (0.5, 1.5));
        assert!(p7.eccentricity.abs() < 1e-12);
    }

    #[test]
    fn eccentricity_of_lines_and_rectangles() {
        let line = Array2::from_elem((1, 5), 1u32);
        let regions = Regions::from_labels(&line);
        let p = &regions.props()[0];
        assert!((p.eccentricity - 1.0).abs() < 1e-12);

        let rect = Array2::from_elem((2, 4), 3u32);
        let regions = Regions::from_labels(&rect);
        let p = &regions.props()[0];
        assert!((p.eccentricity - 0.8f64.sqrt()).abs() < 1e-12);

        let dot = Array2::from_elem((1, 1), 9u32);
        assert_eq!(Regions::from_labels(&dot).props()[0].eccentricity, 0.0);
    }

    #[test]
    fn mean_intensity_per_label() {
        let mask = array![[1u32, 1, 0], [0, 5, 5]];
        let image = Plane::U16(array![[10u16, 20, 1000], [1000, 3, 4]]);
        let regions = Regions::from_labels(&mask);
        assert_eq!(regions.mean_intensity(&mask, &image).unwrap(), vec![15.0, 3.5]);

        let float = Plane::F32(array![[0.5f32, 1.5, 0.0], [0.0, 2.0, 2.0]]);
        assert_eq!(regions.mean_intensity(&mask, &float).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let mask = Array2::from_elem((2, 2), 1u32);
        let regions = Regions::from_labels(&mask);
        let image = Plane::U8(Array2::zeros((2, 3)));
        assert!(matches!(
            regions.mean_intensity(&mask, &image),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn empty_mask_has_no_regions() {
        let regions = Regions::from_labels(&Array2::zeros((3, 3)));
        assert!(regions.is_empty());
    }
}
