//! Quantify: per-cell mean intensity of filtered marker images over a label mask.
//!
//! Discovers `<tif_dir>/<MARKER>/<SLIDE>.ome_<MARKER>_tophat.tif`, pairs each
//! slide with `<mask_dir>/<SLIDE>.tif|.tiff` and writes
//! `<output_dir>/<SLIDE>.csv` with one row per cell.

use clap::Args;
use rayon::prelude::*;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::regionprops::Regions;
use crate::table::{CellTable, Layout};
use crate::tiffio;

const FILTERED_RE: &str = r"^(.+?)\.ome_(.+?)_tophat\.tif$";

#[derive(Args, Clone)]
pub struct QuantifyArgs {
    /// Base folder containing per-marker subfolders of filtered images
    #[arg(long)]
    pub tif_dir: String,
    /// Folder with per-slide label masks (SLIDE.tif/.tiff)
    #[arg(long)]
    pub mask_dir: String,
    /// Where to save CSV results
    #[arg(long)]
    pub output_dir: String,
    /// Slides quantified in parallel
    #[arg(long, default_value_t = 1)]
    pub threads: usize,
}

/// slide -> marker -> image path
pub type MarkerImages = BTreeMap<String, BTreeMap<String, PathBuf>>;

/// Split `<SLIDE>.ome_<MARKER>_tophat.tif` into (slide, marker).
pub fn parse_filtered_name(re: &Regex, name: &str) -> Option<(String, String)> {
    let cap = re.captures(name)?;
    Some((cap[1].to_string(), cap[2].to_string()))
}

pub fn discover(tif_dir: &Path) -> Result<MarkerImages> {
    if !tif_dir.is_dir() {
        return Err(Error::NotFound(tif_dir.to_path_buf()));
    }
    let re = Regex::new(FILTERED_RE)?;
    let mut images = MarkerImages::new();
    for entry in fs::read_dir(tif_dir)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        for file in fs::read_dir(entry.path())? {
            let file = file?;
            if !file.path().is_file() {
                continue;
            }
            let name = file.file_name();
            if let Some((slide, marker)) = parse_filtered_name(&re, &name.to_string_lossy()) {
                images.entry(slide).or_default().insert(marker, file.path());
            }
        }
    }
    Ok(images)
}

pub fn find_mask(mask_dir: &Path, slide: &str) -> Option<PathBuf> {
    ["tif", "tiff"]
        .iter()
        .map(|ext| mask_dir.join(format!("{}.{}", slide, ext)))
        .find(|p| p.is_file())
}

/// Mask regions over the first marker give the rows; the remaining markers
/// are left-joined on the cell label.
pub fn quantify_slide(slide: &str, markers: &BTreeMap<String, PathBuf>, mask: &Path) -> Result<CellTable> {
    let labels = tiffio::read_labels(mask)?;
    let regions = Regions::from_labels(&labels);
    if regions.is_empty() {
        log::warn!("quantify: mask {} has no labels", mask.display());
    }
    log::info!("quantify: {} ({} markers, {} cells)", slide, markers.len(), regions.len());

    let mut table: Option<CellTable> = None;
    for (marker, path) in markers {
        let image = tiffio::read_page(path, 0)?;
        let means = regions.mean_intensity(&labels, &image)?;
        match table.as_mut() {
            None => table = Some(CellTable::new(regions.props().to_vec(), marker, means)?),
            Some(t) => t.left_join(
                marker,
                regions.props().iter().map(|p| p.label).zip(means),
            ),
        }
    }
    table.ok_or_else(|| Error::InvalidInput(format!("no marker images for {}", slide)))
}

pub fn run(args: QuantifyArgs, progress: impl Fn(f64, &str) + Sync) -> Result<()> {
    let tif_dir = Path::new(&args.tif_dir);
    let mask_dir = Path::new(&args.mask_dir);
    let output_dir = Path::new(&args.output_dir);
    fs::create_dir_all(output_dir)?;

    let images = discover(tif_dir)?;
    if images.is_empty() {
        log::warn!(
            "quantify: no filtered marker images found. Expected: {}/<MARKER>/<SLIDE>.ome_<MARKER>_tophat.tif",
            tif_dir.display()
        );
        progress(1.0, "Nothing to quantify");
        return Ok(());
    }

    let jobs: Vec<(&String, &BTreeMap<String, PathBuf>, PathBuf)> = images
        .iter()
        .filter_map(|(slide, markers)| match find_mask(mask_dir, slide) {
            Some(mask) => Some((slide, markers, mask)),
            None => {
                log::warn!("quantify: mask not found for {}, skipping", slide);
                None
            }
        })
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads.max(1))
        .build()?;
    let total = jobs.len();
    let done = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    pool.install(|| {
        jobs.par_iter().for_each(|(slide, markers, mask)| {
            let out_csv = output_dir.join(format!("{}.csv", slide));
            let result = quantify_slide(slide, markers, mask)
                .and_then(|table| table.write_csv(&out_csv, Layout::Markers).map(|_| table.len()));
            match result {
                Ok(n) => log::info!("quantify: saved {} ({} cells)", out_csv.display(), n),
                Err(e) => {
                    log::error!("quantify: {}: {}", slide, e);
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            progress(n as f64 / total as f64, &format!("Quantified slide {}/{}", n, total));
        })
    });

    let failed = failed.into_inner();
    if failed > 0 {
        return Err(Error::Batch {
            what: "slides",
            failed,
            total,
        });
    }
    progress(1.0, &format!("Wrote {} CSV(s) to {}", total, output_dir.display()));
    Ok(())
}
