//! Quantify-stack: per-cell quantification of multi-channel stacks.
//!
//! Images and masks are sorted by name and paired by position. Channel `i`
//! of an image is TIFF page `i` and is named by line `i` of the channel
//! names file. Channels of one image are measured in parallel.

use clap::Args;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::channels;
use crate::error::{Error, Result};
use crate::regionprops::Regions;
use crate::slices;
use crate::table::{CellTable, Layout};
use crate::tiffio;

#[derive(Args, Clone)]
pub struct QuantifyStackArgs {
    /// Folder with multi-channel TIFF stacks
    #[arg(long)]
    pub image_dir: String,
    /// Folder with label masks, one per stack
    #[arg(long)]
    pub mask_dir: String,
    /// Header-less CSV with one channel name per line
    #[arg(long)]
    pub channel_names: String,
    /// Output folder for <image id>.csv
    #[arg(long)]
    pub output: String,
    /// Channels measured in parallel
    #[arg(long, default_value_t = 1)]
    pub threads: usize,
    /// Image/mask pairs to process: "all" or comma-separated indices/slices
    #[arg(long, default_value = "all")]
    pub images: String,
}

/// Sorted images paired with sorted masks.
pub fn pair_images(image_dir: &Path, mask_dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let images = tiffio::list_tiffs(image_dir)?;
    let masks = tiffio::list_tiffs(mask_dir)?;
    if images.len() != masks.len() {
        return Err(Error::InvalidInput(format!(
            "{} images in {} but {} masks in {}",
            images.len(),
            image_dir.display(),
            masks.len(),
            mask_dir.display()
        )));
    }
    Ok(images.into_iter().zip(masks).collect())
}

pub fn quantify_stack(
    image: &Path,
    mask: &Path,
    names: &[String],
    pool: &rayon::ThreadPool,
) -> Result<CellTable> {
    let pages = tiffio::page_count(image)?;
    if pages < names.len() {
        return Err(Error::InvalidInput(format!(
            "{} has {} pages but {} channel names",
            image.display(),
            pages,
            names.len()
        )));
    }
    let labels = tiffio::read_labels(mask)?;
    let regions = Regions::from_labels(&labels);

    let means: Vec<Vec<f64>> = pool.install(|| {
        (0..names.len())
            .into_par_iter()
            .map(|channel| {
                log::debug!("quantify-stack: {} channel {}", image.display(), channel);
                let plane = tiffio::read_page(image, channel)?;
                regions.mean_intensity(&labels, &plane)
            })
            .collect::<Result<_>>()
    })?;

    let mut means = means.into_iter();
    let first = means
        .next()
        .ok_or_else(|| Error::InvalidInput("no channels to quantify".into()))?;
    let mut table = CellTable::new(regions.props().to_vec(), &names[0], first)?;
    for (name, column) in names[1..].iter().zip(means) {
        table.left_join(name, regions.props().iter().map(|p| p.label).zip(column));
    }
    if table.is_empty() {
        log::warn!("quantify-stack: mask {} has no labels", mask.display());
    }
    Ok(table)
}

pub fn run(args: QuantifyStackArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let names = channels::read_channel_names(Path::new(&args.channel_names))?;
    log::info!("quantify-stack: {} channels: {}", names.len(), names.join(", "));

    let pairs = pair_images(Path::new(&args.image_dir), Path::new(&args.mask_dir))?;
    let selected = slices::parse_selection(&args.images, pairs.len())?;
    let output = Path::new(&args.output);
    fs::create_dir_all(output)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads.max(1))
        .build()?;
    let total = selected.len();
    let mut failed = 0;

    for (i, &idx) in selected.iter().enumerate() {
        let (image, mask) = &pairs[idx];
        let started = Instant::now();
        let id = tiffio::image_id(image);
        log::info!("quantify-stack: {} with mask {}", image.display(), mask.display());

        let out_csv = output.join(format!("{}.csv", id));
        let result = quantify_stack(image, mask, &names, &pool)
            .and_then(|table| table.write_csv(&out_csv, Layout::Stack));
        match result {
            Ok(()) => log::info!(
                "Sample {} quantified in {:.2} seconds",
                id,
                started.elapsed().as_secs_f64()
            ),
            Err(e) => {
                log::error!("quantify-stack: {}: {}", image.display(), e);
                failed += 1;
            }
        }
        progress(
            (i + 1) as f64 / total as f64,
            &format!("Quantified image {}/{}", i + 1, total),
        );
    }

    if failed > 0 {
        return Err(Error::Batch {
            what: "images",
            failed,
            total,
        });
    }
    progress(1.0, &format!("Wrote {} CSV(s) to {}", total, output.display()));
    Ok(())
}
