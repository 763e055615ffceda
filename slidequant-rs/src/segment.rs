//! Segment: nuclear instance segmentation with Cellpose (ONNX) via cellpose-rs.
//!
//! For each selected image:
//!   1. Read the nuclear channel page as float32.
//!   2. Stack it into the model's 3-channel layout and run tiled inference.
//!   3. Write the integer mask to `<output>/<id>_labels.ome.tiff`.

use cellpose_rs::{CellposeSession, SegmentParams};
use clap::Args;
use ndarray::Array2;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::slices;
use crate::tiffio;

#[derive(Args, Clone)]
pub struct SegmentArgs {
    /// Folder containing only the images to segment
    #[arg(long)]
    pub input: String,
    /// Output folder for label masks
    #[arg(long)]
    pub output: String,
    /// Path to model directory containing model.onnx
    #[arg(long)]
    pub model: String,
    /// Page (channel) holding the nuclear stain
    #[arg(long, default_value_t = 0)]
    pub channel: usize,
    /// Images to segment: "all" or comma-separated indices/slices of the sorted list
    #[arg(long, default_value = "all")]
    pub images: String,
    /// Batch size for ONNX inference (number of tiles per forward pass)
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,
    /// Force CPU (skip CUDA)
    #[arg(long)]
    pub cpu: bool,
    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

pub fn mask_path(output: &Path, image: &Path) -> PathBuf {
    output.join(format!("{}_labels.ome.tiff", tiffio::image_id(image)))
}

fn confirm() -> Result<bool> {
    eprint!("Proceed with segmentation? [y/N]: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let answer = line.trim();
    Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
}

fn segment_one(
    session: &mut CellposeSession,
    image: &Path,
    args: &SegmentArgs,
) -> Result<Array2<u32>> {
    let plane = tiffio::read_page(image, args.channel)?;
    let (h, w) = plane.dim();
    log::info!("segment: {} is {}x{}", image.display(), w, h);

    let nuclear: Vec<f32> = plane.to_f32().into_iter().collect();
    // Nuclei-only model input: the stain fills both channel slots.
    let chw = cellpose_rs::preprocess::build_chw_image(nuclear.clone(), nuclear, h, w);
    let params = SegmentParams {
        batch_size: args.batch_size.max(1),
        ..Default::default()
    };
    let masks = session
        .segment(&chw, h, w, params)
        .map_err(|e| Error::Segmentation(format!("{}: {}", image.display(), e)))?;
    Array2::from_shape_vec((h, w), masks.into_iter().map(|v| v as u32).collect())
        .map_err(|e| Error::Segmentation(format!("{}: {}", image.display(), e)))
}

pub fn run(args: SegmentArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let input = Path::new(&args.input);
    let output = Path::new(&args.output);

    let all_images = tiffio::list_tiffs(input)?;
    if all_images.is_empty() {
        return Err(Error::InvalidInput(format!("No TIFF images in {}", input.display())));
    }
    let selected = slices::parse_selection(&args.images, all_images.len())?;
    let images: Vec<&PathBuf> = selected.iter().map(|&i| &all_images[i]).collect();

    let model_file = Path::new(&args.model).join("model.onnx");
    if !model_file.exists() {
        return Err(Error::NotFound(model_file));
    }

    eprintln!("Images to segment ({}):", images.len());
    for image in &images {
        eprintln!("  {}", image.display());
    }
    if !args.yes && !confirm()? {
        return Err(Error::Aborted);
    }

    progress(0.0, "Loading cellpose model...");
    let mut session = CellposeSession::new(&model_file, args.cpu)
        .map_err(|e| Error::Segmentation(format!("loading {}: {}", model_file.display(), e)))?;

    fs::create_dir_all(output)?;
    let total = images.len();
    let mut failed = 0;
    for (i, image) in images.iter().enumerate() {
        let result = segment_one(&mut session, image, &args).and_then(|labels| {
            let path = mask_path(output, image);
            tiffio::write_labels(&path, &labels)?;
            let n_cells = labels.iter().copied().max().unwrap_or(0);
            log::info!("segment: wrote {} ({} labels)", path.display(), n_cells);
            Ok(())
        });
        if let Err(e) = result {
            log::error!("segment: {}: {}", image.display(), e);
            failed += 1;
        }
        progress(
            (i + 1) as f64 / total as f64,
            &format!("Segmented image {}/{}", i + 1, total),
        );
    }

    if failed > 0 {
        return Err(Error::Batch {
            what: "images",
            failed,
            total,
        });
    }
    progress(1.0, &format!("Wrote {} mask(s) to {}", total, output.display()));
    Ok(())
}
