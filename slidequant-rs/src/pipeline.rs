use clap::Args;

use crate::error::Result;
use crate::filter::{self, FilterArgs};
use crate::quantify::{self, QuantifyArgs};

/// Filter all markers, then quantify the filtered images.
#[derive(Args, Clone)]
pub struct PipelineArgs {
    #[command(flatten)]
    pub filter: FilterArgs,
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

pub fn run(args: PipelineArgs, progress: impl Fn(f64, &str) + Sync) -> Result<()> {
    let quantify_args = QuantifyArgs {
        tif_dir: args.filter.tif_dir.clone(),
        mask_dir: args.mask_dir,
        output_dir: args.output_dir,
        threads: args.threads,
    };
    filter::run(args.filter, |p, msg| progress(p * 0.5, msg))?;
    quantify::run(quantify_args, |p, msg| progress(0.5 + p * 0.5, msg))?;
    progress(1.0, "Done");
    Ok(())
}
