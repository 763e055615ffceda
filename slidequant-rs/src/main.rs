mod channels;
mod error;
mod filter;
mod morphology;
mod pipeline;
mod quantify;
mod quantify_stack;
mod regionprops;
mod segment;
mod slices;
mod stitch;
mod table;
mod tiffio;

use clap::{Parser, Subcommand};
use std::io::{self, Write};

#[derive(Parser)]
#[command(
    name = "slidequant",
    about = "slidequant CLI: stitch, segment, filter, quantify, quantify-stack, pipeline"
)]
struct Cli {
    /// Log level spec (e.g. "info", "debug", "slidequant=debug"); RUST_LOG wins if set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stitch tiled slide scans with ASHLAR, one slide folder per output
    Stitch(stitch::StitchArgs),
    /// Segment nuclei into integer label masks
    Segment(segment::SegmentArgs),
    /// White top-hat filter every marker channel
    Filter(filter::FilterArgs),
    /// Per-cell marker intensities from filtered images and label masks
    Quantify(quantify::QuantifyArgs),
    /// Per-cell channel intensities from multi-channel stacks and label masks
    QuantifyStack(quantify_stack::QuantifyStackArgs),
    /// Filter, then quantify
    Pipeline(pipeline::PipelineArgs),
}

fn progress(prog: f64, msg: &str) {
    let _ = writeln!(
        io::stderr(),
        "{}",
        serde_json::json!({"progress": prog, "message": msg})
    );
    let _ = io::stderr().flush();
}

fn setup_logging(level: &str) -> Result<flexi_logger::LoggerHandle, flexi_logger::FlexiLoggerError> {
    flexi_logger::Logger::try_with_env_or_str(level)?
        .log_to_stderr()
        .format(flexi_logger::default_format)
        .start()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _logger = setup_logging(&cli.log_level)?;
    match cli.command {
        Commands::Stitch(args) => stitch::run(args, progress)?,
        Commands::Segment(args) => segment::run(args, progress)?,
        Commands::Filter(args) => filter::run(args, progress)?,
        Commands::Quantify(args) => quantify::run(args, progress)?,
        Commands::QuantifyStack(args) => quantify_stack::run(args, progress)?,
        Commands::Pipeline(args) => pipeline::run(args, progress)?,
    }
    Ok(())
}
