//! Filter: white top-hat background removal per marker channel.
//!
//! `<tif_dir>/<SLIDE>.tif` page `channel` ->
//! `<tif_dir>/<MARKER>/<stem>.ome_<MARKER>_tophat.tif` (u16), the naming the
//! quantify step discovers. Float and 32-bit pages are filtered in their own
//! type and only converted to u16 (saturating, fractions truncated) on write.

use clap::Args;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::channels;
use crate::error::Result;
use crate::morphology;
use crate::tiffio::{self, Plane};

#[derive(Args, Clone)]
pub struct FilterArgs {
    /// Folder with raw multi-channel TIFFs
    #[arg(long)]
    pub tif_dir: String,
    /// Marker -> channel map as JSON (e.g. '{"Ki67":7,"DNA1":1}') or a path to a JSON file
    #[arg(long)]
    pub markers: String,
    /// Disk radius (px) for white top-hat
    #[arg(long, default_value_t = 10)]
    pub size: usize,
    /// Parallel workers (0/1 = sequential)
    #[arg(long, default_value_t = 0)]
    pub workers: usize,
}

/// Output file for `input` filtered as `marker`.
pub fn filtered_path(tif_dir: &Path, marker: &str, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    tif_dir
        .join(marker)
        .join(format!("{}.ome_{}_tophat.tif", stem, marker))
}

fn filter_file(input: &Path, output: &Path, channel: usize, radius: usize) -> Result<()> {
    let filtered = match tiffio::read_page(input, channel)? {
        Plane::F32(a) => Plane::F32(morphology::white_tophat(&a, radius)),
        Plane::U32(a) => Plane::U32(morphology::white_tophat(&a, radius)),
        plane => Plane::U16(morphology::white_tophat(&plane.to_u16(), radius)),
    };
    tiffio::write_u16(output, &filtered.to_u16())
}

/// Filter every TIFF in `tif_dir` for one marker. Returns (written, failed).
pub fn run_marker(
    tif_dir: &Path,
    marker: &str,
    channel: usize,
    radius: usize,
    workers: usize,
) -> Result<(usize, usize)> {
    let files = tiffio::list_tiffs(tif_dir)?;
    if files.is_empty() {
        log::warn!("filter:{}: no TIFF files found to process", marker);
        return Ok((0, 0));
    }
    log::info!(
        "filter:{}: channel={} size={} n_files={}",
        marker,
        channel,
        radius,
        files.len()
    );

    let failed = AtomicUsize::new(0);
    let one = |input: &PathBuf| {
        let output = filtered_path(tif_dir, marker, input);
        match filter_file(input, &output, channel, radius) {
            Ok(()) => log::info!("filter:{}: {} -> {}", marker, input.display(), output.display()),
            Err(e) => {
                log::error!("filter:{}: {}: {}", marker, input.display(), e);
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    if workers > 1 {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
        pool.install(|| files.par_iter().for_each(one));
    } else {
        files.iter().for_each(one);
    }

    let failed = failed.into_inner();
    Ok((files.len() - failed, failed))
}

pub fn run(args: FilterArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let markers = channels::parse_markers(&args.markers)?;
    let tif_dir = Path::new(&args.tif_dir);
    let total = markers.len();
    let (mut written, mut failed) = (0, 0);

    for (i, (marker, channel)) in markers.iter().enumerate() {
        let (w, f) = run_marker(tif_dir, marker, *channel, args.size, args.workers)?;
        written += w;
        failed += f;
        progress(
            (i + 1) as f64 / total as f64,
            &format!("Filtered marker {} ({}/{})", marker, i + 1, total),
        );
    }

    if failed > 0 {
        log::warn!("filter: {} file(s) failed", failed);
    }
    progress(1.0, &format!("Wrote {} filtered image(s), {} failed", written, failed));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiffio::tests::write_stack_u16;
    use ndarray::Array2;
    use std::fs;

    #[test]
    fn output_name_keeps_everything_but_last_extension() {
        assert_eq!(
            filtered_path(Path::new("/t"), "Ki67", Path::new("/t/S1.tif")),
            PathBuf::from("/t/Ki67/S1.ome_Ki67_tophat.tif")
        );
        assert_eq!(
            filtered_path(Path::new("/t"), "CD3", Path::new("/t/S1.ome.tiff")),
            PathBuf::from("/t/CD3/S1.ome.ome_CD3_tophat.tif")
        );
    }

    #[test]
    fn filters_each_marker_into_its_folder() {
        let dir = tempfile::tempdir().unwrap();
        let background = Array2::from_elem((16, 16), 200u16);
        let mut spot = background.clone();
        spot[[8, 8]] = 1200;
        write_stack_u16(&dir.path().join("S1.tif"), &[background.clone(), spot]);
        fs::write(dir.path().join("broken.tif"), b"not a tiff").unwrap();

        let args = FilterArgs {
            tif_dir: dir.path().to_string_lossy().into_owned(),
            markers: r#"{"DNA1":0,"CD3":1}"#.into(),
            size: 2,
            workers: 2,
        };
        run(args, |_, _| {}).unwrap();

        let dna = tiffio::read_page(&dir.path().join("DNA1/S1.ome_DNA1_tophat.tif"), 0)
            .unwrap()
            .to_u16();
        assert!(dna.iter().all(|&v| v == 0));

        let cd3 = tiffio::read_page(&dir.path().join("CD3/S1.ome_CD3_tophat.tif"), 0)
            .unwrap()
            .to_u16();
        assert_eq!(cd3[[8, 8]], 1000);
        assert_eq!(cd3.iter().filter(|&&v| v > 0).count(), 1);

        assert!(!dir.path().join("CD3/broken.ome_CD3_tophat.tif").exists());
    }

    #[test]
    fn float_pages_are_filtered_before_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("S1.tif");
        let mut page = vec![1.5f32; 81];
        page[40] = 3.4;
        {
            let mut writer = std::io::BufWriter::new(fs::File::create(&input).unwrap());
            let mut encoder = tiff::encoder::TiffEncoder::new(&mut writer).unwrap();
            encoder
                .write_image::<tiff::encoder::colortype::Gray32Float>(9, 9, &page)
                .unwrap();
        }

        let output = filtered_path(dir.path(), "DNA1", &input);
        filter_file(&input, &output, 0, 1).unwrap();
        let out = tiffio::read_page(&output, 0).unwrap().to_u16();
        // 3.4 - 1.5 truncates to 1; clamping to u16 first would give 3 - 1 = 2.
        assert_eq!(out[[4, 4]], 1);
        assert_eq!(out.iter().filter(|&&v| v > 0).count(), 1);
    }

    #[test]
    fn counts_failures_without_stopping() {
        let dir = tempfile::tempdir().unwrap();
        write_stack_u16(&dir.path().join("a.tif"), &[Array2::from_elem((4, 4), 1u16)]);
        fs::write(dir.path().join("b.tif"), b"garbage").unwrap();
        let (written, failed) = run_marker(dir.path(), "DNA1", 0, 1, 0).unwrap();
        assert_eq!((written, failed), (1, 1));
    }
}
