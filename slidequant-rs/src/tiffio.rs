//! TIFF page I/O on top of the `tiff` crate.
//!
//! Multi-channel slides are stored one channel per top-level IFD, so a
//! channel index is a page index. Pyramid levels written as SubIFDs are
//! not visited.

use ndarray::Array2;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::ColorType;

use crate::error::{Error, Result};

/// One decoded grayscale page.
#[derive(Debug, Clone)]
pub enum Plane {
    U8(Array2<u8>),
    U16(Array2<u16>),
    U32(Array2<u32>),
    F32(Array2<f32>),
}

impl Plane {
    /// (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        match self {
            Plane::U8(a) => a.dim(),
            Plane::U16(a) => a.dim(),
            Plane::U32(a) => a.dim(),
            Plane::F32(a) => a.dim(),
        }
    }

    /// Saturating conversion, used before filtering and for 16-bit output.
    pub fn to_u16(&self) -> Array2<u16> {
        match self {
            Plane::U8(a) => a.mapv(u16::from),
            Plane::U16(a) => a.clone(),
            Plane::U32(a) => a.mapv(|v| v.min(u16::MAX as u32) as u16),
            Plane::F32(a) => a.mapv(|v| v.clamp(0.0, u16::MAX as f32) as u16),
        }
    }

    pub fn to_f32(&self) -> Array2<f32> {
        match self {
            Plane::U8(a) => a.mapv(f32::from),
            Plane::U16(a) => a.mapv(f32::from),
            Plane::U32(a) => a.mapv(|v| v as f32),
            Plane::F32(a) => a.clone(),
        }
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<fs::File>>> {
    let file = fs::File::open(path)?;
    let decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| Error::tiff(path, e))?
        .with_limits(Limits::unlimited());
    Ok(decoder)
}

fn into_array<T>(path: &Path, width: u32, height: u32, data: Vec<T>) -> Result<Array2<T>> {
    Array2::from_shape_vec((height as usize, width as usize), data).map_err(|e| {
        Error::InvalidInput(format!("{}: pixel count does not match {}x{}: {}", path.display(), width, height, e))
    })
}

fn unsupported(path: &Path, format: impl Into<String>) -> Error {
    Error::UnsupportedPixels {
        path: path.to_path_buf(),
        format: format.into(),
    }
}

fn decode_current(
    decoder: &mut Decoder<BufReader<fs::File>>,
    path: &Path,
) -> Result<(u32, u32, DecodingResult)> {
    match decoder.colortype().map_err(|e| Error::tiff(path, e))? {
        ColorType::Gray(_) => {}
        other => return Err(unsupported(path, format!("{:?}", other))),
    }
    let (width, height) = decoder.dimensions().map_err(|e| Error::tiff(path, e))?;
    let data = decoder.read_image().map_err(|e| Error::tiff(path, e))?;
    Ok((width, height, data))
}

/// Number of top-level pages (IFDs).
pub fn page_count(path: &Path) -> Result<usize> {
    let mut decoder = open_decoder(path)?;
    let mut count = 1;
    while decoder.more_images() {
        decoder.next_image().map_err(|e| Error::tiff(path, e))?;
        count += 1;
    }
    Ok(count)
}

/// Decode page `page` (0-based) as an intensity plane.
pub fn read_page(path: &Path, page: usize) -> Result<Plane> {
    let mut decoder = open_decoder(path)?;
    if page > 0 {
        decoder.seek_to_image(page).map_err(|e| Error::tiff(path, e))?;
    }
    let (width, height, data) = decode_current(&mut decoder, path)?;
    let plane = match data {
        DecodingResult::U8(v) => Plane::U8(into_array(path, width, height, v)?),
        DecodingResult::U16(v) => Plane::U16(into_array(path, width, height, v)?),
        DecodingResult::U32(v) => Plane::U32(into_array(path, width, height, v)?),
        DecodingResult::F32(v) => Plane::F32(into_array(path, width, height, v)?),
        DecodingResult::I16(v) => {
            let v = v.into_iter().map(|x| x.max(0) as u16).collect();
            Plane::U16(into_array(path, width, height, v)?)
        }
        _ => return Err(unsupported(path, "need u8, u16, i16, u32 or f32 samples")),
    };
    Ok(plane)
}

/// Decode page 0 as an integer label mask. Negative labels clamp to background.
pub fn read_labels(path: &Path) -> Result<Array2<u32>> {
    let mut decoder = open_decoder(path)?;
    let (width, height, data) = decode_current(&mut decoder, path)?;
    let labels: Vec<u32> = match data {
        DecodingResult::U8(v) => v.into_iter().map(u32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(u32::from).collect(),
        DecodingResult::U32(v) => v,
        DecodingResult::I16(v) => v.into_iter().map(|x| x.max(0) as u32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x.max(0) as u32).collect(),
        _ => return Err(unsupported(path, "label masks need 8, 16 or 32-bit integer samples")),
    };
    into_array(path, width, height, labels)
}

fn create_writer(path: &Path) -> Result<BufWriter<fs::File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(fs::File::create(path)?))
}

// Classic TIFF offsets are 32-bit.
fn needs_bigtiff(bytes: usize) -> bool {
    bytes as u64 >= (u32::MAX as u64) / 2
}

pub fn write_u16(path: &Path, image: &Array2<u16>) -> Result<()> {
    let (height, width) = image.dim();
    let data = image.as_standard_layout();
    let data = data
        .as_slice()
        .ok_or_else(|| Error::InvalidInput("image is not contiguous".into()))?;
    let mut writer = create_writer(path)?;
    if needs_bigtiff(data.len() * 2) {
        let mut encoder = TiffEncoder::new_big(&mut writer).map_err(|e| Error::tiff(path, e))?;
        encoder
            .write_image::<colortype::Gray16>(width as u32, height as u32, data)
            .map_err(|e| Error::tiff(path, e))?;
    } else {
        let mut encoder = TiffEncoder::new(&mut writer).map_err(|e| Error::tiff(path, e))?;
        encoder
            .write_image::<colortype::Gray16>(width as u32, height as u32, data)
            .map_err(|e| Error::tiff(path, e))?;
    }
    Ok(())
}

pub fn write_labels(path: &Path, labels: &Array2<u32>) -> Result<()> {
    let (height, width) = labels.dim();
    let data = labels.as_standard_layout();
    let data = data
        .as_slice()
        .ok_or_else(|| Error::InvalidInput("mask is not contiguous".into()))?;
    let mut writer = create_writer(path)?;
    if needs_bigtiff(data.len() * 4) {
        let mut encoder = TiffEncoder::new_big(&mut writer).map_err(|e| Error::tiff(path, e))?;
        encoder
            .write_image::<colortype::Gray32>(width as u32, height as u32, data)
            .map_err(|e| Error::tiff(path, e))?;
    } else {
        let mut encoder = TiffEncoder::new(&mut writer).map_err(|e| Error::tiff(path, e))?;
        encoder
            .write_image::<colortype::Gray32>(width as u32, height as u32, data)
            .map_err(|e| Error::tiff(path, e))?;
    }
    Ok(())
}

pub fn is_tiff_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tif") || lower.ends_with(".tiff")
}

/// TIFF files directly inside `dir` (symlinks followed), sorted by file name.
pub fn list_tiffs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(dir.to_path_buf()));
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| {
            let e = e.ok()?;
            if !e.path().is_file() {
                return None;
            }
            is_tiff_name(&e.file_name().to_string_lossy()).then(|| e.path())
        })
        .collect();
    files.sort();
    Ok(files)
}

/// File name up to its first '.', e.g. "S1.ome.tif" -> "S1".
pub fn image_id(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.split_once('.') {
        Some((id, _)) => id.to_string(),
        None => name,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::array;

    /// Write a multi-page 16-bit TIFF, one page per plane.
    pub(crate) fn write_stack_u16(path: &Path, pages: &[Array2<u16>]) {
        let mut writer = BufWriter::new(fs::File::create(path).unwrap());
        let mut encoder = TiffEncoder::new(&mut writer).unwrap();
        for page in pages {
            let (h, w) = page.dim();
            let data: Vec<u16> = page.iter().copied().collect();
            encoder
                .write_image::<colortype::Gray16>(w as u32, h as u32, &data)
                .unwrap();
        }
    }

    #[test]
    fn reads_requested_page_of_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.tif");
        let a = array![[1u16, 2, 3], [4, 5, 6]];
        let b = array![[10u16, 20, 30], [40, 50, 60]];
        write_stack_u16(&path, &[a.clone(), b.clone()]);

        assert_eq!(page_count(&path).unwrap(), 2);
        match read_page(&path, 1).unwrap() {
            Plane::U16(p) => assert_eq!(p, b),
            other => panic!("unexpected plane {:?}", other),
        }
        assert_eq!(read_page(&path, 0).unwrap().to_u16(), a);
        assert!(read_page(&path, 2).is_err());
    }

    #[test]
    fn labels_round_trip_as_u32() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("mask_labels.ome.tiff");
        let mask = array![[0u32, 70_000], [3, 3]];
        write_labels(&path, &mask).unwrap();
        assert_eq!(read_labels(&path).unwrap(), mask);
    }

    #[test]
    fn negative_samples_clamp_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("signed16.tif");
        let mask = dir.path().join("signed32.tif");
        {
            let mut writer = BufWriter::new(fs::File::create(&image).unwrap());
            let mut encoder = TiffEncoder::new(&mut writer).unwrap();
            encoder
                .write_image::<colortype::GrayI16>(3, 1, &[-5i16, 0, 7])
                .unwrap();
        }
        {
            let mut writer = BufWriter::new(fs::File::create(&mask).unwrap());
            let mut encoder = TiffEncoder::new(&mut writer).unwrap();
            encoder
                .write_image::<colortype::GrayI32>(2, 2, &[-1i32, 4, 4, -70_000])
                .unwrap();
        }

        match read_page(&image, 0).unwrap() {
            Plane::U16(p) => assert_eq!(p, array![[0u16, 0, 7]]),
            other => panic!("unexpected plane {:?}", other),
        }
        assert_eq!(read_labels(&image).unwrap(), array![[0u32, 0, 7]]);
        assert_eq!(read_labels(&mask).unwrap(), array![[0u32, 4], [4, 0]]);
    }

    #[cfg(unix)]
    #[test]
    fn lists_symlinked_tiffs() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let batch = dir.path().join("batch");
        fs::create_dir_all(&store).unwrap();
        fs::create_dir_all(&batch).unwrap();
        fs::write(store.join("S2.tif"), b"").unwrap();
        fs::write(batch.join("S1.tif"), b"").unwrap();
        std::os::unix::fs::symlink(store.join("S2.tif"), batch.join("S2.tif")).unwrap();
        std::os::unix::fs::symlink(store.join("gone.tif"), batch.join("S3.tif")).unwrap();

        assert_eq!(list_tiffs(&batch).unwrap(), vec![batch.join("S1.tif"), batch.join("S2.tif")]);
    }

    #[test]
    fn lists_only_tiff_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.TIFF", "a.tif", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("sub.tif")).unwrap();
        let names: Vec<String> = list_tiffs(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.tif", "b.TIFF"]);
    }

    #[test]
    fn image_id_stops_at_first_dot() {
        assert_eq!(image_id(Path::new("/x/S1.ome.tif")), "S1");
        assert_eq!(image_id(Path::new("plain")), "plain");
    }
}
