//! Georeferenced rasters.
//!
//! A [`RasterSource`] is a GeoTIFF on disk whose header we have read. The
//! pixels are only decoded by [`to_single_band_8bit`], which produces a
//! [`Raster8`] held in memory for the rest of the raster's processing.

use std::{fs, io::BufReader};

use geo::{Coord, Rect};
use image::GrayImage;
use tiff::decoder::{Decoder, DecodingResult};

use crate::{errors::PipelineError, layer::Crs, prelude::*};

pub mod clip;
mod geotiff;

/// A north-up affine transform from pixel to world coordinates.
///
/// Pixel `(col, row)` covers world x from `origin_x + col * pixel_width` to
/// `origin_x + (col + 1) * pixel_width`, and world y from
/// `origin_y - (row + 1) * pixel_height` to `origin_y - row * pixel_height`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Create a transform. Pixel sizes must be positive.
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Result<Self> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(pixel_width) || !valid(pixel_height) {
            return Err(anyhow!(
                "unsupported pixel size {} x {} (must be positive and north-up)",
                pixel_width,
                pixel_height
            ));
        }
        if !origin_x.is_finite() || !origin_y.is_finite() {
            return Err(anyhow!("raster origin is not finite"));
        }
        Ok(Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        })
    }

    /// The world extent of a `width` x `height` raster.
    pub fn extent(&self, width: u32, height: u32) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.origin_x,
                y: self.origin_y - f64::from(height) * self.pixel_height,
            },
            Coord {
                x: self.origin_x + f64::from(width) * self.pixel_width,
                y: self.origin_y,
            },
        )
    }

    /// The world coordinates of the centre of pixel `(col, row)`.
    pub fn pixel_center(&self, col: i64, row: i64) -> Coord<f64> {
        Coord {
            x: self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            y: self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        }
    }

    /// The fractional pixel position of a world coordinate.
    pub fn world_to_pixel(&self, coord: Coord<f64>) -> (f64, f64) {
        (
            (coord.x - self.origin_x) / self.pixel_width,
            (self.origin_y - coord.y) / self.pixel_height,
        )
    }

    /// The transform of a window starting at pixel `(col, row)`.
    pub fn window(&self, col: i64, row: i64) -> Self {
        Self {
            origin_x: self.origin_x + col as f64 * self.pixel_width,
            origin_y: self.origin_y - row as f64 * self.pixel_height,
            ..*self
        }
    }
}

/// A raster dataset whose header has been read.
#[derive(Clone, Debug)]
pub struct RasterSource {
    /// A display name, used in logs and output.
    pub name: String,
    /// The GeoTIFF file.
    pub path: PathBuf,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel-to-world transform.
    pub transform: GeoTransform,
    /// The CRS declared by the file, if any.
    pub crs: Option<Crs>,
}

impl RasterSource {
    /// Read the header of the GeoTIFF at `path`. When `name` is missing, the
    /// file stem is used.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path, name: Option<String>) -> Result<Self> {
        let mut decoder = open_decoder(path)?;
        let (width, height) = decoder
            .dimensions()
            .with_context(|| format!("failed to get dimensions of {:?}", path.display()))?;
        let georeference = geotiff::read_georeference(&mut decoder)
            .with_context(|| format!("failed to georeference {:?}", path.display()))?;
        let name = name.unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        });
        debug!(
            name = %name,
            width,
            height,
            crs = ?georeference.crs,
            "Opened raster"
        );
        Ok(Self {
            name,
            path: path.to_owned(),
            width,
            height,
            transform: georeference.transform,
            crs: georeference.crs,
        })
    }

    /// The world extent of the raster.
    pub fn extent(&self) -> Rect<f64> {
        self.transform.extent(self.width, self.height)
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<fs::File>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open raster {:?}", path.display()))?;
    Decoder::new(BufReader::new(file))
        .with_context(|| format!("failed to create TIFF decoder for {:?}", path.display()))
}

/// A single-band, 8-bit raster held in memory.
#[derive(Clone, Debug)]
pub struct Raster8 {
    /// The name of the source raster.
    pub name: String,
    /// Band 1 of the source, cast to `u8`.
    pub image: GrayImage,
    /// Pixel-to-world transform.
    pub transform: GeoTransform,
    /// The CRS declared by the source, if any.
    pub crs: Option<Crs>,
}

impl Raster8 {
    /// The world extent of the raster.
    pub fn extent(&self) -> Rect<f64> {
        self.transform.extent(self.image.width(), self.image.height())
    }
}

/// Decode band 1 of `source` and cast it to unsigned 8-bit. All other bands
/// are dropped.
///
/// Failures are reported as [`PipelineError::Conversion`], which callers treat
/// as "skip this raster".
#[instrument(level = "debug", skip_all, fields(raster = %source.name))]
pub fn to_single_band_8bit(source: &RasterSource) -> Result<Raster8> {
    convert_band_one(source).map_err(|err| {
        PipelineError::Conversion {
            raster: source.name.clone(),
            source: err,
        }
        .into()
    })
}

fn convert_band_one(source: &RasterSource) -> Result<Raster8> {
    let path = &source.path;
    let mut decoder = open_decoder(path)?;
    let (width, height) = decoder
        .dimensions()
        .with_context(|| format!("failed to get dimensions of {:?}", path.display()))?;
    if (width, height) != (source.width, source.height) {
        return Err(anyhow!(
            "{:?} changed size since it was opened",
            path.display()
        ));
    }
    let pixel_count = usize::try_from(u64::from(width) * u64::from(height))
        .context("raster is too large")?;
    let decoded = decoder
        .read_image()
        .with_context(|| format!("failed to decode {:?}", path.display()))?;

    // This mirrors GDAL's conversion to Byte: integers saturate, floats are
    // rounded and then saturate.
    let data = match decoded {
        DecodingResult::U8(data) => band_one(&data, pixel_count, |v| v)?,
        DecodingResult::U16(data) => band_one(&data, pixel_count, |v| v.min(255) as u8)?,
        DecodingResult::U32(data) => band_one(&data, pixel_count, |v| v.min(255) as u8)?,
        DecodingResult::U64(data) => band_one(&data, pixel_count, |v| v.min(255) as u8)?,
        DecodingResult::I8(data) => band_one(&data, pixel_count, |v| v.max(0) as u8)?,
        DecodingResult::I16(data) => {
            band_one(&data, pixel_count, |v| v.clamp(0, 255) as u8)?
        }
        DecodingResult::I32(data) => {
            band_one(&data, pixel_count, |v| v.clamp(0, 255) as u8)?
        }
        DecodingResult::I64(data) => {
            band_one(&data, pixel_count, |v| v.clamp(0, 255) as u8)?
        }
        DecodingResult::F32(data) => {
            band_one(&data, pixel_count, |v| v.round().clamp(0.0, 255.0) as u8)?
        }
        DecodingResult::F64(data) => {
            band_one(&data, pixel_count, |v| v.round().clamp(0.0, 255.0) as u8)?
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(anyhow!(
                "unsupported TIFF sample format in {:?}: {:?}",
                path.display(),
                std::any::type_name_of_val(&other)
            ));
        }
    };

    let image = GrayImage::from_raw(width, height, data)
        .ok_or_else(|| anyhow!("failed to create grayscale image for {:?}", path.display()))?;
    Ok(Raster8 {
        name: source.name.clone(),
        image,
        transform: source.transform,
        crs: source.crs.clone(),
    })
}

/// Take the first sample of every pixel in chunky (interleaved) data.
fn band_one<T: Copy>(data: &[T], pixel_count: usize, cast: impl Fn(T) -> u8) -> Result<Vec<u8>> {
    if pixel_count == 0 || data.len() % pixel_count != 0 || data.len() < pixel_count {
        return Err(anyhow!(
            "decoded {} samples, which is not a whole number of samples for {} pixels",
            data.len(),
            pixel_count
        ));
    }
    let samples_per_pixel = data.len() / pixel_count;
    Ok(data
        .chunks_exact(samples_per_pixel)
        .map(|pixel| cast(pixel[0]))
        .collect())
}


#[cfg(test)]
mod tests {
    use image::Pixel as _;

    use super::{test_support::*, *};

    fn georef(epsg: Option<u16>) -> FixtureGeoref {
        FixtureGeoref {
            origin_x: 1000.0,
            origin_y: 2000.0,
            pixel_size: 0.5,
            epsg,
        }
    }

    #[test]
    fn opens_raster_header() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("raster-test")?;
        let path = tmpdir.path().join("sheet.tif");
        write_gray_geotiff(&path, 4, 2, &[0; 8], &georef(Some(2180)))?;

        let source = RasterSource::open(&path, None)?;
        assert_eq!(source.name, "sheet");
        assert_eq!((source.width, source.height), (4, 2));
        assert_eq!(source.crs, Some(Crs::from_epsg(2180)));
        let extent = source.extent();
        assert_eq!(extent.min(), Coord { x: 1000.0, y: 1999.0 });
        assert_eq!(extent.max(), Coord { x: 1002.0, y: 2000.0 });
        Ok(())
    }

    #[test]
    fn raster_without_georeferencing_fails_to_open() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("raster-test")?;
        let path = tmpdir.path().join("plain.tif");
        let mut encoder = tiff::encoder::TiffEncoder::new(fs::File::create(&path)?)?;
        encoder.write_image::<tiff::encoder::colortype::Gray8>(2, 2, &[0; 4])?;
        assert!(RasterSource::open(&path, None).is_err());
        Ok(())
    }

    #[test]
    fn keeps_only_band_one_of_multiband_raster() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("raster-test")?;
        let path = tmpdir.path().join("rgb.tif");
        // Two pixels: (10, 20, 30) and (40, 50, 60).
        write_geotiff::<tiff::encoder::colortype::RGB8>(
            &path,
            2,
            1,
            &[10, 20, 30, 40, 50, 60],
            &georef(None),
        )?;

        let source = RasterSource::open(&path, Some("rgb".to_owned()))?;
        let raster = to_single_band_8bit(&source)?;
        assert_eq!(image::Luma::<u8>::CHANNEL_COUNT, 1);
        assert_eq!(raster.image.as_raw(), &vec![10, 40]);
        assert_eq!(raster.extent(), source.extent());
        Ok(())
    }

    #[test]
    fn saturates_wide_samples() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("raster-test")?;
        let path = tmpdir.path().join("wide.tif");
        write_geotiff::<tiff::encoder::colortype::Gray16>(
            &path,
            3,
            1,
            &[7, 255, 4000],
            &georef(None),
        )?;

        let raster = to_single_band_8bit(&RasterSource::open(&path, None)?)?;
        assert_eq!(raster.image.as_raw(), &vec![7, 255, 255]);
        Ok(())
    }

    #[test]
    fn conversion_failure_is_reported_as_such() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("raster-test")?;
        let path = tmpdir.path().join("broken.tif");
        write_gray_geotiff(&path, 2, 2, &[0; 4], &georef(None))?;
        let source = RasterSource::open(&path, None)?;
        fs::write(&path, b"not a tiff")?;

        let err = to_single_band_8bit(&source).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Conversion { .. })
        ));
        Ok(())
    }

    #[test]
    fn transform_maps_pixels_to_world() {
        let transform = GeoTransform::new(100.0, 50.0, 2.0, 2.0).unwrap();
        assert_eq!(transform.pixel_center(0, 0), Coord { x: 101.0, y: 49.0 });
        assert_eq!(transform.world_to_pixel(Coord { x: 104.0, y: 46.0 }), (2.0, 2.0));
        assert_eq!(transform.window(1, 2).origin_x, 102.0);
        assert_eq!(transform.window(1, 2).origin_y, 46.0);
        assert!(GeoTransform::new(0.0, 0.0, 1.0, -1.0).is_err());
    }
}
