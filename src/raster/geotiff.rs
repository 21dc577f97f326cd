//! GeoTIFF georeferencing tags.

use std::io::{Read, Seek};

use tiff::{decoder::Decoder, tags::Tag};

use super::GeoTransform;
use crate::{layer::Crs, prelude::*};

/// GeoKey ids we care about.
mod geokey {
    /// `GTRasterTypeGeoKey`.
    pub const RASTER_TYPE: u32 = 1025;
    /// `GeographicTypeGeoKey`.
    pub const GEOGRAPHIC_TYPE: u32 = 2048;
    /// `ProjectedCSTypeGeoKey`.
    pub const PROJECTED_CS_TYPE: u32 = 3072;
    /// `RasterPixelIsPoint`, a value of [`RASTER_TYPE`].
    pub const PIXEL_IS_POINT: u32 = 2;
    /// Marks a user-defined CRS, which has no EPSG code.
    pub const USER_DEFINED: u32 = 32767;
}

/// Georeferencing read from a GeoTIFF.
#[derive(Clone, Debug, PartialEq)]
pub struct Georeference {
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
}

/// The GeoKeys we understand, pulled out of a `GeoKeyDirectoryTag`.
#[derive(Clone, Debug, Default, PartialEq)]
struct GeoKeys {
    pixel_is_point: bool,
    epsg: Option<u32>,
}

/// Read the georeferencing of the current image.
pub fn read_georeference<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Georeference> {
    let geokeys = match find_u32_vec(decoder, Tag::GeoKeyDirectoryTag)? {
        Some(directory) => parse_geokeys(&directory)?,
        None => GeoKeys::default(),
    };

    let transformation = find_f64_vec(decoder, Tag::ModelTransformationTag)?;
    let mut transform = if let Some(matrix) = transformation {
        transform_from_matrix(&matrix)?
    } else {
        let tiepoint = find_f64_vec(decoder, Tag::ModelTiepointTag)?;
        let scale = find_f64_vec(decoder, Tag::ModelPixelScaleTag)?;
        match (tiepoint, scale) {
            (Some(tiepoint), Some(scale)) => transform_from_tiepoint(&tiepoint, &scale)?,
            _ => return Err(anyhow!("image has no GeoTIFF georeferencing tags")),
        }
    };

    // Our transforms describe pixel corners. With `PixelIsPoint`, the tags
    // describe pixel centres instead.
    if geokeys.pixel_is_point {
        transform.origin_x -= transform.pixel_width / 2.0;
        transform.origin_y += transform.pixel_height / 2.0;
    }

    Ok(Georeference {
        transform,
        crs: geokeys.epsg.map(Crs::from_epsg),
    })
}

fn find_f64_vec<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<Vec<f64>>> {
    decoder
        .find_tag(tag)
        .with_context(|| format!("failed to read TIFF tag {:?}", tag))?
        .map(|value| {
            value
                .into_f64_vec()
                .with_context(|| format!("TIFF tag {:?} does not hold doubles", tag))
        })
        .transpose()
}

fn find_u32_vec<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<Vec<u32>>> {
    decoder
        .find_tag(tag)
        .with_context(|| format!("failed to read TIFF tag {:?}", tag))?
        .map(|value| {
            value
                .into_u32_vec()
                .with_context(|| format!("TIFF tag {:?} does not hold integers", tag))
        })
        .transpose()
}

/// Build a transform from a 4x4 `ModelTransformationTag` matrix.
fn transform_from_matrix(matrix: &[f64]) -> Result<GeoTransform> {
    if matrix.len() < 8 {
        return Err(anyhow!(
            "ModelTransformationTag has {} values, expected 16",
            matrix.len()
        ));
    }
    let (a, b, d) = (matrix[0], matrix[1], matrix[3]);
    let (e, f, h) = (matrix[4], matrix[5], matrix[7]);
    if b != 0.0 || e != 0.0 {
        return Err(anyhow!("rotated or skewed rasters are not supported"));
    }
    GeoTransform::new(d, h, a, -f)
}

/// Build a transform from `ModelTiepointTag` and `ModelPixelScaleTag`.
fn transform_from_tiepoint(tiepoint: &[f64], scale: &[f64]) -> Result<GeoTransform> {
    let [i, j, _k, x, y, ..] = tiepoint else {
        return Err(anyhow!(
            "ModelTiepointTag has {} values, expected at least 6",
            tiepoint.len()
        ));
    };
    let [scale_x, scale_y, ..] = scale else {
        return Err(anyhow!(
            "ModelPixelScaleTag has {} values, expected 3",
            scale.len()
        ));
    };
    GeoTransform::new(x - i * scale_x, y + j * scale_y, *scale_x, *scale_y)
}

/// Parse a `GeoKeyDirectoryTag`. The directory is a header of four shorts,
/// then one `(key, location, count, value)` entry per key.
fn parse_geokeys(directory: &[u32]) -> Result<GeoKeys> {
    let [_version, _revision, _minor, key_count, entries @ ..] = directory else {
        return Err(anyhow!("GeoKeyDirectoryTag is too short"));
    };
    let key_count = usize::try_from(*key_count).context("too many GeoKeys")?;
    let mut geokeys = GeoKeys::default();
    let mut projected = None;
    let mut geographic = None;
    for entry in entries.chunks_exact(4).take(key_count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        // Values stored in other tags are not codes we can use.
        if location != 0 {
            continue;
        }
        match key {
            geokey::RASTER_TYPE => geokeys.pixel_is_point = value == geokey::PIXEL_IS_POINT,
            geokey::PROJECTED_CS_TYPE => projected = Some(value),
            geokey::GEOGRAPHIC_TYPE => geographic = Some(value),
            _ => {}
        }
    }
    geokeys.epsg = projected
        .or(geographic)
        .filter(|code| *code != 0 && *code != geokey::USER_DEFINED);
    Ok(geokeys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_projected_crs_and_raster_type() {
        let directory = [
            1, 1, 0, 3, //
            1024, 0, 1, 1, //
            1025, 0, 1, 2, //
            3072, 0, 1, 2180,
        ];
        let geokeys = parse_geokeys(&directory).unwrap();
        assert_eq!(
            geokeys,
            GeoKeys {
                pixel_is_point: true,
                epsg: Some(2180)
            }
        );
    }

    #[test]
    fn falls_back_to_geographic_crs() {
        let directory = [1, 1, 0, 2, 1025, 0, 1, 1, 2048, 0, 1, 4326];
        let geokeys = parse_geokeys(&directory).unwrap();
        assert!(!geokeys.pixel_is_point);
        assert_eq!(geokeys.epsg, Some(4326));
    }

    #[test]
    fn ignores_user_defined_crs() {
        let directory = [1, 1, 0, 1, 3072, 0, 1, 32767];
        assert_eq!(parse_geokeys(&directory).unwrap().epsg, None);
    }

    #[test]
    fn builds_transform_from_tiepoint() {
        let transform =
            transform_from_tiepoint(&[0.0, 0.0, 0.0, 500.0, 1000.0, 0.0], &[2.0, 2.0, 0.0])
                .unwrap();
        assert_eq!(transform, GeoTransform::new(500.0, 1000.0, 2.0, 2.0).unwrap());

        // A tiepoint on another pixel moves the origin back to pixel (0, 0).
        let transform =
            transform_from_tiepoint(&[10.0, 5.0, 0.0, 520.0, 990.0, 0.0], &[2.0, 2.0, 0.0])
                .unwrap();
        assert_eq!(transform, GeoTransform::new(500.0, 1000.0, 2.0, 2.0).unwrap());
    }

    #[test]
    fn rejects_rotated_matrix() {
        let matrix = [
            1.0, 0.5, 0.0, 100.0, //
            0.0, -1.0, 0.0, 200.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        assert!(transform_from_matrix(&matrix).is_err());

        let matrix = [
            1.0, 0.0, 0.0, 100.0, //
            0.0, -1.0, 0.0, 200.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        assert_eq!(
            transform_from_matrix(&matrix).unwrap(),
            GeoTransform::new(100.0, 200.0, 1.0, 1.0).unwrap()
        );
    }
}
