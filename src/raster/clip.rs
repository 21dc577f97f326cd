//! Clip a raster to a single polygon feature.

use geo::{Contains as _, MultiPolygon, Point};
use image::{GrayImage, Luma};

use super::{GeoTransform, Raster8};
use crate::{
    layer::{Crs, PolygonFeature},
    prelude::*,
};

/// The value given to every pixel outside the cutline.
pub const NODATA: u8 = 255;

/// Small tolerance used when snapping world coordinates to pixel edges, so
/// that a polygon edge lying exactly on a pixel edge does not pull in an extra
/// row or column.
const EDGE_EPSILON: f64 = 1e-9;

/// Holds the one feature currently being clipped.
///
/// Isolating a feature replaces whatever was held before, so there is never
/// more than one feature here.
#[derive(Debug, Default)]
pub struct IsolatedFeature {
    features: Vec<PolygonFeature>,
}

impl IsolatedFeature {
    /// Create an empty workspace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with exactly `feature`.
    pub fn isolate(&mut self, feature: &PolygonFeature) -> &PolygonFeature {
        self.features.clear();
        self.features.push(feature.clone());
        &self.features[0]
    }

    /// The feature held, if any.
    pub fn current(&self) -> Option<&PolygonFeature> {
        self.features.first()
    }

    /// How many features are held. Never more than one.
    pub fn len(&self) -> usize {
        self.features.len()
    }
}

/// A raster clipped to one feature.
#[derive(Clone, Debug)]
pub struct ClippedImage {
    /// Single-band 8-bit pixels. Outside the cutline, every pixel is
    /// [`NODATA`].
    pub image: GrayImage,
    /// Pixel-to-world transform of the clip.
    pub transform: GeoTransform,
    /// The CRS the source raster was read in.
    pub crs: Option<Crs>,
}

/// Clip `raster` using `cutline`, cropping the output to the cutline's bounding
/// box.
///
/// The output uses the source pixel grid. A pixel keeps its source value when
/// its centre is inside the cutline and inside the raster; every other pixel is
/// set to [`NODATA`]. `crs` is assigned to the source raster, as-is.
pub fn clip_to_feature(
    raster: &Raster8,
    cutline: &MultiPolygon<f64>,
    crs: Option<&Crs>,
) -> Result<ClippedImage> {
    use geo::BoundingRect as _;

    let bounds = cutline
        .bounding_rect()
        .ok_or_else(|| anyhow!("cutline has no area"))?;
    let transform = &raster.transform;
    let (min_col, min_row) = transform.world_to_pixel(geo::Coord {
        x: bounds.min().x,
        y: bounds.max().y,
    });
    let (max_col, max_row) = transform.world_to_pixel(geo::Coord {
        x: bounds.max().x,
        y: bounds.min().y,
    });
    let col0 = (min_col + EDGE_EPSILON).floor() as i64;
    let row0 = (min_row + EDGE_EPSILON).floor() as i64;
    let col1 = ((max_col - EDGE_EPSILON).ceil() as i64).max(col0 + 1);
    let row1 = ((max_row - EDGE_EPSILON).ceil() as i64).max(row0 + 1);
    let width = u32::try_from(col1 - col0).context("clip is too wide")?;
    let height = u32::try_from(row1 - row0).context("clip is too tall")?;
    trace!(col0, row0, width, height, "Clip window");

    let source = &raster.image;
    let (source_width, source_height) = (i64::from(source.width()), i64::from(source.height()));
    let image = GrayImage::from_fn(width, height, |x, y| {
        let col = col0 + i64::from(x);
        let row = row0 + i64::from(y);
        let in_raster = (0..source_width).contains(&col) && (0..source_height).contains(&row);
        let center = Point::from(transform.pixel_center(col, row));
        if in_raster && cutline.contains(&center) {
            // The bounds check above makes these casts lossless.
            *source.get_pixel(col as u32, row as u32)
        } else {
            Luma([NODATA])
        }
    });

    Ok(ClippedImage {
        image,
        transform: transform.window(col0, row0),
        crs: crs.cloned().or_else(|| raster.crs.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{FeatureId, Geometry, tests::square};

    /// A 10x10 raster covering world (0, 0) to (10, 10), where each pixel
    /// holds `row * 10 + col`.
    fn gradient_raster() -> Raster8 {
        Raster8 {
            name: "gradient".to_owned(),
            image: GrayImage::from_fn(10, 10, |x, y| Luma([(y * 10 + x) as u8])),
            transform: GeoTransform::new(0.0, 10.0, 1.0, 1.0).unwrap(),
            crs: Some(Crs::from_epsg(2180)),
        }
    }

    #[test]
    fn crops_to_cutline_bounding_box() {
        let raster = gradient_raster();
        let feature = square(1, 2.0, 5.0, 3.0);
        let clip = clip_to_feature(&raster, feature.shape(), None).unwrap();
        assert_eq!(clip.image.dimensions(), (3, 3));
        // World (2, 8) is the top-left corner, which is row 2, col 2.
        assert_eq!(clip.image.get_pixel(0, 0), &Luma([22]));
        assert_eq!(clip.image.get_pixel(2, 2), &Luma([44]));
        assert_eq!(clip.transform.origin_x, 2.0);
        assert_eq!(clip.transform.origin_y, 8.0);
        assert_eq!(clip.crs, Some(Crs::from_epsg(2180)));
    }

    #[test]
    fn pixels_outside_polygon_are_nodata() {
        let raster = gradient_raster();
        // A right triangle filling the lower-left half of a 4x4 box.
        let geometry = Geometry::Polygon {
            coordinates: vec![vec![
                vec![0.0, 6.0],
                vec![4.0, 6.0],
                vec![0.0, 10.0],
                vec![0.0, 6.0],
            ]],
        };
        let feature = PolygonFeature::new(FeatureId(1), geometry, Default::default()).unwrap();
        let clip = clip_to_feature(&raster, feature.shape(), None).unwrap();
        assert_eq!(clip.image.dimensions(), (4, 4));
        // The top-right corner is outside the triangle.
        assert_eq!(clip.image.get_pixel(3, 0), &Luma([NODATA]));
        // The bottom-left corner is inside.
        assert_eq!(clip.image.get_pixel(0, 3), &Luma([30]));
    }

    #[test]
    fn area_outside_raster_is_nodata() {
        let raster = gradient_raster();
        let feature = square(1, 8.0, 0.0, 4.0);
        let clip = clip_to_feature(&raster, feature.shape(), None).unwrap();
        assert_eq!(clip.image.dimensions(), (4, 4));
        assert_eq!(clip.image.get_pixel(0, 0), &Luma([68]));
        assert_eq!(clip.image.get_pixel(3, 0), &Luma([NODATA]));
    }

    #[test]
    fn assigned_crs_wins() {
        let raster = gradient_raster();
        let feature = square(1, 0.0, 0.0, 2.0);
        let crs = Crs::from_epsg(4326);
        let clip = clip_to_feature(&raster, feature.shape(), Some(&crs)).unwrap();
        assert_eq!(clip.crs, Some(crs));
    }

    #[test]
    fn isolation_holds_exactly_one_feature() {
        let mut workspace = IsolatedFeature::new();
        assert_eq!(workspace.len(), 0);

        let first = square(1, 0.0, 0.0, 1.0);
        let second = square(2, 5.0, 5.0, 2.0);
        workspace.isolate(&first);
        workspace.isolate(&second);

        assert_eq!(workspace.len(), 1);
        let current = workspace.current().unwrap();
        assert_eq!(current.id, FeatureId(2));
        assert_eq!(current.geometry, second.geometry);
    }
}
