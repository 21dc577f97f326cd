//! Command-line entry points.

use clap::Args;

use crate::{
    layer::{Crs, PolygonLayer},
    pipeline::resolve_rasters,
    prelude::*,
    project::Project,
    raster::RasterSource,
};

pub mod ocr;
pub mod plan;
pub mod schema;

/// Options shared by subcommands that match polygons against rasters.
#[derive(Debug, Clone, Args)]
pub struct LayerOpts {
    /// The polygon layer, as a GeoJSON FeatureCollection or as GeoJSON
    /// features, one per line.
    #[clap(value_name = "INPUT_LAYER")]
    pub input_layer: PathBuf,

    /// The raster to read text from. Only band 1 is used.
    #[clap(long = "raster", value_name = "PATH")]
    pub raster: Option<PathBuf>,

    /// Use every active raster layer listed in `--project`, instead of
    /// `--raster`.
    #[clap(long)]
    pub all_active_rasters: bool,

    /// A TOML or JSON project file listing raster layers.
    #[clap(long = "project", value_name = "PATH")]
    pub project: Option<PathBuf>,

    /// Override the CRS of the polygon layer (for example, `EPSG:2180`).
    #[clap(long = "crs", value_name = "AUTHID")]
    pub crs: Option<Crs>,
}

impl LayerOpts {
    /// Resolve our rasters. This fails on configuration errors, before we
    /// touch the polygon layer.
    pub async fn resolve_rasters(&self) -> Result<Vec<RasterSource>> {
        let project = match &self.project {
            Some(path) => Some(Project::load(path).await?),
            None => None,
        };
        resolve_rasters(
            self.raster.as_deref(),
            self.all_active_rasters,
            project.as_ref(),
        )
    }

    /// Read the polygon layer, applying any CRS override.
    pub async fn read_layer(&self) -> Result<PolygonLayer> {
        let mut layer = PolygonLayer::read(&self.input_layer).await?;
        if let Some(crs) = &self.crs {
            if let Some(declared) = layer.crs.as_ref().filter(|declared| *declared != crs) {
                info!(declared = %declared, crs = %crs, "Overriding polygon layer CRS");
            }
            layer.crs = Some(crs.clone());
        }
        debug!(
            features = layer.features.len(),
            crs = ?layer.crs,
            "Read polygon layer"
        );
        Ok(layer)
    }
}
