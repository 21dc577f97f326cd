//! The `plan` subcommand.

use clap::Args;
use futures::{StreamExt as _, stream};

use super::LayerOpts;
use crate::{
    async_utils::io::write_output, pipeline::plan_workload, prelude::*,
    spatial_index::SpatialIndex,
};

/// Plan command line arguments.
#[derive(Debug, Args)]
pub struct PlanOpts {
    #[clap(flatten)]
    pub layers: LayerOpts,

    /// Output path for JSONL plans, one per raster. Defaults to standard
    /// output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `plan` subcommand. Shows which features would be recognized on which
/// raster, without running OCR.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_plan(opts: &PlanOpts) -> Result<()> {
    let rasters = opts.layers.resolve_rasters().await?;
    let layer = opts.layers.read_layer().await?;
    let index = SpatialIndex::build(&layer.features);

    let plans = plan_workload(&index, &rasters);
    let total: usize = plans.iter().map(|plan| plan.feature_ids.len()).sum();
    info!(rasters = plans.len(), total, "Computed workload");

    let values = plans
        .into_iter()
        .map(|plan| serde_json::to_value(plan).context("failed to serialize plan"))
        .collect::<Vec<_>>();
    write_output(opts.output_path.as_deref(), stream::iter(values).boxed()).await
}
