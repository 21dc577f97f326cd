//! The OCR run: find which features lie on which rasters, then clip and
//! recognize each one.
//!
//! A run moves through three phases. We resolve the rasters to use
//! ([`resolve_rasters`]), compute the workload by querying the spatial index
//! with each raster's extent ([`plan_workload`]), and then process every
//! matched feature in turn ([`RunController::run`]). Everything happens in
//! sequence, one feature at a time.

use std::sync::Arc;

use schemars::JsonSchema;

use self::{
    feature::{FeatureOutcome, FeatureProcessor},
    feedback::Feedback,
};
use crate::{
    async_utils::spawn_blocking_propagating_panics,
    errors::PipelineError,
    layer::{FeatureId, PolygonLayer},
    prelude::*,
    project::Project,
    raster::{RasterSource, to_single_band_8bit},
    recognizer::{RecognitionErrorPolicy, TextRecognizer},
    sink::FeatureSink,
    spatial_index::SpatialIndex,
};

pub mod feature;
pub mod feedback;

/// Counts completed work against the total computed up front.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkloadCounter {
    total: usize,
    actual: usize,
}

impl WorkloadCounter {
    /// Start counting towards `total`.
    pub fn new(total: usize) -> Self {
        Self { total, actual: 0 }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn actual(&self) -> usize {
        self.actual
    }

    /// Count one completed feature and return the new progress percentage.
    pub fn record_completion(&mut self) -> Option<f64> {
        debug_assert!(self.actual < self.total, "completed more work than planned");
        self.actual = (self.actual + 1).min(self.total);
        self.percent()
    }

    /// Progress from 0 to 100, or `None` when there is no work at all.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.actual as f64 / self.total as f64 * 100.0)
        }
    }
}

/// The features matched by one raster.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct RasterPlan {
    /// The raster name.
    pub raster: String,
    /// Where the raster was read from.
    pub path: PathBuf,
    /// Features whose bounding boxes intersect the raster, in layer order.
    pub feature_ids: Vec<FeatureId>,
}

/// What a run did.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Features recognized and written to the output.
    pub recognized: usize,
    /// Feature and raster pairs planned.
    pub total: usize,
    /// Features left out because recognition failed.
    pub skipped_features: usize,
    /// Rasters left out because they could not be converted.
    pub skipped_rasters: usize,
    /// Did the run stop early?
    pub canceled: bool,
}

/// Pick the rasters for a run.
///
/// With `all_active` set, every active raster layer in `project` is used, in
/// project order, and `explicit` is ignored. Active rasters that cannot be
/// opened are skipped. Otherwise `explicit` must name a raster that opens.
/// Everything that stops a run from starting is a
/// [`PipelineError::Configuration`].
#[instrument(level = "debug", skip_all)]
pub fn resolve_rasters(
    explicit: Option<&Path>,
    all_active: bool,
    project: Option<&Project>,
) -> Result<Vec<RasterSource>> {
    if !all_active {
        let path = explicit.ok_or_else(|| {
            PipelineError::configuration(
                "no raster layer selected: pass --raster <PATH> or --all-active-rasters",
            )
        })?;
        let raster = RasterSource::open(path, None).map_err(|err| {
            PipelineError::configuration(format!(
                "cannot open raster layer {}: {:#}",
                path.display(),
                err
            ))
        })?;
        return Ok(vec![raster]);
    }

    if let Some(path) = explicit {
        warn!(
            raster = %path.display(),
            "Ignoring --raster because --all-active-rasters is set"
        );
    }
    let project = project.ok_or_else(|| {
        PipelineError::configuration("--all-active-rasters needs a --project file")
    })?;
    let mut rasters = vec![];
    for layer in project.active_rasters() {
        match RasterSource::open(&layer.path, Some(layer.name.clone())) {
            Ok(raster) => rasters.push(raster),
            Err(err) => warn!(layer = %layer.name, "Skipping raster layer: {:#}", err),
        }
    }
    if rasters.is_empty() {
        warn!("The project has no usable active raster layers");
    }
    Ok(rasters)
}

/// Find the features on each raster, using bounding boxes only.
pub fn plan_workload(index: &SpatialIndex, rasters: &[RasterSource]) -> Vec<RasterPlan> {
    rasters
        .iter()
        .map(|raster| RasterPlan {
            raster: raster.name.clone(),
            path: raster.path.clone(),
            feature_ids: index.intersecting_ids(&raster.extent()),
        })
        .collect()
}

/// Settings for a run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// The attribute that receives recognized text.
    pub text_field: String,
    /// What to do when recognition fails.
    pub policy: RecognitionErrorPolicy,
}

/// Drives a whole run.
pub struct RunController<'a> {
    layer: &'a PolygonLayer,
    index: &'a SpatialIndex,
    recognizer: TextRecognizer,
    feedback: &'a dyn Feedback,
    options: RunOptions,
}

impl<'a> RunController<'a> {
    /// Create a controller. `index` must have been built from `layer`.
    pub fn new(
        layer: &'a PolygonLayer,
        index: &'a SpatialIndex,
        recognizer: TextRecognizer,
        feedback: &'a dyn Feedback,
        options: RunOptions,
    ) -> Self {
        Self {
            layer,
            index,
            recognizer,
            feedback,
            options,
        }
    }

    /// Process every feature on every raster, in order, writing results to
    /// `sink`.
    ///
    /// Cancellation is checked before each raster and before each feature.
    /// A canceled run returns normally, with [`RunSummary::canceled`] set.
    #[instrument(level = "debug", skip_all, fields(rasters = rasters.len()))]
    pub async fn run(
        &self,
        rasters: &[RasterSource],
        sink: &mut dyn FeatureSink,
    ) -> Result<RunSummary> {
        let plans = plan_workload(self.index, rasters);
        let total = plans.iter().map(|plan| plan.feature_ids.len()).sum();
        let mut counter = WorkloadCounter::new(total);
        let mut summary = RunSummary {
            total,
            ..RunSummary::default()
        };
        info!(rasters = rasters.len(), total, "Computed workload");
        if let Some(percent) = counter.percent() {
            self.feedback.set_progress(percent);
        }

        let mut processor = FeatureProcessor::new(
            &self.recognizer,
            self.feedback,
            &self.options.text_field,
            self.options.policy,
            self.layer.crs.as_ref(),
        );

        'rasters: for raster in rasters {
            if self.feedback.is_canceled() {
                summary.canceled = true;
                break;
            }

            let hits = self.index.query(&raster.extent());
            if hits.is_empty() {
                debug!(raster = %raster.name, "No features on raster");
                continue;
            }
            if let (Some(layer_crs), Some(raster_crs)) = (&self.layer.crs, &raster.crs) {
                if layer_crs != raster_crs {
                    warn!(
                        raster = %raster.name,
                        layer_crs = %layer_crs,
                        raster_crs = %raster_crs,
                        "Raster CRS differs from the polygon layer; using the layer CRS without reprojecting"
                    );
                }
            }

            self.feedback.push_info(&format!(
                "Computing image {} ({} features)",
                raster.name,
                hits.len()
            ));
            let source = raster.clone();
            let converted =
                spawn_blocking_propagating_panics(move || to_single_band_8bit(&source)).await;
            let raster8 = match converted {
                Ok(raster8) => {
                    debug!(raster = %raster8.name, extent = ?raster8.extent(), "Converted raster");
                    Arc::new(raster8)
                }
                Err(err) => {
                    warn!(raster = %raster.name, "Skipping raster: {:#}", err);
                    summary.skipped_rasters += 1;
                    continue;
                }
            };

            for hit in hits {
                if self.feedback.is_canceled() {
                    summary.canceled = true;
                    break 'rasters;
                }
                let feature = self.layer.feature(hit.position).ok_or_else(|| {
                    anyhow!("spatial index returned unknown feature {}", hit.id)
                })?;
                match processor
                    .process(&raster8, feature, sink, &mut counter)
                    .await?
                {
                    FeatureOutcome::Emitted => summary.recognized += 1,
                    FeatureOutcome::Skipped => summary.skipped_features += 1,
                }
            }
        }

        if summary.canceled {
            warn!(
                recognized = summary.recognized,
                total = summary.total,
                "Run canceled"
            );
        } else {
            info!(
                recognized = summary.recognized,
                total = summary.total,
                skipped_features = summary.skipped_features,
                skipped_rasters = summary.skipped_rasters,
                "Run complete"
            );
        }
        Ok(summary)
    }
}
